mod backend;
mod coordinator;
mod dom;
mod engine;
mod html;
mod page;
mod serve;
mod web_assets;

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use backend::{Backend, BackendKind};
use coordinator::CoordinatorOptions;
use engine::{EngineConfig, EngineHandle};
use page::PageRenderer;

/// Options shared by every subcommand that renders diagrams.
#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// Server-side diagram renderer; `none` leaves diagrams to the browser
    #[arg(long, value_enum, default_value_t = BackendKind::Auto)]
    engine: BackendKind,
    /// Mermaid CLI used by the `command` engine (and `auto` as a fallback)
    #[arg(long, default_value = "mmdc")]
    mmdc: PathBuf,
    /// JSON file with Mermaid configuration (theme, securityLevel, flowchart, ...)
    #[arg(long, value_name = "JSON")]
    mermaid_config: Option<PathBuf>,
    /// Limit for engine initialization and each render; 0 disables it
    #[arg(long, default_value_t = 30_000)]
    render_timeout_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a markdown file to a standalone HTML page
    Render {
        /// Path to the markdown file
        file: String,
        /// Write the page here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Serve a markdown file over HTTP
    Serve {
        /// Path to the markdown file
        file: String,
        /// Interface address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Starting port number for the HTTP server
        #[arg(long, default_value = "3333")]
        port: u16,
        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Parser)]
#[command(
    name = "mdhydrate",
    version,
    about = "Render markdown to HTML with Mermaid diagrams hydrated to inline SVG"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Commands::Render {
            file,
            output,
            engine,
        } => {
            let source = read_markdown(&file)?;
            let path = fs::canonicalize(&file).unwrap_or_else(|_| PathBuf::from(&file));
            let renderer = build_renderer(&engine, true)?;
            let page = rt.block_on(renderer.render(&source, &path))?;
            match output {
                Some(out) => fs::write(&out, page.html)
                    .with_context(|| format!("writing {}", out.display()))?,
                None => print!("{}", page.html),
            }
            Ok(())
        }
        Commands::Serve {
            file,
            bind,
            port,
            engine,
        } => {
            check_extension(&file)?;
            if !Path::new(&file).is_file() {
                bail!("file not found: {file}");
            }
            let renderer = build_renderer(&engine, false)?;
            rt.block_on(serve::run_serve(PathBuf::from(file), &bind, port, renderer))?;
            Ok(())
        }
    }
}

fn build_renderer(args: &EngineArgs, inline_assets: bool) -> anyhow::Result<PageRenderer> {
    let config = match &args.mermaid_config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading mermaid config {}", path.display()))?;
            EngineConfig::from_json(&text)
                .with_context(|| format!("parsing mermaid config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    let timeout = match args.render_timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let engine = Backend::from_kind(args.engine, args.mmdc.clone())
        .map(|backend| Arc::new(EngineHandle::new(backend, config.clone(), timeout)));
    if engine.is_none() {
        tracing::info!("[engine] server-side rendering disabled");
    }
    Ok(PageRenderer::new(
        engine,
        config,
        CoordinatorOptions::default(),
        inline_assets,
    ))
}

fn check_extension(file_arg: &str) -> anyhow::Result<()> {
    match Path::new(file_arg).extension().and_then(|e| e.to_str()) {
        Some("md" | "markdown" | "mdx" | "mdown" | "mkd" | "mkdn") => Ok(()),
        Some(ext) => bail!(
            "'{ext}' is not a recognized markdown extension.\n\
             Expected a markdown file (.md, .markdown, .mdx, .mdown, .mkd, .mkdn)."
        ),
        None => bail!(
            "'{file_arg}' has no file extension.\n\
             Expected a markdown file (.md, .markdown, .mdx, .mdown, .mkd, .mkdn)."
        ),
    }
}

fn read_markdown(file_arg: &str) -> anyhow::Result<String> {
    check_extension(file_arg)?;
    fs::read_to_string(file_arg).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => anyhow::anyhow!("file not found: {file_arg}"),
        io::ErrorKind::PermissionDenied => anyhow::anyhow!("permission denied: {file_arg}"),
        _ => anyhow::Error::new(e).context(format!("reading '{file_arg}'")),
    })
}
