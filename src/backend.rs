//! Concrete diagram engines.
//!
//! - [`NativeEngine`]: in-process rendering with `mermaid-rs-renderer`.
//! - [`CommandEngine`]: shells out to the Mermaid CLI (`mmdc`), passing the
//!   engine config through as a JSON config file.
//! - [`AutoEngine`]: native first, `mmdc` when the native smoke render fails.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use mermaid_rs_renderer::Theme;
use parking_lot::Mutex;
use tempfile::TempPath;
use tokio::process::Command;

use crate::engine::{DiagramEngine, DiagramSource, EngineConfig, EngineError, RenderedDiagram, RunRequest};

/// Diagram rendered during native initialization to prove the renderer works.
const SMOKE_SOURCE: &str = "graph TD\nA-->B";

/// Which backend the CLI should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    /// Native renderer, falling back to `mmdc`.
    Auto,
    Native,
    Command,
    /// No server-side rendering; placeholders are left for the browser.
    None,
}

// ---------------------------------------------------------------------------
// Native
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct NativeEngine {
    theme: Mutex<Option<Theme>>,
}

fn render_native(source: &str, theme: &Theme) -> Result<String, String> {
    let opts = mermaid_rs_renderer::RenderOptions {
        theme: theme.clone(),
        layout: mermaid_rs_renderer::LayoutConfig::default(),
    };
    mermaid_rs_renderer::render_with_options(source, opts).map_err(|e| e.to_string())
}

/// Map the configured Mermaid theme name onto the renderer's themes.
fn native_theme(config: &EngineConfig) -> Theme {
    let mut theme = match config.theme.trim().to_ascii_lowercase().as_str() {
        "default" | "base" | "mermaid" => Theme::mermaid_default(),
        "modern" => Theme::modern(),
        "dark" => dark_theme(),
        other => {
            tracing::warn!("[native] theme={} not supported, using default", other);
            Theme::mermaid_default()
        }
    };
    // `inherit` only means something inside a page; keep the theme font.
    match config.font_family.trim() {
        "" | "inherit" => {}
        font => theme.font_family = font.to_owned(),
    }
    theme
}

/// Light text on a dark surface, for pages that opt into `"theme": "dark"`.
fn dark_theme() -> Theme {
    let fg = "#cdd6f4".to_owned();
    let surface = "#313244".to_owned();
    let overlay = "#6c7086".to_owned();
    let subtext = "#a6adc8".to_owned();
    Theme {
        primary_color: "#45475a".to_owned(),
        primary_text_color: fg.clone(),
        primary_border_color: overlay.clone(),
        line_color: subtext.clone(),
        secondary_color: "#585b70".to_owned(),
        tertiary_color: surface.clone(),
        edge_label_background: surface.clone(),
        cluster_background: surface.clone(),
        cluster_border: overlay.clone(),
        background: "#1e1e2e".to_owned(),
        sequence_actor_fill: "#45475a".to_owned(),
        sequence_actor_border: overlay.clone(),
        sequence_actor_line: subtext.clone(),
        sequence_note_fill: "#585b70".to_owned(),
        sequence_note_border: overlay.clone(),
        sequence_activation_fill: surface,
        sequence_activation_border: subtext,
        text_color: fg.clone(),
        git_commit_label_color: fg.clone(),
        git_commit_label_background: overlay.clone(),
        git_tag_label_color: fg.clone(),
        git_tag_label_background: overlay,
        pie_title_text_color: fg.clone(),
        pie_section_text_color: fg.clone(),
        pie_legend_text_color: fg,
        ..Theme::modern()
    }
}

/// Config keys the native renderer has no equivalent for.
fn warn_unsupported(config: &EngineConfig) {
    if config.flowchart.curve.trim() != "basis" {
        tracing::warn!(
            "[native] flowchart.curve={} not supported, edges keep the renderer's curve",
            config.flowchart.curve
        );
    }
    if !config.flowchart.html_labels {
        tracing::warn!("[native] flowchart.htmlLabels=false ignored, labels are always SVG text");
    }
}

impl DiagramEngine for NativeEngine {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn initialize(&self, config: &EngineConfig) -> Result<(), EngineError> {
        let theme = native_theme(config);
        let smoke_theme = theme.clone();
        tokio::task::spawn_blocking(move || render_native(SMOKE_SOURCE, &smoke_theme))
            .await
            .map_err(|e| EngineError::Unavailable(format!("native renderer crashed: {e}")))?
            .map_err(|e| EngineError::Unavailable(format!("native smoke render failed: {e}")))?;
        warn_unsupported(config);
        *self.theme.lock() = Some(theme);
        Ok(())
    }

    async fn run(&self, request: RunRequest) -> Result<Vec<RenderedDiagram>, EngineError> {
        let theme = self.theme.lock().clone().ok_or_else(|| {
            EngineError::Unavailable("native renderer used before initialization".to_owned())
        })?;
        let first_id = request
            .nodes
            .first()
            .map(|n| n.id.clone())
            .unwrap_or_default();
        let RunRequest {
            nodes,
            suppress_errors,
        } = request;

        tokio::task::spawn_blocking(move || {
            let mut out = Vec::with_capacity(nodes.len());
            for node in nodes {
                match render_native(&node.source, &theme) {
                    Ok(svg) => out.push(RenderedDiagram { id: node.id, svg }),
                    Err(message) if suppress_errors => {
                        tracing::debug!("[native] id={} suppressed error={}", node.id, message);
                    }
                    Err(message) => {
                        return Err(EngineError::Render {
                            id: node.id,
                            message,
                        })
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| EngineError::Render {
            id: first_id,
            message: format!("native renderer crashed: {e}"),
        })?
    }
}

// ---------------------------------------------------------------------------
// Command (mmdc)
// ---------------------------------------------------------------------------

pub struct CommandEngine {
    program: PathBuf,
    config_file: Mutex<Option<Arc<TempPath>>>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_file: Mutex::new(None),
        }
    }

    /// Render one diagram through temp files; `mmdc` cannot write SVG to a pipe.
    async fn render_file(&self, node: &DiagramSource, config: &TempPath) -> Result<String, EngineError> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("input.mmd");
        let output = dir.path().join("output.svg");
        tokio::fs::write(&input, &node.source).await?;

        let result = Command::new(&self.program)
            .arg("-i")
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .arg("-c")
            .arg(config.as_os_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let message = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no diagnostic output")
                .trim()
                .to_owned();
            return Err(EngineError::Render {
                id: node.id.clone(),
                message: format!("mmdc exited with {}: {}", result.status, message),
            });
        }

        let svg = tokio::fs::read_to_string(&output).await?;
        if svg.trim().is_empty() {
            return Err(EngineError::Render {
                id: node.id.clone(),
                message: "mmdc produced an empty file".to_owned(),
            });
        }
        Ok(svg)
    }
}

impl DiagramEngine for CommandEngine {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn initialize(&self, config: &EngineConfig) -> Result<(), EngineError> {
        let version = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                EngineError::Unavailable(format!("cannot run {}: {e}", self.program.display()))
            })?;
        if !version.status.success() {
            return Err(EngineError::Unavailable(format!(
                "{} --version exited with {}",
                self.program.display(),
                version.status
            )));
        }

        let file = tempfile::Builder::new()
            .prefix("mdhydrate-")
            .suffix(".json")
            .tempfile()?;
        tokio::fs::write(file.path(), config.to_json()).await?;
        *self.config_file.lock() = Some(Arc::new(file.into_temp_path()));

        tracing::info!(
            "[mmdc] program={} version={}",
            self.program.display(),
            String::from_utf8_lossy(&version.stdout).trim()
        );
        Ok(())
    }

    async fn run(&self, request: RunRequest) -> Result<Vec<RenderedDiagram>, EngineError> {
        let config = self.config_file.lock().clone().ok_or_else(|| {
            EngineError::Unavailable("mmdc used before initialization".to_owned())
        })?;

        let mut out = Vec::with_capacity(request.nodes.len());
        for node in request.nodes {
            match self.render_file(&node, &config).await {
                Ok(svg) => out.push(RenderedDiagram { id: node.id, svg }),
                Err(e) if request.suppress_errors => {
                    tracing::debug!("[mmdc] id={} suppressed error={}", node.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Auto
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Native,
    Command,
}

pub struct AutoEngine {
    native: NativeEngine,
    command: CommandEngine,
    active: Mutex<Option<Active>>,
}

impl AutoEngine {
    pub fn new(mmdc: impl Into<PathBuf>) -> Self {
        Self {
            native: NativeEngine::default(),
            command: CommandEngine::new(mmdc),
            active: Mutex::new(None),
        }
    }
}

impl DiagramEngine for AutoEngine {
    fn name(&self) -> &'static str {
        match *self.active.lock() {
            Some(Active::Native) => "auto/native",
            Some(Active::Command) => "auto/command",
            None => "auto",
        }
    }

    async fn initialize(&self, config: &EngineConfig) -> Result<(), EngineError> {
        match self.native.initialize(config).await {
            Ok(()) => {
                *self.active.lock() = Some(Active::Native);
                Ok(())
            }
            Err(native_err) => {
                tracing::warn!("[engine] native renderer unavailable, trying mmdc error={native_err}");
                self.command.initialize(config).await?;
                *self.active.lock() = Some(Active::Command);
                Ok(())
            }
        }
    }

    async fn run(&self, request: RunRequest) -> Result<Vec<RenderedDiagram>, EngineError> {
        let active = *self.active.lock();
        match active {
            Some(Active::Native) => self.native.run(request).await,
            Some(Active::Command) => self.command.run(request).await,
            None => Err(EngineError::Unavailable("auto engine used before initialization".to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// The engine selected on the command line.
pub enum Backend {
    Native(NativeEngine),
    Command(CommandEngine),
    Auto(AutoEngine),
}

impl Backend {
    /// Build the backend for `kind`; `None` disables server-side rendering.
    pub fn from_kind(kind: BackendKind, mmdc: PathBuf) -> Option<Self> {
        match kind {
            BackendKind::Auto => Some(Backend::Auto(AutoEngine::new(mmdc))),
            BackendKind::Native => Some(Backend::Native(NativeEngine::default())),
            BackendKind::Command => Some(Backend::Command(CommandEngine::new(mmdc))),
            BackendKind::None => None,
        }
    }
}

impl DiagramEngine for Backend {
    fn name(&self) -> &'static str {
        match self {
            Backend::Native(e) => e.name(),
            Backend::Command(e) => e.name(),
            Backend::Auto(e) => e.name(),
        }
    }

    async fn initialize(&self, config: &EngineConfig) -> Result<(), EngineError> {
        match self {
            Backend::Native(e) => e.initialize(config).await,
            Backend::Command(e) => e.initialize(config).await,
            Backend::Auto(e) => e.initialize(config).await,
        }
    }

    async fn run(&self, request: RunRequest) -> Result<Vec<RenderedDiagram>, EngineError> {
        match self {
            Backend::Native(e) => e.run(request).await,
            Backend::Command(e) => e.run(request).await,
            Backend::Auto(e) => e.run(request).await,
        }
    }
}
