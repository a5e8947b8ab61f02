use std::io;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tokio::signal;
use tower_http::compression::CompressionLayer;

use crate::page::PageRenderer;
use crate::web_assets;

/// Maximum number of consecutive ports to try before giving up.
const MAX_PORT_ATTEMPTS: u16 = 100;

/// Maximum entry file size that will be read and rendered (16 MiB).
pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("{0}")]
    Bind(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Shared application state passed to all request handlers via `Arc<AppState>`.
///
/// The renderer owns the one engine handle every request goes through, so
/// concurrent first requests initialize the engine once.
pub struct AppState {
    /// The markdown file being served.
    pub entry_file: PathBuf,
    /// File name of `entry_file`, also accepted as a request path.
    pub entry_name: String,
    pub renderer: PageRenderer,
}

impl AppState {
    pub fn new(entry_file: PathBuf, renderer: PageRenderer) -> Self {
        let entry_name = entry_file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_owned();
        Self {
            entry_file,
            entry_name,
            renderer,
        }
    }
}

/// Attempt to bind a TCP listener on `bind_addr` starting at `start_port`.
///
/// On `EADDRINUSE` the port is incremented by one and the attempt is retried up
/// to `MAX_PORT_ATTEMPTS` times. Any other OS error fails immediately.
pub fn bind_with_retry(bind_addr: &str, start_port: u16) -> Result<(TcpListener, u16), ServeError> {
    let mut port = start_port;
    tracing::debug!("[bind] trying port={}", port);
    for _ in 0..MAX_PORT_ATTEMPTS {
        let addr = format!("{}:{}", bind_addr, port);
        match TcpListener::bind(&addr) {
            Ok(listener) => {
                tracing::debug!("[bind] success port={}", port);
                return Ok((listener, port));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                let next = port.wrapping_add(1);
                tracing::debug!("[bind] EADDRINUSE, trying {}", next);
                port = next;
            }
            Err(e) => {
                return Err(ServeError::Bind(format!(
                    "bind {}:{} failed: {}",
                    bind_addr, port, e
                )));
            }
        }
    }
    Err(ServeError::Bind(format!(
        "exhausted {} port candidates starting at {}; all ports in use",
        MAX_PORT_ATTEMPTS, start_port,
    )))
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Percent-decode a URL path byte-by-byte (RFC 3986 §2.1).
///
/// `None` for a truncated `%XX` sequence, a non-hex digit, or bytes that are
/// not valid UTF-8 after decoding.
pub fn percent_decode(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return None;
            }
            let hi = hex_digit(bytes[i + 1])?;
            let lo = hex_digit(bytes[i + 2])?;
            out.push((hi << 4) | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Normalize a decoded URL path, stripping `.` and `..` components.
///
/// Returns `None` if a `..` would escape the root.
pub fn normalize_path(decoded: &str) -> Option<PathBuf> {
    let mut parts: Vec<&str> = Vec::new();
    for component in decoded.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            name => parts.push(name),
        }
    }
    Some(parts.iter().collect())
}

/// Return `true` when the query string contains the `raw=1` parameter.
fn is_raw_mode(query: &str) -> bool {
    query.split('&').any(|param| param == "raw=1")
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, content_type),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body.into(),
    )
        .into_response()
}

fn not_found_response() -> Response {
    respond(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", "Not Found")
}

fn too_large_response(path: &Path, size: u64) -> Response {
    let body = format!(
        "Content Too Large: {} ({} bytes exceeds {} byte limit)",
        path.display(),
        size,
        MAX_FILE_SIZE
    );
    respond(StatusCode::PAYLOAD_TOO_LARGE, "text/plain; charset=utf-8", body)
}

fn server_error_response(message: String) -> Response {
    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain; charset=utf-8", message)
}

// ---------------------------------------------------------------------------
// Axum request handler
// ---------------------------------------------------------------------------

/// Request handler.
///
/// 1. `/assets/mdhydrate.css` and `/assets/mdhydrate.js` come from embedded
///    constants.
/// 2. The decoded, normalized path must be `/` or `/<entry file name>`;
///    anything else is 404.
/// 3. The entry file is re-read on every request (size-guarded) and returned
///    as `text/plain` with `?raw=1`, otherwise rendered and hydrated.
async fn serve_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let raw_path = req.uri().path().to_owned();
    let query = req.uri().query().unwrap_or("").to_owned();

    if raw_path == "/assets/mdhydrate.css" {
        tracing::debug!("[request] path={raw_path} mode=asset");
        return respond(StatusCode::OK, "text/css; charset=utf-8", web_assets::CSS);
    }
    if raw_path == "/assets/mdhydrate.js" {
        tracing::debug!("[request] path={raw_path} mode=asset");
        return respond(StatusCode::OK, "text/javascript; charset=utf-8", web_assets::JS);
    }

    let Some(decoded) = percent_decode(&raw_path) else {
        tracing::debug!("[resolve] path={raw_path} denied reason=invalid-percent-encoding");
        return not_found_response();
    };
    let Some(normalized) = normalize_path(&decoded) else {
        tracing::debug!("[resolve] path={raw_path} denied reason=path-traversal");
        return not_found_response();
    };
    let is_entry = normalized.as_os_str().is_empty()
        || normalized.to_str() == Some(state.entry_name.as_str());
    if !is_entry {
        tracing::debug!("[resolve] path={raw_path} denied reason=not-found");
        return not_found_response();
    }

    let size = match tokio::fs::metadata(&state.entry_file).await {
        Ok(m) => m.len(),
        Err(e) => {
            tracing::error!("[resolve] path={} metadata failed: {}", state.entry_file.display(), e);
            return not_found_response();
        }
    };
    if size > MAX_FILE_SIZE {
        tracing::warn!("[resolve] path={} denied reason=too-large size={size}", state.entry_file.display());
        return too_large_response(&state.entry_file, size);
    }

    let content = match tokio::fs::read_to_string(&state.entry_file).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("[resolve] path={} read failed: {}", state.entry_file.display(), e);
            return not_found_response();
        }
    };

    if is_raw_mode(&query) {
        tracing::info!("[request] path={raw_path} mode=raw");
        return respond(StatusCode::OK, "text/plain; charset=utf-8", content);
    }

    match state.renderer.render(&content, &state.entry_file).await {
        Ok(page) => {
            tracing::info!(
                "[request] path={raw_path} mode=rendered diagrams={} rendered={}",
                page.diagrams,
                page.report.rendered
            );
            respond(StatusCode::OK, "text/html; charset=utf-8", page.html)
        }
        Err(e) => {
            tracing::error!("[request] path={raw_path} render failed: {e}");
            server_error_response(format!("render failed: {e}"))
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(serve_handler)
        .layer(CompressionLayer::new())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

/// Serve `entry_file` until Ctrl+C.
///
/// Binds to `bind_addr` starting at `start_port`, retrying on `EADDRINUSE` up
/// to 100 times.
pub async fn run_serve(
    entry_file: PathBuf,
    bind_addr: &str,
    start_port: u16,
    renderer: PageRenderer,
) -> Result<(), ServeError> {
    let entry_file = std::fs::canonicalize(&entry_file).unwrap_or(entry_file);
    let state = Arc::new(AppState::new(entry_file, renderer));

    let (std_listener, bound_port) = bind_with_retry(bind_addr, start_port)?;
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;

    // Stdout carries the URL so scripts and tests can find the bound port.
    println!("http://{}:{}/", bind_addr, bound_port);
    tracing::info!(
        "[serve] listening on {}:{} file={}",
        bind_addr,
        bound_port,
        state.entry_file.display()
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("[shutdown] cannot install SIGINT handler: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("[shutdown] complete");
        })
        .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
