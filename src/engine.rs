//! Diagram engine capability and the shared engine handle.
//!
//! An engine turns diagram source into SVG. [`EngineHandle`] owns exactly one
//! engine and arbitrates its initialization: however many callers ask for a
//! ready engine at once, at most one `initialize` call is in flight, and every
//! caller that arrived while it was running observes the same outcome.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine options, serialized with Mermaid's own key names so the same value
/// can be handed to `mmdc` or to `mermaid.initialize` in the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Always `false` server-side: the coordinator owns triggering.
    pub start_on_load: bool,
    pub theme: String,
    pub security_level: String,
    pub font_family: String,
    pub flowchart: FlowchartConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowchartConfig {
    pub use_max_width: bool,
    pub html_labels: bool,
    pub curve: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_on_load: false,
            theme: "default".to_owned(),
            security_level: "loose".to_owned(),
            font_family: "inherit".to_owned(),
            flowchart: FlowchartConfig::default(),
        }
    }
}

impl Default for FlowchartConfig {
    fn default() -> Self {
        Self {
            use_max_width: true,
            html_labels: true,
            curve: "basis".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Parse a Mermaid-style JSON config; missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

// ---------------------------------------------------------------------------
// Requests and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagramSource {
    pub id: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub nodes: Vec<DiagramSource>,
    /// When set, a node that fails to render is left out of the output
    /// instead of failing the whole call.
    pub suppress_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDiagram {
    pub id: String,
    pub svg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Initialization failed or the engine is absent.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    /// A specific diagram failed to render.
    #[error("render failed for {id}: {message}")]
    Render { id: String, message: String },
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

/// An external source-to-SVG renderer.
pub trait DiagramEngine: Send + Sync + 'static {
    /// Short backend name used in log lines.
    fn name(&self) -> &'static str;

    fn initialize(
        &self,
        config: &EngineConfig,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn run(
        &self,
        request: RunRequest,
    ) -> impl Future<Output = Result<Vec<RenderedDiagram>, EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// EngineHandle
// ---------------------------------------------------------------------------

type Outcome = Option<Result<(), EngineError>>;

enum InitState {
    Uninitialized,
    /// Receiver side of the in-flight token; the initializer holds the sender.
    InFlight(watch::Receiver<Outcome>),
    Ready,
}

/// How a successful [`EngineHandle::ensure_ready`] call got its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The engine was already initialized, or another caller initialized it.
    Ready,
    /// This call performed the initialization.
    Initialized,
}

enum Step {
    Wait(watch::Receiver<Outcome>),
    Start(watch::Sender<Outcome>),
}

/// Returns the state to `Uninitialized` if the initializing future is dropped
/// before it records an outcome.
struct AbandonGuard<'a> {
    state: &'a Mutex<InitState>,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock() = InitState::Uninitialized;
        }
    }
}

/// Sole owner of one engine instance and its initialization state.
pub struct EngineHandle<E> {
    engine: E,
    config: EngineConfig,
    timeout: Option<Duration>,
    state: Mutex<InitState>,
}

impl<E: DiagramEngine> EngineHandle<E> {
    pub fn new(engine: E, config: EngineConfig, timeout: Option<Duration>) -> Self {
        Self {
            engine,
            config,
            timeout,
            state: Mutex::new(InitState::Uninitialized),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), InitState::Ready)
    }

    /// Make sure the engine is initialized.
    ///
    /// Starts an initialization when none is running and the engine is not
    /// ready; otherwise joins the one in flight. Failures leave the handle
    /// uninitialized so a later call can try again.
    pub async fn ensure_ready(&self) -> Result<Readiness, EngineError> {
        let step = {
            let mut state = self.state.lock();
            let joined = match &*state {
                InitState::Ready => return Ok(Readiness::Ready),
                InitState::InFlight(rx) => Some(rx.clone()),
                InitState::Uninitialized => None,
            };
            match joined {
                Some(rx) => Step::Wait(rx),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *state = InitState::InFlight(rx);
                    Step::Start(tx)
                }
            }
        };

        match step {
            Step::Wait(rx) => Self::join(rx).await,
            Step::Start(tx) => self.run_initialization(tx).await,
        }
    }

    async fn join(mut rx: watch::Receiver<Outcome>) -> Result<Readiness, EngineError> {
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(())) => Ok(Readiness::Ready),
            Some(Err(e)) => Err(e),
            None => Err(EngineError::Unavailable(
                "initialization was abandoned".to_owned(),
            )),
        }
    }

    async fn run_initialization(&self, tx: watch::Sender<Outcome>) -> Result<Readiness, EngineError> {
        let mut guard = AbandonGuard {
            state: &self.state,
            armed: true,
        };

        tracing::debug!("[engine] initializing backend={}", self.engine.name());
        let result = bounded(self.timeout, self.engine.initialize(&self.config))
            .await
            .map_err(|e| match e {
                EngineError::Unavailable(_) => e,
                other => EngineError::Unavailable(other.to_string()),
            });

        *self.state.lock() = if result.is_ok() {
            InitState::Ready
        } else {
            InitState::Uninitialized
        };
        guard.armed = false;
        let _ = tx.send(Some(result.clone()));

        match &result {
            Ok(()) => tracing::info!("[engine] initialized backend={}", self.engine.name()),
            Err(e) => tracing::error!(
                "[engine] initialization failed backend={} error={}",
                self.engine.name(),
                e
            ),
        }
        result.map(|()| Readiness::Initialized)
    }

    /// Forward a render request to the engine, bounded by the call timeout.
    pub async fn run(&self, request: RunRequest) -> Result<Vec<RenderedDiagram>, EngineError> {
        bounded(self.timeout, self.engine.run(request)).await
    }
}

async fn bounded<T, F>(limit: Option<Duration>, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(EngineError::Timeout(limit))),
        None => call.await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
