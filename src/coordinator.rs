//! Idempotent render coordinator.
//!
//! Finds diagram placeholders in a [`Document`], renders each one through the
//! shared [`EngineHandle`] exactly once, and keeps watching the document so
//! placeholders inserted later are rendered too.
//!
//! A placeholder is claimed by setting `data-processed` *before* the engine is
//! called, so overlapping passes never submit the same node twice. A failed
//! render removes the marker again and the node is picked up by the next pass.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::dom::{DomError, Document, MutationStream, NodeId, NodeSpec, ReadyState, Selector};
use crate::engine::{DiagramEngine, DiagramSource, EngineError, EngineHandle, Readiness, RunRequest};

pub const PROCESSED_ATTR: &str = "data-processed";
pub const SKIPPED_ATTR: &str = "data-render-skipped";

const TARGET_STYLE: &str = "display:block;max-width:100%";
const SVG_STYLE: &str = "max-width:100%;height:auto;display:block";

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Which elements are render targets.
    pub target: Selector,
    /// Container watched for late insertions.
    pub watch_root: Selector,
    /// Quiet period after an insertion before a scan runs.
    pub debounce: Duration,
    /// Pause after each render attempt; zero disables it.
    pub settle_delay: Duration,
    /// Prefix for generated element ids.
    pub id_prefix: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            target: Selector::parse(".mermaid"),
            watch_root: Selector::parse("main.content"),
            debounce: Duration::from_millis(150),
            settle_delay: Duration::ZERO,
            id_prefix: "mermaid".to_owned(),
        }
    }
}

/// Running totals across every pass of one coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderReport {
    pub rendered: usize,
    pub failed: usize,
    pub skipped_empty: usize,
}

pub struct RenderCoordinator<E> {
    document: Document,
    engine: Arc<EngineHandle<E>>,
    options: CoordinatorOptions,
    next_id: AtomicU64,
    report: Mutex<RenderReport>,
    shutdown: watch::Sender<bool>,
}

impl<E: DiagramEngine> RenderCoordinator<E> {
    pub fn new(document: Document, engine: Arc<EngineHandle<E>>, options: CoordinatorOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            document,
            engine,
            options,
            next_id: AtomicU64::new(0),
            report: Mutex::new(RenderReport::default()),
            shutdown,
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn report(&self) -> RenderReport {
        *self.report.lock()
    }

    // -----------------------------------------------------------------------
    // Engine readiness
    // -----------------------------------------------------------------------

    async fn readiness(&self) -> Option<Readiness> {
        match self.engine.ensure_ready().await {
            Ok(readiness) => Some(readiness),
            Err(e) => {
                tracing::warn!(
                    "[engine] not ready backend={} error={}",
                    self.engine.engine().name(),
                    e
                );
                None
            }
        }
    }

    /// Return the ready engine, initializing it if needed.
    ///
    /// The caller that performs the initialization also runs the first full
    /// render pass. `None` means "not ready"; nothing is rendered.
    pub async fn ensure_engine_ready(&self) -> Option<&E> {
        let readiness = self.readiness().await?;
        if readiness == Readiness::Initialized {
            self.render_pending().await;
        }
        Some(self.engine.engine())
    }

    // -----------------------------------------------------------------------
    // Render passes
    // -----------------------------------------------------------------------

    /// Render every unprocessed target in document order.
    pub async fn scan_and_render_all(&self) {
        if self.readiness().await.is_none() {
            return;
        }
        self.render_pending().await;
    }

    /// Render a single target the caller already holds.
    ///
    /// Already-processed targets are left alone; clear `data-processed` first
    /// to force a re-render.
    pub async fn render_one(&self, node: NodeId) {
        if self.document.has_attribute(node, PROCESSED_ATTR) {
            tracing::debug!("[render] node={} already processed", node);
            return;
        }
        if self.document.select_in(&[node], &self.options.target).first() != Some(&node) {
            tracing::warn!("[render] node={} is not a render target", node);
            return;
        }
        if self.ensure_engine_ready().await.is_none() {
            return;
        }
        self.render_target(node).await;
    }

    fn pending_targets(&self) -> Vec<NodeId> {
        self.document
            .query_all(self.document.root(), &self.options.target)
            .into_iter()
            .filter(|id| !self.document.has_attribute(*id, PROCESSED_ATTR))
            .collect()
    }

    async fn render_pending(&self) {
        let targets = self.pending_targets();
        if targets.is_empty() {
            return;
        }
        tracing::debug!("[scan] pending={}", targets.len());
        for node in targets {
            self.render_target(node).await;
        }
    }

    async fn render_target(&self, node: NodeId) {
        let attempted = match self.try_render_target(node).await {
            Ok(attempted) => attempted,
            Err(e) => {
                tracing::warn!("[render] node={} skipped error={}", node, e);
                false
            }
        };
        // Only an engine attempt earns the pause.
        if attempted && !self.options.settle_delay.is_zero() {
            tokio::time::sleep(self.options.settle_delay).await;
        }
    }

    /// Returns whether the engine was asked to render `node`.
    async fn try_render_target(&self, node: NodeId) -> Result<bool, DomError> {
        if !self
            .document
            .set_attribute_if_absent(node, PROCESSED_ATTR, "true")?
        {
            return Ok(false);
        }

        let source = self.document.text_content(node)?;
        if source.trim().is_empty() {
            tracing::warn!("[render] node={} empty diagram source, not rendering", node);
            self.document.set_attribute(node, SKIPPED_ATTR, "empty")?;
            self.report.lock().skipped_empty += 1;
            return Ok(false);
        }

        let id = self.ensure_identity(node)?;
        let request = RunRequest {
            nodes: vec![DiagramSource {
                id: id.clone(),
                source: source.clone(),
            }],
            suppress_errors: true,
        };

        let produced = match self.engine.run(request).await {
            Ok(outputs) => outputs
                .into_iter()
                .find(|d| d.id == id)
                .ok_or_else(|| EngineError::Render {
                    id: id.clone(),
                    message: "engine produced no output".to_owned(),
                }),
            Err(e) => Err(e),
        };

        match produced {
            Ok(diagram) => {
                self.document
                    .replace_children(node, NodeSpec::raw(normalize_svg(&diagram.svg, &id)))?;
                self.document.set_attribute(node, "style", TARGET_STYLE)?;
                self.report.lock().rendered += 1;
                tracing::info!("[render] id={} ok", id);
            }
            Err(e) => {
                self.document.remove_attribute(node, PROCESSED_ATTR)?;
                self.report.lock().failed += 1;
                tracing::error!("[render] id={} failed error={} source={:?}", id, e, source);
            }
        }
        Ok(true)
    }

    /// Existing `id`, or the next unused `<prefix>-<n>`.
    fn ensure_identity(&self, node: NodeId) -> Result<String, DomError> {
        if let Some(existing) = self.document.attribute(node, "id") {
            if !existing.is_empty() {
                return Ok(existing);
            }
        }
        let id = loop {
            let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let candidate = format!("{}-{}", self.options.id_prefix, n);
            if self.document.element_by_id(&candidate).is_none() {
                break candidate;
            }
        };
        self.document.set_attribute(node, "id", &id)?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle and change detection
    // -----------------------------------------------------------------------

    /// Spawn the coordinator's lifecycle: wait for the document structure,
    /// render what is there, then watch for insertions until [`stop`].
    ///
    /// [`stop`]: RenderCoordinator::stop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_lifecycle().await })
    }

    /// Ask the lifecycle task to finish. Pending debounced work is flushed.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn run_lifecycle(&self) {
        let mut shutdown = self.shutdown.subscribe();

        if self.document.ready_state() == ReadyState::Loading {
            tracing::debug!("[startup] document loading, deferring");
            tokio::select! {
                () = self.document.structure_parsed() => {}
                () = stopped(&mut shutdown) => return,
            }
        }

        self.ensure_engine_ready().await;

        // Biased so a session stopped right after start still renders what
        // is already in the document.
        let root = tokio::select! {
            biased;
            id = self.document.wait_for(&self.options.watch_root) => id,
            () = stopped(&mut shutdown) => return,
        };
        let stream = match self.document.observe(root) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("[watch] cannot observe node={} error={}", root, e);
                return;
            }
        };
        let observer = stream.id();
        tracing::debug!("[watch] attached node={}", root);

        // Catch insertions that landed before the observer existed.
        if self.engine.is_ready() {
            self.render_pending().await;
        }

        self.watch(stream, &mut shutdown).await;
        self.document.disconnect(observer);
    }

    async fn watch(&self, mut stream: MutationStream, shutdown: &mut watch::Receiver<bool>) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                batch = stream.next() => match batch {
                    Some(batch) => {
                        if self.has_pending(&batch.added) {
                            deadline = Some(Instant::now() + self.options.debounce);
                        }
                    }
                    None => break,
                },
                () = sleep_until(deadline) => {
                    deadline = None;
                    self.scan_and_render_all().await;
                }
                () = stopped(shutdown) => break,
            }
        }
        while let Some(batch) = stream.try_next() {
            if self.has_pending(&batch.added) {
                deadline = Some(Instant::now());
            }
        }
        if deadline.is_some() {
            self.scan_and_render_all().await;
        }
    }

    fn has_pending(&self, added: &[NodeId]) -> bool {
        self.document
            .select_in(added, &self.options.target)
            .into_iter()
            .any(|id| !self.document.has_attribute(id, PROCESSED_ATTR))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Make an engine SVG safe to inline: drop any XML prolog, scope its
/// internal ids under `namespace` and constrain the root element to its
/// container.
pub fn normalize_svg(svg: &str, namespace: &str) -> String {
    let Some(start) = svg.find("<svg") else {
        return svg.to_owned();
    };
    let svg = namespace_ids(&svg[start..], namespace);
    let tag_end = svg.find('>').unwrap_or(svg.len());
    match svg[..tag_end].find("style=\"") {
        Some(pos) => {
            let at = pos + "style=\"".len();
            format!("{}{};{}", &svg[..at], SVG_STYLE, &svg[at..])
        }
        None => {
            let at = "<svg".len();
            format!("{} style=\"{}\"{}", &svg[..at], SVG_STYLE, &svg[at..])
        }
    }
}

/// Prefix every `id` defined inside `svg`, and every `url(#..)` or
/// `href="#.."` reference to one, with `<namespace>-`. Two diagrams on one
/// page otherwise share marker and gradient ids.
fn namespace_ids(svg: &str, namespace: &str) -> String {
    let ids: HashSet<&str> = value_spans(svg, "id=\"", '"', true)
        .into_iter()
        .map(|(s, e)| &svg[s..e])
        .collect();
    if ids.is_empty() {
        return svg.to_owned();
    }

    let references = [
        ("id=\"", '"', true),
        ("url(#", ')', false),
        ("href=\"#", '"', false),
    ];
    let mut starts: Vec<usize> = references
        .into_iter()
        .flat_map(|(marker, close, attribute)| value_spans(svg, marker, close, attribute))
        .filter(|&(s, e)| ids.contains(&svg[s..e]))
        .map(|(s, _)| s)
        .collect();
    starts.sort_unstable();

    let mut out = String::with_capacity(svg.len() + starts.len() * (namespace.len() + 1));
    let mut last = 0;
    for at in starts {
        out.push_str(&svg[last..at]);
        out.push_str(namespace);
        out.push('-');
        last = at;
    }
    out.push_str(&svg[last..]);
    out
}

/// Byte ranges of the values following `marker` up to `close`. With
/// `attribute`, the marker must start a whitespace-separated attribute, so
/// `data-edge-id="x"` is not mistaken for `id="x"`.
fn value_spans(svg: &str, marker: &str, close: char, attribute: bool) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(pos) = svg[from..].find(marker) {
        let at = from + pos;
        let value = at + marker.len();
        let Some(len) = svg[value..].find(close) else {
            break;
        };
        let standalone = !attribute || svg[..at].ends_with(|c: char| c.is_ascii_whitespace());
        if standalone && len > 0 {
            spans.push((value, value + len));
        }
        from = value + len;
    }
    spans
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
