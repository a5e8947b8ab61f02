//! One markdown file in, one hydrated HTML page out.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::Backend;
use crate::coordinator::{CoordinatorOptions, RenderCoordinator, RenderReport};
use crate::engine::{EngineConfig, EngineHandle};
use crate::html::{self, PageError, PageShellContext};

pub struct RenderedPage {
    pub html: String,
    pub diagrams: usize,
    pub report: RenderReport,
}

/// Renders pages against one shared engine handle.
///
/// Without an engine the placeholders are left for the browser script.
pub struct PageRenderer {
    engine: Option<Arc<EngineHandle<Backend>>>,
    config: EngineConfig,
    options: CoordinatorOptions,
    inline_assets: bool,
}

impl PageRenderer {
    pub fn new(
        engine: Option<Arc<EngineHandle<Backend>>>,
        config: EngineConfig,
        options: CoordinatorOptions,
        inline_assets: bool,
    ) -> Self {
        Self {
            engine,
            config,
            options,
            inline_assets,
        }
    }

    pub async fn render(&self, source: &str, file_path: &Path) -> Result<RenderedPage, PageError> {
        let started = Instant::now();
        let built = html::build_document(source, file_path)?;

        let (document, report) = match &self.engine {
            Some(engine) if built.diagrams > 0 => {
                let coordinator = Arc::new(RenderCoordinator::new(
                    built.document,
                    Arc::clone(engine),
                    self.options.clone(),
                ));
                // One session: initial pass, then stop, which flushes anything
                // still pending.
                let session = coordinator.start();
                coordinator.stop();
                if let Err(e) = session.await {
                    tracing::error!("[page] hydration task failed: {}", e);
                }
                let report = coordinator.report();
                (coordinator.document().clone(), report)
            }
            _ => (built.document, RenderReport::default()),
        };

        let body = document.outer_html(built.content);
        let page = html::build_page_shell(
            &body,
            &built.headings,
            file_path,
            &PageShellContext {
                metadata: &built.metadata,
                engine_config: &self.config,
                inline_assets: self.inline_assets,
            },
        );

        tracing::info!(
            "[page] path={} diagrams={} rendered={} failed={} skipped={} elapsed_ms={}",
            file_path.display(),
            built.diagrams,
            report.rendered,
            report.failed,
            report.skipped_empty,
            started.elapsed().as_millis()
        );

        Ok(RenderedPage {
            html: page,
            diagrams: built.diagrams,
            report,
        })
    }
}
