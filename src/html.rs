//! Markdown to document tree, and the HTML page shell around it.
//!
//! Markdown is parsed with comrak (GFM extensions, dollar math, YAML front
//! matter, raw HTML disabled). Every
//! top-level block is formatted to HTML on its own and inserted as a raw node,
//! except Mermaid fences, which become `<pre class="mermaid">` elements holding
//! the diagram source as text so the render coordinator can find and replace
//! them.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use comrak::{
    arena_tree::NodeEdge,
    format_html,
    nodes::{AstNode, NodeValue},
    parse_document, Arena, Options,
};

use crate::dom::{html_escape, DomError, Document, NodeId, NodeSpec, ReadyState};
use crate::engine::EngineConfig;
use crate::web_assets;

/// Pinned so a CDN update can never change rendering silently.
const MERMAID_CDN_URL: &str = "https://cdn.jsdelivr.net/npm/mermaid@10.9.3/dist/mermaid.min.js";
const KATEX_CDN_BASE: &str = "https://cdn.jsdelivr.net/npm/katex@0.16.11/dist";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A heading extracted from the document for TOC construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingEntry {
    /// Heading level (1–6).
    pub level: u8,
    /// Plain-text content of the heading.
    pub text: String,
    /// URL-safe anchor ID, deduplicated within the document.
    ///
    /// The first occurrence of a heading slug is bare (e.g. `my-heading`);
    /// subsequent occurrences receive a numeric suffix (`my-heading-1`, `my-heading-2`).
    pub anchor_id: String,
}

/// YAML front matter fields the page shell uses. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub date: Option<String>,
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub summary: Option<String>,
}

/// Output of [`build_document`].
pub struct RenderedMarkdown {
    pub document: Document,
    /// The `<main class="content">` element holding the page body.
    pub content: NodeId,
    pub headings: Vec<HeadingEntry>,
    pub metadata: PageMetadata,
    /// Number of top-level Mermaid placeholders created.
    pub diagrams: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("formatting markdown failed: {0}")]
    Format(#[from] std::io::Error),
    #[error(transparent)]
    Dom(#[from] DomError),
}

/// Per-page options for [`build_page_shell`].
pub struct PageShellContext<'a> {
    pub metadata: &'a PageMetadata,
    /// Handed to the browser-side Mermaid fallback.
    pub engine_config: &'a EngineConfig,
    /// Embed CSS/JS in the page instead of linking `/assets/...`.
    pub inline_assets: bool,
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

/// Build comrak render options with GFM extensions and secure defaults.
fn make_options() -> Options<'static> {
    let mut options = Options::default();
    options.extension.strikethrough = true;
    options.extension.table = true;
    options.extension.autolink = true;
    options.extension.tasklist = true;
    options.extension.math_dollars = true;
    options.extension.front_matter_delimiter = Some("---".to_owned());
    // Raw HTML from the input is replaced with `<!-- raw HTML omitted -->`.
    options.render.unsafe_ = false;
    options
}

/// Parse a `---` delimited front matter block. Malformed YAML is logged and
/// treated as absent.
fn parse_front_matter(raw: &str, file_path: &Path) -> PageMetadata {
    let yaml = raw.trim();
    let yaml = yaml.strip_prefix("---").unwrap_or(yaml);
    let yaml = yaml.trim_end();
    let yaml = yaml.strip_suffix("---").unwrap_or(yaml);
    if yaml.trim().is_empty() {
        return PageMetadata::default();
    }
    match serde_yml::from_str(yaml) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::warn!(
                "[frontmatter] path={} ignored error={}",
                file_path.display(),
                e
            );
            PageMetadata::default()
        }
    }
}

/// Convert heading text to a URL-safe anchor slug.
///
/// Lowercases, maps spaces/hyphens/underscores to `-`, drops every other
/// non-alphanumeric character, collapses and trims hyphens.
fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
        } else if (c == ' ' || c == '-' || c == '_') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_owned()
}

fn collect_heading_text<'a>(node: &'a AstNode<'a>) -> String {
    let mut text = String::new();
    for child in node.children() {
        match &child.data.borrow().value {
            NodeValue::Text(s) => text.push_str(s),
            NodeValue::Code(c) => text.push_str(&c.literal),
            NodeValue::SoftBreak | NodeValue::LineBreak => text.push(' '),
            _ => text.push_str(&collect_heading_text(child)),
        }
    }
    text
}

/// Walk the AST in document order and assign deduplicated anchors.
fn extract_headings<'a>(root: &'a AstNode<'a>) -> Vec<HeadingEntry> {
    let mut entries = Vec::new();
    let mut slug_counter: HashMap<String, usize> = HashMap::new();

    for edge in root.traverse() {
        if let NodeEdge::Start(node) = edge {
            if let NodeValue::Heading(nh) = &node.data.borrow().value {
                let text = collect_heading_text(node);
                let base_slug = slugify(&text);
                let count = slug_counter.entry(base_slug.clone()).or_insert(0);
                let anchor_id = if *count == 0 {
                    base_slug
                } else {
                    format!("{}-{}", base_slug, count)
                };
                *count += 1;
                entries.push(HeadingEntry {
                    level: nh.level,
                    text,
                    anchor_id,
                });
            }
        }
    }
    entries
}

/// Inject `id` attributes into heading elements of an HTML fragment.
///
/// Sequential first-occurrence replacement `<hN>` → `<hN id="...">`. Safe
/// because raw HTML is disabled, so every bare `<hN>` is a real heading.
fn inject_heading_ids(html: &str, headings: &[HeadingEntry]) -> String {
    let mut result = html.to_owned();
    for heading in headings {
        let tag = format!("<h{}>", heading.level);
        let with_id = format!("<h{} id=\"{}\">", heading.level, heading.anchor_id);
        result = result.replacen(&tag, &with_id, 1);
    }
    result
}

fn build_toc_html(headings: &[HeadingEntry]) -> String {
    if headings.is_empty() {
        return String::new();
    }
    let mut html = String::from("<ul>\n");
    for heading in headings {
        let class = format!("toc-h{}", heading.level);
        let anchor = heading.anchor_id.as_str();
        let text = html_escape(&heading.text);
        html.push_str(&format!(
            "<li class=\"{class}\"><a href=\"#{anchor}\">{text}</a></li>\n",
        ));
    }
    html.push_str("</ul>\n");
    html
}

/// True when the first token of a fence info string is `mermaid`
/// (case-insensitive), e.g. `mermaid` in `mermaid title=...`.
fn is_mermaid_info(info: &str) -> bool {
    info.split_whitespace()
        .next()
        .map(|lang| lang.eq_ignore_ascii_case("mermaid"))
        .unwrap_or(false)
}

fn mermaid_literal<'a>(node: &'a AstNode<'a>) -> Option<String> {
    match &node.data.borrow().value {
        NodeValue::CodeBlock(ncb) if ncb.fenced && is_mermaid_info(&ncb.info) => {
            Some(ncb.literal.clone())
        }
        _ => None,
    }
}

/// Rewrite Mermaid fences below the top level into escaped raw placeholders.
///
/// Those stay inside formatted HTML blocks, so only the browser script can
/// render them.
fn rewrite_nested_mermaid<'a>(root: &'a AstNode<'a>) -> usize {
    let mut rewritten = 0usize;
    for top in root.children() {
        for node in top.descendants().skip(1) {
            if let Some(literal) = mermaid_literal(node) {
                node.data.borrow_mut().value = NodeValue::Raw(format!(
                    "<pre class=\"mermaid\">{}</pre>\n",
                    html_escape(&literal)
                ));
                rewritten += 1;
            }
        }
    }
    rewritten
}

fn count_headings<'a>(node: &'a AstNode<'a>) -> usize {
    node.descendants()
        .filter(|n| matches!(n.data.borrow().value, NodeValue::Heading(_)))
        .count()
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Parse markdown into a [`Document`] ready for hydration.
///
/// The returned document is already [`ReadyState::Interactive`].
pub fn build_document(input: &str, file_path: &Path) -> Result<RenderedMarkdown, PageError> {
    let arena = Arena::new();
    let options = make_options();
    let root = parse_document(&arena, input, &options);

    let nested = rewrite_nested_mermaid(root);
    let headings = extract_headings(root);

    let mut metadata = PageMetadata::default();
    let mut blocks = Vec::new();
    let mut diagrams = 0usize;
    let mut heading_cursor = 0usize;
    for block in root.children() {
        if let NodeValue::FrontMatter(raw) = &block.data.borrow().value {
            metadata = parse_front_matter(raw, file_path);
            continue;
        }
        if let Some(literal) = mermaid_literal(block) {
            diagrams += 1;
            blocks.push(
                NodeSpec::element("pre")
                    .attr("class", "mermaid")
                    .child(NodeSpec::text(literal)),
            );
            continue;
        }

        let mut bytes = Vec::new();
        format_html(block, &options, &mut bytes)?;
        let html = String::from_utf8_lossy(&bytes);
        let count = count_headings(block);
        let end = (heading_cursor + count).min(headings.len());
        blocks.push(NodeSpec::raw(inject_heading_ids(&html, &headings[heading_cursor..end])));
        heading_cursor = end;
    }

    let document = Document::new();
    let mut main = NodeSpec::element("main").attr("class", "content");
    for block in blocks {
        main = main.child(block);
    }
    let content = document.append(document.root(), main)?;
    document.set_ready_state(ReadyState::Interactive);

    tracing::info!(
        "[mermaid] file={} diagrams={} nested={}",
        file_path.display(),
        diagrams,
        nested
    );
    tracing::debug!(
        "[render] path={} headings={}",
        file_path.display(),
        headings.len()
    );

    Ok(RenderedMarkdown {
        document,
        content,
        headings,
        metadata,
        diagrams,
    })
}

/// Wrap rendered content in a complete HTML page: TOC sidebar, content area,
/// and the browser-side Mermaid fallback for placeholders left unrendered.
pub fn build_page_shell(
    body_html: &str,
    headings: &[HeadingEntry],
    file_path: &Path,
    ctx: &PageShellContext,
) -> String {
    let metadata = ctx.metadata;
    let title_raw = metadata
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| headings.iter().find(|h| h.level == 1).map(|h| h.text.as_str()))
        .or_else(|| file_path.file_stem().and_then(|s| s.to_str()))
        .unwrap_or("Document");
    let title = html_escape(title_raw);
    let meta_tags = build_meta_tags(metadata);
    let toc_html = build_toc_html(headings);

    let mut client_config = ctx.engine_config.clone();
    client_config.start_on_load = false;
    let config_json = client_config.to_json().replace("</", "<\\/");

    let (style, script) = if ctx.inline_assets {
        (
            format!("<style>\n{}</style>", web_assets::CSS),
            format!("<script>\n{}</script>", web_assets::JS),
        )
    } else {
        (
            "<link rel=\"stylesheet\" href=\"/assets/mdhydrate.css\">".to_owned(),
            "<script src=\"/assets/mdhydrate.js\"></script>".to_owned(),
        )
    };

    format!(
        "<!DOCTYPE html>\n\
<html lang=\"en\">\n\
<head>\n\
<meta charset=\"utf-8\">\n\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
<title>{title} · mdhydrate</title>\n\
{meta_tags}\
<link rel=\"stylesheet\" href=\"{KATEX_CDN_BASE}/katex.min.css\">\n\
{style}\n\
</head>\n\
<body>\n\
<div class=\"layout\">\n\
<nav class=\"toc-sidebar\">\n\
{toc_html}</nav>\n\
{body_html}\n\
</div>\n\
<script id=\"mdhydrate-mermaid-config\" type=\"application/json\">{config_json}</script>\n\
<script src=\"{MERMAID_CDN_URL}\"></script>\n\
<script src=\"{KATEX_CDN_BASE}/katex.min.js\"></script>\n\
<script src=\"{KATEX_CDN_BASE}/contrib/auto-render.min.js\"></script>\n\
{script}\n\
</body>\n\
</html>\n"
    )
}

/// `<meta>` lines for the front matter fields that have one.
fn build_meta_tags(metadata: &PageMetadata) -> String {
    let mut out = String::new();
    let mut push = |name: &str, content: &str| {
        out.push_str(&format!(
            "<meta name=\"{name}\" content=\"{}\">\n",
            html_escape(content)
        ));
    };
    if let Some(author) = &metadata.author {
        push("author", author);
    }
    if let Some(date) = &metadata.date {
        push("date", date);
    }
    if let Some(summary) = &metadata.summary {
        push("description", summary);
    }
    if !metadata.tags.is_empty() {
        push("keywords", &metadata.tags.join(", "));
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
