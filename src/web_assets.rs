//! Embedded static web assets.
//!
//! Compiled into the binary via `include_str!`; `serve` answers
//! `/assets/mdhydrate.{css,js}` from these and `render` inlines them.

/// Layout, TOC sidebar, and diagram block styling.
pub const CSS: &str = include_str!("assets/mdhydrate.css");

/// Browser-side Mermaid fallback for placeholders the server left unrendered,
/// plus KaTeX typesetting.
pub const JS: &str = include_str!("assets/mdhydrate.js");
