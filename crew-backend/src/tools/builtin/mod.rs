//! Built-in tools for crew agents

mod web_fetch;

pub use web_fetch::{extract_paragraphs, truncate_chars, WebFetchConfig, WebFetchTool, WEB_FETCH_TOOL};
