#![allow(dead_code)]

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("navigation to `{url}` failed: {detail}")]
    Navigation { url: String, detail: String },
    #[error("script evaluation failed: {0}")]
    Evaluation(String),
    #[error("element `{selector}` not found within {timeout:?}")]
    ElementTimeout {
        selector: String,
        timeout: Duration,
    },
}

/// Opaque DOM-query executor backing the catalog scraper. The scraper only
/// needs these four operations; how pages are actually driven (CDP,
/// WebDriver, anything else) is the embedder's business.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Evaluates a JavaScript expression in the current page and returns its
    /// JSON-serialized result.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, BrowserError>;

    async fn wait_for_element(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    /// Scrolls the page by `step` pixels, waits `delay` for lazy content,
    /// and reports whether new content appeared.
    async fn scroll(&self, step: u32, delay: Duration) -> Result<bool, BrowserError>;
}
