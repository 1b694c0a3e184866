//! One browser tab, as seen by the router session.
//!
//! `PageDriver` is the seam between the FRITZ!Box login flow and Chromium: the
//! router code only needs navigation, a handful of element helpers and a
//! screenshot. `ChromeLauncher` provides the chromiumoxide-backed tab.

mod chrome;
#[cfg(test)]
pub(crate) mod fake;

pub use chrome::ChromeLauncher;

use crate::browser::BrowserError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

const READY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("browser connection closed")]
    SessionClosed,
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("navigation failed: {0}")]
    NavigationFailed(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("devtools error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl PageError {
    /// The tab or its browser is gone; retrying on it is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PageError::SessionClosed | PageError::Browser(_))
    }
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Start navigating; returns once the browser accepted the request.
    async fn goto(&self, url: &str) -> Result<(), PageError>;
    async fn ready_state(&self) -> Result<String, PageError>;
    async fn current_url(&self) -> Result<String, PageError>;
    /// Outer HTML of the document.
    async fn content(&self) -> Result<String, PageError>;
    /// Whether `selector` matches an element that is rendered.
    async fn is_visible(&self, selector: &str) -> Result<bool, PageError>;
    /// Set an input's value the way typing would, so framework listeners fire.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), PageError>;
    /// Pick an option by value or visible label.
    async fn select_option(&self, selector: &str, value: &str) -> Result<(), PageError>;
    async fn click(&self, selector: &str) -> Result<(), PageError>;
    /// Submit the form that contains `selector`.
    async fn submit_enclosing_form(&self, selector: &str) -> Result<(), PageError>;
    async fn screenshot_png(&self) -> Result<Vec<u8>, PageError>;
    fn is_alive(&self) -> bool;
    /// Close the tab, and the browser if this page launched it.
    async fn close(self: Box<Self>);
}

#[async_trait]
pub trait PageLauncher: Send + Sync {
    /// A fresh blank tab with viewport and user agent applied.
    async fn open(&self) -> Result<Box<dyn PageDriver>, PageError>;
}

/// Navigate and wait until the document is at least interactive.
pub async fn navigate(page: &dyn PageDriver, url: &str, timeout: Duration) -> Result<(), PageError> {
    match tokio::time::timeout(timeout, page.goto(url)).await {
        Ok(result) => result?,
        Err(_) => return Err(PageError::Timeout(format!("navigating to {}", url))),
    }
    wait_for_ready(page, timeout).await?;
    tracing::debug!(url = %url, "navigated");
    Ok(())
}

pub async fn wait_for_ready(page: &dyn PageDriver, timeout: Duration) -> Result<(), PageError> {
    let deadline = Instant::now() + timeout;
    loop {
        match page.ready_state().await {
            Ok(state) if state == "interactive" || state == "complete" => return Ok(()),
            Ok(_) => {}
            Err(err) if err.is_fatal() => return Err(err),
            // Evaluation fails transiently while the old document is torn down.
            Err(err) => tracing::trace!(error = %err, "ready state unavailable"),
        }

        if Instant::now() >= deadline {
            return Err(PageError::Timeout("page load".to_string()));
        }
        tokio::time::sleep(READY_POLL).await;
    }
}

/// First selector of the chain that matches a rendered element.
pub async fn first_visible<'a>(
    page: &dyn PageDriver,
    selectors: &[&'a str],
) -> Result<Option<&'a str>, PageError> {
    for &selector in selectors {
        if page.is_visible(selector).await? {
            return Ok(Some(selector));
        }
    }
    Ok(None)
}

/// Wrap `body` in an IIFE with `el` bound to the first match of `selector`.
fn element_script(selector: &str, body: &str, missing: &str) -> String {
    // A JSON string literal is a valid JS string literal.
    let selector = serde_json::Value::from(selector).to_string();
    format!(
        "(() => {{ const el = document.querySelector({selector}); if (!el) {{ return {missing}; }} {body} }})()"
    )
}
