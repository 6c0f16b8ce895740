//! The seam between the acquisition loop and a live browser.

use async_trait::async_trait;
use std::time::Duration;

use crate::fingerprint::{fingerprint, Fingerprint};
use crate::models::{SiteConfig, StepAction};
use crate::utils::error::Result;

/// Content captured after a step, already fingerprinted.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedContent {
    pub fingerprint: Fingerprint,
    pub raw_content: String,
    /// The URL the page was showing when captured.
    pub url: String,
    /// False when the stabilization wait ran out and the capture is best effort.
    pub stabilized: bool,
}

impl CapturedContent {
    pub fn new(raw_content: String, url: String, stabilized: bool) -> Self {
        Self {
            fingerprint: fingerprint(&raw_content),
            raw_content,
            url,
            stabilized,
        }
    }
}

/// One live browser session driven step by step.
///
/// A driver is owned by exactly one site acquisition and `close` must be called on
/// every exit path; the acquisition loop guarantees that.
#[async_trait]
pub trait InteractionDriver: Send {
    /// Navigate to `url` and wait up to `timeout` for `wait_for_selector`.
    async fn initialize(&mut self, url: &str, wait_for_selector: Option<&str>, timeout: Duration) -> Result<()>;

    /// Click the first visible, enabled match of the highest-priority candidate that
    /// has one, else scroll once when `scroll_enabled`, else report `StepAction::None`.
    async fn perform_step(&mut self, candidates: &[String], scroll_enabled: bool) -> Result<StepAction>;

    /// Wait for the page to settle (at most `stabilization_wait`) and capture it.
    async fn capture_snapshot(&mut self, stabilization_wait: Duration) -> Result<CapturedContent>;

    /// Release the browser session.
    async fn close(&mut self);
}

/// Opens a fresh, unshared session per site.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    /// An error here means no browser can run at all and aborts the whole run.
    async fn launch(&self, site: &SiteConfig) -> Result<Box<dyn InteractionDriver>>;
}
