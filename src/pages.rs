//! Plain HTTP page fetching for sitemap and static-list sites.

use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HttpConfig;
use crate::driver::CapturedContent;
use crate::models::{AcquisitionResult, ContentSnapshot, TerminationReason};
use crate::utils::error::{AppError, Result};

pub fn build_http_client(config: &HttpConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.request_timeout))
        .build()?;
    Ok(client)
}

pub struct PageFetcher {
    client: reqwest::Client,
}

impl PageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn fetch(&self, url: &str, user_agent: Option<&str>) -> Result<CapturedContent> {
        let mut request = self.client.get(url);
        if let Some(user_agent) = user_agent {
            request = request.header(reqwest::header::USER_AGENT, user_agent);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Navigation {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            });
        }

        let final_url = response.url().to_string();
        let body = response.text().await?;
        Ok(CapturedContent::new(body, final_url, true))
    }

    /// Fetch `urls` one at a time, `spacing` apart. Pages that fail are skipped; pages
    /// whose content was already seen are not kept twice. The step of a snapshot is
    /// the index of its URL in `urls`.
    pub async fn fetch_all(
        &self,
        site_id: &str,
        urls: &[String],
        user_agent: Option<&str>,
        spacing: Duration,
        cancel: &CancellationToken,
    ) -> AcquisitionResult {
        let mut seen = HashSet::new();
        let mut result = AcquisitionResult::empty(TerminationReason::Completed);

        for (index, url) in urls.iter().enumerate() {
            if index > 0 && !spacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        result.termination_reason = TerminationReason::Cancelled;
                        break;
                    }
                    _ = tokio::time::sleep(spacing) => {}
                }
            }
            if cancel.is_cancelled() {
                result.termination_reason = TerminationReason::Cancelled;
                break;
            }

            let captured = tokio::select! {
                _ = cancel.cancelled() => {
                    result.termination_reason = TerminationReason::Cancelled;
                    break;
                }
                fetched = self.fetch(url, user_agent) => fetched,
            };

            match captured {
                Ok(captured) => {
                    if !seen.insert(captured.fingerprint.clone()) {
                        debug!(site = %site_id, url = %url, "Duplicate page content");
                        continue;
                    }
                    result.snapshots.push(ContentSnapshot {
                        fingerprint: captured.fingerprint,
                        raw_content: captured.raw_content,
                        captured_at_step: index as u32,
                        source_url: captured.url,
                    });
                }
                Err(e) => warn!(site = %site_id, url = %url, error = %e, "Page fetch failed"),
            }
        }

        metrics::counter!("harvest_snapshots_total").increment(result.snapshots.len() as u64);
        info!(
            site = %site_id,
            pages = urls.len(),
            snapshots = result.snapshots.len(),
            reason = %result.termination_reason,
            "Page acquisition finished"
        );
        result
    }
}
