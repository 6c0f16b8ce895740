//! Runs a batch of sites through acquisition and extraction.
//!
//! Sites run as independent tokio tasks. A semaphore caps how many are in flight, a
//! rate limiter spaces out browser launches, and one cancellation token reaches
//! every loop. A site failing is recorded in its report; only a browser that cannot
//! launch at all stops the batch.

use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acquisition::AcquisitionLoop;
use crate::config::{HttpConfig, OrchestratorConfig};
use crate::driver::SessionLauncher;
use crate::extraction::{ExtractionContext, ExtractionService};
use crate::models::{
    generate_id, AcquisitionResult, AcquisitionStrategy, ExtractionFailure, InteractionConfig, RunReport,
    SiteConfig, SiteReport, TerminationReason, TreatmentProduct,
};
use crate::pages::PageFetcher;
use crate::sitemap::{SitemapDiscovery, UrlFilter};
use crate::utils::error::{AppError, Result};

#[derive(Clone)]
pub struct SiteOrchestrator {
    launcher: Arc<dyn SessionLauncher>,
    fetcher: Arc<PageFetcher>,
    discovery: Arc<SitemapDiscovery>,
    extractor: Option<Arc<dyn ExtractionService>>,
    max_concurrent: usize,
    session_limiter: Option<Arc<DefaultDirectRateLimiter>>,
    run_timeout: Option<Duration>,
}

impl SiteOrchestrator {
    pub fn new(
        launcher: Arc<dyn SessionLauncher>,
        client: reqwest::Client,
        orchestrator: &OrchestratorConfig,
        http: &HttpConfig,
    ) -> Self {
        let session_limiter = Quota::with_period(orchestrator.session_spacing())
            .map(|quota| Arc::new(RateLimiter::direct(quota)));

        Self {
            launcher,
            fetcher: Arc::new(PageFetcher::new(client.clone())),
            discovery: Arc::new(SitemapDiscovery::new(
                client,
                http.sitemap_paths.clone(),
                http.max_discovered_urls,
            )),
            extractor: None,
            max_concurrent: orchestrator.max_concurrent_sites.max(1),
            session_limiter,
            run_timeout: orchestrator.run_timeout(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ExtractionService>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Process every site and merge the reports by site id. `cancel` stops the run
    /// early; reports of sites already started still come back, partial.
    pub async fn run(&self, sites: Vec<SiteConfig>, cancel: CancellationToken) -> Result<RunReport> {
        let run_id = generate_id();
        let started_at = Utc::now();
        let token = cancel.child_token();

        info!(run_id = %run_id, sites = sites.len(), max_concurrent = self.max_concurrent, "Run started");

        let timer = self.run_timeout.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(seconds = limit.as_secs(), "Run timeout reached, cancelling");
                        token.cancel();
                    }
                }
            })
        });

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for site in sites {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let token = token.clone();
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| AppError::Internal(format!("site pool closed: {}", e)))?;
                this.process_site(site, token).await
            });
        }

        let mut reports = BTreeMap::new();
        let mut fatal = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => {
                    reports.insert(report.site_id.clone(), report);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Aborting run");
                    token.cancel();
                    fatal.get_or_insert(e);
                }
                Err(e) => error!(error = %e, "Site task panicked"),
            }
        }

        let cancelled = token.is_cancelled();
        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            sites: reports,
        };
        let summary = report.summary();
        info!(
            run_id = %report.run_id,
            succeeded = summary.sites_succeeded,
            failed = summary.sites_failed,
            records = summary.records,
            cancelled,
            "Run finished"
        );
        Ok(report)
    }

    /// One site from acquisition through extraction. Returns `Err` only for fatal
    /// errors; everything else ends up in the report.
    pub async fn process_site(&self, site: SiteConfig, token: CancellationToken) -> Result<SiteReport> {
        let started_at = Utc::now();
        info!(site = %site.id, strategy = %site.strategy_kind(), "Site started");

        let acquisition = match self.acquire(&site, &token).await {
            Ok(result) => result,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(site = %site.id, error = %e, "Site failed");
                return Ok(SiteReport::failed(&site, e.to_string(), started_at));
            }
        };

        if let Some(cut_short) = interruption(&site, acquisition.termination_reason) {
            warn!(
                site = %site.id,
                error = %cut_short,
                snapshots = acquisition.snapshots.len(),
                "Acquisition cut short, extracting partial snapshots"
            );
        }
        let (records, extraction_failures) = self.extract_all(&site, &acquisition).await;

        let error = match acquisition.termination_reason {
            TerminationReason::InitFailed => Some(format!("initialization failed for {}", site.entry_url())),
            _ => None,
        };

        let report = SiteReport {
            site_id: site.id.clone(),
            site_name: site.site_name.clone(),
            strategy: site.strategy_kind(),
            snapshots_collected: acquisition.snapshots.len(),
            interactions_performed: acquisition.interactions_performed,
            termination_reason: Some(acquisition.termination_reason),
            records,
            extraction_failures,
            error,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            site = %report.site_id,
            snapshots = report.snapshots_collected,
            records = report.record_count(),
            treatments = report.treatment_count(),
            duration_ms = report.duration_ms(),
            "Site finished"
        );
        Ok(report)
    }

    async fn acquire(&self, site: &SiteConfig, token: &CancellationToken) -> Result<AcquisitionResult> {
        let user_agent = site.user_agent.as_deref();

        match &site.acquisition {
            AcquisitionStrategy::SpaDynamic { interaction, .. } => self.acquire_dynamic(site, interaction, token).await,
            AcquisitionStrategy::StaticList { urls } => {
                Ok(self.fetcher.fetch_all(&site.id, urls, user_agent, site.rate_limit(), token).await)
            }
            AcquisitionStrategy::Sitemap {
                priority_keywords,
                exclude_patterns,
                max_urls,
            } => {
                let filter = UrlFilter::new(priority_keywords, exclude_patterns);
                let mut urls = tokio::select! {
                    _ = token.cancelled() => return Ok(AcquisitionResult::empty(TerminationReason::Cancelled)),
                    found = self.discovery.discover(&site.base_url, &filter) => found?,
                };
                urls.truncate(*max_urls);
                Ok(self.fetcher.fetch_all(&site.id, &urls, user_agent, site.rate_limit(), token).await)
            }
        }
    }

    async fn acquire_dynamic(
        &self,
        site: &SiteConfig,
        interaction: &InteractionConfig,
        token: &CancellationToken,
    ) -> Result<AcquisitionResult> {
        if let Some(limiter) = &self.session_limiter {
            tokio::select! {
                _ = token.cancelled() => return Ok(AcquisitionResult::empty(TerminationReason::Cancelled)),
                _ = limiter.until_ready() => {}
            }
        }
        if token.is_cancelled() {
            return Ok(AcquisitionResult::empty(TerminationReason::Cancelled));
        }

        if interaction.is_single_snapshot() {
            info!(site = %site.id, "No click targets and no scrolling, taking a single snapshot");
        }

        let mut driver = self.launcher.launch(site).await?;
        let acquisition = AcquisitionLoop::new(&site.id, site.entry_url(), interaction.clone(), token.clone());
        Ok(acquisition.run(driver.as_mut()).await)
    }

    /// Extract every snapshot in step order. A product already found under the same
    /// name in an earlier snapshot of this site is kept only once.
    async fn extract_all(
        &self,
        site: &SiteConfig,
        acquisition: &AcquisitionResult,
    ) -> (Vec<TreatmentProduct>, Vec<ExtractionFailure>) {
        let mut records = Vec::new();
        let mut failures = Vec::new();
        let Some(extractor) = &self.extractor else {
            return (records, failures);
        };

        let context = ExtractionContext {
            site_id: site.id.clone(),
            site_name: site.site_name.clone(),
        };

        let mut seen_names = HashSet::new();
        for snapshot in &acquisition.snapshots {
            match extractor.extract(&context, snapshot).await {
                Ok(found) => {
                    let total = found.len();
                    records.extend(found.into_iter().filter(|p| seen_names.insert(p.product_name.clone())));
                    debug!(
                        site = %site.id,
                        step = snapshot.captured_at_step,
                        found = total,
                        kept = records.len(),
                        "Snapshot extracted"
                    );
                }
                Err(e) => {
                    warn!(site = %site.id, step = snapshot.captured_at_step, error = %e, "Extraction failed");
                    metrics::counter!("harvest_extraction_failures_total").increment(1);
                    failures.push(ExtractionFailure {
                        captured_at_step: snapshot.captured_at_step,
                        source_url: snapshot.source_url.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        metrics::counter!("harvest_records_total").increment(records.len() as u64);
        (records, failures)
    }
}

/// The error behind an acquisition that stopped before finishing on its own.
fn interruption(site: &SiteConfig, reason: TerminationReason) -> Option<AppError> {
    match reason {
        TerminationReason::SiteTimeout => {
            let seconds = match &site.acquisition {
                AcquisitionStrategy::SpaDynamic { interaction, .. } => interaction.site_timeout_seconds,
                _ => 0,
            };
            Some(AppError::SiteTimeout {
                site_id: site.id.clone(),
                seconds,
            })
        }
        TerminationReason::Cancelled => Some(AppError::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(site_timeout_seconds: u64) -> SiteConfig {
        SiteConfig {
            id: "ppeum_global".to_string(),
            site_name: "PPEUM Global".to_string(),
            base_url: "https://global.ppeum.com/".to_string(),
            user_agent: None,
            rate_limit_seconds: 1.0,
            acquisition: AcquisitionStrategy::SpaDynamic {
                entry_url: None,
                interaction: InteractionConfig {
                    site_timeout_seconds,
                    ..InteractionConfig::default()
                },
            },
        }
    }

    #[test]
    fn test_interruption_reports_site_budget() {
        let error = interruption(&site(120), TerminationReason::SiteTimeout).unwrap();
        assert!(matches!(error, AppError::SiteTimeout { seconds: 120, .. }));
        assert_eq!(error.to_string(), "Site ppeum_global exceeded its 120s time budget");
    }

    #[test]
    fn test_interruption_for_cancelled_run() {
        assert!(matches!(
            interruption(&site(300), TerminationReason::Cancelled),
            Some(AppError::Cancelled)
        ));
    }

    #[test]
    fn test_natural_terminations_are_not_interruptions() {
        for reason in [
            TerminationReason::StagnantLimit,
            TerminationReason::MaxInteractions,
            TerminationReason::NoFurtherAction,
            TerminationReason::Completed,
            TerminationReason::InitFailed,
        ] {
            assert!(interruption(&site(300), reason).is_none());
        }
    }
}
