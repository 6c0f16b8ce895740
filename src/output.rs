use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::OutputConfig;
use crate::models::RunReport;
use crate::utils::error::Result;

pub struct ReportWriter {
    directory: PathBuf,
    pretty: bool,
}

impl ReportWriter {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            directory: PathBuf::from(&config.directory),
            pretty: config.pretty,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write the run as `treatments_<timestamp>.json` and return the path.
    pub fn write(&self, report: &RunReport) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.directory)?;

        let filename = format!("treatments_{}.json", report.started_at.format("%Y%m%d_%H%M%S"));
        let path = self.directory.join(filename);

        let body = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };
        std::fs::write(&path, body)?;

        info!(path = %path.display(), records = report.summary().records, "Report written");
        Ok(path)
    }
}

/// One log line per site, then the totals.
pub fn log_summary(report: &RunReport) {
    for site in report.sites.values() {
        let reason = site
            .termination_reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());

        match &site.error {
            None => info!(
                site = %site.site_id,
                strategy = %site.strategy,
                reason = %reason,
                snapshots = site.snapshots_collected,
                interactions = site.interactions_performed,
                records = site.record_count(),
                treatments = site.treatment_count(),
                extraction_failures = site.extraction_failures.len(),
                duration_ms = site.duration_ms(),
                "Site summary"
            ),
            Some(error) => warn!(
                site = %site.site_id,
                strategy = %site.strategy,
                reason = %reason,
                error = %error,
                duration_ms = site.duration_ms(),
                "Site failed"
            ),
        }
    }

    let summary = report.summary();
    info!(
        sites = summary.sites_total,
        succeeded = summary.sites_succeeded,
        failed = summary.sites_failed,
        snapshots = summary.snapshots,
        records = summary.records,
        treatments = summary.treatments,
        extraction_failures = summary.extraction_failures,
        cancelled = report.cancelled,
        "Run summary"
    );
}
