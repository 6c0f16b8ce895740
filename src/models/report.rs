use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::site::{SiteConfig, StrategyKind};
use super::snapshot::TerminationReason;
use super::treatment::TreatmentProduct;

/// A snapshot the extraction service could not turn into records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionFailure {
    pub captured_at_step: u32,
    pub source_url: String,
    pub message: String,
}

/// Final per-site outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteReport {
    pub site_id: String,
    pub site_name: String,
    pub strategy: StrategyKind,
    pub snapshots_collected: usize,
    pub interactions_performed: u32,
    pub termination_reason: Option<TerminationReason>,
    pub records: Vec<TreatmentProduct>,
    pub extraction_failures: Vec<ExtractionFailure>,
    /// Set when the site failed outright; `records` is then empty.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SiteReport {
    /// A site that produced nothing because of `error`.
    pub fn failed(site: &SiteConfig, error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            site_id: site.id.clone(),
            site_name: site.site_name.clone(),
            strategy: site.strategy_kind(),
            snapshots_collected: 0,
            interactions_performed: 0,
            termination_reason: None,
            records: Vec::new(),
            extraction_failures: Vec::new(),
            error: Some(error.into()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn treatment_count(&self) -> usize {
        self.records.iter().map(|r| r.treatments.len()).sum()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// All site reports of one run, keyed by site id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub sites: BTreeMap<String, SiteReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub sites_total: usize,
    pub sites_succeeded: usize,
    pub sites_failed: usize,
    pub snapshots: usize,
    pub records: usize,
    pub treatments: usize,
    pub extraction_failures: usize,
}

impl RunReport {
    pub fn summary(&self) -> RunSummary {
        let succeeded = self.sites.values().filter(|s| s.is_success()).count();
        RunSummary {
            sites_total: self.sites.len(),
            sites_succeeded: succeeded,
            sites_failed: self.sites.len() - succeeded,
            snapshots: self.sites.values().map(|s| s.snapshots_collected).sum(),
            records: self.sites.values().map(|s| s.record_count()).sum(),
            treatments: self.sites.values().map(|s| s.treatment_count()).sum(),
            extraction_failures: self.sites.values().map(|s| s.extraction_failures.len()).sum(),
        }
    }

    pub fn all_records(&self) -> impl Iterator<Item = &TreatmentProduct> {
        self.sites.values().flat_map(|s| s.records.iter())
    }
}
