use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::utils::error::AppError;

/// One clinic website and how its content is acquired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteConfig {
    /// Catalog key, filled in from the table name when loaded.
    #[serde(default)]
    pub id: String,
    pub site_name: String,
    pub base_url: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Pause between page requests inside a sitemap or static-list site.
    #[serde(default = "default_rate_limit_seconds")]
    pub rate_limit_seconds: f64,
    pub acquisition: AcquisitionStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum AcquisitionStrategy {
    Sitemap {
        #[serde(default)]
        priority_keywords: Vec<String>,
        #[serde(default)]
        exclude_patterns: Vec<String>,
        #[serde(default = "default_max_sitemap_urls")]
        max_urls: usize,
    },
    StaticList {
        urls: Vec<String>,
    },
    SpaDynamic {
        #[serde(default)]
        entry_url: Option<String>,
        #[serde(default)]
        interaction: InteractionConfig,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Sitemap,
    StaticList,
    SpaDynamic,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StrategyKind::Sitemap => "sitemap",
            StrategyKind::StaticList => "static-list",
            StrategyKind::SpaDynamic => "spa-dynamic",
        };
        f.pad(name)
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sitemap" => Ok(StrategyKind::Sitemap),
            "static-list" => Ok(StrategyKind::StaticList),
            "spa-dynamic" => Ok(StrategyKind::SpaDynamic),
            other => Err(AppError::Validation(format!("Unknown strategy: {}", other))),
        }
    }
}

/// How duplicate observations feed the stagnation counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StagnationMode {
    /// New content resets the counter, so only a run of duplicates stops the loop.
    #[default]
    Consecutive,
    /// Every duplicate counts toward the limit for the whole site run.
    Cumulative,
}

/// Interaction plan for a client-side rendered site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionConfig {
    #[serde(default)]
    pub wait_for_selector: Option<String>,
    #[serde(default)]
    pub click_targets: Vec<String>,
    #[serde(default)]
    pub scroll_enabled: bool,
    #[serde(alias = "wait_time_seconds", default = "default_stabilization_wait")]
    pub stabilization_wait_seconds: f64,
    #[serde(default = "default_max_interactions")]
    pub max_interactions: u32,
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout_seconds: u64,
    #[serde(default = "default_site_timeout")]
    pub site_timeout_seconds: u64,
    #[serde(default = "default_stagnation_threshold")]
    pub stagnation_threshold: u32,
    #[serde(default)]
    pub stagnation_mode: StagnationMode,
}

/// One day. Longer per-site budgets are configuration mistakes.
pub const MAX_SITE_TIMEOUT_SECONDS: u64 = 86_400;
pub const MAX_STABILIZATION_WAIT_SECONDS: u64 = 600;

fn default_rate_limit_seconds() -> f64 {
    1.0
}

fn default_max_sitemap_urls() -> usize {
    50
}

fn default_stabilization_wait() -> f64 {
    3.0
}

fn default_max_interactions() -> u32 {
    10
}

fn default_navigation_timeout() -> u64 {
    15
}

fn default_site_timeout() -> u64 {
    300
}

fn default_stagnation_threshold() -> u32 {
    3
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            wait_for_selector: None,
            click_targets: Vec::new(),
            scroll_enabled: false,
            stabilization_wait_seconds: default_stabilization_wait(),
            max_interactions: default_max_interactions(),
            navigation_timeout_seconds: default_navigation_timeout(),
            site_timeout_seconds: default_site_timeout(),
            stagnation_threshold: default_stagnation_threshold(),
            stagnation_mode: StagnationMode::default(),
        }
    }
}

impl InteractionConfig {
    pub fn stabilization_wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.stabilization_wait_seconds)
            .map(|wait| wait.min(Duration::from_secs(MAX_STABILIZATION_WAIT_SECONDS)))
            .unwrap_or(Duration::from_secs(MAX_STABILIZATION_WAIT_SECONDS))
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_secs(self.navigation_timeout_seconds)
    }

    pub fn site_timeout(&self) -> Duration {
        Duration::from_secs(self.site_timeout_seconds)
    }

    /// Nothing to click and no scrolling: only the initial snapshot is taken.
    pub fn is_single_snapshot(&self) -> bool {
        self.click_targets.is_empty() && !self.scroll_enabled
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_interactions == 0 {
            return Err(AppError::Validation("max_interactions must be at least 1".into()));
        }
        if !(self.stabilization_wait_seconds.is_finite() && self.stabilization_wait_seconds > 0.0) {
            return Err(AppError::Validation(
                "stabilization_wait_seconds must be a positive number".into(),
            ));
        }
        if self.stabilization_wait_seconds > MAX_STABILIZATION_WAIT_SECONDS as f64 {
            return Err(AppError::Validation(format!(
                "stabilization_wait_seconds must not exceed {}",
                MAX_STABILIZATION_WAIT_SECONDS
            )));
        }
        if self.navigation_timeout_seconds == 0 || self.navigation_timeout_seconds > MAX_SITE_TIMEOUT_SECONDS {
            return Err(AppError::Validation(format!(
                "navigation_timeout_seconds must be between 1 and {}",
                MAX_SITE_TIMEOUT_SECONDS
            )));
        }
        if self.site_timeout_seconds == 0 || self.site_timeout_seconds > MAX_SITE_TIMEOUT_SECONDS {
            return Err(AppError::Validation(format!(
                "site_timeout_seconds must be between 1 and {}",
                MAX_SITE_TIMEOUT_SECONDS
            )));
        }
        if self.stagnation_threshold == 0 {
            return Err(AppError::Validation("stagnation_threshold must be at least 1".into()));
        }
        if let Some(target) = self.click_targets.iter().find(|t| t.trim().is_empty()) {
            return Err(AppError::Validation(format!("Empty click target: {:?}", target)));
        }
        Ok(())
    }
}

impl SiteConfig {
    pub fn strategy_kind(&self) -> StrategyKind {
        match self.acquisition {
            AcquisitionStrategy::Sitemap { .. } => StrategyKind::Sitemap,
            AcquisitionStrategy::StaticList { .. } => StrategyKind::StaticList,
            AcquisitionStrategy::SpaDynamic { .. } => StrategyKind::SpaDynamic,
        }
    }

    /// Where an SPA session starts: the configured entry URL, else the base URL.
    pub fn entry_url(&self) -> &str {
        match &self.acquisition {
            AcquisitionStrategy::SpaDynamic { entry_url: Some(url), .. } => url,
            _ => &self.base_url,
        }
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs_f64(self.rate_limit_seconds.max(0.0))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.site_name.trim().is_empty() {
            return Err(AppError::Validation(format!("Site '{}' has no site_name", self.id)));
        }
        if Url::parse(&self.base_url).is_err() {
            return Err(AppError::Validation(format!(
                "Site '{}' has an invalid base_url: {}",
                self.id, self.base_url
            )));
        }
        if !self.rate_limit_seconds.is_finite() || self.rate_limit_seconds < 0.0 {
            return Err(AppError::Validation(format!(
                "Site '{}' rate_limit_seconds must be zero or positive",
                self.id
            )));
        }

        match &self.acquisition {
            AcquisitionStrategy::Sitemap { max_urls, .. } => {
                if *max_urls == 0 {
                    return Err(AppError::Validation(format!(
                        "Site '{}' sitemap max_urls must be greater than 0",
                        self.id
                    )));
                }
            }
            AcquisitionStrategy::StaticList { urls } => {
                if urls.is_empty() {
                    return Err(AppError::Validation(format!("Site '{}' has an empty URL list", self.id)));
                }
                for url in urls {
                    if Url::parse(url).is_err() {
                        return Err(AppError::Validation(format!("Site '{}' has an invalid URL: {}", self.id, url)));
                    }
                }
            }
            AcquisitionStrategy::SpaDynamic { entry_url, interaction } => {
                if let Some(entry) = entry_url {
                    if Url::parse(entry).is_err() {
                        return Err(AppError::Validation(format!(
                            "Site '{}' has an invalid entry_url: {}",
                            self.id, entry
                        )));
                    }
                }
                interaction
                    .validate()
                    .map_err(|e| AppError::Validation(format!("Site '{}': {}", self.id, e)))?;
            }
        }

        Ok(())
    }
}
