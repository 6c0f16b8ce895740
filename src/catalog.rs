//! The site catalog: every clinic site the harvester knows about.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::models::{SiteConfig, StrategyKind};
use crate::utils::error::{AppError, Result};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    sites: BTreeMap<String, SiteConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct SiteCatalog {
    sites: BTreeMap<String, SiteConfig>,
}

impl SiteCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let catalog = Self::from_toml(&raw)?;
        info!(path = %path.display(), sites = catalog.len(), "Site catalog loaded");
        Ok(catalog)
    }

    /// Parse `[sites.<id>]` tables. The table key becomes the site id.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(raw)?;
        let mut sites = BTreeMap::new();

        for (id, mut site) in file.sites {
            site.id = id.clone();
            site.validate()?;
            sites.insert(id, site);
        }

        Ok(Self { sites })
    }

    pub fn get(&self, id: &str) -> Option<&SiteConfig> {
        self.sites.get(id)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.values()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sites.keys().map(String::as_str).collect()
    }

    pub fn by_strategy(&self, kind: StrategyKind) -> Vec<&SiteConfig> {
        self.iter().filter(|s| s.strategy_kind() == kind).collect()
    }

    /// Sites to run: the requested ids (all when empty), optionally narrowed to
    /// one strategy. Unknown ids are an error.
    pub fn select(&self, ids: &[String], strategy: Option<StrategyKind>) -> Result<Vec<SiteConfig>> {
        let chosen: Vec<&SiteConfig> = if ids.is_empty() {
            self.iter().collect()
        } else {
            ids.iter()
                .map(|id| {
                    self.get(id).ok_or_else(|| AppError::NotFound {
                        resource: format!("site '{}'", id),
                    })
                })
                .collect::<Result<_>>()?
        };

        Ok(chosen
            .into_iter()
            .filter(|site| strategy.is_none_or(|kind| site.strategy_kind() == kind))
            .cloned()
            .collect())
    }
}
