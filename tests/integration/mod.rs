// Integration tests for Clinic Harvest
// These tests drive the orchestrator end to end with scripted browser sessions

pub mod acquisition_tests;
pub mod orchestrator_tests;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clinic_harvest::{
    config::{HttpConfig, OrchestratorConfig},
    extraction::{ExtractionContext, ExtractionService},
    models::{
        AcquisitionStrategy, ContentSnapshot, IndividualTreatment, InteractionConfig, SiteConfig, StepAction,
        TreatmentProduct,
    },
    utils::error::{AppError, Result},
    CapturedContent, InteractionDriver, SessionLauncher, SiteOrchestrator,
};

/// How a fake site behaves once its session is open.
#[derive(Clone, Default)]
pub struct PageScript {
    pub init_fails: bool,
    pub initial: String,
    /// Content shown after clicking a selector.
    pub clicks: HashMap<String, String>,
    /// When set, each scroll reveals fresh content.
    pub endless_scroll: bool,
    pub capture_delay: Option<Duration>,
}

impl PageScript {
    pub fn page(initial: &str) -> Self {
        Self {
            initial: initial.to_string(),
            ..Self::default()
        }
    }

    pub fn click(mut self, selector: &str, content: &str) -> Self {
        self.clicks.insert(selector.to_string(), content.to_string());
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.capture_delay = Some(delay);
        self
    }
}

/// Shared counters the tests inspect after a run.
#[derive(Default)]
pub struct SessionLog {
    pub launched: AtomicUsize,
    pub closed: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub events: Mutex<Vec<String>>,
}

impl SessionLog {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

pub struct FakeLauncher {
    pub scripts: HashMap<String, PageScript>,
    pub log: Arc<SessionLog>,
    pub fail_launch: bool,
}

impl FakeLauncher {
    pub fn new(scripts: Vec<(&str, PageScript)>) -> Self {
        Self {
            scripts: scripts.into_iter().map(|(id, s)| (id.to_string(), s)).collect(),
            log: Arc::new(SessionLog::default()),
            fail_launch: false,
        }
    }
}

#[async_trait]
impl SessionLauncher for FakeLauncher {
    async fn launch(&self, site: &SiteConfig) -> Result<Box<dyn InteractionDriver>> {
        if self.fail_launch {
            return Err(AppError::BrowserLaunch("no chrome binary".to_string()));
        }
        let script = self.scripts.get(&site.id).cloned().unwrap_or_default();

        self.log.launched.fetch_add(1, Ordering::SeqCst);
        let active = self.log.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_active.fetch_max(active, Ordering::SeqCst);
        self.log.record(format!("launch:{}", site.id));

        Ok(Box::new(FakeSession {
            site_id: site.id.clone(),
            page: script.initial.clone(),
            script,
            scrolls: 0,
            log: self.log.clone(),
            closed: false,
        }))
    }
}

pub struct FakeSession {
    site_id: String,
    script: PageScript,
    page: String,
    scrolls: usize,
    log: Arc<SessionLog>,
    closed: bool,
}

#[async_trait]
impl InteractionDriver for FakeSession {
    async fn initialize(&mut self, url: &str, _wait_for_selector: Option<&str>, _timeout: Duration) -> Result<()> {
        if self.script.init_fails {
            return Err(AppError::Navigation {
                url: url.to_string(),
                message: "wait for selector timed out".to_string(),
            });
        }
        Ok(())
    }

    async fn perform_step(&mut self, candidates: &[String], scroll_enabled: bool) -> Result<StepAction> {
        for candidate in candidates {
            if let Some(content) = self.script.clicks.get(candidate) {
                self.page = content.clone();
                return Ok(StepAction::Clicked(candidate.clone()));
            }
        }
        if scroll_enabled {
            self.scrolls += 1;
            if self.script.endless_scroll {
                self.page = format!("{} + lazy row {}", self.script.initial, self.scrolls);
            }
            return Ok(StepAction::Scrolled);
        }
        Ok(StepAction::None)
    }

    async fn capture_snapshot(&mut self, _stabilization_wait: Duration) -> Result<CapturedContent> {
        if let Some(delay) = self.script.capture_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(CapturedContent::new(
            self.page.clone(),
            format!("https://{}.test/", self.site_id),
            true,
        ))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        self.log.active.fetch_sub(1, Ordering::SeqCst);
        self.log.record(format!("close:{}", self.site_id));
    }
}

/// One record per `|`-separated name in the snapshot; fails for content containing
/// "broken".
pub struct FakeExtractor;

#[async_trait]
impl ExtractionService for FakeExtractor {
    async fn extract(&self, context: &ExtractionContext, snapshot: &ContentSnapshot) -> Result<Vec<TreatmentProduct>> {
        if snapshot.raw_content.contains("broken") {
            return Err(AppError::Extraction {
                source_url: snapshot.source_url.clone(),
                message: "model reply had no JSON".to_string(),
            });
        }
        let products = snapshot
            .raw_content
            .split('|')
            .map(|name| TreatmentProduct {
                id: format!("{}-{}-{}", context.site_id, snapshot.captured_at_step, name),
                site_id: context.site_id.clone(),
                clinic_name: context.site_name.clone(),
                source_url: snapshot.source_url.clone(),
                product_name: name.to_string(),
                category: None,
                original_price: None,
                event_price: None,
                description: None,
                treatments: vec![IndividualTreatment {
                    name: name.to_string(),
                    ..IndividualTreatment::default()
                }],
                captured_at_step: snapshot.captured_at_step,
                scraped_at: chrono::Utc::now(),
            })
            .collect();
        Ok(products)
    }
}

pub fn orchestrator_config(max_concurrent_sites: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_concurrent_sites,
        session_spacing_ms: 0,
        run_timeout_seconds: 0,
    }
}

pub fn http_config() -> HttpConfig {
    HttpConfig {
        user_agent: "ClinicHarvest-Test/1.0".to_string(),
        request_timeout: 5,
        sitemap_paths: vec!["/sitemap.xml".to_string()],
        max_discovered_urls: 100,
    }
}

pub fn interaction(click_targets: &[&str], scroll_enabled: bool) -> InteractionConfig {
    InteractionConfig {
        click_targets: click_targets.iter().map(|t| t.to_string()).collect(),
        scroll_enabled,
        stabilization_wait_seconds: 0.1,
        max_interactions: 5,
        stagnation_threshold: 2,
        ..InteractionConfig::default()
    }
}

pub fn spa_site(id: &str, interaction: InteractionConfig) -> SiteConfig {
    SiteConfig {
        id: id.to_string(),
        site_name: format!("{} clinic", id),
        base_url: format!("https://{}.test/", id),
        user_agent: None,
        rate_limit_seconds: 0.0,
        acquisition: AcquisitionStrategy::SpaDynamic {
            entry_url: None,
            interaction,
        },
    }
}

pub fn create_orchestrator(launcher: Arc<FakeLauncher>, max_concurrent_sites: usize) -> SiteOrchestrator {
    SiteOrchestrator::new(
        launcher,
        reqwest::Client::new(),
        &orchestrator_config(max_concurrent_sites),
        &http_config(),
    )
    .with_extractor(Arc::new(FakeExtractor))
}
