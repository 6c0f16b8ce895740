//! Headless Chrome implementation of the interaction driver.
//!
//! `headless_chrome` talks to the browser synchronously, so every CDP call runs on the
//! blocking pool. One browser process is launched per session and killed on close.

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::driver::{CapturedContent, InteractionDriver, SessionLauncher};
use crate::models::{SiteConfig, StepAction};
use crate::utils::error::{AppError, Result};

const CLICK_SCRIPT: &str = r#"
(function(selector) {
    let nodes;
    try {
        nodes = document.querySelectorAll(selector);
    } catch (e) {
        return "invalid";
    }
    for (const el of nodes) {
        const style = window.getComputedStyle(el);
        const rect = el.getBoundingClientRect();
        const visible = style.display !== "none" && style.visibility !== "hidden"
            && rect.width > 0 && rect.height > 0;
        if (!visible || el.disabled || el.getAttribute("aria-disabled") === "true") {
            continue;
        }
        try {
            el.scrollIntoView({ block: "center" });
            el.click();
            return "clicked";
        } catch (e) {
            return "failed";
        }
    }
    return "missing";
})"#;

const SCROLL_SCRIPT: &str = r#"
(function() {
    const before = window.scrollY;
    window.scrollTo(0, document.body.scrollHeight);
    return window.scrollY !== before;
})()"#;

/// Build the click script for one selector. The selector is embedded as a JSON string
/// literal so quotes in attribute selectors survive.
pub fn click_script(selector: &str) -> Result<String> {
    let literal = serde_json::to_string(selector)?;
    Ok(format!("{}({})", CLICK_SCRIPT.trim(), literal))
}

pub struct ChromeLauncher {
    config: BrowserConfig,
}

impl ChromeLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn launch_options(config: &BrowserConfig) -> Result<LaunchOptions<'static>> {
        let mut launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .sandbox(false) // Often needed in containerized environments
            .window_size(Some((config.window_width, config.window_height)))
            .args(vec![
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-extensions"),
                OsStr::new("--disable-background-timer-throttling"),
                OsStr::new("--disable-backgrounding-occluded-windows"),
                OsStr::new("--disable-renderer-backgrounding"),
            ])
            .build()
            .map_err(|e| AppError::BrowserLaunch(format!("invalid launch options: {}", e)))?;

        if let Some(chrome_path) = &config.chrome_path {
            launch_options.path = Some(PathBuf::from(chrome_path));
        }

        Ok(launch_options)
    }
}

#[async_trait]
impl SessionLauncher for ChromeLauncher {
    async fn launch(&self, site: &SiteConfig) -> Result<Box<dyn InteractionDriver>> {
        let config = self.config.clone();
        let user_agent = site.user_agent.clone().unwrap_or_else(|| config.user_agent.clone());
        let site_id = site.id.clone();

        let (browser, tab) = tokio::task::spawn_blocking(move || -> Result<(Browser, Arc<Tab>)> {
            let options = Self::launch_options(&config)?;
            let browser = Browser::new(options).map_err(|e| AppError::BrowserLaunch(e.to_string()))?;
            let tab = browser
                .new_tab()
                .map_err(|e| AppError::BrowserLaunch(format!("failed to create tab: {}", e)))?;
            tab.set_user_agent(&user_agent, None, None)
                .map_err(|e| AppError::Browser(format!("failed to set user agent: {}", e)))?;
            Ok((browser, tab))
        })
        .await??;

        info!(site = %site_id, "Browser session started");

        Ok(Box::new(ChromeSession {
            site_id,
            browser: Some(browser),
            tab: Some(tab),
            settle_poll: self.config.settle_poll(),
        }))
    }
}

pub struct ChromeSession {
    site_id: String,
    browser: Option<Browser>,
    tab: Option<Arc<Tab>>,
    settle_poll: Duration,
}

impl ChromeSession {
    async fn on_tab<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self
            .tab
            .clone()
            .ok_or_else(|| AppError::Browser("session already closed".to_string()))?;
        tokio::task::spawn_blocking(move || f(&tab)).await?
    }

    async fn read_page(&self) -> Result<(String, String)> {
        self.on_tab(|tab| {
            let html = tab
                .get_content()
                .map_err(|e| AppError::Browser(format!("failed to get page content: {}", e)))?;
            Ok((html, tab.get_url()))
        })
        .await
    }

    async fn try_click(&self, selector: &str) -> Result<bool> {
        let script = click_script(selector)?;
        let target = selector.to_string();
        let outcome = self
            .on_tab(move |tab| {
                let result = tab.evaluate(&script, false).map_err(|e| AppError::Interaction {
                    selector: target.clone(),
                    message: e.to_string(),
                })?;
                Ok(result
                    .value
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default())
            })
            .await?;

        match outcome.as_str() {
            "clicked" => Ok(true),
            "missing" => Ok(false),
            other => Err(AppError::Interaction {
                selector: selector.to_string(),
                message: format!("click script returned '{}'", other),
            }),
        }
    }
}

#[async_trait]
impl InteractionDriver for ChromeSession {
    async fn initialize(&mut self, url: &str, wait_for_selector: Option<&str>, timeout: Duration) -> Result<()> {
        let url = url.to_string();
        let selector = wait_for_selector.map(str::to_string);

        self.on_tab(move |tab| {
            tab.set_default_timeout(timeout);
            let nav_err = |e: anyhow::Error| AppError::Navigation {
                url: url.clone(),
                message: e.to_string(),
            };

            tab.navigate_to(&url).map_err(nav_err)?;
            tab.wait_until_navigated().map_err(nav_err)?;

            if let Some(selector) = &selector {
                tab.wait_for_element_with_custom_timeout(selector, timeout)
                    .map_err(|e| AppError::Navigation {
                        url: url.clone(),
                        message: format!("wait for selector '{}' failed: {}", selector, e),
                    })?;
            }
            Ok(())
        })
        .await
    }

    async fn perform_step(&mut self, candidates: &[String], scroll_enabled: bool) -> Result<StepAction> {
        for selector in candidates {
            match self.try_click(selector).await {
                Ok(true) => return Ok(StepAction::Clicked(selector.clone())),
                Ok(false) => debug!(site = %self.site_id, selector = %selector, "No clickable match"),
                Err(e) => debug!(site = %self.site_id, error = %e, "Click failed, trying next target"),
            }
        }

        if scroll_enabled {
            let moved = self
                .on_tab(|tab| {
                    let result = tab
                        .evaluate(SCROLL_SCRIPT, false)
                        .map_err(|e| AppError::Browser(format!("scroll failed: {}", e)))?;
                    Ok(result.value.and_then(|v| v.as_bool()).unwrap_or(false))
                })
                .await?;
            debug!(site = %self.site_id, moved, "Scrolled to bottom");
            return Ok(StepAction::Scrolled);
        }

        Ok(StepAction::None)
    }

    async fn capture_snapshot(&mut self, stabilization_wait: Duration) -> Result<CapturedContent> {
        let deadline = Instant::now() + stabilization_wait;
        let (html, url) = self.read_page().await?;
        let mut previous = CapturedContent::new(html, url, true);

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                previous.stabilized = false;
                return Ok(previous);
            }
            tokio::time::sleep(self.settle_poll.min(remaining)).await;

            let (html, url) = self.read_page().await?;
            let current = CapturedContent::new(html, url, true);
            if current.fingerprint == previous.fingerprint {
                return Ok(current);
            }
            previous = current;
        }
    }

    async fn close(&mut self) {
        let tab = self.tab.take();
        let browser = self.browser.take();
        if tab.is_none() && browser.is_none() {
            return;
        }

        let closed = tokio::task::spawn_blocking(move || {
            if let Some(tab) = tab {
                if let Err(e) = tab.close(true) {
                    debug!(error = %e, "Tab close failed");
                }
            }
            // dropping the browser kills the process
            drop(browser);
        })
        .await;

        match closed {
            Ok(()) => info!(site = %self.site_id, "Browser session closed"),
            Err(e) => warn!(site = %self.site_id, error = %e, "Browser shutdown task failed"),
        }
    }
}
