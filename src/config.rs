use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub browser: BrowserConfig,
    pub orchestrator: OrchestratorConfig,
    pub http: HttpConfig,
    pub extraction: ExtractionConfig,
    pub catalog: CatalogConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub chrome_path: Option<String>,
    pub user_agent: String,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    /// Content is considered settled once two polls this far apart match.
    pub settle_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_concurrent_sites: usize,
    /// Minimum gap between two browser session starts.
    pub session_spacing_ms: u64,
    /// Zero disables the run-level timeout.
    pub run_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub user_agent: String,
    pub request_timeout: u64,
    pub sitemap_paths: Vec<String>,
    /// Upper bound on URLs collected while walking sitemap indexes.
    pub max_discovered_urls: usize,
}

/// Which model API the extraction client speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionProvider {
    /// `POST {api_base}/chat/completions`, also used for LiteLLM-style proxies.
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// `POST {api_base}/messages`
    Anthropic,
    /// `POST {api_base}/models/{model}:generateContent`
    Gemini,
}

impl ExtractionProvider {
    /// Environment variable consulted when no API key is configured.
    pub fn api_key_var(&self) -> &'static str {
        match self {
            ExtractionProvider::OpenAi => "OPENAI_API_KEY",
            ExtractionProvider::Anthropic => "ANTHROPIC_API_KEY",
            ExtractionProvider::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl std::fmt::Display for ExtractionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ExtractionProvider::OpenAi => "openai",
            ExtractionProvider::Anthropic => "anthropic",
            ExtractionProvider::Gemini => "gemini",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub enabled: bool,
    #[serde(default)]
    pub provider: ExtractionProvider,
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_content_chars: usize,
    pub min_content_chars: usize,
    pub request_timeout: u64,
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
    pub request_spacing_ms: u64,
    /// Provider quota; when set it replaces `request_spacing_ms` with an even
    /// spacing of one request every `60 / requests_per_minute` seconds.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    /// Prompt template file. The built-in templates are used when unset.
    #[serde(default)]
    pub prompts_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub directory: String,
    pub pretty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// When set, logs are also written to a daily rolling file here.
    pub directory: Option<String>,
    pub file_prefix: String,
}

impl BrowserConfig {
    pub fn settle_poll(&self) -> Duration {
        Duration::from_millis(self.settle_poll_ms)
    }
}

impl ExtractionConfig {
    /// Minimum gap between two requests to the model API.
    pub fn request_spacing(&self) -> Duration {
        match self.requests_per_minute {
            Some(rpm) if rpm > 0 => Duration::from_secs(60) / rpm,
            _ => Duration::from_millis(self.request_spacing_ms),
        }
    }
}

impl OrchestratorConfig {
    pub fn session_spacing(&self) -> Duration {
        Duration::from_millis(self.session_spacing_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        (self.run_timeout_seconds > 0).then(|| Duration::from_secs(self.run_timeout_seconds))
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env may carry the extraction API key
        dotenvy::dotenv().ok();
        Self::from_dir("config")
    }

    /// Load layered configuration from `dir`, then the `HARVEST__` environment.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let layer = |name: &str| -> String { dir.join(name).to_string_lossy().into_owned() };

        let s = Config::builder()
            // Start with default configuration
            .add_source(File::with_name(&layer("default")))
            // Add environment-specific config
            .add_source(File::with_name(&layer(&run_mode)).required(false))
            // Add local config (ignored by git)
            .add_source(File::with_name(&layer("local")).required(false))
            // Add environment variables with prefix "HARVEST__"
            .add_source(Environment::with_prefix("HARVEST").separator("__"))
            .build()?;

        let mut config: AppConfig = s.try_deserialize()?;

        if config.browser.chrome_path.is_none() {
            config.browser.chrome_path = env::var("CHROME_PATH").ok();
        }
        if config.extraction.api_key.is_none() {
            config.extraction.api_key = env::var(config.extraction.provider.api_key_var()).ok();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn catalog_path(&self) -> PathBuf {
        PathBuf::from(&self.catalog.path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.max_concurrent_sites == 0 {
            return Err(ConfigError::Message(
                "Orchestrator max_concurrent_sites must be greater than 0".into(),
            ));
        }

        if self.browser.window_width == 0 || self.browser.window_height == 0 {
            return Err(ConfigError::Message("Browser window size must be non-zero".into()));
        }

        if self.browser.settle_poll_ms == 0 {
            return Err(ConfigError::Message("Browser settle_poll_ms must be greater than 0".into()));
        }

        if self.http.request_timeout == 0 {
            return Err(ConfigError::Message("HTTP request_timeout must be greater than 0".into()));
        }

        if self.http.sitemap_paths.iter().any(|p| !p.starts_with('/')) {
            return Err(ConfigError::Message("Sitemap paths must start with '/'".into()));
        }

        if self.extraction.enabled {
            if Url::parse(&self.extraction.api_base).is_err() {
                return Err(ConfigError::Message("Invalid extraction api_base URL".into()));
            }

            if self.extraction.model.trim().is_empty() {
                return Err(ConfigError::Message("Extraction model must not be empty".into()));
            }

            if self.extraction.min_content_chars >= self.extraction.max_content_chars {
                return Err(ConfigError::Message(
                    "Extraction min_content_chars must be below max_content_chars".into(),
                ));
            }

            if !(0.0..=2.0).contains(&self.extraction.temperature) {
                return Err(ConfigError::Message("Extraction temperature must be between 0 and 2".into()));
            }

            if self.extraction.requests_per_minute == Some(0) {
                return Err(ConfigError::Message(
                    "Extraction requests_per_minute must be greater than 0".into(),
                ));
            }
        }

        if self.catalog.path.trim().is_empty() {
            return Err(ConfigError::Message("Catalog path must not be empty".into()));
        }

        if self.output.directory.trim().is_empty() {
            return Err(ConfigError::Message("Output directory must not be empty".into()));
        }

        Ok(())
    }
}
