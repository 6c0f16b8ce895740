use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Navigation failed for {url}: {message}")]
    Navigation { url: String, message: String },

    #[error("Interaction failed on '{selector}': {message}")]
    Interaction { selector: String, message: String },

    #[error("Content did not stabilize within {seconds}s")]
    StabilizationTimeout { seconds: f64 },

    #[error("Extraction failed for {source_url}: {message}")]
    Extraction { source_url: String, message: String },

    #[error("Site {site_id} exceeded its {seconds}s time budget")]
    SiteTimeout { site_id: String, seconds: u64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Failed to launch browser: {0}")]
    BrowserLaunch(String),

    #[error("Browser session error: {0}")]
    Browser(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors that make any further work in the run pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::BrowserLaunch(_))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("blocking task failed: {}", err))
    }
}

// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::Io(_)));
    }

    #[test]
    fn test_navigation_error_message() {
        let err = AppError::Navigation {
            url: "https://gu.clinic/kr".to_string(),
            message: "selector never appeared".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Navigation failed for https://gu.clinic/kr: selector never appeared"
        );
    }

    #[test]
    fn test_interaction_error_message() {
        let err = AppError::Interaction {
            selector: ".tab-button".to_string(),
            message: "element detached".to_string(),
        };
        assert_eq!(err.to_string(), "Interaction failed on '.tab-button': element detached");
    }

    #[test]
    fn test_only_browser_launch_is_fatal() {
        assert!(AppError::BrowserLaunch("no chrome".to_string()).is_fatal());
        assert!(!AppError::Cancelled.is_fatal());
        assert!(!AppError::StabilizationTimeout { seconds: 2.0 }.is_fatal());
        assert!(!AppError::Browser("tab crashed".to_string()).is_fatal());
    }
}
