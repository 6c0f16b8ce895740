pub mod acquisition;
pub mod browser;
pub mod catalog;
pub mod config;
pub mod driver;
pub mod extraction;
pub mod fingerprint;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod pages;
pub mod prompts;
pub mod sitemap;
pub mod utils;

// Re-export commonly used types
pub use acquisition::AcquisitionLoop;
pub use catalog::SiteCatalog;
pub use config::AppConfig;
pub use driver::{CapturedContent, InteractionDriver, SessionLauncher};
pub use extraction::{ExtractionContext, ExtractionService};
pub use orchestrator::SiteOrchestrator;
pub use utils::error::AppError;

pub type Result<T> = std::result::Result<T, AppError>;
