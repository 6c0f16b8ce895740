use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clinic_harvest::browser::ChromeLauncher;
use clinic_harvest::config::LoggingConfig;
use clinic_harvest::extraction::HttpExtractionService;
use clinic_harvest::models::StrategyKind;
use clinic_harvest::output::{log_summary, ReportWriter};
use clinic_harvest::pages::build_http_client;
use clinic_harvest::{AppConfig, SiteCatalog, SiteOrchestrator};

#[derive(Parser)]
#[command(name = "clinic-harvest", version, about = "Harvest treatment and pricing data from clinic websites")]
struct Cli {
    /// Directory holding default.toml and its overrides
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire and extract the selected sites
    Run {
        /// Site id from the catalog; repeat for several. All sites when omitted.
        #[arg(long = "site")]
        sites: Vec<String>,

        /// Only run sites using this strategy (sitemap, static-list, spa-dynamic)
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Skip extraction and only report what was acquired
        #[arg(long)]
        no_extract: bool,

        /// Write the report here instead of the configured output directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the site catalog
    ListSites {
        #[arg(long)]
        strategy: Option<StrategyKind>,
    },
    /// Validate configuration and the site catalog, then exit
    CheckConfig,
}

fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env().add_directive("clinic_harvest=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::from_dir(&cli.config_dir)
        .with_context(|| format!("loading configuration from {}", cli.config_dir.display()))?;
    let _guard = init_tracing(&config.logging)?;

    let catalog = SiteCatalog::load(config.catalog_path())
        .with_context(|| format!("loading site catalog {}", config.catalog.path))?;

    match cli.command {
        Command::Run {
            sites,
            strategy,
            no_extract,
            output,
        } => {
            let selected = catalog.select(&sites, strategy)?;
            if selected.is_empty() {
                warn!("No sites matched the selection");
                return Ok(());
            }

            let client = build_http_client(&config.http)?;
            let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));
            let mut orchestrator = SiteOrchestrator::new(launcher, client, &config.orchestrator, &config.http);
            if config.extraction.enabled && !no_extract {
                let extractor = HttpExtractionService::new(config.extraction.clone())?;
                orchestrator = orchestrator.with_extractor(Arc::new(extractor));
            }

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    interrupt.cancel();
                }
            });

            info!("Starting Clinic Harvest...");
            let report = orchestrator.run(selected, cancel).await?;
            log_summary(&report);

            if let Some(directory) = output {
                config.output.directory = directory.to_string_lossy().into_owned();
            }
            let path = ReportWriter::new(&config.output).write(&report)?;
            println!("{}", path.display());
        }
        Command::ListSites { strategy } => {
            for site in catalog.iter().filter(|s| strategy.is_none_or(|k| s.strategy_kind() == k)) {
                println!("{:<20} {:<12} {}", site.id, site.strategy_kind(), site.base_url);
            }
        }
        Command::CheckConfig => {
            println!(
                "Configuration OK: {} sites, max {} concurrent, extraction {}",
                catalog.len(),
                config.orchestrator.max_concurrent_sites,
                if config.extraction.enabled { "enabled" } else { "disabled" }
            );
        }
    }

    Ok(())
}
