//! series-sync operator CLI

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use series_sync::application::monitoring::Monitor;
use series_sync::application::{SyncRunOrchestrator, ValidatedSyncConfig};
use series_sync::domain::{SummarySink, SyncRunSummary};
use series_sync::infrastructure::catalog_import::import_catalog_file;
use series_sync::infrastructure::logging::{init_logging_with_config, log_system_info};
use series_sync::infrastructure::summary_sinks::{FanOutSummarySink, JsonFileSummarySink, LogSummarySink};
use series_sync::infrastructure::{ConfigManager, DatabaseConnection, EntityRegistry, HttpEntityFetcher, SyncConfig};

#[derive(Parser, Debug)]
#[command(name = "series-sync")]
#[command(about = "Incremental time-series harvester", long_about = None)]
struct Cli {
    /// Config file (default: per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL or file path, e.g. sqlite:data/series.db
    #[arg(long = "db-file", global = true)]
    db_file: Option<String>,

    /// Log at debug level
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database schema and the config file if missing
    Init,
    /// Register series from a CSV catalog
    Import {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Run one scheduled sync pass
    Sync {
        /// Maximum number of candidates this run
        #[arg(long)]
        limit: Option<usize>,
        /// Skip the first N ranked candidates
        #[arg(long)]
        skip: Option<usize>,
        /// Concurrent fetch workers
        #[arg(long)]
        workers: Option<usize>,
        /// Base politeness delay in seconds; the delay is drawn from [S, 2S]
        #[arg(long)]
        delay: Option<f64>,
        #[arg(long)]
        proxy: Option<String>,
    },
    /// Re-attempt recently failed series, re-admitting suspended ones
    Retry {
        #[arg(long)]
        lookback_hours: Option<u64>,
    },
    /// Registry counts by status and cadence
    Stats,
    /// Store integrity check
    Check,
    /// Error analysis and alert threshold check
    Alerts {
        #[arg(long, default_value_t = 24)]
        lookback_hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let mut config = manager.load_config().await?;
    apply_overrides(&mut config, &cli);

    init_logging_with_config(&config.logging)?;
    log_system_info();

    let validated = Arc::new(ValidatedSyncConfig::validate(&config).context("Invalid configuration")?);
    validated.log_config();

    let connection = DatabaseConnection::open(&validated.database_url).await?;
    let registry = EntityRegistry::new(connection.pool().clone());

    match cli.command {
        Commands::Init => {
            connection.ping().await?;
            info!("✅ Database ready at {}", validated.database_url);
            info!("✅ Configuration at {:?}", manager.config_path());
        }
        Commands::Import { file } => {
            let report = import_catalog_file(&registry, &file).await?;
            println!(
                "Imported {} rows: {} new, {} updated, {} unchanged, {} duplicates",
                report.rows, report.inserted, report.updated, report.unchanged, report.duplicates
            );
        }
        Commands::Sync { .. } => {
            let orchestrator = build_orchestrator(&config, &validated, registry)?;
            let cancel = cancel_on_ctrl_c();
            let summary = orchestrator.run(cancel).await;
            finish_run(&summary)?;
        }
        Commands::Retry { .. } => {
            let orchestrator = build_orchestrator(&config, &validated, registry)?;
            let cancel = cancel_on_ctrl_c();
            let summary = orchestrator.run_retry_pass(cancel).await;
            finish_run(&summary)?;
        }
        Commands::Stats => {
            let stats = Monitor::new(registry).registry_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Check => {
            let report = Monitor::new(registry).integrity_check().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                bail!("Integrity check failed");
            }
        }
        Commands::Alerts { lookback_hours } => {
            let monitor = Monitor::new(registry);
            let lookback = Duration::from_secs(lookback_hours * 3600);
            match monitor
                .check_alerts(lookback, validated.error_alert_threshold, Utc::now())
                .await?
            {
                Some(alert) => println!("{}", serde_json::to_string_pretty(&alert)?),
                None => {
                    let analysis = monitor.analyze_errors(lookback, Utc::now()).await?;
                    println!("{}", serde_json::to_string_pretty(&analysis)?);
                }
            }
        }
    }

    Ok(())
}

/// CLI flags win over the config file
fn apply_overrides(config: &mut SyncConfig, cli: &Cli) {
    if let Some(db_file) = &cli.db_file {
        config.database_url = if db_file.starts_with("sqlite:") {
            db_file.clone()
        } else {
            format!("sqlite:{db_file}")
        };
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }

    match &cli.command {
        Commands::Sync {
            limit,
            skip,
            workers,
            delay,
            proxy,
        } => {
            if limit.is_some() {
                config.sync.entity_limit = *limit;
            }
            if let Some(skip) = skip {
                config.sync.skip = *skip;
            }
            if let Some(workers) = workers {
                config.sync.concurrency = *workers;
            }
            if let Some(delay) = delay {
                config.sync.min_delay_secs = *delay;
                config.sync.max_delay_secs = *delay * 2.0;
            }
            if proxy.is_some() {
                config.fetch.proxy.clone_from(proxy);
            }
        }
        Commands::Retry {
            lookback_hours: Some(hours),
        } => config.failures.retry_lookback_hours = *hours,
        _ => {}
    }
}

fn build_orchestrator(
    config: &SyncConfig,
    validated: &Arc<ValidatedSyncConfig>,
    registry: EntityRegistry,
) -> Result<SyncRunOrchestrator> {
    let fetcher = Arc::new(HttpEntityFetcher::new(&config.fetch)?);

    let mut sinks: Vec<Arc<dyn SummarySink>> = vec![Arc::new(LogSummarySink)];
    if let Some(dir) = &validated.report_dir {
        sinks.push(Arc::new(JsonFileSummarySink::new(dir)));
    }

    Ok(SyncRunOrchestrator::new(
        Arc::clone(validated),
        registry,
        fetcher,
        Arc::new(FanOutSummarySink::new(sinks)),
    ))
}

/// First Ctrl-C stops dispatch; in-flight fetches get their grace period
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("🛑 Stop requested, finishing in-flight fetches");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
    cancel
}

fn finish_run(summary: &SyncRunSummary) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    if summary.is_aborted() {
        bail!(
            "Run {} aborted: {}",
            summary.run_id,
            summary.abort_reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}
