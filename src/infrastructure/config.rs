//! Configuration infrastructure
//!
//! Contains configuration loading and management for the sync engine.
//!
//! Configuration is layered:
//! 1. Built-in defaults (the [`defaults`] module)
//! 2. The JSON config file managed by [`ConfigManager`]
//! 3. `SERIES_SYNC_*` environment variables (e.g. `SERIES_SYNC_SYNC__CONCURRENCY=8`)
//! 4. CLI flags, applied by the binary before validation
//!
//! The result is checked and frozen by
//! [`ValidatedSyncConfig`](crate::infrastructure::validated_config::ValidatedSyncConfig)
//! before a run starts.

#![allow(clippy::uninlined_format_args)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

/// Complete operator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// sqlx connection URL, e.g. `sqlite:series_sync.db`
    pub database_url: String,

    /// Candidate selection and worker pool settings
    pub sync: SchedulingConfig,

    /// Suspension and retry admission
    pub failures: FailureConfig,

    /// Per-entity cool-down after failures
    pub backoff: BackoffConfig,

    /// Fetch capability and per-attempt policy
    pub fetch: FetchConfig,

    /// Run-wide abort on widespread upstream failure
    pub circuit_breaker: CircuitBreakerConfig,

    /// Error analysis and alerting
    pub monitoring: MonitoringConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Concurrent fetch slots
    pub concurrency: usize,

    /// Lower bound of the per-fetch politeness delay in seconds
    pub min_delay_secs: f64,

    /// Upper bound of the per-fetch politeness delay in seconds
    pub max_delay_secs: f64,

    /// Optional cap on candidates per run
    pub entity_limit: Option<usize>,

    /// Candidates skipped before the cap applies (chunked runs)
    pub skip: usize,

    /// Fraction by which a cadence interval may be shortened per entity
    pub jitter_ratio: f64,

    /// Hard wall-clock budget of a run in seconds
    pub run_timeout_secs: u64,

    /// Grace period for in-flight fetches after a stop signal, in seconds
    pub cancel_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FailureConfig {
    /// Consecutive failures that suspend an entity
    pub failure_suspend_threshold: u32,

    /// Entities at or above this many failures are not re-admitted
    pub retry_cap: u32,

    /// How far back the retry pass looks for failed attempts
    pub retry_lookback_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_secs: u64,
    pub cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchConfig {
    /// Hard timeout of one fetch attempt in seconds
    pub timeout_secs: u64,

    /// Same-run retries of a transient failure
    pub transient_retry_limit: u32,

    /// Base delay of the in-run exponential retry backoff
    pub retry_base_delay_ms: u64,

    /// Optional global quota across all workers
    pub max_requests_per_second: Option<u32>,

    /// Upstream base URL used by the HTTP fetcher
    pub base_url: String,

    pub user_agent: String,

    /// Optional HTTP(S) proxy for the HTTP fetcher
    pub proxy: Option<String>,

    /// Also fetch the series page for title/frequency metadata
    pub fetch_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Sliding window in seconds
    pub window_secs: u64,

    /// Distinct failing entities inside the window that trip the breaker
    pub distinct_entities: usize,

    /// Share of outcomes inside the window that must be failures (0.0 - 1.0)
    pub min_failure_share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Failed attempts within a day that raise an alert
    pub error_alert_threshold: usize,

    /// Directory for JSON run summaries; none disables the file sink
    pub report_dir: Option<PathBuf>,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs
    pub json_format: bool,

    /// Enable console output
    pub console_output: bool,

    /// Enable file output
    pub file_output: bool,

    /// Log directory; defaults to `logs/` next to the executable
    pub log_dir: Option<PathBuf>,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,

    /// Enable automatic log cleanup on startup
    pub auto_cleanup_logs: bool,

    /// Module-specific log level filters (e.g., "sqlx": "warn", "reqwest": "info")
    pub module_filters: HashMap<String, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            sync: SchedulingConfig::default(),
            failures: FailureConfig::default(),
            backoff: BackoffConfig::default(),
            fetch: FetchConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            monitoring: MonitoringConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::CONCURRENCY,
            min_delay_secs: defaults::MIN_DELAY_SECS,
            max_delay_secs: defaults::MAX_DELAY_SECS,
            entity_limit: None,
            skip: 0,
            jitter_ratio: defaults::JITTER_RATIO,
            run_timeout_secs: defaults::RUN_TIMEOUT_SECS,
            cancel_grace_secs: defaults::CANCEL_GRACE_SECS,
        }
    }
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            failure_suspend_threshold: defaults::FAILURE_SUSPEND_THRESHOLD,
            retry_cap: defaults::RETRY_CAP,
            retry_lookback_hours: defaults::RETRY_LOOKBACK_HOURS,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: defaults::BACKOFF_BASE_DELAY_SECS,
            cap_secs: defaults::BACKOFF_CAP_SECS,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::FETCH_TIMEOUT_SECS,
            transient_retry_limit: defaults::TRANSIENT_RETRY_LIMIT,
            retry_base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_requests_per_second: None,
            base_url: defaults::BASE_URL.to_string(),
            user_agent: defaults::USER_AGENT.to_string(),
            proxy: None,
            fetch_metadata: true,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_secs: defaults::CIRCUIT_WINDOW_SECS,
            distinct_entities: defaults::CIRCUIT_DISTINCT_ENTITIES,
            min_failure_share: defaults::CIRCUIT_MIN_FAILURE_SHARE,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            error_alert_threshold: defaults::ERROR_ALERT_THRESHOLD,
            report_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            log_dir: None,
            max_files: defaults::LOG_MAX_FILES,
            auto_cleanup_logs: defaults::LOG_AUTO_CLEANUP,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("series_sync".to_string(), "info".to_string());
                filters
            },
        }
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join("series-sync");

        Ok(config_dir)
    }

    /// Configuration manager for the default per-user config file
    pub fn new() -> Result<Self> {
        let config_dir = Self::get_config_dir()?;
        Ok(Self {
            config_path: config_dir.join("series_sync_config.json"),
        })
    }

    /// Configuration manager for an explicit config file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    /// Load configuration from file and environment, creating the file with defaults if missing
    pub async fn load_config(&self) -> Result<SyncConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = SyncConfig::default();
            self.save_config(&default_config).await?;
        }

        let config = Self::load_layered(&self.config_path)?;
        info!("Loaded configuration from: {:?}", self.config_path);
        Ok(config)
    }

    fn load_layered(path: &Path) -> Result<SyncConfig> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .add_source(
                config::Environment::with_prefix("SERIES_SYNC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;

        settings
            .try_deserialize::<SyncConfig>()
            .context("Configuration file contains invalid settings")
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &SyncConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Reset configuration to defaults (useful for troubleshooting)
    pub async fn reset_to_defaults(&self) -> Result<SyncConfig> {
        info!("🔄 Resetting configuration to defaults");
        let default_config = SyncConfig::default();
        self.save_config(&default_config).await?;
        Ok(default_config)
    }

    /// Get the configuration file path
    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }
}

/// Default sync configuration values
pub mod defaults {
    /// Default database location, relative to the working directory
    pub const DATABASE_URL: &str = "sqlite:series_sync.db";

    /// Default number of concurrent fetch slots
    pub const CONCURRENCY: usize = 5;

    /// Default politeness delay bounds in seconds
    pub const MIN_DELAY_SECS: f64 = 1.0;
    pub const MAX_DELAY_SECS: f64 = 3.0;

    /// Default share of a cadence interval that jitter may shave off
    pub const JITTER_RATIO: f64 = 0.1;

    /// Default run budget (1 hour)
    pub const RUN_TIMEOUT_SECS: u64 = 3600;

    /// Default grace period for in-flight fetches after a stop signal
    pub const CANCEL_GRACE_SECS: u64 = 30;

    /// Default consecutive failures before suspension
    pub const FAILURE_SUSPEND_THRESHOLD: u32 = 3;

    /// Default retry admission cap; above the suspension threshold so suspended
    /// entities get a few re-admissions before they are left for manual review
    pub const RETRY_CAP: u32 = 6;

    /// Default retry lookback (1 day)
    pub const RETRY_LOOKBACK_HOURS: u64 = 24;

    /// Default failure backoff base (30 minutes) and cap (1 day)
    pub const BACKOFF_BASE_DELAY_SECS: u64 = 30 * 60;
    pub const BACKOFF_CAP_SECS: u64 = 24 * 60 * 60;

    /// Default per-attempt fetch timeout
    pub const FETCH_TIMEOUT_SECS: u64 = 60;

    /// Default same-run retries of a transient failure
    pub const TRANSIENT_RETRY_LIMIT: u32 = 3;

    /// Default in-run retry base delay in milliseconds
    pub const RETRY_BASE_DELAY_MS: u64 = 1000;

    /// Default upstream base URL
    pub const BASE_URL: &str = "https://fred.stlouisfed.org";

    /// Default user agent for the HTTP fetcher
    pub const USER_AGENT: &str =
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

    /// Default circuit breaker window and trip threshold
    pub const CIRCUIT_WINDOW_SECS: u64 = 120;
    pub const CIRCUIT_DISTINCT_ENTITIES: usize = 10;
    pub const CIRCUIT_MIN_FAILURE_SHARE: f64 = 0.5;

    /// Default failed attempts per day that raise an alert
    pub const ERROR_ALERT_THRESHOLD: usize = 10;

    // Log configuration defaults
    /// Default log level
    pub const LOG_LEVEL: &str = "info";

    /// Default JSON format setting
    pub const LOG_JSON_FORMAT: bool = false;

    /// Default console output setting
    pub const LOG_CONSOLE_OUTPUT: bool = true;

    /// Default file output setting
    pub const LOG_FILE_OUTPUT: bool = true;

    /// Default maximum log files to keep
    pub const LOG_MAX_FILES: u32 = 5;

    /// Default auto cleanup logs setting
    pub const LOG_AUTO_CLEANUP: bool = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() -> Result<()> {
        let dir = tempdir()?;
        let manager = ConfigManager::with_path(dir.path().join("nested").join("config.json"));

        let config = manager.load_config().await?;

        assert_eq!(config, SyncConfig::default());
        assert!(manager.config_path().exists());
        Ok(())
    }

    #[tokio::test]
    async fn partial_file_is_filled_from_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "sync": { "concurrency": 9 }, "failures": { "retry_cap": 7 } }"#,
        )?;

        let config = ConfigManager::with_path(&path).load_config().await?;

        assert_eq!(config.sync.concurrency, 9);
        assert_eq!(config.failures.retry_cap, 7);
        assert!((config.sync.max_delay_secs - defaults::MAX_DELAY_SECS).abs() < f64::EPSILON);
        assert_eq!(config.database_url, defaults::DATABASE_URL);
        Ok(())
    }

    #[tokio::test]
    async fn saved_config_loads_back() -> Result<()> {
        let dir = tempdir()?;
        let manager = ConfigManager::with_path(dir.path().join("config.json"));
        let mut config = SyncConfig::default();
        config.sync.entity_limit = Some(50);
        config.sync.skip = 50;
        manager.save_config(&config).await?;

        assert_eq!(manager.load_config().await?, config);
        Ok(())
    }
}
