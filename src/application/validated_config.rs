use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::application::change_detector::{DetectorPolicy, SelectionWindow};
use crate::application::circuit_breaker::CircuitBreakerSettings;
use crate::application::fetch_coordinator::CoordinatorConfig;
use crate::infrastructure::config::SyncConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Validated sync configuration, immutable for the length of a run
///
/// Every operator-facing option checked and converted to the typed settings
/// each component consumes. Built once before a run and shared read-only.
#[derive(Debug, Clone)]
pub struct ValidatedSyncConfig {
    pub database_url: String,
    pub detector: DetectorPolicy,
    pub selection: SelectionWindow,
    pub coordinator: CoordinatorConfig,
    pub failure_suspend_threshold: u32,
    pub retry_cap: u32,
    pub retry_lookback: Duration,
    pub run_timeout: Duration,
    pub error_alert_threshold: usize,
    pub report_dir: Option<PathBuf>,
}

impl ValidatedSyncConfig {
    /// Validate a loaded configuration. Any violation is fatal before a run starts.
    pub fn validate(config: &SyncConfig) -> Result<Self, ConfigError> {
        let sync = &config.sync;
        let fetch = &config.fetch;

        if config.database_url.trim().is_empty() {
            return Err(invalid("database_url", "must not be empty"));
        }
        if sync.concurrency == 0 {
            return Err(invalid("sync.concurrency", "must be at least 1"));
        }
        if !sync.min_delay_secs.is_finite() || sync.min_delay_secs < 0.0 {
            return Err(invalid("sync.min_delay_secs", "must be a non-negative number"));
        }
        if !sync.max_delay_secs.is_finite() || sync.max_delay_secs < sync.min_delay_secs {
            return Err(invalid(
                "sync.max_delay_secs",
                format!("must be >= min_delay_secs ({})", sync.min_delay_secs),
            ));
        }
        if !(0.0..1.0).contains(&sync.jitter_ratio) {
            return Err(invalid("sync.jitter_ratio", "must be in [0, 1)"));
        }
        if sync.entity_limit == Some(0) {
            return Err(invalid("sync.entity_limit", "must be at least 1 when set"));
        }
        if sync.run_timeout_secs == 0 {
            return Err(invalid("sync.run_timeout_secs", "must be greater than 0"));
        }
        if config.failures.failure_suspend_threshold == 0 {
            return Err(invalid("failures.failure_suspend_threshold", "must be at least 1"));
        }
        if config.failures.retry_cap == 0 {
            return Err(invalid("failures.retry_cap", "must be at least 1"));
        }
        if config.backoff.base_delay_secs > config.backoff.cap_secs {
            return Err(invalid("backoff.base_delay_secs", "must not exceed backoff.cap_secs"));
        }
        if fetch.timeout_secs == 0 {
            return Err(invalid("fetch.timeout_secs", "must be greater than 0"));
        }
        if fetch.max_requests_per_second == Some(0) {
            return Err(invalid("fetch.max_requests_per_second", "must be at least 1 when set"));
        }
        if config.circuit_breaker.distinct_entities == 0 {
            return Err(invalid("circuit_breaker.distinct_entities", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&config.circuit_breaker.min_failure_share) {
            return Err(invalid("circuit_breaker.min_failure_share", "must be between 0.0 and 1.0"));
        }
        if config.circuit_breaker.window_secs == 0 {
            return Err(invalid("circuit_breaker.window_secs", "must be greater than 0"));
        }

        if config.failures.retry_cap <= config.failures.failure_suspend_threshold {
            warn!(
                "retry_cap ({}) <= failure_suspend_threshold ({}): suspended entities will never be re-admitted",
                config.failures.retry_cap, config.failures.failure_suspend_threshold
            );
        }

        Ok(Self {
            database_url: config.database_url.clone(),
            detector: DetectorPolicy {
                backoff_base_delay: Duration::from_secs(config.backoff.base_delay_secs),
                backoff_cap: Duration::from_secs(config.backoff.cap_secs),
                jitter_ratio: sync.jitter_ratio,
            },
            selection: SelectionWindow {
                limit: sync.entity_limit,
                skip: sync.skip,
            },
            coordinator: CoordinatorConfig {
                concurrency: sync.concurrency,
                min_delay: Duration::from_secs_f64(sync.min_delay_secs),
                max_delay: Duration::from_secs_f64(sync.max_delay_secs),
                fetch_timeout: Duration::from_secs(fetch.timeout_secs),
                transient_retry_limit: fetch.transient_retry_limit,
                retry_base_delay: Duration::from_millis(fetch.retry_base_delay_ms),
                max_requests_per_second: fetch.max_requests_per_second.and_then(NonZeroU32::new),
                cancel_grace_period: Duration::from_secs(sync.cancel_grace_secs),
                circuit_breaker: CircuitBreakerSettings {
                    window: Duration::from_secs(config.circuit_breaker.window_secs),
                    distinct_entities: config.circuit_breaker.distinct_entities,
                    min_failure_share: config.circuit_breaker.min_failure_share,
                },
            },
            failure_suspend_threshold: config.failures.failure_suspend_threshold,
            retry_cap: config.failures.retry_cap,
            retry_lookback: Duration::from_secs(config.failures.retry_lookback_hours * 3600),
            run_timeout: Duration::from_secs(sync.run_timeout_secs),
            error_alert_threshold: config.monitoring.error_alert_threshold,
            report_dir: config.monitoring.report_dir.clone(),
        })
    }

    /// Log the effective settings
    pub fn log_config(&self) {
        info!("🔧 ValidatedSyncConfig applied:");
        info!(
            "   concurrency: {} (delay {:?}..{:?}, timeout {:?})",
            self.coordinator.concurrency,
            self.coordinator.min_delay,
            self.coordinator.max_delay,
            self.coordinator.fetch_timeout
        );
        info!("   selection: limit={:?} skip={}", self.selection.limit, self.selection.skip);
        info!(
            "   failures: suspend_threshold={} retry_cap={} lookback={:?}",
            self.failure_suspend_threshold, self.retry_cap, self.retry_lookback
        );
        info!(
            "   backoff: base={:?} cap={:?} jitter={}",
            self.detector.backoff_base_delay, self.detector.backoff_cap, self.detector.jitter_ratio
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let validated = ValidatedSyncConfig::validate(&SyncConfig::default()).unwrap();
        assert_eq!(validated.coordinator.concurrency, 5);
        assert_eq!(validated.coordinator.min_delay, Duration::from_secs(1));
        assert_eq!(validated.coordinator.max_delay, Duration::from_secs(3));
        assert_eq!(validated.selection.limit, None);
        assert_eq!(validated.retry_lookback, Duration::from_secs(24 * 3600));
        assert!(validated.coordinator.max_requests_per_second.is_none());
    }

    #[test]
    fn inverted_delay_bounds_are_rejected() {
        let mut config = SyncConfig::default();
        config.sync.min_delay_secs = 5.0;
        config.sync.max_delay_secs = 2.0;

        let err = ValidatedSyncConfig::validate(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "sync.max_delay_secs", .. }));
    }

    #[test]
    fn zero_concurrency_and_zero_threshold_are_rejected() {
        let mut config = SyncConfig::default();
        config.sync.concurrency = 0;
        assert!(ValidatedSyncConfig::validate(&config).is_err());

        let mut config = SyncConfig::default();
        config.failures.failure_suspend_threshold = 0;
        assert!(ValidatedSyncConfig::validate(&config).is_err());
    }

    #[test]
    fn backoff_base_above_cap_is_rejected() {
        let mut config = SyncConfig::default();
        config.backoff.base_delay_secs = 10;
        config.backoff.cap_secs = 5;
        assert!(ValidatedSyncConfig::validate(&config).is_err());
    }

    #[test]
    fn failure_share_outside_unit_range_is_rejected() {
        let mut config = SyncConfig::default();
        config.circuit_breaker.min_failure_share = 1.5;

        let err = ValidatedSyncConfig::validate(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "circuit_breaker.min_failure_share", .. }));
    }

    #[test]
    fn limit_and_skip_flow_into_selection_window() {
        let mut config = SyncConfig::default();
        config.sync.entity_limit = Some(50);
        config.sync.skip = 50;
        let validated = ValidatedSyncConfig::validate(&config).unwrap();
        assert_eq!(
            validated.selection,
            SelectionWindow {
                limit: Some(50),
                skip: 50
            }
        );
    }
}
