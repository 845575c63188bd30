//! Read-only health queries over the store: integrity, error analysis, alerts, stats

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use tracing::{info, warn};

use crate::application::change_detector::chrono_duration;
use crate::domain::EntityId;
use crate::infrastructure::entity_registry::{EntityRegistry, StoreResult};

const REQUIRED_TABLES: [&str; 4] = ["entities", "data_points", "sync_attempts", "sync_runs"];
const TOP_N: i64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub missing_tables: Vec<String>,
    pub entity_count: i64,
    pub data_point_count: i64,
    pub attempt_count: i64,
    /// Entities whose `last_observed_date` disagrees with their stored rows
    pub pointer_mismatches: Vec<EntityId>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.missing_tables.is_empty() && self.pointer_mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorAnalysis {
    pub lookback_hours: u64,
    pub total_attempts: i64,
    pub error_count: i64,
    pub success_count: i64,
    pub error_rate: f64,
    pub by_outcome: BTreeMap<String, i64>,
    /// Most common failure details with their counts
    pub top_errors: Vec<(String, i64)>,
    /// Entities with the most failures
    pub top_entities: Vec<(EntityId, i64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub error_count: i64,
    pub threshold: usize,
    pub analysis: ErrorAnalysis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_entities: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_cadence: BTreeMap<String, i64>,
    pub data_points: i64,
    pub last_successful_sync: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Monitor {
    registry: EntityRegistry,
}

impl Monitor {
    pub fn new(registry: EntityRegistry) -> Self {
        Self { registry }
    }

    pub async fn integrity_check(&self) -> StoreResult<IntegrityReport> {
        let pool = self.registry.pool();
        let mut report = IntegrityReport::default();

        for table in REQUIRED_TABLES {
            let found: Option<String> =
                sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                    .bind(table)
                    .fetch_optional(pool)
                    .await?;
            if found.is_none() {
                report.missing_tables.push(table.to_string());
            }
        }
        if !report.missing_tables.is_empty() {
            warn!("❌ Missing tables: {:?}", report.missing_tables);
            return Ok(report);
        }

        report.entity_count = sqlx::query_scalar("SELECT COUNT(*) FROM entities").fetch_one(pool).await?;
        report.data_point_count = sqlx::query_scalar("SELECT COUNT(*) FROM data_points").fetch_one(pool).await?;
        report.attempt_count = sqlx::query_scalar("SELECT COUNT(*) FROM sync_attempts").fetch_one(pool).await?;

        let mismatched: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT e.id FROM entities e
            LEFT JOIN (
                SELECT entity_id, MAX(observation_date) AS max_date
                FROM data_points GROUP BY entity_id
            ) d ON d.entity_id = e.id
            WHERE e.last_observed_date IS NOT d.max_date
            ORDER BY e.id
            "#,
        )
        .fetch_all(pool)
        .await?;
        report.pointer_mismatches = mismatched.into_iter().map(EntityId::new).collect();

        if report.is_healthy() {
            info!(
                "✅ Integrity OK: {} entities, {} data points, {} attempts",
                report.entity_count, report.data_point_count, report.attempt_count
            );
        } else {
            warn!("❌ {} entities have an inconsistent observation pointer", report.pointer_mismatches.len());
        }
        Ok(report)
    }

    pub async fn analyze_errors(&self, lookback: Duration, now: DateTime<Utc>) -> StoreResult<ErrorAnalysis> {
        let pool = self.registry.pool();
        let since = now - chrono_duration(lookback);
        let mut analysis = ErrorAnalysis {
            lookback_hours: lookback.as_secs() / 3600,
            ..ErrorAnalysis::default()
        };

        let rows = sqlx::query(
            "SELECT outcome, COUNT(*) AS n FROM sync_attempts WHERE attempted_at >= ? GROUP BY outcome",
        )
        .bind(since)
        .fetch_all(pool)
        .await?;
        for row in rows {
            let outcome: String = row.try_get("outcome")?;
            let count: i64 = row.try_get("n")?;
            if outcome == "SUCCESS" {
                analysis.success_count += count;
            } else {
                analysis.error_count += count;
            }
            analysis.total_attempts += count;
            analysis.by_outcome.insert(outcome, count);
        }

        if analysis.total_attempts > 0 {
            analysis.error_rate = analysis.error_count as f64 / analysis.total_attempts as f64;
        }

        let rows = sqlx::query(
            r#"
            SELECT detail, COUNT(*) AS n FROM sync_attempts
            WHERE attempted_at >= ? AND outcome != 'SUCCESS'
            GROUP BY detail ORDER BY n DESC, detail LIMIT ?
            "#,
        )
        .bind(since)
        .bind(TOP_N)
        .fetch_all(pool)
        .await?;
        for row in rows {
            analysis.top_errors.push((row.try_get("detail")?, row.try_get("n")?));
        }

        let rows = sqlx::query(
            r#"
            SELECT entity_id, COUNT(*) AS n FROM sync_attempts
            WHERE attempted_at >= ? AND outcome != 'SUCCESS'
            GROUP BY entity_id ORDER BY n DESC, entity_id LIMIT ?
            "#,
        )
        .bind(since)
        .bind(TOP_N)
        .fetch_all(pool)
        .await?;
        for row in rows {
            let entity_id: String = row.try_get("entity_id")?;
            analysis.top_entities.push((EntityId::new(entity_id), row.try_get("n")?));
        }

        info!(
            "📊 Last {}h: {} attempts, {} errors, {} successes, error rate {:.2}%",
            analysis.lookback_hours,
            analysis.total_attempts,
            analysis.error_count,
            analysis.success_count,
            analysis.error_rate * 100.0
        );
        Ok(analysis)
    }

    /// `Some(Alert)` when the error count over `lookback` reaches `threshold`
    pub async fn check_alerts(
        &self,
        lookback: Duration,
        threshold: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Alert>> {
        let analysis = self.analyze_errors(lookback, now).await?;
        let reached = usize::try_from(analysis.error_count).is_ok_and(|count| count >= threshold);
        if !reached {
            return Ok(None);
        }

        warn!(
            "🚨 {} errors in the last {}h (threshold {})",
            analysis.error_count, analysis.lookback_hours, threshold
        );
        Ok(Some(Alert {
            error_count: analysis.error_count,
            threshold,
            analysis,
        }))
    }

    pub async fn registry_stats(&self) -> StoreResult<RegistryStats> {
        let pool = self.registry.pool();
        let mut stats = RegistryStats {
            total_entities: self.registry.count_entities().await?,
            ..RegistryStats::default()
        };

        for row in sqlx::query("SELECT status, COUNT(*) AS n FROM entities GROUP BY status")
            .fetch_all(pool)
            .await?
        {
            stats.by_status.insert(row.try_get("status")?, row.try_get("n")?);
        }
        for row in sqlx::query("SELECT cadence_class, COUNT(*) AS n FROM entities GROUP BY cadence_class")
            .fetch_all(pool)
            .await?
        {
            stats.by_cadence.insert(row.try_get("cadence_class")?, row.try_get("n")?);
        }

        stats.data_points = sqlx::query_scalar("SELECT COUNT(*) FROM data_points").fetch_one(pool).await?;

        let last: Option<String> = sqlx::query_scalar("SELECT MAX(last_sync_at) FROM entities")
            .fetch_one(pool)
            .await?;
        stats.last_successful_sync = last
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc));

        Ok(stats)
    }
}
