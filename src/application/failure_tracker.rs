//! Failure accounting: audit rows, consecutive failure counts, suspension

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{info, warn};

use crate::application::change_detector::chrono_duration;
use crate::domain::{AttemptOutcome, EntityId, EntityStatus, NewAttempt};
use crate::infrastructure::entity_registry::{EntityRegistry, StoreError, StoreResult};

/// Effect of recording one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub consecutive_failures: u32,
    /// This attempt pushed the entity across the suspension threshold
    pub newly_suspended: bool,
}

#[derive(Clone)]
pub struct FailureTracker {
    registry: EntityRegistry,
    suspend_threshold: u32,
}

impl FailureTracker {
    pub fn new(registry: EntityRegistry, suspend_threshold: u32) -> Self {
        Self {
            registry,
            suspend_threshold: suspend_threshold.max(1),
        }
    }

    /// `Record(entity_id, attempt)`
    ///
    /// Appends the attempt and, for failures, bumps `consecutive_failures`
    /// and `last_attempt_at`, suspending the entity when the threshold is
    /// reached. Both writes commit together.
    pub async fn record(&self, entity_id: &EntityId, attempt: &NewAttempt) -> StoreResult<RecordOutcome> {
        let mut tx = self.registry.begin().await?;

        let mut entity = EntityRegistry::get_entity_in(&mut tx, entity_id)
            .await?
            .ok_or_else(|| StoreError::UnknownEntity(entity_id.clone()))?;

        EntityRegistry::append_attempt(&mut tx, entity_id, attempt).await?;

        let mut newly_suspended = false;
        if attempt.outcome.is_failure() {
            entity.consecutive_failures = entity.consecutive_failures.saturating_add(1);
            entity.last_attempt_at = Some(attempt.attempted_at);
            if entity.status == EntityStatus::Active && entity.consecutive_failures >= self.suspend_threshold {
                entity.status = EntityStatus::Suspended;
                newly_suspended = true;
            }
            EntityRegistry::update_entity(&mut tx, &entity).await?;
        }

        tx.commit().await?;

        if newly_suspended {
            warn!(
                entity_id = %entity_id,
                "⛔ Suspended after {} consecutive failures (last: {} {})",
                entity.consecutive_failures,
                attempt.outcome,
                attempt.detail
            );
        }

        Ok(RecordOutcome {
            consecutive_failures: entity.consecutive_failures,
            newly_suspended,
        })
    }

    /// `RetryEligible(threshold)`
    ///
    /// Entities whose most recent attempt lies within `lookback` and was a
    /// failure, and whose failure count is still below `retry_cap`.
    pub async fn retry_eligible(
        &self,
        retry_cap: u32,
        lookback: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<BTreeSet<EntityId>> {
        let since = now - chrono_duration(lookback);
        let rows = sqlx::query(
            r#"
            SELECT a.entity_id, a.outcome, e.consecutive_failures
            FROM sync_attempts a
            JOIN entities e ON e.id = a.entity_id
            WHERE a.id = (SELECT MAX(id) FROM sync_attempts WHERE entity_id = a.entity_id)
              AND a.attempted_at >= ?
            "#,
        )
        .bind(since)
        .fetch_all(self.registry.pool())
        .await?;

        let mut eligible = BTreeSet::new();
        for row in rows {
            let entity_id: String = row.try_get("entity_id")?;
            let outcome: String = row.try_get("outcome")?;
            let failures: i64 = row.try_get("consecutive_failures")?;

            let failed = outcome
                .parse::<AttemptOutcome>()
                .map(AttemptOutcome::is_failure)
                .unwrap_or(false);
            if failed && failures < i64::from(retry_cap) {
                eligible.insert(EntityId::new(entity_id));
            }
        }

        info!(
            "🔁 {} entities eligible for retry (cap {}, lookback {:?})",
            eligible.len(),
            retry_cap,
            lookback
        );
        Ok(eligible)
    }

    /// Explicit retry admission: SUSPENDED → ACTIVE
    pub async fn readmit(&self, entity_ids: &[EntityId]) -> StoreResult<Vec<EntityId>> {
        let readmitted = self.registry.readmit(entity_ids).await?;
        if !readmitted.is_empty() {
            info!("♻️ Re-admitted {} suspended entities", readmitted.len());
        }
        Ok(readmitted)
    }
}
