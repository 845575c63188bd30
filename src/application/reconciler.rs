//! Transactional merge of fetched payloads into the store

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::payload_parser::{ParseError, ParsedPayload, parse_payload};
use crate::domain::{AttemptOutcome, CadenceClass, EntityId, EntityMetadata, FetchedEntity, NewAttempt};
use crate::infrastructure::entity_registry::{EntityRegistry, StoreError};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub const fn outcome(&self) -> AttemptOutcome {
        match self {
            Self::Parse(_) => AttemptOutcome::ParseError,
            Self::Store(_) => AttemptOutcome::StoreError,
        }
    }
}

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub rows_written: usize,
    pub last_observed_date: Option<NaiveDate>,
    pub skipped_values: usize,
    pub payload_hash: String,
    /// Set when an IRREGULAR entity learned its cadence from upstream metadata
    pub cadence_refined: Option<CadenceClass>,
}

#[derive(Clone)]
pub struct Reconciler {
    registry: EntityRegistry,
}

impl Reconciler {
    pub fn new(registry: EntityRegistry) -> Self {
        Self { registry }
    }

    /// `Apply(entity_id, payload)`
    ///
    /// Parsing happens before any write, so a parse failure leaves the entity
    /// untouched. Every write runs in one transaction that is either committed
    /// or rolled back before this returns.
    pub async fn apply(
        &self,
        entity_id: &EntityId,
        fetched: &FetchedEntity,
        run_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let parsed = parse_payload(&fetched.payload)?;
        let payload_hash = fetched.payload.fingerprint();

        let mut tx = self.registry.begin().await?;
        let written = Self::write(&mut tx, entity_id, &parsed, &fetched.metadata, run_id, &payload_hash, now).await;

        match written {
            Ok(outcome) => {
                tx.commit().await?;
                debug!(
                    entity_id = %entity_id,
                    rows = outcome.rows_written,
                    "Reconciled up to {:?}",
                    outcome.last_observed_date
                );
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback for {} failed: {}", entity_id, rollback_err);
                }
                Err(e.into())
            }
        }
    }

    async fn write(
        conn: &mut SqliteConnection,
        entity_id: &EntityId,
        parsed: &ParsedPayload,
        metadata: &EntityMetadata,
        run_id: Option<&str>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let mut entity = EntityRegistry::get_entity_in(conn, entity_id)
            .await?
            .ok_or_else(|| StoreError::UnknownEntity(entity_id.clone()))?;

        let rows_written = EntityRegistry::upsert_data_points(conn, entity_id, &parsed.rows, now).await?;
        // read back inside the transaction so the pointer matches the rows exactly
        let last_observed_date = EntityRegistry::max_observation_date(conn, entity_id).await?;

        entity.last_observed_date = last_observed_date;
        entity.last_sync_at = Some(now);
        entity.last_attempt_at = Some(now);
        entity.consecutive_failures = 0;

        let mut cadence_refined = None;
        if !metadata.is_empty() {
            if entity.cadence_class == CadenceClass::Irregular {
                if let Some(cadence) = metadata
                    .frequency
                    .as_deref()
                    .and_then(CadenceClass::from_frequency_label)
                {
                    info!("📅 {} cadence refined: IRREGULAR → {}", entity_id, cadence);
                    entity.cadence_class = cadence;
                    cadence_refined = Some(cadence);
                }
            }
            entity.metadata = Some(metadata.clone());
        }

        EntityRegistry::update_entity(conn, &entity).await?;

        let mut attempt = NewAttempt::success(
            format!(
                "{} rows, last observation {}",
                rows_written,
                last_observed_date.map_or_else(|| "none".to_string(), |d| d.to_string())
            ),
            payload_hash,
        )
        .at(now);
        if let Some(run_id) = run_id {
            attempt = attempt.in_run(run_id);
        }
        EntityRegistry::append_attempt(conn, entity_id, &attempt).await?;

        Ok(ReconcileOutcome {
            rows_written,
            last_observed_date,
            skipped_values: parsed.skipped_values,
            payload_hash: payload_hash.to_string(),
            cadence_refined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityStatus, RawPayload};
    use crate::test_utils::TestDatabase;

    fn payload(body: &str) -> FetchedEntity {
        FetchedEntity::new(RawPayload::new(body))
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn success_moves_pointer_and_resets_failures() {
        let db = TestDatabase::new().await;
        let id = db.register("X", CadenceClass::Daily).await;
        db.set_failures(&id, 2).await;

        let reconciler = Reconciler::new(db.registry());
        let now = Utc::now();
        let outcome = reconciler
            .apply(&id, &payload("DATE,X\n2024-01-01,1\n2024-01-02,2\n"), Some("run-1"), now)
            .await
            .unwrap();

        assert_eq!(outcome.rows_written, 2);
        assert_eq!(outcome.last_observed_date, Some(date("2024-01-02")));

        let entity = db.registry().get_entity(&id).await.unwrap().unwrap();
        assert_eq!(entity.consecutive_failures, 0);
        assert_eq!(entity.last_observed_date, Some(date("2024-01-02")));
        assert_eq!(entity.status, EntityStatus::Active);
        assert!(entity.last_sync_at.is_some());

        let attempts = db.registry().attempts_for(&id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
        assert_eq!(attempts[0].run_id.as_deref(), Some("run-1"));
        assert_eq!(attempts[0].payload_hash.as_deref(), Some(outcome.payload_hash.as_str()));
    }

    #[tokio::test]
    async fn pointer_reflects_all_stored_rows_not_just_this_payload() {
        let db = TestDatabase::new().await;
        let id = db.register("REV", CadenceClass::Monthly).await;
        let reconciler = Reconciler::new(db.registry());

        reconciler
            .apply(&id, &payload("DATE,V\n2024-03-01,1\n"), None, Utc::now())
            .await
            .unwrap();
        // a revision-only payload for an older date keeps the newer pointer
        let outcome = reconciler
            .apply(&id, &payload("DATE,V\n2024-01-01,0.5\n"), None, Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.last_observed_date, Some(date("2024-03-01")));
        assert_eq!(db.registry().data_points_for(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn parse_failure_leaves_entity_untouched() {
        let db = TestDatabase::new().await;
        let id = db.register("P", CadenceClass::Daily).await;
        let before = db.registry().get_entity(&id).await.unwrap().unwrap();

        let err = Reconciler::new(db.registry())
            .apply(&id, &payload("<html>Access Denied</html>"), None, Utc::now())
            .await
            .unwrap_err();

        assert_eq!(err.outcome(), AttemptOutcome::ParseError);
        assert_eq!(db.registry().get_entity(&id).await.unwrap().unwrap(), before);
        assert!(db.registry().attempts_for(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_fault_rolls_back_everything() {
        let db = TestDatabase::new().await;
        let id = db.register("Z", CadenceClass::Daily).await;
        let reconciler = Reconciler::new(db.registry());
        reconciler
            .apply(&id, &payload("DATE,Z\n2024-01-01,1\n"), None, Utc::now())
            .await
            .unwrap();
        let before = db.registry().get_entity(&id).await.unwrap().unwrap();

        db.inject_write_fault("Z", "2024-01-03").await;
        let err = reconciler
            .apply(
                &id,
                &payload("DATE,Z\n2024-01-01,9\n2024-01-02,2\n2024-01-03,3\n"),
                None,
                Utc::now(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.outcome(), AttemptOutcome::StoreError);
        let points = db.registry().data_points_for(&id).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, Some(1.0));
        assert_eq!(db.registry().get_entity(&id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn irregular_cadence_is_refined_from_metadata() {
        let db = TestDatabase::new().await;
        let id = db.register("NEW", CadenceClass::Irregular).await;
        let fetched = payload("DATE,V\n2024-01-05,1\n").with_metadata(EntityMetadata {
            title: Some("Initial Claims".into()),
            frequency: Some("Weekly, Ending Saturday".into()),
            ..EntityMetadata::default()
        });

        let outcome = Reconciler::new(db.registry())
            .apply(&id, &fetched, None, Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.cadence_refined, Some(CadenceClass::Weekly));
        let entity = db.registry().get_entity(&id).await.unwrap().unwrap();
        assert_eq!(entity.cadence_class, CadenceClass::Weekly);
        assert_eq!(entity.metadata.unwrap().title.as_deref(), Some("Initial Claims"));
    }

    #[tokio::test]
    async fn unknown_entity_is_a_store_error() {
        let db = TestDatabase::new().await;
        let err = Reconciler::new(db.registry())
            .apply(&EntityId::new("GHOST"), &payload("DATE,V\n2024-01-01,1\n"), None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Store(StoreError::UnknownEntity(_))));
    }
}
