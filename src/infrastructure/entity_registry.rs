//! Entity registry and time-series store over SQLite
//!
//! Owns every read and write of `entities`, `data_points`, `sync_attempts`
//! and `sync_runs`. Writes that must be atomic with each other take a
//! `&mut SqliteConnection` so callers can run them inside one transaction
//! (`begin()` → helpers → `commit()`; dropping an uncommitted transaction rolls back).

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{
    AttemptOutcome, CadenceClass, DataPoint, Entity, EntityId, EntityMetadata, EntityStatus,
    NewAttempt, ObservationRow, SyncAttempt, SyncRunSummary,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Entity {0} is not registered")]
    UnknownEntity(EntityId),

    #[error("Corrupt row for {entity_id}: {reason}")]
    Corrupt { entity_id: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a catalog upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Known entity; a previously empty field was filled in
    Updated,
    Unchanged,
}

/// `ListEntities(filter)`; every field narrows the result
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub status: Option<EntityStatus>,
    pub cadence_class: Option<CadenceClass>,
}

const ENTITY_COLUMNS: &str = "id, cadence_class, hierarchy_path, last_observed_date, last_sync_at, \
     last_attempt_at, consecutive_failures, status, metadata";

#[derive(Clone)]
pub struct EntityRegistry {
    pool: SqlitePool,
}

impl EntityRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ===============================
    // CATALOG OPERATIONS
    // ===============================

    /// `Upsert(entity_id, cadence_class, hierarchy_path)`
    ///
    /// Establishes identity only. A known entity keeps its cadence and sync
    /// state; only a missing hierarchy path is filled in.
    pub async fn upsert(
        &self,
        entity_id: &EntityId,
        cadence_class: CadenceClass,
        hierarchy_path: Option<&str>,
    ) -> StoreResult<UpsertOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO entities (id, cadence_class, hierarchy_path, status, consecutive_failures)
            VALUES (?, ?, ?, 'ACTIVE', 0)
            "#,
        )
        .bind(entity_id.as_str())
        .bind(cadence_class.as_str())
        .bind(hierarchy_path)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            debug!("Registered new entity {} ({})", entity_id, cadence_class);
            return Ok(UpsertOutcome::Inserted);
        }

        let Some(path) = hierarchy_path else {
            return Ok(UpsertOutcome::Unchanged);
        };
        let filled = sqlx::query(
            "UPDATE entities SET hierarchy_path = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ? AND hierarchy_path IS NULL",
        )
        .bind(path)
        .bind(entity_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(if filled > 0 {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Unchanged
        })
    }

    // ===============================
    // READ QUERIES
    // ===============================

    /// `GetEntity(id)`
    pub async fn get_entity(&self, entity_id: &EntityId) -> StoreResult<Option<Entity>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_entity_in(&mut conn, entity_id).await
    }

    /// `ListEntities(filter)`, ordered by id
    pub async fn list_entities(&self, filter: &EntityFilter) -> StoreResult<Vec<Entity>> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities \
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR cadence_class = ?2) \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.status.map(EntityStatus::as_str))
            .bind(filter.cadence_class.map(CadenceClass::as_str))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entity_from_row).collect()
    }

    pub async fn count_entities(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn data_points_for(&self, entity_id: &EntityId) -> StoreResult<Vec<DataPoint>> {
        let rows = sqlx::query(
            "SELECT observation_date, value, revision FROM data_points \
             WHERE entity_id = ? ORDER BY observation_date",
        )
        .bind(entity_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(DataPoint {
                    entity_id: entity_id.clone(),
                    observation_date: row.try_get("observation_date")?,
                    value: row.try_get("value")?,
                    revision: row.try_get("revision")?,
                })
            })
            .collect()
    }

    /// Audit trail of one entity, oldest first
    pub async fn attempts_for(&self, entity_id: &EntityId) -> StoreResult<Vec<SyncAttempt>> {
        let rows = sqlx::query(
            "SELECT id, run_id, entity_id, attempted_at, outcome, detail, payload_hash \
             FROM sync_attempts WHERE entity_id = ? ORDER BY id",
        )
        .bind(entity_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }

    // ===============================
    // TRANSACTIONAL WRITES
    // ===============================

    /// `BeginTransaction`
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn get_entity_in(
        conn: &mut SqliteConnection,
        entity_id: &EntityId,
    ) -> StoreResult<Option<Entity>> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(entity_id.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    /// `UpsertDataPoints`: a row for an existing date is overwritten, never duplicated
    pub async fn upsert_data_points(
        conn: &mut SqliteConnection,
        entity_id: &EntityId,
        rows: &[ObservationRow],
        written_at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO data_points (entity_id, observation_date, value, revision, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (entity_id, observation_date) DO UPDATE SET
                    value = excluded.value,
                    revision = excluded.revision,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(entity_id.as_str())
            .bind(row.date)
            .bind(row.value)
            .bind(row.revision.as_deref())
            .bind(written_at)
            .execute(&mut *conn)
            .await?;
        }
        Ok(rows.len())
    }

    /// Newest observation date actually present for an entity
    pub async fn max_observation_date(
        conn: &mut SqliteConnection,
        entity_id: &EntityId,
    ) -> StoreResult<Option<NaiveDate>> {
        let max: Option<String> =
            sqlx::query_scalar("SELECT MAX(observation_date) FROM data_points WHERE entity_id = ?")
                .bind(entity_id.as_str())
                .fetch_one(&mut *conn)
                .await?;

        max.map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| StoreError::Corrupt {
                entity_id: entity_id.to_string(),
                reason: format!("observation_date '{raw}': {e}"),
            })
        })
        .transpose()
    }

    /// `UpdateEntity`: persist every mutable field of the entity
    pub async fn update_entity(conn: &mut SqliteConnection, entity: &Entity) -> StoreResult<()> {
        let metadata = entity
            .metadata
            .as_ref()
            .filter(|m| !m.is_empty())
            .map(serde_json::to_string)
            .transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE entities SET
                cadence_class = ?,
                hierarchy_path = ?,
                last_observed_date = ?,
                last_sync_at = ?,
                last_attempt_at = ?,
                consecutive_failures = ?,
                status = ?,
                metadata = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
        )
        .bind(entity.cadence_class.as_str())
        .bind(entity.hierarchy_path.as_deref())
        .bind(entity.last_observed_date)
        .bind(entity.last_sync_at)
        .bind(entity.last_attempt_at)
        .bind(i64::from(entity.consecutive_failures))
        .bind(entity.status.as_str())
        .bind(metadata)
        .bind(entity.id.as_str())
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::UnknownEntity(entity.id.clone()));
        }
        Ok(())
    }

    /// Append one audit row; attempts are never updated or deleted
    pub async fn append_attempt(
        conn: &mut SqliteConnection,
        entity_id: &EntityId,
        attempt: &NewAttempt,
    ) -> StoreResult<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO sync_attempts (run_id, entity_id, attempted_at, outcome, detail, payload_hash)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(attempt.run_id.as_deref())
        .bind(entity_id.as_str())
        .bind(attempt.attempted_at)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.detail)
        .bind(attempt.payload_hash.as_deref())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    // ===============================
    // MAINTENANCE
    // ===============================

    /// SUSPENDED → ACTIVE for the given ids. Failure counts are kept so that
    /// backoff and the retry cap still apply.
    pub async fn readmit(&self, entity_ids: &[EntityId]) -> StoreResult<Vec<EntityId>> {
        let mut tx = self.begin().await?;
        let mut readmitted = Vec::new();
        for entity_id in entity_ids {
            let changed = sqlx::query(
                "UPDATE entities SET status = 'ACTIVE', updated_at = CURRENT_TIMESTAMP \
                 WHERE id = ? AND status = 'SUSPENDED'",
            )
            .bind(entity_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if changed > 0 {
                readmitted.push(entity_id.clone());
            }
        }
        tx.commit().await?;
        Ok(readmitted)
    }

    pub async fn save_run(&self, summary: &SyncRunSummary) -> StoreResult<()> {
        let json = serde_json::to_string(summary)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sync_runs (run_id, kind, started_at, finished_at, final_state, summary)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.run_id)
        .bind(summary.kind.as_str())
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.final_state.as_str())
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_run(&self, run_id: &str) -> StoreResult<Option<SyncRunSummary>> {
        let summary: Option<String> = sqlx::query_scalar("SELECT summary FROM sync_runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(summary.map(|json| serde_json::from_str(&json)).transpose()?)
    }
}

fn corrupt(id: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        entity_id: id.to_string(),
        reason: reason.into(),
    }
}

fn entity_from_row(row: &SqliteRow) -> StoreResult<Entity> {
    let id: String = row.try_get("id")?;
    let cadence: String = row.try_get("cadence_class")?;
    let status: String = row.try_get("status")?;
    let failures: i64 = row.try_get("consecutive_failures")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    let metadata = metadata.and_then(|json| match serde_json::from_str::<EntityMetadata>(&json) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!("Ignoring unreadable metadata for {}: {}", id, e);
            None
        }
    });

    Ok(Entity {
        cadence_class: cadence.parse().map_err(|e: String| corrupt(&id, e))?,
        status: status.parse().map_err(|e: String| corrupt(&id, e))?,
        consecutive_failures: u32::try_from(failures)
            .map_err(|_| corrupt(&id, format!("consecutive_failures {failures}")))?,
        hierarchy_path: row.try_get("hierarchy_path")?,
        last_observed_date: row.try_get("last_observed_date")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        metadata,
        id: EntityId::new(id),
    })
}

fn attempt_from_row(row: &SqliteRow) -> StoreResult<SyncAttempt> {
    let entity_id: String = row.try_get("entity_id")?;
    let outcome: String = row.try_get("outcome")?;
    Ok(SyncAttempt {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        attempted_at: row.try_get("attempted_at")?,
        outcome: outcome
            .parse::<AttemptOutcome>()
            .map_err(|e| corrupt(&entity_id, e))?,
        detail: row.try_get("detail")?,
        payload_hash: row.try_get("payload_hash")?,
        entity_id: EntityId::new(entity_id),
    })
}
