//! Test utilities for series-sync
//!
//! Isolated in-memory databases, a scripted fetch capability with
//! concurrency instrumentation, and a summary sink that keeps what it gets.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::application::validated_config::ValidatedSyncConfig;
use crate::domain::{
    CadenceClass, EntityFetcher, EntityId, EntityMetadata, EntityStatus, FetchError, FetchedEntity,
    NewAttempt, RawPayload, SummarySink, SyncRunSummary,
};
use crate::infrastructure::config::SyncConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::entity_registry::EntityRegistry;

/// Test database configuration
pub struct TestDatabase {
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    /// Create a new in-memory test database with the schema applied
    pub async fn new() -> Self {
        let connection = DatabaseConnection::open("sqlite::memory:")
            .await
            .expect("in-memory database");
        Self { connection }
    }

    /// File-backed database, for tests that need WAL or several connections
    pub async fn at(database_url: &str) -> Self {
        let connection = DatabaseConnection::open(database_url)
            .await
            .expect("file database");
        Self { connection }
    }

    pub fn pool(&self) -> sqlx::SqlitePool {
        self.connection.pool().clone()
    }

    pub fn registry(&self) -> EntityRegistry {
        EntityRegistry::new(self.pool())
    }

    pub async fn register(&self, id: &str, cadence: CadenceClass) -> EntityId {
        let id = EntityId::new(id);
        self.registry()
            .upsert(&id, cadence, None)
            .await
            .expect("register entity");
        id
    }

    pub async fn set_last_sync(&self, id: &EntityId, at: DateTime<Utc>) {
        self.edit(id, |entity| {
            entity.last_sync_at = Some(at);
            entity.last_attempt_at = Some(at);
        })
        .await;
    }

    pub async fn set_failures(&self, id: &EntityId, failures: u32) {
        self.edit(id, |entity| {
            entity.consecutive_failures = failures;
            entity.last_attempt_at = Some(Utc::now());
        })
        .await;
    }

    pub async fn suspend(&self, id: &EntityId) {
        self.edit(id, |entity| entity.status = EntityStatus::Suspended).await;
    }

    /// Append a SUCCESS audit row without touching the entity
    pub async fn append_success(&self, id: &EntityId, at: DateTime<Utc>) {
        let mut conn = self.pool().acquire().await.expect("connection");
        EntityRegistry::append_attempt(&mut conn, id, &NewAttempt::success("ok", "hash").at(at))
            .await
            .expect("append attempt");
    }

    /// Make any write of `(entity_id, date)` into `data_points` fail mid-transaction
    pub async fn inject_write_fault(&self, entity_id: &str, date: &str) {
        let sql = format!(
            "CREATE TRIGGER fault_{} BEFORE INSERT ON data_points \
             WHEN NEW.entity_id = '{}' AND NEW.observation_date = '{}' \
             BEGIN SELECT RAISE(ABORT, 'injected write fault'); END",
            fastrand::u32(..),
            entity_id.replace('\'', "''"),
            date.replace('\'', "''"),
        );
        sqlx::query(&sql)
            .execute(self.connection.pool())
            .await
            .expect("create fault trigger");
    }

    async fn edit(&self, id: &EntityId, change: impl FnOnce(&mut crate::domain::Entity)) {
        let mut conn = self.pool().acquire().await.expect("connection");
        let mut entity = EntityRegistry::get_entity_in(&mut conn, id)
            .await
            .expect("load entity")
            .expect("entity exists");
        change(&mut entity);
        EntityRegistry::update_entity(&mut conn, &entity)
            .await
            .expect("update entity");
    }
}

/// Validated configuration with pacing delays removed and short retry waits
pub fn fast_config() -> ValidatedSyncConfig {
    let mut config = SyncConfig::default();
    config.sync.min_delay_secs = 0.0;
    config.sync.max_delay_secs = 0.0;
    config.fetch.retry_base_delay_ms = 1;
    config.fetch.transient_retry_limit = 0;
    config.sync.cancel_grace_secs = 1;
    config.circuit_breaker.distinct_entities = 1_000;

    ValidatedSyncConfig::validate(&config).expect("valid test config")
}

/// CSV payload whose newest observation is today
pub fn csv_through_today() -> String {
    let today = Utc::now().date_naive();
    let yesterday = today.pred_opt().unwrap_or(today);
    format!("DATE,VALUE\n{yesterday},1.0\n{today},2.0\n")
}

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Body(String),
    Fail(FetchError),
}

/// Fetch capability driven by per-entity scripts
///
/// Each call pops the next scripted response for the entity; once the script
/// is exhausted the default body is returned. Every call sleeps `latency`
/// and is counted toward the concurrency high-water mark.
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<EntityId, VecDeque<ScriptedResponse>>>,
    metadata: HashMap<EntityId, EntityMetadata>,
    default_body: Option<String>,
    latency: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    total_calls: AtomicUsize,
    calls: Mutex<HashMap<EntityId, usize>>,
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            metadata: HashMap::new(),
            default_body: None,
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total_calls: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_default_body(mut self, body: impl Into<String>) -> Self {
        self.default_body = Some(body.into());
        self
    }

    pub fn with_metadata(mut self, id: &str, metadata: EntityMetadata) -> Self {
        self.metadata.insert(EntityId::new(id), metadata);
        self
    }

    pub fn script(self, id: &str, responses: Vec<ScriptedResponse>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(EntityId::new(id), responses.into());
        self
    }

    /// Highest number of simultaneous `fetch` calls observed
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(&EntityId::new(id))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntityFetcher for ScriptedFetcher {
    async fn fetch(&self, entity_id: &EntityId) -> Result<FetchedEntity, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(entity_id.clone())
            .or_default() += 1;

        // decrements even when the caller drops this future mid-sleep
        struct Leave<'a>(&'a AtomicUsize);
        impl Drop for Leave<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let _leave = Leave(&self.in_flight);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get_mut(entity_id)
            .and_then(VecDeque::pop_front);

        match next {
            Some(ScriptedResponse::Fail(error)) => Err(error),
            Some(ScriptedResponse::Body(body)) => Ok(FetchedEntity::new(RawPayload::new(body))),
            None => {
                let body = self.default_body.clone().unwrap_or_else(csv_through_today);
                let metadata = self.metadata.get(entity_id).cloned().unwrap_or_default();
                Ok(FetchedEntity::new(RawPayload::new(body)).with_metadata(metadata))
            }
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Summary sink that records every published summary
#[derive(Default)]
pub struct CollectingSink {
    published: Mutex<Vec<SyncRunSummary>>,
}

impl CollectingSink {
    pub fn summaries(&self) -> Vec<SyncRunSummary> {
        self.published.lock().expect("sink lock").clone()
    }

    pub fn last(&self) -> Option<SyncRunSummary> {
        self.summaries().pop()
    }
}

#[async_trait]
impl SummarySink for CollectingSink {
    async fn publish(&self, summary: &SyncRunSummary) -> anyhow::Result<()> {
        self.published.lock().expect("sink lock").push(summary.clone());
        Ok(())
    }
}

