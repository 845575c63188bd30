//! End-to-end sync pass driver
//!
//! `COLLECTING → DISPATCHING → RECONCILING → SUMMARIZING → DONE`, or
//! `ABORTED` on a fatal condition. Fetch results are reconciled as they
//! arrive, so every finished entity is committed before the batch ends.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::application::change_detector::ChangeDetector;
use crate::application::failure_tracker::FailureTracker;
use crate::application::fetch_coordinator::{FetchCoordinator, FetchResult};
use crate::application::reconciler::Reconciler;
use crate::application::validated_config::ValidatedSyncConfig;
use crate::domain::{
    AttemptOutcome, EntityFetcher, EntityId, NewAttempt, RunKind, RunState, SummarySink, SyncRunSummary,
};
use crate::infrastructure::entity_registry::{EntityFilter, EntityRegistry, StoreError};

/// Conditions that end a run as ABORTED
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store unreachable: {0}")]
    StoreUnreachable(#[source] StoreError),

    #[error("Failed to load the registry: {0}")]
    Registry(#[source] StoreError),

    #[error("Failed to record outcome for {entity_id}: {source}")]
    Record {
        entity_id: EntityId,
        #[source]
        source: StoreError,
    },

    #[error("Circuit breaker tripped: upstream is failing across many entities")]
    CircuitBreak,
}

pub struct SyncRunOrchestrator {
    config: Arc<ValidatedSyncConfig>,
    registry: EntityRegistry,
    detector: ChangeDetector,
    coordinator: FetchCoordinator,
    reconciler: Reconciler,
    tracker: FailureTracker,
    fetcher: Arc<dyn EntityFetcher>,
    sink: Arc<dyn SummarySink>,
}

impl SyncRunOrchestrator {
    pub fn new(
        config: Arc<ValidatedSyncConfig>,
        registry: EntityRegistry,
        fetcher: Arc<dyn EntityFetcher>,
        sink: Arc<dyn SummarySink>,
    ) -> Self {
        Self {
            detector: ChangeDetector::new(config.detector.clone()),
            coordinator: FetchCoordinator::new(config.coordinator.clone()),
            reconciler: Reconciler::new(registry.clone()),
            tracker: FailureTracker::new(registry.clone(), config.failure_suspend_threshold),
            config,
            registry,
            fetcher,
            sink,
        }
    }

    /// One scheduled pass over the registry. Always yields a summary.
    pub async fn run(&self, cancel: CancellationToken) -> SyncRunSummary {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("sync_run", run_id = %run_id, kind = "scheduled");
        self.run_scheduled(run_id, cancel).instrument(span).await
    }

    /// Maintenance pass over recently failed entities, bypassing cadence and backoff
    pub async fn run_retry_pass(&self, cancel: CancellationToken) -> SyncRunSummary {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("sync_run", run_id = %run_id, kind = "retry");
        self.run_retry(run_id, cancel).instrument(span).await
    }

    async fn run_scheduled(&self, run_id: String, cancel: CancellationToken) -> SyncRunSummary {
        let mut summary = SyncRunSummary::new(run_id, RunKind::Scheduled, Utc::now());
        info!("🔄 Sync run started");

        if let Err(e) = self.ensure_store().await {
            return self.abort_and_finish(summary, &e).await;
        }
        self.persist(&summary).await;

        // COLLECTING
        let entities = match self.registry.list_entities(&EntityFilter::default()).await {
            Ok(entities) => entities,
            Err(e) => return self.abort_and_finish(summary, &SyncError::Registry(e)).await,
        };
        let selection = self
            .detector
            .select_candidates(&entities, Utc::now(), self.config.selection);

        summary.candidates = selection.candidates.len();
        summary.skipped_up_to_date = selection.up_to_date;
        summary.skipped_backoff = selection.backoff;
        summary.skipped_suspended = selection.suspended;
        info!(
            "📋 {} entities: {} due ({} selected), {} up to date, {} backing off, {} suspended",
            entities.len(),
            selection.ranked_total,
            selection.candidates.len(),
            selection.up_to_date,
            selection.backoff,
            selection.suspended
        );

        self.execute(summary, selection.candidates, cancel).await
    }

    async fn run_retry(&self, run_id: String, cancel: CancellationToken) -> SyncRunSummary {
        let mut summary = SyncRunSummary::new(run_id, RunKind::Retry, Utc::now());
        info!("🔁 Retry pass started");

        if let Err(e) = self.ensure_store().await {
            return self.abort_and_finish(summary, &e).await;
        }
        self.persist(&summary).await;

        let eligible = match self
            .tracker
            .retry_eligible(self.config.retry_cap, self.config.retry_lookback, Utc::now())
            .await
        {
            Ok(eligible) => eligible,
            Err(e) => return self.abort_and_finish(summary, &SyncError::Registry(e)).await,
        };
        let ids: Vec<EntityId> = eligible.into_iter().collect();

        if let Err(e) = self.tracker.readmit(&ids).await {
            return self.abort_and_finish(summary, &SyncError::Registry(e)).await;
        }

        let mut entities = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.registry.get_entity(id).await {
                Ok(Some(entity)) => entities.push(entity),
                Ok(None) => {}
                Err(e) => return self.abort_and_finish(summary, &SyncError::Registry(e)).await,
            }
        }
        entities.sort_by(|a, b| {
            a.cadence_class
                .priority_rank()
                .cmp(&b.cadence_class.priority_rank())
                .then_with(|| a.id.cmp(&b.id))
        });

        summary.candidates = entities.len();
        let candidates = entities.into_iter().map(|entity| entity.id).collect();
        self.execute(summary, candidates, cancel).await
    }

    /// DISPATCHING → RECONCILING → SUMMARIZING, shared by both run kinds
    async fn execute(
        &self,
        mut summary: SyncRunSummary,
        candidates: Vec<EntityId>,
        cancel: CancellationToken,
    ) -> SyncRunSummary {
        if candidates.is_empty() {
            info!("✅ Nothing to fetch");
            transition(&mut summary, RunState::Summarizing);
            return self.finish(summary).await;
        }

        let run_cancel = cancel.child_token();
        let watchdog = tokio::spawn({
            let token = run_cancel.clone();
            let run_timeout = self.config.run_timeout;
            async move {
                tokio::select! {
                    () = sleep(run_timeout) => {
                        warn!("⏱️ Run exceeded {:?}; stopping dispatch", run_timeout);
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            }
        });

        transition(&mut summary, RunState::Dispatching);
        let mut fetch_run = self
            .coordinator
            .dispatch(candidates, Arc::clone(&self.fetcher), run_cancel.clone());

        transition(&mut summary, RunState::Reconciling);
        let mut fatal = None;
        while let Some(result) = fetch_run.next_result().await {
            if let Err(e) = self.handle_result(&mut summary, result).await {
                error!("💥 {}", e);
                fatal = Some(e);
                run_cancel.cancel();
                break;
            }
        }

        let report = fetch_run.finish().await;
        watchdog.abort();
        summary.not_dispatched = report.not_dispatched;
        summary.circuit_broken = report.circuit_broken;

        if let Some(e) = fatal {
            return self.abort_and_finish(summary, &e).await;
        }
        if report.circuit_broken {
            return self.abort_and_finish(summary, &SyncError::CircuitBreak).await;
        }
        if run_cancel.is_cancelled() {
            summary.cancelled = true;
            warn!(
                "🛑 Run stopped early: {} reconciled, {} not dispatched",
                summary.succeeded, summary.not_dispatched
            );
        }

        transition(&mut summary, RunState::Summarizing);
        self.finish(summary).await
    }

    /// Route one fetch result. Per-entity failures are recorded and absorbed;
    /// only a failure to record them is fatal.
    async fn handle_result(&self, summary: &mut SyncRunSummary, result: FetchResult) -> Result<(), SyncError> {
        let FetchResult {
            entity_id,
            attempts,
            outcome,
        } = result;
        let run_id = summary.run_id.clone();

        let (outcome, detail) = match outcome {
            Ok(fetched) => {
                match self
                    .reconciler
                    .apply(&entity_id, &fetched, Some(&run_id), Utc::now())
                    .await
                {
                    Ok(reconciled) => {
                        summary.record_success(reconciled.rows_written);
                        info!(
                            entity_id = %entity_id,
                            rows = reconciled.rows_written,
                            "✅ Synced through {:?}",
                            reconciled.last_observed_date
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(entity_id = %entity_id, "Reconcile failed: {}", e);
                        (e.outcome(), e.to_string())
                    }
                }
            }
            Err(fetch_error) => {
                warn!(entity_id = %entity_id, attempt = attempts, "Fetch failed: {}", fetch_error);
                if !fetch_error.is_transient() {
                    summary.permanent_failures.insert(entity_id.clone());
                }
                (
                    AttemptOutcome::FetchError,
                    format!("{fetch_error} (after {attempts} attempts)"),
                )
            }
        };

        let attempt = NewAttempt::failure(outcome, detail).in_run(run_id);
        let recorded = self
            .tracker
            .record(&entity_id, &attempt)
            .await
            .map_err(|source| SyncError::Record {
                entity_id: entity_id.clone(),
                source,
            })?;

        summary.record_failure(outcome);
        if recorded.newly_suspended {
            summary.record_suspension(entity_id);
        }
        Ok(())
    }

    async fn ensure_store(&self) -> Result<(), SyncError> {
        sqlx::query("SELECT 1")
            .execute(self.registry.pool())
            .await
            .map(|_| ())
            .map_err(|e| SyncError::StoreUnreachable(StoreError::Database(e)))
    }

    async fn abort_and_finish(&self, mut summary: SyncRunSummary, reason: &SyncError) -> SyncRunSummary {
        error!("🛑 Run aborted in {}: {}", summary.final_state, reason);
        summary.abort(reason.to_string());
        self.finish(summary).await
    }

    /// SUMMARIZING: stamp, persist, hand to the sink
    async fn finish(&self, mut summary: SyncRunSummary) -> SyncRunSummary {
        summary.finish(Utc::now());
        if !summary.is_aborted() {
            transition(&mut summary, RunState::Done);
        }

        self.persist(&summary).await;
        if let Err(e) = self.sink.publish(&summary).await {
            warn!("⚠️ Summary sink failed: {:#}", e);
        }

        info!(
            "🏁 Run {} {}: {} attempted, {} succeeded, {} failed, {} newly suspended, {} not dispatched ({} ms)",
            summary.run_id,
            summary.final_state,
            summary.attempted,
            summary.succeeded,
            summary.failed(),
            summary.newly_suspended.len(),
            summary.not_dispatched,
            summary.duration_ms
        );
        summary
    }

    async fn persist(&self, summary: &SyncRunSummary) {
        if let Err(e) = self.registry.save_run(summary).await {
            warn!("⚠️ Failed to persist run {}: {}", summary.run_id, e);
        }
    }
}

fn transition(summary: &mut SyncRunSummary, next: RunState) {
    if summary.final_state.can_transition_to(next) {
        info!("🔄 {} → {}", summary.final_state, next);
        summary.final_state = next;
    } else {
        warn!("Ignoring illegal run transition {} → {}", summary.final_state, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CadenceClass, EntityStatus, FetchError};
    use crate::test_utils::{CollectingSink, ScriptedFetcher, ScriptedResponse, TestDatabase, fast_config};

    fn orchestrator(
        db: &TestDatabase,
        fetcher: ScriptedFetcher,
        sink: Arc<CollectingSink>,
    ) -> SyncRunOrchestrator {
        SyncRunOrchestrator::new(Arc::new(fast_config()), db.registry(), Arc::new(fetcher), sink)
    }

    #[tokio::test]
    async fn empty_registry_finishes_done() {
        let db = TestDatabase::new().await;
        let sink = Arc::new(CollectingSink::default());
        let summary = orchestrator(&db, ScriptedFetcher::new(), sink.clone())
            .run(CancellationToken::new())
            .await;

        assert_eq!(summary.final_state, RunState::Done);
        assert_eq!(summary.candidates, 0);
        assert_eq!(sink.summaries().len(), 1);
        assert!(db.registry().load_run(&summary.run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mixed_outcomes_are_all_counted() {
        let db = TestDatabase::new().await;
        db.register("OK", CadenceClass::Daily).await;
        db.register("GONE", CadenceClass::Daily).await;
        db.register("JUNK", CadenceClass::Daily).await;

        let fetcher = ScriptedFetcher::new()
            .script("GONE", vec![ScriptedResponse::Fail(FetchError::NotFound)])
            .script("JUNK", vec![ScriptedResponse::Body("no csv here".into())]);
        let sink = Arc::new(CollectingSink::default());

        let summary = orchestrator(&db, fetcher, sink).run(CancellationToken::new()).await;

        assert_eq!(summary.final_state, RunState::Done);
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed_of(AttemptOutcome::FetchError), 1);
        assert_eq!(summary.failed_of(AttemptOutcome::ParseError), 1);
        assert!(summary.permanent_failures.contains(&EntityId::new("GONE")));
    }

    #[tokio::test]
    async fn retry_pass_readmits_suspended_entities() {
        let db = TestDatabase::new().await;
        let id = db.register("Y", CadenceClass::Daily).await;
        let tracker = FailureTracker::new(db.registry(), 1);
        tracker
            .record(&id, &NewAttempt::failure(AttemptOutcome::FetchError, "blocked"))
            .await
            .unwrap();
        assert_eq!(
            db.registry().get_entity(&id).await.unwrap().unwrap().status,
            EntityStatus::Suspended
        );

        let sink = Arc::new(CollectingSink::default());
        let summary = orchestrator(&db, ScriptedFetcher::new(), sink)
            .run_retry_pass(CancellationToken::new())
            .await;

        assert_eq!(summary.kind, RunKind::Retry);
        assert_eq!(summary.succeeded, 1);
        let entity = db.registry().get_entity(&id).await.unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Active);
        assert_eq!(entity.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn closed_store_aborts_before_collecting() {
        let db = TestDatabase::new().await;
        db.register("A", CadenceClass::Daily).await;
        let sink = Arc::new(CollectingSink::default());
        let orchestrator = orchestrator(&db, ScriptedFetcher::new(), sink.clone());

        db.registry().pool().close().await;
        let summary = orchestrator.run(CancellationToken::new()).await;

        assert_eq!(summary.final_state, RunState::Aborted);
        assert!(summary.abort_reason.unwrap().contains("Store unreachable"));
        assert_eq!(summary.attempted, 0);
        assert_eq!(sink.summaries().len(), 1);
    }
}
