//! End-to-end sync runs against an in-memory store and a scripted upstream

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use series_sync::application::change_detector::SelectionWindow;
use series_sync::application::{SyncRunOrchestrator, ValidatedSyncConfig};
use series_sync::domain::{AttemptOutcome, CadenceClass, EntityId, EntityStatus, FetchError, RunState};
use series_sync::test_utils::{CollectingSink, ScriptedFetcher, ScriptedResponse, TestDatabase, fast_config};

fn orchestrator(
    db: &TestDatabase,
    config: ValidatedSyncConfig,
    fetcher: Arc<ScriptedFetcher>,
) -> SyncRunOrchestrator {
    SyncRunOrchestrator::new(
        Arc::new(config),
        db.registry(),
        fetcher,
        Arc::new(CollectingSink::default()),
    )
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn http_503() -> ScriptedResponse {
    ScriptedResponse::Fail(FetchError::Http {
        status: 503,
        message: "Service Unavailable".into(),
    })
}

#[tokio::test]
async fn stale_daily_entity_is_fetched_and_pointer_advances() {
    let db = TestDatabase::new().await;
    let x = db.register("X", CadenceClass::Daily).await;
    db.set_last_sync(&x, Utc::now() - chrono::Duration::days(2)).await;

    let fetcher = Arc::new(ScriptedFetcher::new());
    let summary = orchestrator(&db, fast_config(), fetcher.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(summary.final_state, RunState::Done);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(fetcher.calls_for("X"), 1);

    let entity = db.registry().get_entity(&x).await.unwrap().unwrap();
    assert_eq!(entity.last_observed_date, Some(Utc::now().date_naive()));
    assert_eq!(entity.consecutive_failures, 0);
    assert!(entity.last_sync_at.unwrap() > Utc::now() - chrono::Duration::minutes(5));
}

#[tokio::test]
async fn three_consecutive_failures_suspend_and_later_runs_skip() {
    let db = TestDatabase::new().await;
    let x = db.register("X", CadenceClass::Daily).await;
    let y = db.register("Y", CadenceClass::Daily).await;

    let mut config = fast_config();
    // failed entities are due again immediately
    config.detector.backoff_base_delay = Duration::ZERO;

    let fetcher = Arc::new(ScriptedFetcher::new().script("Y", vec![http_503(), http_503(), http_503()]));
    let orchestrator = orchestrator(&db, config, fetcher.clone());

    for run in 1..=3 {
        let summary = orchestrator.run(CancellationToken::new()).await;
        assert_eq!(summary.final_state, RunState::Done);
        assert_eq!(summary.failed_of(AttemptOutcome::FetchError), 1, "run {run}");

        let entity = db.registry().get_entity(&y).await.unwrap().unwrap();
        assert_eq!(entity.consecutive_failures, run);
        if run < 3 {
            assert_eq!(entity.status, EntityStatus::Active);
        } else {
            assert_eq!(entity.status, EntityStatus::Suspended);
            assert!(summary.newly_suspended.contains(&y));
        }
    }

    let fourth = orchestrator.run(CancellationToken::new()).await;
    assert_eq!(fourth.skipped_suspended, 1);
    assert_eq!(fourth.attempted, 0);
    assert_eq!(fetcher.calls_for("Y"), 3);

    // X synced once, then stayed up to date
    assert_eq!(fetcher.calls_for("X"), 1);
    assert_eq!(fourth.skipped_up_to_date, 1);

    let attempts = db.registry().attempts_for(&y).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::FetchError));
    assert!(db.registry().get_entity(&x).await.unwrap().unwrap().is_active());
}

#[tokio::test]
async fn store_fault_mid_write_leaves_previous_state_intact() {
    let db = TestDatabase::new().await;
    let z = db.register("Z", CadenceClass::Daily).await;
    let w = db.register("W", CadenceClass::Daily).await;

    let fetcher = Arc::new(ScriptedFetcher::new().script(
        "Z",
        vec![
            ScriptedResponse::Body("DATE,Z\n2024-01-01,1\n".into()),
            ScriptedResponse::Body("DATE,Z\n2024-01-01,9\n2024-01-02,2\n2024-01-03,3\n".into()),
        ],
    ));
    let orchestrator = orchestrator(&db, fast_config(), fetcher);

    let first = orchestrator.run(CancellationToken::new()).await;
    assert_eq!(first.succeeded, 2);
    let before = db.registry().get_entity(&z).await.unwrap().unwrap();

    db.inject_write_fault("Z", "2024-01-03").await;
    let two_days_ago = Utc::now() - chrono::Duration::days(2);
    db.set_last_sync(&z, two_days_ago).await;
    db.set_last_sync(&w, two_days_ago).await;

    let second = orchestrator.run(CancellationToken::new()).await;
    assert_eq!(second.final_state, RunState::Done);
    assert_eq!(second.failed_of(AttemptOutcome::StoreError), 1);
    assert_eq!(second.succeeded, 1);

    let points = db.registry().data_points_for(&z).await.unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value, Some(1.0));

    let after = db.registry().get_entity(&z).await.unwrap().unwrap();
    assert_eq!(after.last_observed_date, before.last_observed_date);
    assert_eq!(after.last_observed_date, Some(date("2024-01-01")));
    assert_eq!(after.consecutive_failures, 1);

    let outcomes: Vec<_> = db
        .registry()
        .attempts_for(&z)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.outcome)
        .collect();
    assert_eq!(outcomes, vec![AttemptOutcome::Success, AttemptOutcome::StoreError]);
}

#[tokio::test]
async fn limit_and_skip_select_the_second_chunk() {
    let db = TestDatabase::new().await;
    for i in 0..150 {
        db.register(&format!("S{i:03}"), CadenceClass::Daily).await;
    }

    let mut config = fast_config();
    config.selection = SelectionWindow {
        limit: Some(50),
        skip: 50,
    };
    let fetcher = Arc::new(ScriptedFetcher::new());

    let summary = orchestrator(&db, config, fetcher.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(summary.candidates, 50);
    assert_eq!(summary.succeeded, 50);
    assert_eq!(fetcher.total_calls(), 50);
    assert_eq!(fetcher.calls_for("S049"), 0);
    assert_eq!(fetcher.calls_for("S050"), 1);
    assert_eq!(fetcher.calls_for("S099"), 1);
    assert_eq!(fetcher.calls_for("S100"), 0);
}

#[tokio::test]
async fn rerun_is_stable_and_reapplying_a_payload_changes_nothing() {
    let db = TestDatabase::new().await;
    let ids: Vec<EntityId> = {
        let mut ids = Vec::new();
        for name in ["A", "B", "C"] {
            ids.push(db.register(name, CadenceClass::Daily).await);
        }
        ids
    };
    let body = "DATE,V\n2024-05-01,1.5\n2024-05-02,.\n2024-05-03,2.5\n";
    let fetcher = Arc::new(ScriptedFetcher::new().with_default_body(body));
    let orchestrator = orchestrator(&db, fast_config(), fetcher.clone());

    let first = orchestrator.run(CancellationToken::new()).await;
    assert_eq!(first.succeeded, 3);
    let mut snapshot = Vec::new();
    for id in &ids {
        snapshot.push(db.registry().data_points_for(id).await.unwrap());
    }

    let second = orchestrator.run(CancellationToken::new()).await;
    assert_eq!(second.candidates, 0);
    assert_eq!(second.skipped_up_to_date, 3);
    assert_eq!(fetcher.total_calls(), 3);

    // force a refetch of the identical payload
    for id in &ids {
        db.set_last_sync(id, Utc::now() - chrono::Duration::days(2)).await;
    }
    let third = orchestrator.run(CancellationToken::new()).await;
    assert_eq!(third.succeeded, 3);

    for (id, before) in ids.iter().zip(&snapshot) {
        assert_eq!(&db.registry().data_points_for(id).await.unwrap(), before);
        let entity = db.registry().get_entity(id).await.unwrap().unwrap();
        assert_eq!(entity.last_observed_date, Some(date("2024-05-03")));
    }
}

#[tokio::test]
async fn concurrency_bound_holds_for_a_full_run() {
    let db = TestDatabase::new().await;
    for i in 0..20 {
        db.register(&format!("C{i:02}"), CadenceClass::Monthly).await;
    }

    let mut config = fast_config();
    config.coordinator.concurrency = 3;
    let fetcher = Arc::new(ScriptedFetcher::new().with_latency(Duration::from_millis(20)));

    let summary = orchestrator(&db, config, fetcher.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(summary.succeeded, 20);
    assert!(fetcher.peak_concurrency() <= 3, "peak {}", fetcher.peak_concurrency());
    assert!(fetcher.peak_concurrency() >= 2);
    for i in 0..20 {
        assert_eq!(fetcher.calls_for(&format!("C{i:02}")), 1);
    }
}

#[tokio::test]
async fn circuit_breaker_aborts_the_run_and_stops_dispatch() {
    let db = TestDatabase::new().await;
    let mut fetcher = ScriptedFetcher::new();
    for i in 0..10 {
        let id = format!("E{i}");
        db.register(&id, CadenceClass::Daily).await;
        fetcher = fetcher.script(&id, vec![http_503()]);
    }

    let mut config = fast_config();
    config.coordinator.concurrency = 1;
    config.coordinator.circuit_breaker.distinct_entities = 3;
    let fetcher = Arc::new(fetcher);

    let summary = orchestrator(&db, config, fetcher.clone())
        .run(CancellationToken::new())
        .await;

    assert_eq!(summary.final_state, RunState::Aborted);
    assert!(summary.circuit_broken);
    assert_eq!(fetcher.total_calls(), 3);
    assert_eq!(summary.failed_of(AttemptOutcome::FetchError), 3);
    assert_eq!(summary.not_dispatched, 7);

    // the failures that were observed are still recorded
    assert_eq!(db.registry().attempts_for(&EntityId::new("E0")).await.unwrap().len(), 1);
    assert!(db.registry().attempts_for(&EntityId::new("E9")).await.unwrap().is_empty());
}

#[tokio::test]
async fn stop_signal_finishes_in_flight_work_and_reports_the_rest() {
    let db = TestDatabase::new().await;
    for i in 0..10 {
        db.register(&format!("K{i}"), CadenceClass::Daily).await;
    }

    let mut config = fast_config();
    config.coordinator.concurrency = 2;
    config.coordinator.cancel_grace_period = Duration::from_millis(100);
    let fetcher = Arc::new(ScriptedFetcher::new().with_latency(Duration::from_secs(10)));
    let orchestrator = orchestrator(&db, config, fetcher.clone());

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    });

    let summary = orchestrator.run(cancel).await;

    assert_eq!(summary.final_state, RunState::Done);
    assert!(summary.cancelled);
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.failed_of(AttemptOutcome::FetchError), 2);
    assert_eq!(summary.not_dispatched, 8);
    assert_eq!(fetcher.total_calls(), 2);

    let persisted = db.registry().load_run(&summary.run_id).await.unwrap().unwrap();
    assert_eq!(persisted.final_state, RunState::Done);
}
