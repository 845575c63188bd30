//! Candidate selection benchmark
//!
//! Classification and ranking over registries of catalog size, with a mix
//! of cadences, sync ages and failing entities.

use std::hint::black_box;
use std::time::Duration;

use chrono::{DateTime, Utc};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use series_sync::application::change_detector::{ChangeDetector, DetectorPolicy, SelectionWindow};
use series_sync::domain::{CadenceClass, Entity, EntityStatus};

fn registry(size: usize, now: DateTime<Utc>) -> Vec<Entity> {
    let mut rng = fastrand::Rng::with_seed(7);
    (0..size)
        .map(|i| {
            let cadence = CadenceClass::ALL[i % CadenceClass::ALL.len()];
            let mut entity = Entity::new(format!("SERIES{i:06}"), cadence);
            if rng.u8(..10) > 0 {
                entity = entity.with_last_sync(now - chrono::Duration::hours(rng.i64(1..24 * 120)));
            }
            if rng.u8(..20) == 0 {
                entity = entity.with_failures(rng.u32(1..5), now - chrono::Duration::minutes(rng.i64(1..600)));
            }
            if rng.u8(..100) == 0 {
                entity.status = EntityStatus::Suspended;
            }
            entity
        })
        .collect()
}

fn candidate_selection(c: &mut Criterion) {
    let now = Utc::now();
    let detector = ChangeDetector::new(DetectorPolicy {
        backoff_base_delay: Duration::from_secs(1800),
        backoff_cap: Duration::from_secs(86_400),
        jitter_ratio: 0.1,
    });

    let mut group = c.benchmark_group("select_candidates");
    for size in [1_000, 10_000, 100_000] {
        let entities = registry(size, now);
        group.bench_with_input(BenchmarkId::new("unbounded", size), &entities, |b, entities| {
            b.iter(|| detector.select_candidates(black_box(entities), now, SelectionWindow::unbounded()));
        });
        group.bench_with_input(BenchmarkId::new("chunk_500", size), &entities, |b, entities| {
            let window = SelectionWindow {
                limit: Some(500),
                skip: 500,
            };
            b.iter(|| detector.select_candidates(black_box(entities), now, window));
        });
    }
    group.finish();
}

criterion_group!(benches, candidate_selection);
criterion_main!(benches);
