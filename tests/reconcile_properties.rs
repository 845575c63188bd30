//! Overwrite law: stored rows equal the payloads merged in arrival order,
//! later observations of a date replacing earlier ones, and the pointer
//! equals the newest stored date.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, Utc};
use proptest::prelude::*;

use series_sync::application::Reconciler;
use series_sync::domain::{CadenceClass, FetchedEntity, RawPayload};
use series_sync::test_utils::TestDatabase;

type Payload = Vec<(u16, Option<i32>)>;

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn render(payload: &Payload) -> String {
    let mut csv = String::from("DATE,VALUE\n");
    for (offset, value) in payload {
        let date = base_date() + Duration::days(i64::from(*offset));
        match value {
            Some(v) => csv.push_str(&format!("{date},{v}\n")),
            None => csv.push_str(&format!("{date},.\n")),
        }
    }
    csv
}

fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::vec((0_u16..60, prop::option::weighted(0.8, -1000_i32..1000)), 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn merged_store_matches_last_writer_wins_model(payloads in prop::collection::vec(payload_strategy(), 1..5)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        let (stored, pointer) = runtime.block_on(async {
            let db = TestDatabase::new().await;
            let id = db.register("PROP", CadenceClass::Daily).await;
            let reconciler = Reconciler::new(db.registry());

            for payload in &payloads {
                let fetched = FetchedEntity::new(RawPayload::new(render(payload)));
                reconciler.apply(&id, &fetched, None, Utc::now()).await.unwrap();
            }

            let stored: BTreeMap<NaiveDate, Option<f64>> = db
                .registry()
                .data_points_for(&id)
                .await
                .unwrap()
                .into_iter()
                .map(|p| (p.observation_date, p.value))
                .collect();
            let pointer = db.registry().get_entity(&id).await.unwrap().unwrap().last_observed_date;
            (stored, pointer)
        });

        let mut model: BTreeMap<NaiveDate, Option<f64>> = BTreeMap::new();
        for payload in &payloads {
            for (offset, value) in payload {
                model.insert(base_date() + Duration::days(i64::from(*offset)), value.map(f64::from));
            }
        }

        prop_assert_eq!(pointer, model.keys().next_back().copied());
        prop_assert_eq!(stored, model);
    }
}
