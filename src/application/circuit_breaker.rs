//! Run-wide circuit breaker over upstream-hostile failures
//!
//! Trips when transient failures signalling a hostile upstream (timeouts,
//! blocks, rate limits, 5xx) hit too many distinct entities inside a sliding
//! window. Successes in the same window only dilute the failure share; they
//! never clear it. Once tripped the coordinator stops dispatching for the rest
//! of the run.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::domain::{EntityId, FetchError};

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerSettings {
    pub window: Duration,
    pub distinct_entities: usize,
    /// Minimum share of window outcomes that must be failures
    pub min_failure_share: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        use crate::infrastructure::config::defaults;
        Self {
            window: Duration::from_secs(defaults::CIRCUIT_WINDOW_SECS),
            distinct_entities: defaults::CIRCUIT_DISTINCT_ENTITIES,
            min_failure_share: defaults::CIRCUIT_MIN_FAILURE_SHARE,
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    failures: VecDeque<(Instant, EntityId)>,
    successes: VecDeque<Instant>,
}

impl Window {
    fn expire(&mut self, now: Instant, window: Duration) {
        while self
            .failures
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > window)
        {
            self.failures.pop_front();
        }
        while self
            .successes
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            self.successes.pop_front();
        }
    }

    fn failure_share(&self) -> f64 {
        let total = self.failures.len() + self.successes.len();
        if total == 0 {
            0.0
        } else {
            self.failures.len() as f64 / total as f64
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitBreakerSettings,
    recent: Mutex<Window>,
    tripped: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            settings,
            recent: Mutex::new(Window::default()),
            tripped: AtomicBool::new(false),
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Feed one final fetch failure. Returns `true` if this call tripped the breaker.
    pub fn record_failure(&self, entity_id: &EntityId, error: &FetchError) -> bool {
        if !error.is_upstream_hostile() || self.is_tripped() {
            return false;
        }

        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.failures.push_back((now, entity_id.clone()));
        recent.expire(now, self.settings.window);

        let distinct: HashSet<&EntityId> = recent.failures.iter().map(|(_, id)| id).collect();
        let share = recent.failure_share();
        if distinct.len() >= self.settings.distinct_entities
            && share >= self.settings.min_failure_share
            && !self.tripped.swap(true, Ordering::AcqRel)
        {
            warn!(
                "🛑 Circuit breaker tripped: {} distinct entities failed within {:?}, {:.0}% of outcomes (last: {})",
                distinct.len(),
                self.settings.window,
                share * 100.0,
                error
            );
            return true;
        }
        false
    }

    pub fn record_success(&self) {
        if self.is_tripped() {
            return;
        }
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.successes.push_back(now);
        recent.expire(now, self.settings.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(distinct: usize) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerSettings {
            window: Duration::from_secs(60),
            distinct_entities: distinct,
            min_failure_share: 0.5,
        })
    }

    fn hostile() -> FetchError {
        FetchError::Blocked("Access Denied".into())
    }

    #[tokio::test(start_paused = true)]
    async fn trips_on_distinct_entities_only() {
        let breaker = breaker(3);
        assert!(!breaker.record_failure(&EntityId::new("A"), &hostile()));
        assert!(!breaker.record_failure(&EntityId::new("A"), &hostile()));
        assert!(!breaker.record_failure(&EntityId::new("B"), &hostile()));
        assert!(!breaker.is_tripped());
        assert!(breaker.record_failure(&EntityId::new("C"), &hostile()));
        assert!(breaker.is_tripped());
        // already tripped: no second trip signal
        assert!(!breaker.record_failure(&EntityId::new("D"), &hostile()));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_never_count() {
        let breaker = breaker(2);
        breaker.record_failure(&EntityId::new("A"), &FetchError::NotFound);
        breaker.record_failure(&EntityId::new("B"), &FetchError::MalformedResponse("bad".into()));
        assert!(!breaker.is_tripped());
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_fall_out_of_the_window() {
        let breaker = breaker(2);
        breaker.record_failure(&EntityId::new("A"), &hostile());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!breaker.record_failure(&EntityId::new("B"), &hostile()));
        assert!(!breaker.is_tripped());
    }

    #[tokio::test(start_paused = true)]
    async fn interleaved_successes_do_not_mask_a_hostile_upstream() {
        let breaker = CircuitBreaker::new(CircuitBreakerSettings {
            window: Duration::from_secs(120),
            distinct_entities: 5,
            min_failure_share: 0.5,
        });
        for i in 0..20 {
            breaker.record_failure(&EntityId::new(format!("H{i}")), &hostile());
            breaker.record_success();
            tokio::time::advance(Duration::from_secs(1)).await;
        }
        assert!(breaker.is_tripped());
    }

    #[tokio::test(start_paused = true)]
    async fn sporadic_failures_in_a_healthy_run_do_not_trip() {
        let breaker = breaker(3);
        for i in 0..5 {
            for _ in 0..10 {
                breaker.record_success();
            }
            assert!(!breaker.record_failure(&EntityId::new(format!("S{i}")), &hostile()));
        }
        assert!(!breaker.is_tripped());
    }
}
