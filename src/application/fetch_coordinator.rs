//! Bounded-concurrency fetch pool
//!
//! Candidates are dispatched in order onto a semaphore-bounded set of
//! workers. Each worker paces itself with a randomized delay, optionally
//! waits on a shared rate limiter, wraps every fetch in a timeout and retries
//! transient failures with exponential backoff. Results stream back as they
//! complete so the orchestrator can reconcile while the batch is still running.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::circuit_breaker::{CircuitBreaker, CircuitBreakerSettings};
use crate::domain::{EntityFetcher, EntityId, FetchError, FetchedEntity};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum fetches in flight at any instant
    pub concurrency: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub fetch_timeout: Duration,
    /// Retries after the first attempt, transient failures only
    pub transient_retry_limit: u32,
    pub retry_base_delay: Duration,
    pub max_requests_per_second: Option<NonZeroU32>,
    /// How long in-flight fetches may keep running after cancellation
    pub cancel_grace_period: Duration,
    pub circuit_breaker: CircuitBreakerSettings,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        use crate::infrastructure::config::defaults;
        Self {
            concurrency: defaults::CONCURRENCY,
            min_delay: Duration::from_secs_f64(defaults::MIN_DELAY_SECS),
            max_delay: Duration::from_secs_f64(defaults::MAX_DELAY_SECS),
            fetch_timeout: Duration::from_secs(defaults::FETCH_TIMEOUT_SECS),
            transient_retry_limit: defaults::TRANSIENT_RETRY_LIMIT,
            retry_base_delay: Duration::from_millis(defaults::RETRY_BASE_DELAY_MS),
            max_requests_per_second: None,
            cancel_grace_period: Duration::from_secs(defaults::CANCEL_GRACE_SECS),
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }
}

/// Outcome of fetching one entity, after retries
#[derive(Debug)]
pub struct FetchResult {
    pub entity_id: EntityId,
    /// Fetch calls made, including retries
    pub attempts: u32,
    pub outcome: Result<FetchedEntity, FetchError>,
}

/// Live counters, readable while a batch runs
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    invocations: AtomicUsize,
    dispatched: AtomicUsize,
    abandoned: AtomicUsize,
}

impl CoordinatorStats {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.invocations.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous fetch calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Total fetch calls, including retries
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Workers cancelled before their first fetch call
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

/// Final dispatch accounting once every worker has finished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    /// Candidates that never reached the fetch capability
    pub not_dispatched: usize,
    pub circuit_broken: bool,
}

/// Handle to a running batch
pub struct FetchRun {
    results: ReceiverStream<FetchResult>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<CoordinatorStats>,
    dispatcher: JoinHandle<DispatchReport>,
}

impl FetchRun {
    /// Next completed fetch; `None` once every dispatched worker has reported
    pub async fn next_result(&mut self) -> Option<FetchResult> {
        self.results.next().await
    }

    pub fn stats(&self) -> Arc<CoordinatorStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for the dispatcher and return its accounting
    pub async fn finish(self) -> DispatchReport {
        drop(self.results);
        match self.dispatcher.await {
            Ok(report) => report,
            Err(e) => {
                warn!("⚠️ Fetch dispatcher task failed: {}", e);
                DispatchReport {
                    dispatched: self.stats.dispatched(),
                    not_dispatched: 0,
                    circuit_broken: self.breaker.is_tripped(),
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct FetchCoordinator {
    config: CoordinatorConfig,
    rate_limiter: Option<Arc<DirectRateLimiter>>,
}

impl FetchCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let rate_limiter = config
            .max_requests_per_second
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));
        Self {
            config,
            rate_limiter,
        }
    }

    /// `Dispatch(candidates) -> stream of FetchResult`
    ///
    /// The candidate list must already be deduplicated; each id is fetched by
    /// exactly one worker.
    pub fn dispatch(
        &self,
        candidates: Vec<EntityId>,
        fetcher: Arc<dyn EntityFetcher>,
        cancel: CancellationToken,
    ) -> FetchRun {
        let concurrency = self.config.concurrency.max(1);
        let (tx, rx) = mpsc::channel(concurrency * 2);
        let breaker = Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone()));
        let stats = Arc::new(CoordinatorStats::default());

        let dispatcher = tokio::spawn(dispatch_loop(
            candidates,
            Arc::new(Worker {
                config: self.config.clone(),
                rate_limiter: self.rate_limiter.clone(),
                fetcher,
                breaker: Arc::clone(&breaker),
                stats: Arc::clone(&stats),
                cancel,
            }),
            Arc::new(Semaphore::new(concurrency)),
            tx,
        ));

        FetchRun {
            results: ReceiverStream::new(rx),
            breaker,
            stats,
            dispatcher,
        }
    }
}

async fn dispatch_loop(
    candidates: Vec<EntityId>,
    worker: Arc<Worker>,
    semaphore: Arc<Semaphore>,
    tx: mpsc::Sender<FetchResult>,
) -> DispatchReport {
    let total = candidates.len();
    let mut workers = JoinSet::new();
    let mut dispatched = 0;

    info!(
        "🚀 Dispatching {} candidates via {} (concurrency {})",
        total,
        worker.fetcher.name(),
        worker.config.concurrency
    );

    for entity_id in candidates {
        if worker.breaker.is_tripped() || worker.cancel.is_cancelled() {
            break;
        }

        let permit = tokio::select! {
            biased;
            () = worker.cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // the breaker may have tripped while this slot was awaited
        if worker.breaker.is_tripped() {
            break;
        }

        dispatched += 1;
        worker.stats.dispatched.fetch_add(1, Ordering::SeqCst);
        workers.spawn(Arc::clone(&worker).run(entity_id, permit, tx.clone()));
    }
    drop(tx);

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            warn!("⚠️ Fetch worker panicked: {}", e);
        }
    }

    let abandoned = worker.stats.abandoned();
    let report = DispatchReport {
        dispatched: dispatched - abandoned,
        not_dispatched: total - dispatched + abandoned,
        circuit_broken: worker.breaker.is_tripped(),
    };
    info!(
        "✅ Dispatch finished: {} fetched, {} not dispatched{}",
        report.dispatched,
        report.not_dispatched,
        if report.circuit_broken { " (circuit broken)" } else { "" }
    );
    report
}

struct Worker {
    config: CoordinatorConfig,
    rate_limiter: Option<Arc<DirectRateLimiter>>,
    fetcher: Arc<dyn EntityFetcher>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<CoordinatorStats>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(
        self: Arc<Self>,
        entity_id: EntityId,
        permit: OwnedSemaphorePermit,
        tx: mpsc::Sender<FetchResult>,
    ) {
        if !self.pace().await {
            debug!("Abandoning {} before first fetch: cancelled", entity_id);
            self.stats.abandoned.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let (attempts, outcome) = self.fetch_with_retry(&entity_id).await;
        match &outcome {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                self.breaker.record_failure(&entity_id, e);
            }
        }
        drop(permit);

        if tx
            .send(FetchResult {
                entity_id,
                attempts,
                outcome,
            })
            .await
            .is_err()
        {
            debug!("Result receiver dropped; discarding fetch result");
        }
    }

    /// Randomized pre-request delay plus rate limiting. `false` if cancelled meanwhile.
    async fn pace(&self) -> bool {
        let delay = random_delay(self.config.min_delay, self.config.max_delay);
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            () = sleep(delay) => {}
        }

        if let Some(limiter) = &self.rate_limiter {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = limiter.until_ready() => {}
            }
        }
        true
    }

    async fn fetch_with_retry(&self, entity_id: &EntityId) -> (u32, Result<FetchedEntity, FetchError>) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = self.fetch_once(entity_id).await;

            let error = match result {
                Ok(fetched) => {
                    if attempt > 1 {
                        info!("Fetched {} on attempt {}", entity_id, attempt);
                    }
                    return (attempt, Ok(fetched));
                }
                Err(e) => e,
            };

            let retries_left = attempt <= self.config.transient_retry_limit;
            if !error.is_transient()
                || !retries_left
                || self.cancel.is_cancelled()
                || self.breaker.is_tripped()
            {
                return (attempt, Err(error));
            }

            let mut delay = self
                .config
                .retry_base_delay
                .saturating_mul(2_u32.saturating_pow(attempt - 1));
            if let FetchError::RateLimited {
                retry_after: Some(retry_after),
            } = &error
            {
                delay = delay.max((*retry_after).min(self.retry_after_cap()));
            }
            warn!(
                "Failed to fetch {} (attempt {}), retrying in {:?}: {}",
                entity_id, attempt, delay, error
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return (attempt, Err(error)),
                () = sleep(delay) => {}
            }
        }
    }

    /// Longest upstream `Retry-After` honoured while holding a slot
    fn retry_after_cap(&self) -> Duration {
        self.config.fetch_timeout.saturating_mul(2)
    }

    /// One timed fetch call. After cancellation the call gets the grace period to finish.
    async fn fetch_once(&self, entity_id: &EntityId) -> Result<FetchedEntity, FetchError> {
        self.stats.enter();
        let call = timeout(self.config.fetch_timeout, self.fetcher.fetch(entity_id));
        tokio::pin!(call);

        let timed = tokio::select! {
            result = &mut call => Some(result),
            () = self.cancel.cancelled() => None,
        };
        let timed = match timed {
            Some(result) => Some(result),
            None => timeout(self.config.cancel_grace_period, &mut call).await.ok(),
        };
        self.stats.leave();

        match timed {
            Some(Ok(result)) => result,
            Some(Err(_elapsed)) => Err(FetchError::Timeout(self.config.fetch_timeout)),
            None => Err(FetchError::Cancelled(format!(
                "still in flight {:?} after stop signal",
                self.config.cancel_grace_period
            ))),
        }
    }
}

fn random_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    min + (max - min).mul_f64(fastrand::f64())
}
