//! Local change detection and candidate ordering
//!
//! Decides from stored cadence and timestamps alone whether an entity is due.
//! No upstream request is made here; whether the upstream actually changed is
//! discovered by the fetch + reconcile step.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Entity, EntityId, EntityStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    NeedsFetch,
    UpToDate,
    /// Cooling down after failures; excluded from this run
    Backoff { until: DateTime<Utc> },
    /// Never scheduled until re-admitted
    Suspended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorPolicy {
    pub backoff_base_delay: Duration,
    pub backoff_cap: Duration,
    /// Each entity's refresh threshold is `interval * (1 - jitter_ratio * f(id))`, `f(id)` in `[0, 1)`
    pub jitter_ratio: f64,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        use crate::infrastructure::config::defaults;
        Self {
            backoff_base_delay: Duration::from_secs(defaults::BACKOFF_BASE_DELAY_SECS),
            backoff_cap: Duration::from_secs(defaults::BACKOFF_CAP_SECS),
            jitter_ratio: defaults::JITTER_RATIO,
        }
    }
}

/// Offset/limit applied to the ranked candidate list, for chunked processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionWindow {
    pub limit: Option<usize>,
    pub skip: usize,
}

impl SelectionWindow {
    pub const fn unbounded() -> Self {
        Self { limit: None, skip: 0 }
    }
}

/// Outcome of classifying the whole registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSelection {
    /// Ordered, deduplicated, windowed dispatch list
    pub candidates: Vec<EntityId>,
    /// NEEDS_FETCH entities before the window was applied
    pub ranked_total: usize,
    pub up_to_date: usize,
    pub backoff: usize,
    pub suspended: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    policy: DetectorPolicy,
}

impl ChangeDetector {
    pub const fn new(policy: DetectorPolicy) -> Self {
        Self { policy }
    }

    /// `Classify(entity, now)`
    pub fn classify(&self, entity: &Entity, now: DateTime<Utc>) -> Classification {
        if entity.status == EntityStatus::Suspended {
            return Classification::Suspended;
        }

        if entity.consecutive_failures > 0 {
            if let Some(last_attempt) = entity.last_attempt_at {
                let cool_down = self.backoff_delay(entity.consecutive_failures);
                let until = last_attempt + chrono_duration(cool_down);
                if now < until {
                    return Classification::Backoff { until };
                }
            }
        }

        match entity.last_sync_at {
            None => Classification::NeedsFetch,
            Some(last_sync) => {
                let elapsed = (now - last_sync).to_std().unwrap_or(Duration::ZERO);
                if elapsed > self.refresh_threshold(entity) {
                    Classification::NeedsFetch
                } else {
                    Classification::UpToDate
                }
            }
        }
    }

    /// `base_delay * 2^failures`, capped
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let factor = 2_u32.checked_pow(consecutive_failures).unwrap_or(u32::MAX);
        self.policy
            .backoff_base_delay
            .checked_mul(factor)
            .unwrap_or(self.policy.backoff_cap)
            .min(self.policy.backoff_cap)
    }

    /// Cadence interval shortened by a per-entity jitter that is stable across runs
    pub fn refresh_threshold(&self, entity: &Entity) -> Duration {
        let interval = entity.cadence_class.interval();
        let scale = 1.0 - self.policy.jitter_ratio * jitter_fraction(&entity.id);
        interval.mul_f64(scale.clamp(0.0, 1.0))
    }

    /// Classify every entity and return the ranked, windowed candidate set.
    ///
    /// Ranking: shorter cadence first, then stalest `last_sync_at` (never synced first).
    pub fn select_candidates(
        &self,
        entities: &[Entity],
        now: DateTime<Utc>,
        window: SelectionWindow,
    ) -> CandidateSelection {
        let mut selection = CandidateSelection::default();
        let mut seen: HashSet<&EntityId> = HashSet::with_capacity(entities.len());
        let mut due: Vec<&Entity> = Vec::new();

        for entity in entities {
            if !seen.insert(&entity.id) {
                continue;
            }
            match self.classify(entity, now) {
                Classification::NeedsFetch => due.push(entity),
                Classification::UpToDate => selection.up_to_date += 1,
                Classification::Backoff { .. } => selection.backoff += 1,
                Classification::Suspended => selection.suspended += 1,
            }
        }

        due.sort_by(|a, b| {
            a.cadence_class
                .priority_rank()
                .cmp(&b.cadence_class.priority_rank())
                .then_with(|| a.last_sync_at.cmp(&b.last_sync_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        selection.ranked_total = due.len();
        selection.candidates = due
            .into_iter()
            .skip(window.skip)
            .take(window.limit.unwrap_or(usize::MAX))
            .map(|entity| entity.id.clone())
            .collect();
        selection
    }
}

/// Deterministic fraction in `[0, 1)` derived from the entity id
fn jitter_fraction(id: &EntityId) -> f64 {
    let hash = blake3::hash(id.as_str().as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    // 53 significant bits keep the quotient strictly below 1.0
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1_u64 << 53) as f64
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
