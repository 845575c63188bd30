//! Run lifecycle states and the per-run summary handed to reporting sinks

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityId;
use super::sync_attempt::AttemptOutcome;

/// Orchestrator state machine
///
/// `Collecting → Dispatching → Reconciling → Summarizing → Done`, with
/// `Aborted` reachable from any state on a fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Collecting,
    Dispatching,
    Reconciling,
    Summarizing,
    Done,
    Aborted,
}

impl RunState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Collecting => "COLLECTING",
            Self::Dispatching => "DISPATCHING",
            Self::Reconciling => "RECONCILING",
            Self::Summarizing => "SUMMARIZING",
            Self::Done => "DONE",
            Self::Aborted => "ABORTED",
        }
    }

    /// Whether `self → next` is a legal transition
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Done | Self::Aborted, _) => false,
            (_, Self::Aborted) => true,
            // an empty candidate set or an early stop skips straight to Summarizing
            (Self::Collecting, Self::Dispatching | Self::Summarizing)
            | (Self::Dispatching, Self::Reconciling | Self::Summarizing)
            | (Self::Reconciling, Self::Summarizing)
            | (Self::Summarizing, Self::Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunKind {
    /// Cadence-driven pass over the whole registry
    Scheduled,
    /// Maintenance pass re-attempting recently failed entities
    Retry,
}

impl RunKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Retry => "RETRY",
        }
    }
}

/// Aggregate outcome of one orchestrator pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: String,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub final_state: RunState,
    pub abort_reason: Option<String>,
    /// Size of the candidate set after limit/skip
    pub candidates: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed_by_kind: BTreeMap<AttemptOutcome, usize>,
    pub skipped_up_to_date: usize,
    pub skipped_backoff: usize,
    pub skipped_suspended: usize,
    /// Candidates never handed to a fetch worker (circuit break, cancellation, abort)
    pub not_dispatched: usize,
    pub data_points_written: usize,
    pub newly_suspended: BTreeSet<EntityId>,
    pub permanent_failures: BTreeSet<EntityId>,
    pub circuit_broken: bool,
    /// Stopped early by a stop signal or the run timeout
    #[serde(default)]
    pub cancelled: bool,
}

impl SyncRunSummary {
    pub fn new(run_id: impl Into<String>, kind: RunKind, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            kind,
            started_at,
            finished_at: None,
            duration_ms: 0,
            final_state: RunState::Collecting,
            abort_reason: None,
            candidates: 0,
            attempted: 0,
            succeeded: 0,
            failed_by_kind: BTreeMap::new(),
            skipped_up_to_date: 0,
            skipped_backoff: 0,
            skipped_suspended: 0,
            not_dispatched: 0,
            data_points_written: 0,
            newly_suspended: BTreeSet::new(),
            permanent_failures: BTreeSet::new(),
            circuit_broken: false,
            cancelled: false,
        }
    }

    pub fn record_success(&mut self, rows_written: usize) {
        self.attempted += 1;
        self.succeeded += 1;
        self.data_points_written += rows_written;
    }

    pub fn record_failure(&mut self, outcome: AttemptOutcome) {
        self.attempted += 1;
        *self.failed_by_kind.entry(outcome).or_default() += 1;
    }

    pub fn record_suspension(&mut self, entity_id: EntityId) {
        self.newly_suspended.insert(entity_id);
    }

    pub fn failed(&self) -> usize {
        self.failed_by_kind.values().sum()
    }

    pub fn failed_of(&self, outcome: AttemptOutcome) -> usize {
        self.failed_by_kind.get(&outcome).copied().unwrap_or(0)
    }

    pub fn is_aborted(&self) -> bool {
        self.final_state == RunState::Aborted
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.final_state = RunState::Aborted;
        self.abort_reason = Some(reason.into());
    }

    /// Stamp the finish time; the final state is left as already set
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        self.duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        let path = [
            RunState::Collecting,
            RunState::Dispatching,
            RunState::Reconciling,
            RunState::Summarizing,
            RunState::Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn aborted_is_reachable_from_every_live_state() {
        for state in [
            RunState::Collecting,
            RunState::Dispatching,
            RunState::Reconciling,
            RunState::Summarizing,
        ] {
            assert!(state.can_transition_to(RunState::Aborted));
        }
        assert!(!RunState::Done.can_transition_to(RunState::Aborted));
        assert!(!RunState::Reconciling.can_transition_to(RunState::Collecting));
    }

    #[test]
    fn summary_counts_and_serializes() {
        let started = Utc::now();
        let mut summary = SyncRunSummary::new("run-1", RunKind::Scheduled, started);
        summary.record_success(12);
        summary.record_failure(AttemptOutcome::FetchError);
        summary.record_failure(AttemptOutcome::FetchError);
        summary.record_failure(AttemptOutcome::StoreError);
        summary.record_suspension(EntityId::new("Y"));
        summary.finish(started + chrono::Duration::milliseconds(1500));

        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.failed(), 3);
        assert_eq!(summary.failed_of(AttemptOutcome::FetchError), 2);
        assert_eq!(summary.duration_ms, 1500);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["failed_by_kind"]["FETCH_ERROR"], 2);
        assert_eq!(json["newly_suspended"][0], "Y");
    }
}
