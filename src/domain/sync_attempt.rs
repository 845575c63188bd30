//! Append-only audit trail of fetch/reconcile attempts

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Success,
    FetchError,
    ParseError,
    StoreError,
}

impl AttemptOutcome {
    pub const fn is_failure(self) -> bool {
        !matches!(self, Self::Success)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::FetchError => "FETCH_ERROR",
            Self::ParseError => "PARSE_ERROR",
            Self::StoreError => "STORE_ERROR",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FETCH_ERROR" => Ok(Self::FetchError),
            "PARSE_ERROR" => Ok(Self::ParseError),
            "STORE_ERROR" => Ok(Self::StoreError),
            other => Err(format!("unknown attempt outcome: {other}")),
        }
    }
}

/// A recorded attempt. Rows are never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub id: i64,
    pub run_id: Option<String>,
    pub entity_id: EntityId,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub detail: String,
    pub payload_hash: Option<String>,
}

/// An attempt about to be appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    pub run_id: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub detail: String,
    pub payload_hash: Option<String>,
}

impl NewAttempt {
    pub fn failure(outcome: AttemptOutcome, detail: impl Into<String>) -> Self {
        Self {
            run_id: None,
            attempted_at: Utc::now(),
            outcome,
            detail: detail.into(),
            payload_hash: None,
        }
    }

    pub fn success(detail: impl Into<String>, payload_hash: impl Into<String>) -> Self {
        Self {
            run_id: None,
            attempted_at: Utc::now(),
            outcome: AttemptOutcome::Success,
            detail: detail.into(),
            payload_hash: Some(payload_hash.into()),
        }
    }

    pub fn in_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub const fn at(mut self, attempted_at: DateTime<Utc>) -> Self {
        self.attempted_at = attempted_at;
        self
    }
}
