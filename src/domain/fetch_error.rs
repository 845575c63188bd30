//! Transport failures reported by the fetch capability and their classification

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failure is worth retrying within the same run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Timeouts, 5xx, throttling or blocking: retried with backoff
    Transient,
    /// Entity gone or response schema unusable: reported immediately
    Permanent,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Access blocked by upstream: {0}")]
    Blocked(String),

    #[error("Entity no longer exists upstream")]
    NotFound,

    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Fetch abandoned: {0}")]
    Cancelled(String),
}

impl FetchError {
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout(_)
            | Self::Network(_)
            | Self::Http { .. }
            | Self::RateLimited { .. }
            | Self::Blocked(_)
            | Self::Cancelled(_) => FailureKind::Transient,
            Self::NotFound | Self::Rejected { .. } | Self::MalformedResponse(_) => {
                FailureKind::Permanent
            }
        }
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), FailureKind::Transient)
    }

    /// Symptoms that count toward the run-wide circuit breaker
    pub const fn is_upstream_hostile(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Http { .. } | Self::RateLimited { .. } | Self::Blocked(_) | Self::Network(_)
        )
    }

    /// Map an HTTP status to an error; `None` for success codes
    pub fn from_status(status: u16, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        match status {
            200..=399 => None,
            404 | 410 => Some(Self::NotFound),
            429 => Some(Self::RateLimited { retry_after: None }),
            403 => Some(Self::Blocked(message)),
            500..=599 => Some(Self::Http { status, message }),
            _ => Some(Self::Rejected { status, message }),
        }
    }
}
