//! Application layer - the sync engine
//!
//! Change detection, fetch coordination, reconciliation, failure tracking
//! and the run orchestrator that ties them together.

pub mod change_detector;
pub mod circuit_breaker;
pub mod failure_tracker;
pub mod fetch_coordinator;
pub mod monitoring;
pub mod orchestrator;
pub mod payload_parser;
pub mod reconciler;
pub mod validated_config;

// Re-export commonly used items
pub use change_detector::{ChangeDetector, Classification, SelectionWindow};
pub use failure_tracker::FailureTracker;
pub use fetch_coordinator::{FetchCoordinator, FetchResult};
pub use monitoring::Monitor;
pub use orchestrator::{SyncError, SyncRunOrchestrator};
pub use reconciler::Reconciler;
pub use validated_config::{ConfigError, ValidatedSyncConfig};
