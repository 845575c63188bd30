//! Domain module - entities, audit records and collaborator contracts
//!
//! Pure data and traits; nothing here touches the database or the network.

pub mod capabilities;
pub mod data_point;
pub mod entity;
pub mod fetch_error;
pub mod summary;
pub mod sync_attempt;

// Re-export commonly used items for convenience
pub use capabilities::{EntityFetcher, FetchedEntity, SummarySink};
pub use data_point::{DataPoint, ObservationRow, RawPayload};
pub use entity::{CadenceClass, Entity, EntityId, EntityMetadata, EntityStatus};
pub use fetch_error::{FailureKind, FetchError};
pub use summary::{RunKind, RunState, SyncRunSummary};
pub use sync_attempt::{AttemptOutcome, NewAttempt, SyncAttempt};
