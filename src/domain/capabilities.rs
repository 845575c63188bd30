//! Collaborator contracts injected into the sync engine
//!
//! The engine owns no knowledge of how an entity is fetched or how a run
//! summary is rendered or delivered; both are supplied by the caller.

use async_trait::async_trait;

use super::data_point::RawPayload;
use super::entity::{EntityId, EntityMetadata};
use super::fetch_error::FetchError;
use super::summary::SyncRunSummary;

/// Successful output of one fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedEntity {
    pub payload: RawPayload,
    pub metadata: EntityMetadata,
}

impl FetchedEntity {
    pub fn new(payload: RawPayload) -> Self {
        Self {
            payload,
            metadata: EntityMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: EntityMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// `FetchEntity(id) -> (RawPayload, Metadata) | Error`
///
/// Implementations may be slow or blocked; the coordinator wraps every call
/// in a timeout and never assumes anything about the transport.
#[async_trait]
pub trait EntityFetcher: Send + Sync {
    async fn fetch(&self, entity_id: &EntityId) -> Result<FetchedEntity, FetchError>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "fetcher"
    }
}

/// Consumer of finished run summaries (reports, notifications)
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn publish(&self, summary: &SyncRunSummary) -> anyhow::Result<()>;
}
