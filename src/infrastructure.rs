//! Infrastructure layer: configuration, logging, storage and the HTTP fetcher

pub mod catalog_import;
pub mod config;
pub mod database_connection;
pub mod entity_registry;
pub mod http_fetcher;
pub mod logging;
pub mod summary_sinks;

// Re-export commonly used items
pub use config::{ConfigManager, SyncConfig};
pub use database_connection::DatabaseConnection;
pub use entity_registry::{EntityRegistry, StoreError};
pub use http_fetcher::HttpEntityFetcher;
