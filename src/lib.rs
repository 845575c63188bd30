//! series-sync - incremental time-series harvester
//!
//! Decides which series need fetching, fetches them concurrently against a
//! rate-limited upstream, and reconciles the results into SQLite without
//! partial writes.

pub mod application;
pub mod domain;
pub mod infrastructure;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
