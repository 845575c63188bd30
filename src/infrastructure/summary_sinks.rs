//! Destinations for finished run summaries

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::{info, warn};

use crate::domain::{SummarySink, SyncRunSummary};

/// Writes the summary to the log
pub struct LogSummarySink;

#[async_trait]
impl SummarySink for LogSummarySink {
    async fn publish(&self, summary: &SyncRunSummary) -> Result<()> {
        info!(
            run_id = %summary.run_id,
            "📋 {} run {} in {} ms: {} candidates, {} ok, {} failed, {} rows written",
            summary.kind.as_str(),
            summary.final_state,
            summary.duration_ms,
            summary.candidates,
            summary.succeeded,
            summary.failed(),
            summary.data_points_written
        );
        info!(
            "   skipped: {} up to date, {} in backoff, {} suspended, {} not dispatched",
            summary.skipped_up_to_date, summary.skipped_backoff, summary.skipped_suspended, summary.not_dispatched
        );
        for (outcome, count) in &summary.failed_by_kind {
            info!("   {}: {}", outcome, count);
        }
        if !summary.newly_suspended.is_empty() {
            warn!("⛔ Newly suspended: {:?}", summary.newly_suspended);
        }
        if summary.circuit_broken {
            warn!("🛑 Run stopped by the circuit breaker");
        }
        if let Some(reason) = &summary.abort_reason {
            warn!("❌ Aborted: {}", reason);
        }
        Ok(())
    }
}

/// Writes `summary-<run_id>.json` into a report directory
pub struct JsonFileSummarySink {
    dir: PathBuf,
}

impl JsonFileSummarySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("summary-{run_id}.json"))
    }
}

#[async_trait]
impl SummarySink for JsonFileSummarySink {
    async fn publish(&self, summary: &SyncRunSummary) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create report directory {:?}", self.dir))?;

        let path = self.path_for(&summary.run_id);
        let content = serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;
        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write run summary {:?}", path))?;

        info!("📝 Run summary written to {:?}", path);
        Ok(())
    }
}

/// Publishes to every inner sink; one failing sink does not stop the others
pub struct FanOutSummarySink {
    sinks: Vec<Arc<dyn SummarySink>>,
}

impl FanOutSummarySink {
    pub fn new(sinks: Vec<Arc<dyn SummarySink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl SummarySink for FanOutSummarySink {
    async fn publish(&self, summary: &SyncRunSummary) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(summary).await {
                warn!("Summary sink failed: {:#}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttemptOutcome, RunKind, RunState};
    use crate::test_utils::CollectingSink;
    use chrono::Utc;
    use tempfile::tempdir;

    fn finished_summary() -> SyncRunSummary {
        let mut summary = SyncRunSummary::new("run-42", RunKind::Scheduled, Utc::now());
        summary.candidates = 3;
        summary.record_success(10);
        summary.record_failure(AttemptOutcome::FetchError);
        summary.final_state = RunState::Done;
        summary.finish(Utc::now());
        summary
    }

    #[tokio::test]
    async fn json_sink_writes_readable_summary() -> Result<()> {
        let dir = tempdir()?;
        let sink = JsonFileSummarySink::new(dir.path().join("reports"));
        let summary = finished_summary();

        sink.publish(&summary).await?;

        let written = std::fs::read_to_string(sink.path_for("run-42"))?;
        let loaded: SyncRunSummary = serde_json::from_str(&written)?;
        assert_eq!(loaded, summary);
        Ok(())
    }

    struct FailingSink;

    #[async_trait]
    impl SummarySink for FailingSink {
        async fn publish(&self, _summary: &SyncRunSummary) -> Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_sink_and_reports_failure() {
        let collecting = Arc::new(CollectingSink::default());
        let sinks: Vec<Arc<dyn SummarySink>> = vec![Arc::new(FailingSink), Arc::new(LogSummarySink), collecting.clone()];
        let sink = FanOutSummarySink::new(sinks);

        let result = sink.publish(&finished_summary()).await;

        assert!(result.is_err());
        assert_eq!(collecting.summaries().len(), 1);
    }
}
