//! Completion summaries and notification records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::batch::{Batch, BatchId, ProcessingMethod};

/// Outcome of a finished batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub processing_method: ProcessingMethod,
}

impl CompletionSummary {
    pub fn from_batch(batch: &Batch) -> Self {
        let started = batch.started_at.unwrap_or(batch.created_at);
        let finished = batch.completed_at.unwrap_or_else(Utc::now);
        let duration_ms = (finished - started).num_milliseconds().max(0) as u64;

        Self {
            total: batch.total_files,
            successful: batch.successful_files,
            failed: batch.failed_files,
            duration_ms,
            processing_method: batch.processing_method,
        }
    }
}

/// A completed file the auto-save sink rejected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveFailure {
    pub index: usize,
    pub name: String,
    pub error: String,
}

/// Result of the completion side effects for one batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionReport {
    pub batch_id: BatchId,
    pub summary: CompletionSummary,
    /// Files handed to the sink successfully during this completion
    pub saved_count: usize,
    pub save_errors: Vec<SaveFailure>,
}

/// User-facing completion notice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub batch_id: BatchId,
    pub document_type: String,
    pub report: CompletionReport,
    pub timestamp: DateTime<Utc>,
    /// False while the notice waits for the consumer to return to the foreground
    pub delivered: bool,
}

impl Notification {
    pub fn new(document_type: impl Into<String>, report: CompletionReport) -> Self {
        Self {
            batch_id: report.batch_id.clone(),
            document_type: document_type.into(),
            report,
            timestamp: Utc::now(),
            delivered: false,
        }
    }

    /// One-line human readable text
    pub fn message(&self) -> String {
        let summary = &self.report.summary;
        if summary.failed == 0 {
            format!(
                "Processed {} {} file(s) successfully",
                summary.total, self.document_type
            )
        } else {
            format!(
                "Processed {} {} file(s): {} succeeded, {} failed",
                summary.total, self.document_type, summary.successful, summary.failed
            )
        }
    }
}
