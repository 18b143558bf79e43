//! Response types for the control and observer APIs

use serde::{Deserialize, Serialize};

use super::batch::{BatchId, ProcessingMethod};

/// Returned by `add_batch`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AddBatchResponse {
    pub batch_id: BatchId,
    pub total_files: usize,
    /// Placeholder heuristic, not a measurement
    pub estimated_seconds: u64,
    pub processing_method: ProcessingMethod,
}

/// Aggregate counters across all resident batches
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineStatistics {
    pub total_batches: usize,
    pub active_batches: usize,
    pub active_workers: usize,
    pub total_files: usize,
    pub processed_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
    pub background_execution_supported: bool,
}

/// Returned by `cancel_batch` and `retry_failed_files`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    pub batch_id: BatchId,
    /// Files affected by the operation
    pub files: usize,
    pub message: String,
}
