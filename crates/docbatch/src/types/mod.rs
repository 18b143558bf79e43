//! Core types for the batch engine

pub mod batch;
pub mod notification;
pub mod response;

pub use batch::{
    Batch, BatchId, BatchOptions, BatchStatus, FileItem, FileStatus, FileUpload, Priority,
    ProcessingMethod,
};
pub use notification::{CompletionReport, CompletionSummary, Notification, SaveFailure};
pub use response::{AddBatchResponse, ControlResponse, EngineStatistics};
