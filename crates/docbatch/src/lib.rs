//! docbatch: batch document extraction engine
//!
//! Accepts batches of uploaded files, extracts structured data from each file
//! through an [`providers::ExtractionService`], and tracks every file through
//! a small state machine. Batches run on background worker tasks when
//! available and fall back to same-thread processing otherwise. State is
//! mirrored to SQLite so unfinished batches survive a restart.

pub mod config;
pub mod engine;
pub mod error;
pub mod processing;
pub mod providers;
pub mod server;
pub mod storage;
pub mod types;

pub use config::EngineConfig;
pub use engine::BatchEngine;
pub use error::{Error, Result};
pub use types::{
    AddBatchResponse, Batch, BatchOptions, BatchStatus, EngineStatistics, FileItem, FileStatus,
    FileUpload, Notification, ProcessingMethod,
};
