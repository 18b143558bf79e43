//! Batch and file records
//!
//! A [`Batch`] owns its [`FileItem`]s; the file order is fixed at submission
//! and the index is used to address files across execution contexts.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque batch identifier
pub type BatchId = String;

/// Batch lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// `completed` and `cancelled` are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution strategy used for a batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMethod {
    /// Background worker task with message protocol
    Worker,
    /// Sequential processing on the calling context
    SameThread,
}

impl ProcessingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::SameThread => "same_thread",
        }
    }
}

impl fmt::Display for ProcessingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-file status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed or failed: counted in `processed_files`
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling hint carried with the batch
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Batch options supplied at submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchOptions {
    pub priority: Priority,
    /// Hand successful results to the auto-save sink on completion
    pub auto_save: bool,
    /// Produce a notification record on completion
    pub notify_when_complete: bool,
    /// Use a background worker when one is available
    pub prefer_background_worker: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            auto_save: false,
            notify_when_complete: true,
            prefer_background_worker: true,
        }
    }
}

/// A file as submitted by the caller, content included
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl FileUpload {
    /// Create an upload, guessing the MIME type from the file name
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let mime_type = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            name,
            mime_type,
            data: data.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }
}

/// One file's processing record within a batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileItem {
    pub id: String,
    pub index: usize,
    pub name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub status: FileStatus,
    /// Incremented on every queued -> processing transition
    pub attempts: u32,
    /// 0-100, non-decreasing within one attempt
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Result already handed to the auto-save sink
    #[serde(default)]
    pub saved: bool,
}

impl FileItem {
    pub fn new(batch_id: &str, index: usize, upload: &FileUpload) -> Self {
        Self {
            id: format!("{}-{}", batch_id, index),
            index,
            name: upload.name.clone(),
            size_bytes: upload.data.len() as u64,
            mime_type: upload.mime_type.clone(),
            status: FileStatus::Queued,
            attempts: 0,
            progress: 0,
            result: None,
            error: None,
            saved: false,
        }
    }
}

/// A submitted group of files processed under one id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub document_type: String,
    pub status: BatchStatus,
    pub processing_method: ProcessingMethod,
    pub total_files: usize,
    pub processed_files: usize,
    pub successful_files: usize,
    pub failed_files: usize,
    pub files: Vec<FileItem>,
    pub options: BatchOptions,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Bumped on every mutation; orders durable snapshots
    #[serde(default)]
    pub revision: u64,
}

impl Batch {
    pub fn new(
        id: BatchId,
        files: &[FileUpload],
        document_type: impl Into<String>,
        options: BatchOptions,
        processing_method: ProcessingMethod,
    ) -> Self {
        let items: Vec<FileItem> = files
            .iter()
            .enumerate()
            .map(|(index, upload)| FileItem::new(&id, index, upload))
            .collect();

        Self {
            id,
            document_type: document_type.into(),
            status: BatchStatus::Queued,
            processing_method,
            total_files: items.len(),
            processed_files: 0,
            successful_files: 0,
            failed_files: 0,
            files: items,
            options,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Indices of files currently in `status`, in index order
    pub fn indices_with_status(&self, status: FileStatus) -> Vec<usize> {
        self.files
            .iter()
            .filter(|f| f.status == status)
            .map(|f| f.index)
            .collect()
    }

    pub fn count_with_status(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }

    pub fn percent_complete(&self) -> f32 {
        if self.total_files == 0 {
            return 0.0;
        }
        self.processed_files as f32 / self.total_files as f32 * 100.0
    }

    /// Moment the batch reached its terminal state, if it has
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            BatchStatus::Completed => self.completed_at,
            BatchStatus::Cancelled => self.cancelled_at,
            _ => None,
        }
    }
}
