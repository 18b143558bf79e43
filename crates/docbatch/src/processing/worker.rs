//! Background worker and its message protocol
//!
//! A worker is a tokio task that owns one batch run. The orchestrator talks
//! to it only through [`WorkerCommand`]s and receives [`WorkerEvent`]s back;
//! file content crosses the boundary as [`EncodedFile`]s. Cancellation is
//! cooperative and checked between files, so a file already being extracted
//! finishes first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::providers::{ExtractionService, FileBlob};
use crate::types::{BatchId, BatchOptions};

use super::codec::{decode_file, EncodedFile};

/// Orchestrator -> worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    StartBatch {
        batch_id: BatchId,
        document_type: String,
        files: Vec<EncodedFile>,
        options: BatchOptions,
    },
    CancelBatch {
        batch_id: BatchId,
    },
}

/// Worker -> orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready,
    Started { batch_id: BatchId },
    FileProcessing { index: usize, progress: u8 },
    FileCompleted { index: usize, result: Value },
    FileFailed { index: usize, error: String },
    Completed,
    Cancelled,
    Error { detail: String },
}

/// Progress reported once a file's content has been decoded
const DECODED_PROGRESS: u8 = 10;

/// Worker task body
pub struct BackgroundWorker {
    extractor: Arc<dyn ExtractionService>,
}

impl BackgroundWorker {
    pub fn new(extractor: Arc<dyn ExtractionService>) -> Self {
        Self { extractor }
    }

    /// Spawn the worker task. It exits after one batch, on cancellation, or
    /// when either channel is closed.
    pub fn spawn(
        self,
        commands: mpsc::Receiver<WorkerCommand>,
        events: mpsc::Sender<WorkerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(commands, events))
    }

    async fn run(self, mut commands: mpsc::Receiver<WorkerCommand>, events: mpsc::Sender<WorkerEvent>) {
        if events.send(WorkerEvent::Ready).await.is_err() {
            return;
        }

        let Some(command) = commands.recv().await else {
            return;
        };

        match command {
            WorkerCommand::StartBatch {
                batch_id,
                document_type,
                files,
                ..
            } => {
                self.process_batch(batch_id, document_type, files, &mut commands, &events)
                    .await;
            }
            WorkerCommand::CancelBatch { .. } => {
                let _ = events.send(WorkerEvent::Cancelled).await;
            }
        }
    }

    async fn process_batch(
        &self,
        batch_id: BatchId,
        document_type: String,
        files: Vec<EncodedFile>,
        commands: &mut mpsc::Receiver<WorkerCommand>,
        events: &mpsc::Sender<WorkerEvent>,
    ) {
        tracing::debug!("Worker starting batch {} ({} files)", batch_id, files.len());
        if events.send(WorkerEvent::Started { batch_id: batch_id.clone() }).await.is_err() {
            return;
        }

        for file in files {
            match commands.try_recv() {
                Ok(WorkerCommand::CancelBatch { .. }) => {
                    tracing::debug!("Worker cancelling batch {}", batch_id);
                    let _ = events.send(WorkerEvent::Cancelled).await;
                    return;
                }
                Ok(WorkerCommand::StartBatch { batch_id: other, .. }) => {
                    let detail = format!("worker busy with batch {}, rejected start of {}", batch_id, other);
                    let _ = events.send(WorkerEvent::Error { detail }).await;
                    return;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            }

            let index = file.index;
            if events.send(WorkerEvent::FileProcessing { index, progress: 0 }).await.is_err() {
                return;
            }

            let data = match decode_file(&file) {
                Ok(data) => data,
                Err(e) => {
                    if events.send(WorkerEvent::FileFailed { index, error: e.to_string() }).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            let progress = WorkerEvent::FileProcessing { index, progress: DECODED_PROGRESS };
            if events.send(progress).await.is_err() {
                return;
            }

            let blob = FileBlob {
                name: file.name,
                mime_type: file.mime_type,
                data,
            };
            let event = match self.extractor.extract(&blob, &document_type).await.into_outcome() {
                Ok(result) => WorkerEvent::FileCompleted { index, result },
                Err(error) => WorkerEvent::FileFailed { index, error },
            };
            if events.send(event).await.is_err() {
                return;
            }
        }

        let _ = events.send(WorkerEvent::Completed).await;
    }
}
