//! Worker orchestration: strategy selection, demotion, cancellation
//!
//! Each batch has at most one driver at a time. A run request for a batch
//! that is already being driven is merged into the active run, which picks
//! the extra indices up when its current pass ends.
//!
//! The worker strategy spawns a [`BackgroundWorker`] per run and applies its
//! events to the store. If the worker crashes, closes its channel, reports an
//! error or goes silent past the event timeout, the run is demoted: in-flight
//! files return to queued and the same-thread fallback finishes the batch.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{FallbackConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::providers::{ExtractionService, FileBlob};
use crate::types::{Batch, BatchId, BatchStatus, FileStatus, ProcessingMethod};

use super::batch_store::BatchStore;
use super::codec::{encode_file, EncodedFile};
use super::completion::CompletionManager;
use super::worker::{BackgroundWorker, WorkerCommand, WorkerEvent};

/// Ack wait used when the event timeout is disabled
const DEFAULT_CANCEL_ACK: Duration = Duration::from_secs(30);

/// Handle to a running background worker
struct ActiveWorker {
    commands: mpsc::Sender<WorkerCommand>,
    cancel_ack: Mutex<Option<oneshot::Sender<()>>>,
}

/// How a worker run ended
#[derive(Debug)]
enum WorkerOutcome {
    Finished,
    Cancelled,
    Failed(String),
}

pub struct WorkerOrchestrator {
    store: Arc<BatchStore>,
    completion: Arc<CompletionManager>,
    extractor: Arc<dyn ExtractionService>,
    worker_config: WorkerConfig,
    fallback_config: FallbackConfig,
    slots: Arc<Semaphore>,
    active: DashMap<BatchId, ActiveWorker>,
    /// Batches with a driver, plus indices queued for its next pass
    runs: DashMap<BatchId, Vec<usize>>,
}

impl WorkerOrchestrator {
    pub fn new(
        store: Arc<BatchStore>,
        completion: Arc<CompletionManager>,
        extractor: Arc<dyn ExtractionService>,
        worker_config: WorkerConfig,
        fallback_config: FallbackConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(worker_config.max_workers.max(1)));
        tracing::info!(
            "Orchestrator configured: background workers {}, {} slot(s), extractor {}",
            if worker_config.enabled { "enabled" } else { "disabled" },
            worker_config.max_workers,
            extractor.name()
        );

        Self {
            store,
            completion,
            extractor,
            worker_config,
            fallback_config,
            slots,
            active: DashMap::new(),
            runs: DashMap::new(),
        }
    }

    /// Whether the environment offers background execution
    pub fn background_supported(&self) -> bool {
        self.worker_config.enabled
    }

    /// Strategy a batch with these options will start with
    pub fn method_for(&self, prefer_background_worker: bool) -> ProcessingMethod {
        if self.background_supported() && prefer_background_worker {
            ProcessingMethod::Worker
        } else {
            ProcessingMethod::SameThread
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active.len()
    }

    /// Drive the given files of a batch to a settled state. Returns once the
    /// batch has no more work or has been cancelled.
    pub async fn run_batch(&self, batch_id: &str, indices: Vec<usize>) {
        match self.runs.entry(batch_id.to_string()) {
            Entry::Occupied(mut pending) => {
                tracing::debug!("Batch {} already running, merging {} file(s)", batch_id, indices.len());
                pending.get_mut().extend(indices);
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(Vec::new());
            }
        }

        let mut indices = indices;
        loop {
            self.run_pass(batch_id, &indices).await;

            match self.runs.entry(batch_id.to_string()) {
                Entry::Occupied(mut pending) if !pending.get().is_empty() => {
                    indices = std::mem::take(pending.get_mut());
                }
                Entry::Occupied(done) => {
                    done.remove();
                    break;
                }
                Entry::Vacant(_) => break,
            }
        }
    }

    async fn run_pass(&self, batch_id: &str, indices: &[usize]) {
        let Some(batch) = self.store.get(batch_id) else {
            tracing::warn!("Batch {} disappeared before it could run", batch_id);
            return;
        };
        if batch.status == BatchStatus::Cancelled {
            return;
        }

        let method = self.method_for(batch.options.prefer_background_worker);
        if let Err(e) = self.store.mutate(batch_id, |b| b.mark_started(method)) {
            tracing::warn!("Cannot start batch {}: {}", batch_id, e);
            return;
        }

        match method {
            ProcessingMethod::Worker => match self.run_with_worker(&batch, indices).await {
                WorkerOutcome::Finished | WorkerOutcome::Cancelled => {}
                WorkerOutcome::Failed(detail) => {
                    tracing::warn!(
                        "Worker for batch {} failed ({}), continuing on the same thread",
                        batch_id,
                        detail
                    );
                    let demoted = self.store.mutate(batch_id, |b| {
                        b.processing_method = ProcessingMethod::SameThread;
                        b.requeue_in_flight(Some(indices))
                    });
                    match demoted {
                        Ok(requeued) => {
                            if requeued > 0 {
                                tracing::info!("Re-queued {} in-flight file(s) of batch {}", requeued, batch_id);
                            }
                            self.run_fallback(batch_id, indices).await;
                        }
                        Err(e) => tracing::warn!("Cannot demote batch {}: {}", batch_id, e),
                    }
                }
            },
            ProcessingMethod::SameThread => self.run_fallback(batch_id, indices).await,
        }

        // covers empty runs and batches restored with every file settled
        self.settle(batch_id).await;
    }

    // ==================== Worker strategy ====================

    async fn run_with_worker(&self, batch: &Batch, indices: &[usize]) -> WorkerOutcome {
        let batch_id = batch.id.as_str();
        let _permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return WorkerOutcome::Failed("worker pool closed".to_string()),
        };

        let files = self.encode_files(batch_id, indices).await;
        if files.is_empty() {
            return WorkerOutcome::Finished;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (evt_tx, mut evt_rx) = mpsc::channel(self.worker_config.channel_capacity.max(1));
        let mut task = BackgroundWorker::new(self.extractor.clone()).spawn(cmd_rx, evt_tx);

        self.active.insert(
            batch_id.to_string(),
            ActiveWorker {
                commands: cmd_tx.clone(),
                cancel_ack: Mutex::new(None),
            },
        );
        tracing::info!("Spawned worker for batch {} ({} files)", batch_id, files.len());

        let start = WorkerCommand::StartBatch {
            batch_id: batch_id.to_string(),
            document_type: batch.document_type.clone(),
            files,
            options: batch.options.clone(),
        };
        let outcome = match cmd_tx.send(start).await {
            Ok(()) => self.consume_events(batch_id, &mut evt_rx, &mut task).await,
            Err(_) => WorkerOutcome::Failed("worker stopped before accepting the batch".to_string()),
        };

        task.abort();
        self.active.remove(batch_id);
        tracing::debug!("Worker for batch {} terminated: {:?}", batch_id, outcome);
        outcome
    }

    /// Encode every queued file of the run; a file that cannot be encoded
    /// fails on its own.
    async fn encode_files(&self, batch_id: &str, indices: &[usize]) -> Vec<EncodedFile> {
        let Some(batch) = self.store.get(batch_id) else {
            return Vec::new();
        };

        let mut encoded = Vec::with_capacity(indices.len());
        for &index in indices {
            let Some(file) = batch.files.get(index) else {
                continue;
            };
            if file.status != FileStatus::Queued {
                continue;
            }

            let result = match self.store.payload(batch_id, index) {
                Some(data) => encode_file(file, &data, self.worker_config.max_transfer_bytes),
                None => Err(content_unavailable(&file.name)),
            };
            match result {
                Ok(file) => encoded.push(file),
                Err(e) => {
                    tracing::warn!("Not sending {} to worker: {}", file.name, e);
                    self.fail_unstarted(batch_id, index, e.to_string()).await;
                }
            }
        }
        encoded
    }

    async fn fail_unstarted(&self, batch_id: &str, index: usize, error: String) {
        let result = self.store.try_mutate(batch_id, |b| {
            b.begin_file(index)?;
            b.fail_file(index, error)
        });
        if let Err(e) = result {
            tracing::debug!("Could not fail file {} of batch {}: {}", index, batch_id, e);
        }
        self.settle(batch_id).await;
    }

    async fn consume_events(
        &self,
        batch_id: &str,
        events: &mut mpsc::Receiver<WorkerEvent>,
        task: &mut JoinHandle<()>,
    ) -> WorkerOutcome {
        loop {
            let next = match self.worker_config.event_timeout() {
                Some(limit) => match timeout(limit, events.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        return WorkerOutcome::Failed(format!(
                            "no worker event within {}s",
                            limit.as_secs()
                        ))
                    }
                },
                None => events.recv().await,
            };

            let Some(event) = next else {
                return WorkerOutcome::Failed(exit_detail(task).await);
            };

            match event {
                WorkerEvent::Ready => tracing::debug!("Worker for batch {} ready", batch_id),
                WorkerEvent::Started { .. } => tracing::debug!("Worker started batch {}", batch_id),
                WorkerEvent::FileProcessing { index, progress } => {
                    self.apply(batch_id, |b| b.set_file_progress(index, progress));
                }
                WorkerEvent::FileCompleted { index, result } => {
                    self.apply(batch_id, |b| b.complete_file(index, result));
                    self.settle(batch_id).await;
                }
                WorkerEvent::FileFailed { index, error } => {
                    self.apply(batch_id, |b| b.fail_file(index, error));
                    self.settle(batch_id).await;
                }
                WorkerEvent::Completed => return WorkerOutcome::Finished,
                WorkerEvent::Cancelled => {
                    self.cancel_locally(batch_id);
                    if let Some(worker) = self.active.get(batch_id) {
                        if let Some(ack) = worker.cancel_ack.lock().take() {
                            let _ = ack.send(());
                        }
                    }
                    return WorkerOutcome::Cancelled;
                }
                WorkerEvent::Error { detail } => return WorkerOutcome::Failed(detail),
            }
        }
    }

    // ==================== Same-thread fallback ====================

    async fn run_fallback(&self, batch_id: &str, indices: &[usize]) {
        for &index in indices {
            let Some(batch) = self.store.get(batch_id) else {
                return;
            };
            if batch.status == BatchStatus::Cancelled {
                tracing::info!("Batch {} cancelled, stopping fallback run", batch_id);
                return;
            }
            let Some(file) = batch.files.get(index) else {
                continue;
            };
            if file.status != FileStatus::Queued {
                continue;
            }
            if let Err(e) = self.store.try_mutate(batch_id, |b| b.begin_file(index)) {
                tracing::debug!("Skipping file {} of batch {}: {}", index, batch_id, e);
                continue;
            }

            let outcome = match self.store.payload(batch_id, index) {
                Some(data) => {
                    let blob = FileBlob {
                        name: file.name.clone(),
                        mime_type: file.mime_type.clone(),
                        data,
                    };
                    let extraction = AssertUnwindSafe(self.extractor.extract(&blob, &batch.document_type))
                        .catch_unwind()
                        .await;
                    match extraction {
                        Ok(result) => result.into_outcome(),
                        Err(panic) => Err(format!("extraction panicked: {}", panic_message(&*panic))),
                    }
                }
                None => Err(content_unavailable(&file.name).to_string()),
            };

            match outcome {
                Ok(result) => self.apply(batch_id, |b| b.complete_file(index, result)),
                Err(error) => {
                    tracing::warn!("File {} of batch {} failed: {}", file.name, batch_id, error);
                    self.apply(batch_id, |b| b.fail_file(index, error));
                }
            }
            self.settle(batch_id).await;

            tokio::task::yield_now().await;
            if self.fallback_config.yield_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.fallback_config.yield_ms)).await;
            }
        }
    }

    // ==================== Cancellation ====================

    /// Cancel a batch. Terminal batches are returned unchanged.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<Batch> {
        let batch = self
            .store
            .get(batch_id)
            .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;
        if batch.is_terminal() {
            return Ok(batch);
        }

        let ack = self.request_worker_cancel(batch_id).await;
        if let Some(ack) = ack {
            let wait = self.worker_config.event_timeout().unwrap_or(DEFAULT_CANCEL_ACK);
            match timeout(wait, ack).await {
                Ok(Ok(())) => tracing::debug!("Worker acknowledged cancel of batch {}", batch_id),
                _ => tracing::warn!("No cancel acknowledgement for batch {}, cancelling locally", batch_id),
            }
        }

        self.cancel_locally(batch_id);
        self.completion.schedule_removal(batch_id);
        self.store
            .get(batch_id)
            .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))
    }

    async fn request_worker_cancel(&self, batch_id: &str) -> Option<oneshot::Receiver<()>> {
        let (commands, rx) = {
            let worker = self.active.get(batch_id)?;
            let (tx, rx) = oneshot::channel();
            *worker.cancel_ack.lock() = Some(tx);
            (worker.commands.clone(), rx)
        };

        let command = WorkerCommand::CancelBatch {
            batch_id: batch_id.to_string(),
        };
        match commands.send(command).await {
            Ok(()) => Some(rx),
            Err(_) => None,
        }
    }

    fn cancel_locally(&self, batch_id: &str) {
        match self.store.mutate(batch_id, |b| b.cancel_pending()) {
            Ok(0) => {}
            Ok(count) => tracing::info!("Cancelled {} file(s) of batch {}", count, batch_id),
            Err(e) => tracing::debug!("Cancel of batch {} skipped: {}", batch_id, e),
        }
    }

    // ==================== Helpers ====================

    /// Apply a worker or fallback result. Rejected transitions (late events
    /// for cancelled files, duplicates) are logged and dropped.
    fn apply(&self, batch_id: &str, f: impl FnOnce(&mut Batch) -> Result<()>) {
        match self.store.try_mutate(batch_id, f) {
            Ok(()) => {}
            Err(e @ Error::Transition { .. }) => {
                tracing::debug!("Ignored event for batch {}: {}", batch_id, e)
            }
            Err(e) => tracing::warn!("Failed to update batch {}: {}", batch_id, e),
        }
    }

    async fn settle(&self, batch_id: &str) {
        if let Err(e) = self.completion.on_file_settled(batch_id).await {
            tracing::warn!("Completion check for batch {} failed: {}", batch_id, e);
        }
    }
}

fn content_unavailable(name: &str) -> Error {
    Error::encoding(name, "content unavailable; re-attach the file and retry")
}

/// Describe why a worker task ended without finishing its batch
async fn exit_detail(task: &mut JoinHandle<()>) -> String {
    match task.await {
        Ok(()) => "worker exited before completing the batch".to_string(),
        Err(e) if e.is_panic() => format!("worker panicked: {}", panic_message(&*e.into_panic())),
        Err(e) => format!("worker task failed: {}", e),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
