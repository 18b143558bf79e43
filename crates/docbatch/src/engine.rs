//! Batch engine facade: control and observer APIs
//!
//! [`BatchEngine`] wires the store, persistence, orchestrator, completion
//! manager and notification center together. It is cheap to clone and is
//! shared by the HTTP layer as router state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::processing::{
    BatchStore, CompletionManager, NotificationCenter, ProcessedBatchSet, WorkerOrchestrator,
};
use crate::providers::{AutoSaveSink, ExtractionService};
use crate::storage::{BatchDb, PersistenceAdapter};
use crate::types::{
    AddBatchResponse, Batch, BatchOptions, EngineStatistics, FileStatus, FileUpload, Notification,
};

struct EngineInner {
    config: EngineConfig,
    store: Arc<BatchStore>,
    persistence: Arc<PersistenceAdapter>,
    ledger: Arc<ProcessedBatchSet>,
    notifications: Arc<NotificationCenter>,
    completion: Arc<CompletionManager>,
    orchestrator: Arc<WorkerOrchestrator>,
    ready: AtomicBool,
}

/// Batch document processing engine
#[derive(Clone)]
pub struct BatchEngine {
    inner: Arc<EngineInner>,
}

impl BatchEngine {
    /// Open the configured database and build the engine. Call
    /// [`BatchEngine::start`] afterwards to restore persisted batches.
    pub fn new(
        config: EngineConfig,
        extractor: Arc<dyn ExtractionService>,
        sink: Option<Arc<dyn AutoSaveSink>>,
    ) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(BatchDb::new(&config.persistence.database_path)?);
        tracing::info!("Batch database at {}", config.persistence.database_path.display());
        Self::with_database(config, db, extractor, sink)
    }

    /// Build the engine on an already opened database
    pub fn with_database(
        config: EngineConfig,
        db: Arc<BatchDb>,
        extractor: Arc<dyn ExtractionService>,
        sink: Option<Arc<dyn AutoSaveSink>>,
    ) -> Result<Self> {
        let persistence = Arc::new(PersistenceAdapter::new(db.clone()));
        let store = Arc::new(BatchStore::new(persistence.clone()));
        let ledger = Arc::new(ProcessedBatchSet::load(db.clone(), config.completion.ledger_ttl())?);
        let notifications = Arc::new(NotificationCenter::load(db)?);
        let completion = Arc::new(CompletionManager::new(
            store.clone(),
            ledger.clone(),
            notifications.clone(),
            sink,
            config.completion.retention(),
        ));
        let orchestrator = Arc::new(WorkerOrchestrator::new(
            store.clone(),
            completion.clone(),
            extractor,
            config.worker.clone(),
            config.fallback.clone(),
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                persistence,
                ledger,
                notifications,
                completion,
                orchestrator,
                ready: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Restore persisted batches. Terminal ones get their retention timer,
    /// unfinished ones are resumed when `recovery.auto_resume` is set.
    /// Returns the number of batches restored.
    pub async fn start(&self) -> Result<usize> {
        let restored = self.inner.persistence.restore_all()?;
        let count = restored.len();

        for batch in restored {
            let id = batch.id.clone();
            let terminal = batch.is_terminal();
            let queued = batch.indices_with_status(FileStatus::Queued);
            self.inner.store.admit(batch);

            if terminal {
                self.inner.completion.schedule_removal(&id);
            } else if self.inner.config.recovery.auto_resume {
                tracing::info!("Resuming batch {} ({} queued file(s))", id, queued.len());
                self.spawn_run(id, queued);
            }
        }

        self.inner.ready.store(true, Ordering::SeqCst);
        Ok(count)
    }

    /// True once persisted state has been restored
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    // ==================== Control API ====================

    /// Register a batch and start processing it in the background
    pub async fn add_batch(
        &self,
        files: Vec<FileUpload>,
        document_type: &str,
        options: BatchOptions,
    ) -> Result<AddBatchResponse> {
        if files.is_empty() {
            return Err(Error::invalid_argument("a batch needs at least one file"));
        }
        let document_type = document_type.trim();
        if document_type.is_empty() {
            return Err(Error::invalid_argument("document type must not be empty"));
        }

        let method = self.inner.orchestrator.method_for(options.prefer_background_worker);
        let batch = self.inner.store.create_batch(files, document_type, options, method)?;
        let total_files = batch.total_files;
        tracing::info!(
            "Accepted batch {}: {} {} file(s) via {}",
            batch.id,
            total_files,
            batch.document_type,
            method
        );

        self.spawn_run(batch.id.clone(), (0..total_files).collect());

        Ok(AddBatchResponse {
            batch_id: batch.id,
            total_files,
            estimated_seconds: total_files as u64 * self.inner.config.estimation.seconds_per_file,
            processing_method: method,
        })
    }

    /// Cancel a batch; terminal batches are returned unchanged
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<Batch> {
        self.inner.orchestrator.cancel_batch(batch_id).await
    }

    /// Re-queue every failed file of a batch and process only those.
    /// Returns the number of files re-queued; 0 means nothing to do.
    pub async fn retry_failed_files(&self, batch_id: &str) -> Result<usize> {
        let requeued = self.inner.store.try_mutate(batch_id, |b| b.requeue_failed())?;
        if requeued.is_empty() {
            return Ok(0);
        }

        self.inner.ledger.remove(batch_id);
        tracing::info!("Retrying {} failed file(s) of batch {}", requeued.len(), batch_id);
        let count = requeued.len();
        self.spawn_run(batch_id.to_string(), requeued);
        Ok(count)
    }

    /// Supply content again for files of a restored batch. Files are matched
    /// by name, in index order, among those not yet settled successfully.
    /// Returns the number of files attached.
    pub fn reattach_files(&self, batch_id: &str, files: Vec<FileUpload>) -> Result<usize> {
        let batch = self
            .inner
            .store
            .get(batch_id)
            .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;

        let mut taken = vec![false; batch.files.len()];
        let mut attached = 0;
        for upload in files {
            let slot = batch.files.iter().position(|f| {
                !taken[f.index]
                    && f.name == upload.name
                    && matches!(f.status, FileStatus::Queued | FileStatus::Failed)
            });
            let Some(index) = slot else {
                tracing::debug!("No open slot named {} in batch {}", upload.name, batch_id);
                continue;
            };
            if upload.data.len() as u64 != batch.files[index].size_bytes {
                tracing::warn!(
                    "Size mismatch re-attaching {} to batch {} ({} vs {} bytes)",
                    upload.name,
                    batch_id,
                    upload.data.len(),
                    batch.files[index].size_bytes
                );
                continue;
            }
            taken[index] = true;
            if self.inner.store.attach_payload(batch_id, index, upload.data) {
                attached += 1;
            }
        }

        tracing::info!("Re-attached {} file(s) to batch {}", attached, batch_id);
        Ok(attached)
    }

    /// Process every queued file of a batch (after re-attaching content, or
    /// when auto-resume is off). Returns the number of files scheduled.
    pub fn resume_batch(&self, batch_id: &str) -> Result<usize> {
        let batch = self
            .inner
            .store
            .get(batch_id)
            .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;
        if batch.is_terminal() {
            return Ok(0);
        }

        let queued = batch.indices_with_status(FileStatus::Queued);
        let count = queued.len();
        self.spawn_run(batch.id, queued);
        Ok(count)
    }

    fn spawn_run(&self, batch_id: String, indices: Vec<usize>) {
        let orchestrator = self.inner.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.run_batch(&batch_id, indices).await;
        });
    }

    // ==================== Observer API ====================

    pub fn get_batch(&self, batch_id: &str) -> Option<Batch> {
        self.inner.store.get(batch_id)
    }

    /// Every resident batch, newest first. Completed and cancelled batches
    /// stay listed until their retention period ends.
    pub fn get_active_batches(&self) -> Vec<Batch> {
        self.inner.store.list()
    }

    pub fn get_statistics(&self) -> EngineStatistics {
        let batches = self.inner.store.list();
        let mut stats = EngineStatistics {
            total_batches: batches.len(),
            active_workers: self.inner.orchestrator.active_workers(),
            background_execution_supported: self.inner.orchestrator.background_supported(),
            ..EngineStatistics::default()
        };

        for batch in &batches {
            if !batch.is_terminal() {
                stats.active_batches += 1;
            }
            stats.total_files += batch.total_files;
            stats.processed_files += batch.processed_files;
            stats.successful_files += batch.successful_files;
            stats.failed_files += batch.failed_files;
        }
        stats
    }

    // ==================== Notifications ====================

    /// Mark the consumer foreground-active; returns pending notices flushed
    pub fn set_foreground(&self, active: bool) -> usize {
        self.inner.notifications.set_foreground(active)
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    pub fn pending_notifications(&self) -> Vec<Notification> {
        self.inner.notifications.pending()
    }

    pub fn recent_notifications(&self) -> Vec<Notification> {
        self.inner.notifications.recent()
    }
}
