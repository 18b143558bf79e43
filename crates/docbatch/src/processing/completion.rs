//! Batch completion: summary, ledger, auto-save, notification, retention
//!
//! [`CompletionManager::on_file_settled`] is called after every file reaches
//! completed or failed, by both execution strategies. Only the call that
//! moves the batch to `completed` proceeds, and the ledger is recorded before
//! any side effect runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::Result;
use crate::providers::AutoSaveSink;
use crate::types::{
    Batch, CompletionReport, CompletionSummary, FileStatus, Notification, SaveFailure,
};

use super::batch_store::BatchStore;
use super::ledger::ProcessedBatchSet;
use super::notification::NotificationCenter;

pub struct CompletionManager {
    store: Arc<BatchStore>,
    ledger: Arc<ProcessedBatchSet>,
    notifications: Arc<NotificationCenter>,
    sink: Option<Arc<dyn AutoSaveSink>>,
    retention: Duration,
}

impl CompletionManager {
    pub fn new(
        store: Arc<BatchStore>,
        ledger: Arc<ProcessedBatchSet>,
        notifications: Arc<NotificationCenter>,
        sink: Option<Arc<dyn AutoSaveSink>>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            notifications,
            sink,
            retention,
        }
    }

    /// Check whether the batch just finished and, if so, run its completion
    /// side effects exactly once. Returns the report for the call that did.
    pub async fn on_file_settled(self: &Arc<Self>, batch_id: &str) -> Result<Option<CompletionReport>> {
        if !self.store.mutate(batch_id, |batch| batch.try_complete())? {
            return Ok(None);
        }

        let Some(batch) = self.store.get(batch_id) else {
            return Ok(None);
        };
        let summary = CompletionSummary::from_batch(&batch);
        tracing::info!(
            "Batch {} completed: {}/{} successful, {} failed in {}ms via {}",
            batch_id,
            summary.successful,
            summary.total,
            summary.failed,
            summary.duration_ms,
            summary.processing_method
        );

        if !self.ledger.insert(batch_id) {
            tracing::debug!("Batch {} already processed, skipping side effects", batch_id);
            return Ok(None);
        }

        let (saved_count, save_errors) = self.auto_save(&batch).await;
        let report = CompletionReport {
            batch_id: batch_id.to_string(),
            summary,
            saved_count,
            save_errors,
        };

        if batch.options.notify_when_complete {
            self.notifications
                .publish(Notification::new(batch.document_type.clone(), report.clone()));
        }

        self.schedule_removal(batch_id);
        Ok(Some(report))
    }

    /// Hand every completed, not yet saved result to the sink. Failures are
    /// collected; they never abort the remaining saves.
    async fn auto_save(&self, batch: &Batch) -> (usize, Vec<SaveFailure>) {
        let sink = match (&self.sink, batch.options.auto_save) {
            (Some(sink), true) => sink,
            (None, true) => {
                tracing::warn!("Batch {} requested auto-save but no sink is configured", batch.id);
                return (0, Vec::new());
            }
            _ => return (0, Vec::new()),
        };

        let mut saved = 0;
        let mut failures = Vec::new();

        for file in batch
            .files
            .iter()
            .filter(|f| f.status == FileStatus::Completed && !f.saved)
        {
            let Some(result) = file.result.as_ref() else {
                continue;
            };

            let outcome = sink.save(result, &batch.document_type).await;
            if outcome.success {
                saved += 1;
                let index = file.index;
                if let Err(e) = self.store.mutate(&batch.id, |b| {
                    if let Some(f) = b.files.get_mut(index) {
                        f.saved = true;
                    }
                }) {
                    tracing::warn!("Could not mark {} saved: {}", file.id, e);
                }
            } else {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "save rejected without a reason".to_string());
                tracing::warn!("Auto-save of {} via {} failed: {}", file.name, sink.name(), error);
                failures.push(SaveFailure {
                    index: file.index,
                    name: file.name.clone(),
                    error,
                });
            }
        }

        tracing::info!(
            "Auto-saved {} result(s) for batch {} ({} failed)",
            saved,
            batch.id,
            failures.len()
        );
        (saved, failures)
    }

    /// Remove a terminal batch once the retention period has passed. A batch
    /// that was reopened in the meantime is left alone.
    pub fn schedule_removal(self: &Arc<Self>, batch_id: &str) {
        let Some(finished_at) = self.store.get(batch_id).and_then(|b| b.finished_at()) else {
            return;
        };

        let elapsed = (Utc::now() - finished_at).to_std().unwrap_or_default();
        let delay = self.retention.saturating_sub(elapsed);
        let manager = Arc::clone(self);
        let batch_id = batch_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.remove_if_expired(&batch_id);
        });
    }

    fn remove_if_expired(&self, batch_id: &str) -> bool {
        let retention = self.retention;
        let removed = self.store.remove_if(batch_id, |batch| {
            batch.finished_at().is_some_and(|at| {
                (Utc::now() - at).to_std().unwrap_or_default() >= retention
            })
        });
        if removed.is_some() {
            tracing::debug!("Removed batch {} after retention period", batch_id);
        }
        removed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::SaveResult;
    use crate::storage::{BatchDb, PersistenceAdapter};
    use crate::types::{BatchOptions, FileUpload, ProcessingMethod};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Default)]
    struct RecordingSink {
        saved: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl AutoSaveSink for RecordingSink {
        async fn save(&self, data: &Value, _document_type: &str) -> SaveResult {
            if data["reject"] == json!(true) {
                return SaveResult::failed("duplicate record");
            }
            self.saved.lock().push(data.clone());
            SaveResult::ok()
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct Fixture {
        store: Arc<BatchStore>,
        manager: Arc<CompletionManager>,
        sink: Arc<RecordingSink>,
        notifications: Arc<NotificationCenter>,
        db: Arc<BatchDb>,
    }

    fn fixture(retention: Duration) -> Fixture {
        let db = Arc::new(BatchDb::in_memory().unwrap());
        let store = Arc::new(BatchStore::new(Arc::new(PersistenceAdapter::new(db.clone()))));
        let ledger = Arc::new(ProcessedBatchSet::load(db.clone(), Duration::from_secs(3600)).unwrap());
        let notifications = Arc::new(NotificationCenter::load(db.clone()).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let manager = Arc::new(CompletionManager::new(
            store.clone(),
            ledger,
            notifications.clone(),
            Some(sink.clone() as Arc<dyn AutoSaveSink>),
            retention,
        ));
        Fixture {
            store,
            manager,
            sink,
            notifications,
            db,
        }
    }

    fn settled_batch(store: &BatchStore, results: &[std::result::Result<Value, &str>]) -> String {
        let files: Vec<FileUpload> = (0..results.len())
            .map(|i| FileUpload::new(format!("f{}.pdf", i), vec![1u8]))
            .collect();
        let options = BatchOptions {
            auto_save: true,
            ..BatchOptions::default()
        };
        let batch = store
            .create_batch(files, "invoice", options, ProcessingMethod::SameThread)
            .unwrap();
        store.mutate(&batch.id, |b| b.mark_started(ProcessingMethod::SameThread)).unwrap();
        for (i, result) in results.iter().enumerate() {
            store.try_mutate(&batch.id, |b| b.begin_file(i)).unwrap();
            match result {
                Ok(value) => store.try_mutate(&batch.id, |b| b.complete_file(i, value.clone())).unwrap(),
                Err(error) => store.try_mutate(&batch.id, |b| b.fail_file(i, *error)).unwrap(),
            }
        }
        batch.id
    }

    #[tokio::test]
    async fn test_completion_runs_once() {
        let f = fixture(Duration::from_secs(60));
        let id = settled_batch(&f.store, &[Ok(json!({"n": 1})), Err("bad"), Ok(json!({"n": 3}))]);

        let report = f.manager.on_file_settled(&id).await.unwrap().unwrap();
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.successful, 2);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.saved_count, 2);

        assert!(f.manager.on_file_settled(&id).await.unwrap().is_none());
        assert_eq!(f.sink.saved.lock().len(), 2);

        let batch = f.store.get(&id).unwrap();
        assert!(batch.files[0].saved && batch.files[2].saved);
        assert!(!batch.files[1].saved);
        assert_eq!(f.notifications.pending().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_blocks_duplicate_side_effects() {
        let f = fixture(Duration::from_secs(60));
        let id = settled_batch(&f.store, &[Ok(json!({"n": 1}))]);

        // a previous process already handled this batch
        ProcessedBatchSet::load(f.db.clone(), Duration::from_secs(3600)).unwrap().insert(&id);
        let manager = Arc::new(CompletionManager::new(
            f.store.clone(),
            Arc::new(ProcessedBatchSet::load(f.db.clone(), Duration::from_secs(3600)).unwrap()),
            f.notifications.clone(),
            Some(f.sink.clone() as Arc<dyn AutoSaveSink>),
            Duration::from_secs(60),
        ));

        assert!(manager.on_file_settled(&id).await.unwrap().is_none());
        assert!(f.sink.saved.lock().is_empty());
        assert!(f.notifications.pending().is_empty());
    }

    #[tokio::test]
    async fn test_save_failures_are_collected() {
        let f = fixture(Duration::from_secs(60));
        let id = settled_batch(&f.store, &[Ok(json!({"reject": true})), Ok(json!({"n": 2}))]);

        let report = f.manager.on_file_settled(&id).await.unwrap().unwrap();
        assert_eq!(report.saved_count, 1);
        assert_eq!(report.save_errors.len(), 1);
        assert_eq!(report.save_errors[0].index, 0);
        assert_eq!(report.save_errors[0].error, "duplicate record");
    }

    #[tokio::test]
    async fn test_incomplete_batch_is_ignored() {
        let f = fixture(Duration::from_secs(60));
        let files = vec![FileUpload::new("a.pdf", vec![1u8]), FileUpload::new("b.pdf", vec![2u8])];
        let batch = f
            .store
            .create_batch(files, "invoice", BatchOptions::default(), ProcessingMethod::SameThread)
            .unwrap();

        assert!(f.manager.on_file_settled(&batch.id).await.unwrap().is_none());
        assert!(!f.store.get(&batch.id).unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_storage_failures_do_not_block_progress() {
        let f = fixture(Duration::from_secs(60));
        let files = vec![FileUpload::new("a.pdf", vec![1u8]), FileUpload::new("b.pdf", vec![2u8])];
        let options = BatchOptions {
            auto_save: true,
            ..BatchOptions::default()
        };
        let batch = f
            .store
            .create_batch(files, "invoice", options, ProcessingMethod::SameThread)
            .unwrap();
        let id = batch.id;

        f.db.drop_tables();
        assert!(f.db.put_record("processed_batches", "{}").is_err());

        f.store.mutate(&id, |b| b.mark_started(ProcessingMethod::SameThread)).unwrap();
        f.store.try_mutate(&id, |b| b.begin_file(0)).unwrap();
        f.store.try_mutate(&id, |b| b.complete_file(0, json!({"n": 1}))).unwrap();
        f.store.try_mutate(&id, |b| b.begin_file(1)).unwrap();
        f.store.try_mutate(&id, |b| b.fail_file(1, "unreadable")).unwrap();

        let report = f.manager.on_file_settled(&id).await.unwrap().unwrap();
        assert_eq!(report.summary.successful, 1);
        assert_eq!(report.saved_count, 1);
        assert_eq!(f.notifications.pending().len(), 1);

        let current = f.store.get(&id).unwrap();
        assert_eq!(current.status, crate::types::BatchStatus::Completed);
        assert_eq!(current.processed_files, 2);
        assert!(current.files[0].saved);
        assert!(current.revision >= 6);

        // the in-memory ledger still blocks a second completion
        assert!(f.manager.on_file_settled(&id).await.unwrap().is_none());
        assert_eq!(f.sink.saved.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_retention_spares_reopened_batch() {
        let f = fixture(Duration::ZERO);
        let id = settled_batch(&f.store, &[Ok(json!({"n": 1})), Err("bad")]);
        f.store.mutate(&id, |b| b.try_complete()).unwrap();

        // a retry reopened the batch before the retention timer fired
        f.store.try_mutate(&id, |b| b.requeue_failed()).unwrap();
        assert!(!f.manager.remove_if_expired(&id));
        assert!(f.store.contains(&id));
        assert!(f.db.get_snapshot(&id).unwrap().is_some());

        f.store.try_mutate(&id, |b| b.begin_file(1)).unwrap();
        f.store.try_mutate(&id, |b| b.fail_file(1, "still bad")).unwrap();
        f.store.mutate(&id, |b| b.try_complete()).unwrap();
        assert!(f.manager.remove_if_expired(&id));
        assert!(!f.store.contains(&id));
        assert!(f.db.get_snapshot(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retention_removes_completed_batch() {
        let f = fixture(Duration::from_millis(20));
        let id = settled_batch(&f.store, &[Ok(json!({}))]);

        f.manager.on_file_settled(&id).await.unwrap();
        assert!(f.store.contains(&id));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!f.store.contains(&id));
        assert!(f.db.get_snapshot(&id).unwrap().is_none());
    }
}
