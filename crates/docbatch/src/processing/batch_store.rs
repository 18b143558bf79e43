//! In-memory batch store with write-through persistence
//!
//! The store is the single source of truth for live batch state. Every
//! mutation runs under the batch's map entry, bumps the revision and then
//! hands a snapshot to the persistence adapter after the entry is released.
//! File payloads live in a separate registry and are never persisted.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::PersistenceAdapter;
use crate::types::{Batch, BatchId, BatchOptions, FileUpload, ProcessingMethod};

/// Authoritative batch map plus the in-memory payload registry
pub struct BatchStore {
    batches: DashMap<BatchId, Batch>,
    payloads: DashMap<BatchId, Vec<Option<Bytes>>>,
    persistence: Arc<PersistenceAdapter>,
}

impl BatchStore {
    pub fn new(persistence: Arc<PersistenceAdapter>) -> Self {
        Self {
            batches: DashMap::new(),
            payloads: DashMap::new(),
            persistence,
        }
    }

    /// Register a new batch from uploaded files and persist it
    pub fn create_batch(
        &self,
        files: Vec<FileUpload>,
        document_type: &str,
        options: BatchOptions,
        method: ProcessingMethod,
    ) -> Result<Batch> {
        if files.is_empty() {
            return Err(Error::invalid_argument("a batch needs at least one file"));
        }

        let id = Uuid::new_v4().to_string();
        let batch = Batch::new(id.clone(), &files, document_type, options, method);

        self.payloads
            .insert(id.clone(), files.into_iter().map(|f| Some(f.data)).collect());
        self.batches.insert(id.clone(), batch.clone());
        self.persistence.persist(&batch);

        tracing::debug!("Created batch {} with {} files", id, batch.total_files);
        Ok(batch)
    }

    /// Re-admit a batch loaded from persistence (no payloads)
    pub fn admit(&self, batch: Batch) {
        self.payloads
            .entry(batch.id.clone())
            .or_insert_with(|| vec![None; batch.total_files]);
        self.batches.insert(batch.id.clone(), batch);
    }

    /// Snapshot of one batch
    pub fn get(&self, batch_id: &str) -> Option<Batch> {
        self.batches.get(batch_id).map(|b| b.clone())
    }

    pub fn contains(&self, batch_id: &str) -> bool {
        self.batches.contains_key(batch_id)
    }

    /// Snapshots of every resident batch, newest first
    pub fn list(&self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self.batches.iter().map(|e| e.value().clone()).collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        batches
    }

    /// Snapshots of every non-terminal batch, newest first
    pub fn list_active(&self) -> Vec<Batch> {
        let mut batches: Vec<Batch> = self
            .batches
            .iter()
            .filter(|e| !e.value().is_terminal())
            .map(|e| e.value().clone())
            .collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        batches
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Apply a fallible mutation. On `Err` nothing is bumped or persisted, so
    /// the closure must validate before it changes anything.
    pub fn try_mutate<R>(
        &self,
        batch_id: &str,
        f: impl FnOnce(&mut Batch) -> Result<R>,
    ) -> Result<R> {
        let (value, snapshot) = {
            let mut entry = self
                .batches
                .get_mut(batch_id)
                .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;
            let value = f(entry.value_mut())?;
            entry.revision += 1;
            (value, entry.value().clone())
        };

        self.persistence.persist(&snapshot);
        if !self.batches.contains_key(batch_id) {
            // removed while the snapshot was being written
            self.persistence.remove(batch_id);
        }
        Ok(value)
    }

    /// Apply an infallible mutation
    pub fn mutate<R>(&self, batch_id: &str, f: impl FnOnce(&mut Batch) -> R) -> Result<R> {
        self.try_mutate(batch_id, |batch| Ok(f(batch)))
    }

    /// File content for cross-context transfer or extraction
    pub fn payload(&self, batch_id: &str, index: usize) -> Option<Bytes> {
        self.payloads
            .get(batch_id)
            .and_then(|files| files.get(index).cloned().flatten())
    }

    /// Attach content to a file slot; returns false for unknown slots
    pub fn attach_payload(&self, batch_id: &str, index: usize, data: Bytes) -> bool {
        match self.payloads.get_mut(batch_id) {
            Some(mut files) => match files.get_mut(index) {
                Some(slot) => {
                    *slot = Some(data);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Drop a batch from memory and persistence
    pub fn remove(&self, batch_id: &str) -> Option<Batch> {
        self.remove_if(batch_id, |_| true)
    }

    /// Drop a batch only if `predicate` holds. The check runs under the
    /// batch's map entry, so no mutation can slip in between check and removal.
    pub fn remove_if(&self, batch_id: &str, predicate: impl FnOnce(&Batch) -> bool) -> Option<Batch> {
        let (_, removed) = self.batches.remove_if(batch_id, |_, batch| predicate(batch))?;
        self.payloads.remove(batch_id);
        self.persistence.remove(batch_id);
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BatchDb;
    use crate::types::FileStatus;

    fn store() -> BatchStore {
        let db = Arc::new(BatchDb::in_memory().unwrap());
        BatchStore::new(Arc::new(PersistenceAdapter::new(db)))
    }

    fn uploads(n: usize) -> Vec<FileUpload> {
        (0..n)
            .map(|i| FileUpload::new(format!("f{}.pdf", i), format!("payload-{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn test_create_rejects_empty_batch() {
        let store = store();
        let result = store.create_batch(vec![], "invoice", BatchOptions::default(), ProcessingMethod::SameThread);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_mutate_bumps_revision_and_persists() {
        let db = Arc::new(BatchDb::in_memory().unwrap());
        let store = BatchStore::new(Arc::new(PersistenceAdapter::new(db.clone())));
        let batch = store
            .create_batch(uploads(2), "invoice", BatchOptions::default(), ProcessingMethod::SameThread)
            .unwrap();

        store.try_mutate(&batch.id, |b| b.begin_file(0)).unwrap();

        let current = store.get(&batch.id).unwrap();
        assert_eq!(current.revision, 1);
        assert_eq!(current.files[0].status, FileStatus::Processing);
        assert_eq!(db.get_snapshot(&batch.id).unwrap().unwrap().revision, 1);
    }

    #[test]
    fn test_failed_mutation_is_not_persisted() {
        let store = store();
        let batch = store
            .create_batch(uploads(1), "invoice", BatchOptions::default(), ProcessingMethod::SameThread)
            .unwrap();

        let result = store.try_mutate(&batch.id, |b| b.complete_file(0, serde_json::json!({})));
        assert!(result.is_err());
        assert_eq!(store.get(&batch.id).unwrap().revision, 0);
        assert!(matches!(
            store.mutate("missing", |_| ()),
            Err(Error::BatchNotFound(_))
        ));
    }

    #[test]
    fn test_payload_registry() {
        let store = store();
        let batch = store
            .create_batch(uploads(2), "invoice", BatchOptions::default(), ProcessingMethod::SameThread)
            .unwrap();

        assert_eq!(store.payload(&batch.id, 1).unwrap(), Bytes::from("payload-1"));
        assert!(store.payload(&batch.id, 2).is_none());

        let mut restored = batch.clone();
        restored.id = "restored".to_string();
        store.admit(restored);
        assert!(store.payload("restored", 0).is_none());
        assert!(store.attach_payload("restored", 0, Bytes::from("again")));
        assert!(!store.attach_payload("restored", 9, Bytes::from("nope")));
        assert_eq!(store.payload("restored", 0).unwrap(), Bytes::from("again"));

        store.remove(&batch.id);
        assert!(store.payload(&batch.id, 0).is_none());
        assert!(!store.contains(&batch.id));
    }

    #[test]
    fn test_remove_if_keeps_batch_when_predicate_fails() {
        let db = Arc::new(BatchDb::in_memory().unwrap());
        let store = BatchStore::new(Arc::new(PersistenceAdapter::new(db.clone())));
        let batch = store
            .create_batch(uploads(1), "invoice", BatchOptions::default(), ProcessingMethod::SameThread)
            .unwrap();

        assert!(store.remove_if(&batch.id, |b| b.is_terminal()).is_none());
        assert!(store.contains(&batch.id));
        assert!(store.payload(&batch.id, 0).is_some());
        assert!(db.get_snapshot(&batch.id).unwrap().is_some());

        store.mutate(&batch.id, |b| b.cancel_pending()).unwrap();
        assert!(store.remove_if(&batch.id, |b| b.is_terminal()).is_some());
        assert!(!store.contains(&batch.id));
        assert!(db.get_snapshot(&batch.id).unwrap().is_none());
        assert!(matches!(
            store.mutate(&batch.id, |b| b.cancel_pending()),
            Err(Error::BatchNotFound(_))
        ));
        assert!(db.get_snapshot(&batch.id).unwrap().is_none());
    }

    #[test]
    fn test_list_active_excludes_terminal() {
        let store = store();
        let a = store
            .create_batch(uploads(1), "invoice", BatchOptions::default(), ProcessingMethod::SameThread)
            .unwrap();
        let b = store
            .create_batch(uploads(1), "invoice", BatchOptions::default(), ProcessingMethod::SameThread)
            .unwrap();
        store.mutate(&a.id, |batch| batch.cancel_pending()).unwrap();

        let active: Vec<String> = store.list_active().into_iter().map(|b| b.id).collect();
        assert_eq!(active, vec![b.id]);
        assert_eq!(store.list().len(), 2);
    }
}
