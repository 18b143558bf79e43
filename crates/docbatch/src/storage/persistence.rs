//! Persistence adapter: batch snapshots in, restored batches out
//!
//! Writes are best-effort. A failed write is logged and processing continues;
//! in-memory state stays authoritative for the running process.

use std::sync::Arc;

use crate::error::Result;
use crate::types::{Batch, FileStatus};

use super::database::BatchDb;

/// Durable mirror of the batch store
pub struct PersistenceAdapter {
    db: Arc<BatchDb>,
}

impl PersistenceAdapter {
    pub fn new(db: Arc<BatchDb>) -> Self {
        Self { db }
    }

    /// Write a full snapshot of the batch (payloads are never part of it)
    pub fn persist(&self, batch: &Batch) {
        let json = match serde_json::to_string(batch) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize batch {}: {}", batch.id, e);
                return;
            }
        };

        match self.db.upsert_snapshot(&batch.id, batch.status.as_str(), batch.revision, &json) {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                "Skipped stale snapshot for batch {} (revision {})",
                batch.id,
                batch.revision
            ),
            Err(e) => tracing::error!("Failed to persist batch {}: {}", batch.id, e),
        }
    }

    /// Delete the batch snapshot
    pub fn remove(&self, batch_id: &str) {
        if let Err(e) = self.db.delete_snapshot(batch_id) {
            tracing::error!("Failed to remove batch {} from persistence: {}", batch_id, e);
        }
    }

    /// Load every stored batch. Files caught mid-extraction are reset to
    /// queued without touching their attempt counts, and the corrected
    /// snapshot is written back. Unreadable snapshots are skipped.
    pub fn restore_all(&self) -> Result<Vec<Batch>> {
        let rows = self.db.list_snapshots()?;
        let mut restored = Vec::with_capacity(rows.len());

        for row in rows {
            let mut batch: Batch = match serde_json::from_str(&row.snapshot_json) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!("Skipping unreadable snapshot for batch {}: {}", row.id, e);
                    continue;
                }
            };

            let mut repaired = false;
            if !batch.counters_consistent() {
                tracing::warn!(
                    "Batch {} snapshot has inconsistent counters ({} processed, {} ok, {} failed), recounting",
                    batch.id,
                    batch.processed_files,
                    batch.successful_files,
                    batch.failed_files
                );
                batch.recount();
                repaired = true;
            }

            if !batch.is_terminal() && batch.count_with_status(FileStatus::Processing) > 0 {
                let requeued = batch.requeue_in_flight(None);
                tracing::info!(
                    "Recovered batch {}: {} in-flight file(s) reset to queued",
                    batch.id,
                    requeued
                );
                repaired = true;
            }

            if repaired {
                batch.revision += 1;
                self.persist(&batch);
            }

            restored.push(batch);
        }

        tracing::info!("Restored {} batch(es) from persistence", restored.len());
        Ok(restored)
    }
}
