//! Processed-batch ledger
//!
//! Records every batch whose completion side effects have started. The set is
//! written to the database on each change, before any side effect runs, so a
//! completion that is observed twice (duplicate events, restart) saves and
//! notifies at most once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::storage::BatchDb;

const LEDGER_KEY: &str = "processed_batches";

/// Batch ids with the time their completion side effects started. Entries
/// older than the ttl are pruned; the ttl must outlive batch retention so a
/// batch can never complete again while it is still resident or persisted.
pub struct ProcessedBatchSet {
    ids: Mutex<HashMap<String, DateTime<Utc>>>,
    ttl: Duration,
    db: Arc<BatchDb>,
}

impl ProcessedBatchSet {
    /// Load the ledger from the database, dropping expired entries
    pub fn load(db: Arc<BatchDb>, ttl: Duration) -> Result<Self> {
        let ids = match db.get_record(LEDGER_KEY)? {
            Some(json) => parse_ledger(&json),
            None => HashMap::new(),
        };

        let ledger = Self {
            ids: Mutex::new(ids),
            ttl,
            db,
        };
        {
            let mut ids = ledger.ids.lock();
            if ledger.prune(&mut ids) > 0 {
                ledger.write(&ids);
            }
            tracing::debug!("Loaded processed-batch ledger with {} entries", ids.len());
        }
        Ok(ledger)
    }

    pub fn contains(&self, batch_id: &str) -> bool {
        self.ids.lock().contains_key(batch_id)
    }

    /// Record a batch. Returns false when it was already present.
    pub fn insert(&self, batch_id: &str) -> bool {
        let mut ids = self.ids.lock();
        if ids.contains_key(batch_id) {
            return false;
        }
        ids.insert(batch_id.to_string(), Utc::now());
        self.prune(&mut ids);
        self.write(&ids);
        true
    }

    /// Forget a batch so a retried run can complete again
    pub fn remove(&self, batch_id: &str) -> bool {
        let mut ids = self.ids.lock();
        if ids.remove(batch_id).is_none() {
            return false;
        }
        self.write(&ids);
        true
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    fn prune(&self, ids: &mut HashMap<String, DateTime<Utc>>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(self.ttl) else {
            return 0;
        };
        let cutoff = Utc::now() - ttl;
        let before = ids.len();
        ids.retain(|_, recorded| *recorded >= cutoff);

        let pruned = before - ids.len();
        if pruned > 0 {
            tracing::debug!("Pruned {} expired processed-batch entries", pruned);
        }
        pruned
    }

    fn write(&self, ids: &HashMap<String, DateTime<Utc>>) {
        let result = serde_json::to_string(ids)
            .map_err(crate::error::Error::from)
            .and_then(|json| self.db.put_record(LEDGER_KEY, &json));
        if let Err(e) = result {
            tracing::error!("Failed to persist processed-batch ledger: {}", e);
        }
    }
}

/// Accepts the timestamped map, and the bare id list written by older
/// releases (those entries restart their ttl now)
fn parse_ledger(json: &str) -> HashMap<String, DateTime<Utc>> {
    if let Ok(ids) = serde_json::from_str::<HashMap<String, DateTime<Utc>>>(json) {
        return ids;
    }
    match serde_json::from_str::<HashSet<String>>(json) {
        Ok(ids) => {
            let now = Utc::now();
            ids.into_iter().map(|id| (id, now)).collect()
        }
        Err(e) => {
            tracing::warn!("Discarding unreadable processed-batch ledger: {}", e);
            HashMap::new()
        }
    }
}
