//! Completion notifications with deferred delivery
//!
//! A notification is delivered on the broadcast channel when the consumer is
//! in the foreground and someone is subscribed. Otherwise it is queued as
//! pending (and persisted) until [`NotificationCenter::set_foreground`]
//! flips back to active.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::storage::BatchDb;
use crate::types::Notification;

const PENDING_KEY: &str = "pending_notifications";
const CHANNEL_CAPACITY: usize = 64;
const HISTORY_LIMIT: usize = 100;

pub struct NotificationCenter {
    foreground: AtomicBool,
    pending: Mutex<Vec<Notification>>,
    history: Mutex<VecDeque<Notification>>,
    sender: broadcast::Sender<Notification>,
    db: Arc<BatchDb>,
}

impl NotificationCenter {
    /// Load pending notifications left over from a previous run
    pub fn load(db: Arc<BatchDb>) -> Result<Self> {
        let pending: Vec<Notification> = match db.get_record(PENDING_KEY)? {
            Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Discarding unreadable pending notifications: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        if !pending.is_empty() {
            tracing::info!("{} notification(s) pending from a previous run", pending.len());
        }

        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            foreground: AtomicBool::new(false),
            pending: Mutex::new(pending),
            history: Mutex::new(VecDeque::new()),
            sender,
            db,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// Deliver now if possible, otherwise queue as pending. The foreground
    /// flag is read under the pending lock so a concurrent flush cannot miss
    /// a notice queued here.
    pub fn publish(&self, notification: Notification) {
        let mut pending = self.pending.lock();
        if self.is_foreground() {
            if let Some(delivered) = self.deliver(notification.clone()) {
                tracing::info!("Notified completion of batch {}", delivered.batch_id);
                return;
            }
        }

        tracing::debug!("Deferring notification for batch {}", notification.batch_id);
        pending.push(notification);
        self.write_pending(&pending);
    }

    /// Mark the consumer active or inactive. Becoming active flushes every
    /// pending notification; returns how many were delivered.
    pub fn set_foreground(&self, active: bool) -> usize {
        self.foreground.store(active, Ordering::SeqCst);
        if !active {
            return 0;
        }

        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return 0;
        }

        let mut kept = Vec::new();
        let mut delivered = 0;
        for notification in pending.drain(..) {
            match self.deliver(notification.clone()) {
                Some(_) => delivered += 1,
                None => kept.push(notification),
            }
        }
        *pending = kept;
        self.write_pending(&pending);

        if delivered > 0 {
            tracing::info!("Flushed {} pending notification(s)", delivered);
        }
        delivered
    }

    pub fn pending(&self) -> Vec<Notification> {
        self.pending.lock().clone()
    }

    /// Recently delivered notifications, newest first
    pub fn recent(&self) -> Vec<Notification> {
        self.history.lock().iter().rev().cloned().collect()
    }

    fn deliver(&self, mut notification: Notification) -> Option<Notification> {
        notification.delivered = true;
        if self.sender.send(notification.clone()).is_err() {
            // nobody subscribed
            return None;
        }

        let mut history = self.history.lock();
        history.push_back(notification.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        Some(notification)
    }

    fn write_pending(&self, pending: &[Notification]) {
        let result = serde_json::to_string(pending)
            .map_err(crate::error::Error::from)
            .and_then(|json| self.db.put_record(PENDING_KEY, &json));
        if let Err(e) = result {
            tracing::error!("Failed to persist pending notifications: {}", e);
        }
    }
}
