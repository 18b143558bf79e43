//! Per-file state machine and batch counter bookkeeping
//!
//! Every file transition goes through [`Batch`] methods so that
//! `processed_files == successful_files + failed_files` holds after each
//! mutation. Illegal transitions return [`Error::Transition`] and leave the
//! batch untouched.
//!
//! ```text
//! queued -> processing -> completed
//!                      -> failed -> queued (retry)
//! queued | processing -> cancelled
//! processing -> queued (recovery, worker demotion)
//! ```

use chrono::Utc;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{Batch, BatchStatus, FileItem, FileStatus, ProcessingMethod};

impl FileStatus {
    /// Whether `self -> next` is a legal edge
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Queued, Cancelled)
                | (Processing, Cancelled)
                | (Failed, Queued)
                | (Processing, Queued)
        )
    }
}

impl FileItem {
    fn transition(&mut self, next: FileStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Transition {
                index: self.index,
                from: self.status,
                to: next,
            });
        }

        match next {
            FileStatus::Processing => {
                self.attempts += 1;
                self.progress = 0;
                self.error = None;
            }
            FileStatus::Completed => self.progress = 100,
            FileStatus::Queued => {
                self.progress = 0;
                if self.status == FileStatus::Failed {
                    self.error = None;
                    self.result = None;
                    self.saved = false;
                }
            }
            FileStatus::Failed | FileStatus::Cancelled => {}
        }
        self.status = next;
        Ok(())
    }
}

impl Batch {
    fn file_mut(&mut self, index: usize) -> Result<&mut FileItem> {
        let total = self.files.len();
        self.files
            .get_mut(index)
            .ok_or_else(|| Error::invalid_argument(format!("file index {} out of range (batch has {})", index, total)))
    }

    /// First run (or re-run) of the batch
    pub fn mark_started(&mut self, method: ProcessingMethod) {
        if self.status == BatchStatus::Queued {
            self.status = BatchStatus::Processing;
        }
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        self.processing_method = method;
    }

    /// queued -> processing; returns the attempt number
    pub fn begin_file(&mut self, index: usize) -> Result<u32> {
        if self.status == BatchStatus::Cancelled {
            return Err(Error::Transition {
                index,
                from: self.file_mut(index)?.status,
                to: FileStatus::Processing,
            });
        }
        let file = self.file_mut(index)?;
        file.transition(FileStatus::Processing)?;
        Ok(file.attempts)
    }

    /// Progress update; begins the file when it is still queued.
    /// Values below the current progress are ignored.
    pub fn set_file_progress(&mut self, index: usize, progress: u8) -> Result<()> {
        if self.file_mut(index)?.status == FileStatus::Queued {
            self.begin_file(index)?;
        }
        let file = self.file_mut(index)?;
        if file.status != FileStatus::Processing {
            return Err(Error::Transition {
                index,
                from: file.status,
                to: FileStatus::Processing,
            });
        }
        file.progress = file.progress.max(progress.min(100));
        Ok(())
    }

    /// processing -> completed
    pub fn complete_file(&mut self, index: usize, result: Value) -> Result<()> {
        let file = self.file_mut(index)?;
        file.transition(FileStatus::Completed)?;
        file.result = Some(result);
        file.error = None;
        self.processed_files += 1;
        self.successful_files += 1;
        Ok(())
    }

    /// processing -> failed
    pub fn fail_file(&mut self, index: usize, error: impl Into<String>) -> Result<()> {
        let file = self.file_mut(index)?;
        file.transition(FileStatus::Failed)?;
        file.error = Some(error.into());
        self.processed_files += 1;
        self.failed_files += 1;
        Ok(())
    }

    /// Cancel every queued or in-flight file and mark the batch cancelled.
    /// Terminal batches are left alone; returns the number of files cancelled.
    pub fn cancel_pending(&mut self) -> usize {
        if self.is_terminal() {
            return 0;
        }
        let mut cancelled = 0;
        for file in &mut self.files {
            if file.transition(FileStatus::Cancelled).is_ok() {
                cancelled += 1;
            }
        }
        self.status = BatchStatus::Cancelled;
        self.cancelled_at = Some(Utc::now());
        cancelled
    }

    /// processing -> queued for the given indices (all when `None`),
    /// without touching attempt counts
    pub fn requeue_in_flight(&mut self, indices: Option<&[usize]>) -> usize {
        let mut requeued = 0;
        for file in &mut self.files {
            let selected = indices.map_or(true, |set| set.contains(&file.index));
            if selected
                && file.status == FileStatus::Processing
                && file.transition(FileStatus::Queued).is_ok()
            {
                requeued += 1;
            }
        }
        requeued
    }

    /// failed -> queued for every failed file, reopening a completed batch.
    /// Returns the re-queued indices.
    pub fn requeue_failed(&mut self) -> Result<Vec<usize>> {
        if self.status == BatchStatus::Cancelled {
            return Err(Error::invalid_argument(format!(
                "batch {} was cancelled and cannot be retried",
                self.id
            )));
        }

        let mut requeued = Vec::new();
        for file in &mut self.files {
            if file.status == FileStatus::Failed {
                file.transition(FileStatus::Queued)?;
                requeued.push(file.index);
            }
        }

        if !requeued.is_empty() {
            self.processed_files = self.processed_files.saturating_sub(requeued.len());
            self.failed_files = self.failed_files.saturating_sub(requeued.len());
            if self.status == BatchStatus::Completed {
                self.status = BatchStatus::Processing;
                self.completed_at = None;
            }
        }
        Ok(requeued)
    }

    /// Atomically move to `completed` once every file has settled.
    /// Returns true only for the call that made the transition.
    pub fn try_complete(&mut self) -> bool {
        if self.is_terminal() || self.processed_files != self.total_files {
            return false;
        }
        self.status = BatchStatus::Completed;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Rebuild the counters from file statuses
    pub fn recount(&mut self) {
        self.total_files = self.files.len();
        self.successful_files = self.count_with_status(FileStatus::Completed);
        self.failed_files = self.count_with_status(FileStatus::Failed);
        self.processed_files = self.successful_files + self.failed_files;
    }

    /// Recount from file statuses; used to validate restored snapshots
    pub fn counters_consistent(&self) -> bool {
        let successful = self.count_with_status(FileStatus::Completed);
        let failed = self.count_with_status(FileStatus::Failed);
        self.successful_files == successful
            && self.failed_files == failed
            && self.processed_files == successful + failed
            && self.total_files == self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BatchOptions, FileUpload};
    use serde_json::json;

    fn batch(n: usize) -> Batch {
        let files: Vec<FileUpload> = (0..n)
            .map(|i| FileUpload::new(format!("doc-{}.pdf", i), vec![1u8, 2, 3]))
            .collect();
        let mut batch = Batch::new(
            "batch".to_string(),
            &files,
            "invoice",
            BatchOptions::default(),
            ProcessingMethod::SameThread,
        );
        batch.mark_started(ProcessingMethod::SameThread);
        batch
    }

    #[test]
    fn test_counters_follow_transitions() {
        let mut b = batch(3);
        b.begin_file(0).unwrap();
        b.complete_file(0, json!({"total": 10})).unwrap();
        b.begin_file(1).unwrap();
        b.fail_file(1, "unreadable").unwrap();

        assert_eq!(b.processed_files, 2);
        assert_eq!(b.successful_files, 1);
        assert_eq!(b.failed_files, 1);
        assert_eq!(b.files[0].progress, 100);
        assert!(b.counters_consistent());
        assert!(!b.try_complete());

        b.begin_file(2).unwrap();
        b.complete_file(2, json!({})).unwrap();
        assert!(b.try_complete());
        assert!(!b.try_complete());
        assert_eq!(b.status, BatchStatus::Completed);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let mut b = batch(2);
        assert!(matches!(
            b.complete_file(0, json!({})),
            Err(Error::Transition { from: FileStatus::Queued, to: FileStatus::Completed, .. })
        ));

        b.begin_file(0).unwrap();
        b.complete_file(0, json!({})).unwrap();
        assert!(b.fail_file(0, "late").is_err());
        assert!(b.begin_file(0).is_err());
        assert_eq!(b.processed_files, 1);
        assert!(b.begin_file(7).is_err());
    }

    #[test]
    fn test_attempts_increment_per_begin() {
        let mut b = batch(1);
        assert_eq!(b.begin_file(0).unwrap(), 1);
        b.fail_file(0, "timeout").unwrap();
        assert_eq!(b.requeue_failed().unwrap(), vec![0]);
        assert_eq!(b.begin_file(0).unwrap(), 2);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut b = batch(1);
        b.set_file_progress(0, 40).unwrap();
        assert_eq!(b.files[0].status, FileStatus::Processing);
        assert_eq!(b.files[0].attempts, 1);
        b.set_file_progress(0, 20).unwrap();
        assert_eq!(b.files[0].progress, 40);
        b.set_file_progress(0, 250).unwrap();
        assert_eq!(b.files[0].progress, 100);
    }

    #[test]
    fn test_cancel_keeps_settled_files() {
        let mut b = batch(7);
        b.begin_file(0).unwrap();
        b.complete_file(0, json!({})).unwrap();
        b.begin_file(1).unwrap();
        b.complete_file(1, json!({})).unwrap();

        assert_eq!(b.cancel_pending(), 5);
        assert_eq!(b.status, BatchStatus::Cancelled);
        assert_eq!(b.count_with_status(FileStatus::Completed), 2);
        assert_eq!(b.count_with_status(FileStatus::Cancelled), 5);
        assert_eq!(b.failed_files, 0);
        assert!(b.cancelled_at.is_some());

        // a result arriving after cancellation is discarded
        assert!(b.complete_file(3, json!({})).is_err());
        assert!(b.begin_file(4).is_err());
        assert_eq!(b.cancel_pending(), 0);
    }

    #[test]
    fn test_retry_reopens_completed_batch() {
        let mut b = batch(3);
        for i in 0..3 {
            b.begin_file(i).unwrap();
        }
        b.complete_file(0, json!({})).unwrap();
        b.fail_file(1, "bad scan").unwrap();
        b.complete_file(2, json!({})).unwrap();
        assert!(b.try_complete());

        let requeued = b.requeue_failed().unwrap();
        assert_eq!(requeued, vec![1]);
        assert_eq!(b.status, BatchStatus::Processing);
        assert!(b.completed_at.is_none());
        assert_eq!(b.processed_files, 2);
        assert_eq!(b.failed_files, 0);
        assert!(b.files[1].error.is_none());
        assert!(b.counters_consistent());

        assert!(b.requeue_failed().unwrap().is_empty());
    }

    #[test]
    fn test_requeue_in_flight_keeps_attempts() {
        let mut b = batch(3);
        b.begin_file(0).unwrap();
        b.begin_file(1).unwrap();
        assert_eq!(b.requeue_in_flight(Some(&[1, 2])), 1);
        assert_eq!(b.files[0].status, FileStatus::Processing);
        assert_eq!(b.files[1].status, FileStatus::Queued);
        assert_eq!(b.files[1].attempts, 1);
        assert_eq!(b.requeue_in_flight(None), 1);
    }

    #[test]
    fn test_cancelled_batch_cannot_be_retried() {
        let mut b = batch(2);
        b.begin_file(0).unwrap();
        b.fail_file(0, "x").unwrap();
        b.cancel_pending();
        assert!(matches!(b.requeue_failed(), Err(Error::InvalidArgument(_))));
    }
}
