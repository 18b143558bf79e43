//! Batch processing: store, state machine, workers and completion

mod batch_store;
mod codec;
mod completion;
mod ledger;
mod notification;
mod orchestrator;
mod state_machine;
mod worker;

pub use batch_store::BatchStore;
pub use codec::{decode_file, encode_file, EncodedFile};
pub use completion::CompletionManager;
pub use ledger::ProcessedBatchSet;
pub use notification::NotificationCenter;
pub use orchestrator::WorkerOrchestrator;
pub use worker::{BackgroundWorker, WorkerCommand, WorkerEvent};
