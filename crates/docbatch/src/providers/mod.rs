//! Provider abstractions for extraction and auto-save
//!
//! The engine talks to the document extraction service and the
//! business-record store only through these traits, so tests and embedders
//! can plug in their own backends.

pub mod extraction;
pub mod http;

pub use extraction::{AutoSaveSink, ExtractionResult, ExtractionService, FileBlob, SaveResult};
pub use http::{HttpExtractionService, HttpSaveSink};
