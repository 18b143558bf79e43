//! Extraction service and auto-save sink traits

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// File content handed to the extraction service
#[derive(Debug, Clone)]
pub struct FileBlob {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// Outcome of extracting one file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractionResult {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Collapse into the value stored on the file, or the failure message
    pub fn into_outcome(self) -> std::result::Result<Value, String> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "extraction failed without a reason".to_string()))
        }
    }
}

/// Outcome of saving one result
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SaveResult {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl SaveResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Turns a document into structured data
///
/// Implementations:
/// - `HttpExtractionService`: remote extraction endpoint
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Extract structured data from one file. Failures are reported in the
    /// result, not as an error, so a bad file never aborts a batch.
    async fn extract(&self, file: &FileBlob, document_type: &str) -> ExtractionResult;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

/// Persists extraction results as business records
///
/// Implementations:
/// - `HttpSaveSink`: remote record store
#[async_trait]
pub trait AutoSaveSink: Send + Sync {
    async fn save(&self, data: &Value, document_type: &str) -> SaveResult;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
