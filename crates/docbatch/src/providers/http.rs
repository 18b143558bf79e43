//! HTTP-backed extraction service and auto-save sink

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::{ExtractionConfig, SaveSinkConfig};
use crate::error::{Error, Result};

use super::extraction::{AutoSaveSink, ExtractionResult, ExtractionService, FileBlob, SaveResult};

#[derive(Serialize)]
struct ExtractRequest<'a> {
    filename: &'a str,
    mime_type: &'a str,
    document_type: &'a str,
    content_base64: String,
}

#[derive(Serialize)]
struct SaveRequest<'a> {
    document_type: &'a str,
    data: &'a Value,
}

/// Extraction client posting base64 content to `{base_url}/extract`
pub struct HttpExtractionService {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl HttpExtractionService {
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    /// Retry a request with exponential backoff
    async fn retry_request<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        let delay = Duration::from_secs(2u64.pow(attempt));
                        tracing::warn!(
                            "Extraction request failed (attempt {}/{}), retrying in {:?}",
                            attempt + 1,
                            self.max_retries + 1,
                            delay
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Extraction("Unknown error".to_string())))
    }

    async fn post_extract(&self, file: &FileBlob, document_type: &str) -> Result<ExtractionResult> {
        let url = format!("{}/extract", self.base_url);
        let content_base64 = STANDARD.encode(&file.data);

        self.retry_request(|| {
            let request = ExtractRequest {
                filename: &file.name,
                mime_type: &file.mime_type,
                document_type,
                content_base64: content_base64.clone(),
            };
            let url = url.clone();

            async move {
                let response = self
                    .client
                    .post(&url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| Error::Extraction(format!("Extraction request failed: {}", e)))?;

                let status = response.status();
                if status.is_server_error() {
                    return Err(Error::Extraction(format!("Extraction failed: HTTP {}", status)));
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Ok(ExtractionResult::failed(format!("HTTP {}: {}", status, body)));
                }

                response
                    .json::<ExtractionResult>()
                    .await
                    .map_err(|e| Error::Extraction(format!("Invalid extraction response: {}", e)))
            }
        })
        .await
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionService {
    async fn extract(&self, file: &FileBlob, document_type: &str) -> ExtractionResult {
        match self.post_extract(file, document_type).await {
            Ok(result) => result,
            Err(e) => ExtractionResult::failed(e.to_string()),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Save sink posting results to `{base_url}/save`
pub struct HttpSaveSink {
    client: Client,
    base_url: String,
}

impl HttpSaveSink {
    pub fn new(config: &SaveSinkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AutoSaveSink for HttpSaveSink {
    async fn save(&self, data: &Value, document_type: &str) -> SaveResult {
        let url = format!("{}/save", self.base_url);
        let request = SaveRequest { document_type, data };

        let response = match self.client.post(&url).json(&request).send().await {
            Ok(response) => response,
            Err(e) => return SaveResult::failed(format!("Save request failed: {}", e)),
        };

        if !response.status().is_success() {
            return SaveResult::failed(format!("Save failed: HTTP {}", response.status()));
        }

        // Sinks may answer with an empty body on success
        match response.json::<SaveResult>().await {
            Ok(result) => result,
            Err(_) => SaveResult::ok(),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
