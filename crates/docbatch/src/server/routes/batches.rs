//! Batch control endpoints

use axum::{
    extract::{Multipart, Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::engine::BatchEngine;
use crate::error::{Error, Result};
use crate::types::{AddBatchResponse, Batch, BatchOptions, ControlResponse, FileUpload};

const DEFAULT_DOCUMENT_TYPE: &str = "generic";

/// Parsed multipart upload
struct UploadForm {
    files: Vec<FileUpload>,
    document_type: Option<String>,
    options: Option<BatchOptions>,
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadForm> {
    let mut form = UploadForm {
        files: Vec::new(),
        document_type: None,
        options: None,
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::invalid_argument(format!("Failed to read multipart field: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "options" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::invalid_argument(format!("Failed to read options: {}", e)))?;
                let options = serde_json::from_slice::<BatchOptions>(&data)
                    .map_err(|e| Error::invalid_argument(format!("Invalid options: {}", e)))?;
                form.options = Some(options);
            }
            "document_type" => {
                let value = field.text().await.map_err(|e| {
                    Error::invalid_argument(format!("Failed to read document_type: {}", e))
                })?;
                form.document_type = Some(value);
            }
            _ => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("file_{}.bin", Uuid::new_v4()));
                let content_type = field.content_type().map(|s| s.to_string());

                let data = match field.bytes().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Failed to read file {}: {}", filename, e);
                        continue;
                    }
                };

                let mut upload = FileUpload::new(filename, data);
                if let Some(content_type) = content_type.filter(|c| c != "application/octet-stream") {
                    upload = upload.with_mime_type(content_type);
                }
                tracing::debug!("Received file: {} ({} bytes)", upload.name, upload.data.len());
                form.files.push(upload);
            }
        }
    }

    Ok(form)
}

/// POST /api/batches - Submit files as a new batch
pub async fn add_batch(
    State(engine): State<BatchEngine>,
    multipart: Multipart,
) -> Result<Json<AddBatchResponse>> {
    let form = read_upload(multipart).await?;
    let document_type = form
        .document_type
        .unwrap_or_else(|| DEFAULT_DOCUMENT_TYPE.to_string());

    let response = engine
        .add_batch(form.files, &document_type, form.options.unwrap_or_default())
        .await?;
    Ok(Json(response))
}

/// Batch listing
#[derive(Debug, Serialize)]
pub struct BatchListResponse {
    pub batches: Vec<Batch>,
    pub total: usize,
}

/// GET /api/batches - List resident batches
pub async fn list_batches(State(engine): State<BatchEngine>) -> Json<BatchListResponse> {
    let batches = engine.get_active_batches();
    Json(BatchListResponse {
        total: batches.len(),
        batches,
    })
}

/// GET /api/batches/:id - Get one batch
pub async fn get_batch(
    State(engine): State<BatchEngine>,
    Path(batch_id): Path<String>,
) -> Result<Json<Batch>> {
    engine
        .get_batch(&batch_id)
        .map(Json)
        .ok_or(Error::BatchNotFound(batch_id))
}

/// POST /api/batches/:id/cancel - Cancel a batch
pub async fn cancel_batch(
    State(engine): State<BatchEngine>,
    Path(batch_id): Path<String>,
) -> Result<Json<Batch>> {
    let batch = engine.cancel_batch(&batch_id).await?;
    Ok(Json(batch))
}

/// POST /api/batches/:id/retry - Retry failed files
pub async fn retry_batch(
    State(engine): State<BatchEngine>,
    Path(batch_id): Path<String>,
) -> Result<Json<ControlResponse>> {
    let files = engine.retry_failed_files(&batch_id).await?;
    let message = if files == 0 {
        "No failed files to retry".to_string()
    } else {
        format!("Re-queued {} failed file(s)", files)
    };
    Ok(Json(ControlResponse {
        batch_id,
        files,
        message,
    }))
}

/// POST /api/batches/:id/files - Re-attach file content
pub async fn reattach_files(
    State(engine): State<BatchEngine>,
    Path(batch_id): Path<String>,
    multipart: Multipart,
) -> Result<Json<ControlResponse>> {
    let form = read_upload(multipart).await?;
    if form.files.is_empty() {
        return Err(Error::invalid_argument("No files provided"));
    }

    let files = engine.reattach_files(&batch_id, form.files)?;
    Ok(Json(ControlResponse {
        message: format!("Re-attached {} file(s)", files),
        batch_id,
        files,
    }))
}

/// POST /api/batches/:id/resume - Process queued files
pub async fn resume_batch(
    State(engine): State<BatchEngine>,
    Path(batch_id): Path<String>,
) -> Result<Json<ControlResponse>> {
    let files = engine.resume_batch(&batch_id)?;
    Ok(Json(ControlResponse {
        message: format!("Scheduled {} queued file(s)", files),
        batch_id,
        files,
    }))
}
