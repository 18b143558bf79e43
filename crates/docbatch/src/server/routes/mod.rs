//! API routes for the batch engine

pub mod batches;
pub mod observer;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::engine::BatchEngine;

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<BatchEngine> {
    Router::new()
        // Control
        .route(
            "/batches",
            post(batches::add_batch)
                .layer(DefaultBodyLimit::max(max_upload_size))
                .get(batches::list_batches),
        )
        .route("/batches/:id", get(batches::get_batch))
        .route("/batches/:id/cancel", post(batches::cancel_batch))
        .route("/batches/:id/retry", post(batches::retry_batch))
        .route(
            "/batches/:id/files",
            post(batches::reattach_files).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route("/batches/:id/resume", post(batches::resume_batch))
        // Observer
        .route("/stats", get(observer::statistics))
        .route("/notifications", get(observer::notifications))
        .route("/foreground", post(observer::set_foreground))
        .route("/info", get(info))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "docbatch",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Batch document extraction with background workers and crash recovery",
        "endpoints": {
            "POST /api/batches": "Submit files (multipart, optional 'document_type' and 'options' fields)",
            "GET /api/batches": "List resident batches, newest first",
            "GET /api/batches/:id": "Get one batch",
            "POST /api/batches/:id/cancel": "Cancel a batch",
            "POST /api/batches/:id/retry": "Retry failed files",
            "POST /api/batches/:id/files": "Re-attach file content after a restart",
            "POST /api/batches/:id/resume": "Process queued files",
            "GET /api/stats": "Aggregate statistics",
            "GET /api/notifications": "Pending and recent completion notifications",
            "POST /api/foreground": "Mark the consumer active or inactive"
        }
    }))
}
