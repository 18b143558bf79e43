//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use docbatch::providers::{AutoSaveSink, ExtractionResult, ExtractionService, FileBlob, SaveResult};
use docbatch::storage::BatchDb;
use docbatch::{Batch, BatchEngine, EngineConfig, FileUpload};

/// Extractor whose behavior is chosen by file name prefix:
/// `fail-` always fails, `flaky-` fails on the first call, `panic-` panics on
/// the first call, `gate-` waits for a permit from [`ScriptedExtractor::open_gate`].
pub struct ScriptedExtractor {
    calls: Mutex<HashMap<String, usize>>,
    gate: Arc<Semaphore>,
}

impl ScriptedExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            gate: Arc::new(Semaphore::new(0)),
        })
    }

    pub fn calls(&self, name: &str) -> usize {
        self.calls.lock().get(name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Let `n` gated extractions proceed
    pub fn open_gate(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl ExtractionService for ScriptedExtractor {
    async fn extract(&self, file: &FileBlob, document_type: &str) -> ExtractionResult {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(file.name.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if file.name.starts_with("gate-") {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        if file.name.starts_with("panic-") && call == 1 {
            panic!("extractor blew up on {}", file.name);
        }
        if file.name.starts_with("fail-") || (file.name.starts_with("flaky-") && call == 1) {
            return ExtractionResult::failed(format!("cannot read {}", file.name));
        }

        ExtractionResult::ok(json!({
            "file": file.name,
            "document_type": document_type,
            "bytes": file.data.len(),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Sink recording the `file` field of every saved result
#[derive(Default)]
pub struct RecordingSink {
    pub saved: Mutex<Vec<String>>,
}

#[async_trait]
impl AutoSaveSink for RecordingSink {
    async fn save(&self, data: &Value, _document_type: &str) -> SaveResult {
        let name = data["file"].as_str().unwrap_or_default().to_string();
        self.saved.lock().push(name);
        SaveResult::ok()
    }

    fn name(&self) -> &str {
        "recording"
    }
}

pub fn test_config(workers: bool) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.enabled = workers;
    config.worker.max_workers = 2;
    config.worker.event_timeout_secs = Some(5);
    config.fallback.yield_ms = 0;
    config.completion.retention_secs = 60;
    config
}

pub fn engine_with(
    config: EngineConfig,
    db: Arc<BatchDb>,
    extractor: Arc<ScriptedExtractor>,
    sink: Option<Arc<RecordingSink>>,
) -> BatchEngine {
    let sink = sink.map(|s| s as Arc<dyn AutoSaveSink>);
    BatchEngine::with_database(config, db, extractor, sink).unwrap()
}

pub fn engine(workers: bool, extractor: Arc<ScriptedExtractor>) -> BatchEngine {
    engine_with(
        test_config(workers),
        Arc::new(BatchDb::in_memory().unwrap()),
        extractor,
        None,
    )
}

pub fn uploads(names: &[&str]) -> Vec<FileUpload> {
    names
        .iter()
        .map(|name| FileUpload::new(*name, format!("content of {}", name).into_bytes()))
        .collect()
}

/// Poll until the batch satisfies `ready`
pub async fn wait_for(engine: &BatchEngine, batch_id: &str, ready: impl Fn(&Batch) -> bool) -> Batch {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(batch) = engine.get_batch(batch_id) {
            if ready(&batch) {
                return batch;
            }
        }
        assert!(Instant::now() < deadline, "timed out waiting for batch {}", batch_id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `ready` returns true
pub async fn wait_until(ready: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_terminal(engine: &BatchEngine, batch_id: &str) -> Batch {
    wait_for(engine, batch_id, |b| b.is_terminal()).await
}

pub fn assert_counters(batch: &Batch) {
    assert_eq!(
        batch.processed_files,
        batch.successful_files + batch.failed_files,
        "processed must equal successful + failed"
    );
    assert!(batch.processed_files <= batch.total_files);
    assert!(batch.counters_consistent());
}
