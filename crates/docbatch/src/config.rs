//! Configuration for the batch engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Background worker pool
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Same-thread fallback strategy
    #[serde(default)]
    pub fallback: FallbackConfig,
    /// Snapshot persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Completion handling
    #[serde(default)]
    pub completion: CompletionConfig,
    /// Time estimation heuristic
    #[serde(default)]
    pub estimation: EstimationConfig,
    /// Start-up recovery
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// HTTP extraction service
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// HTTP auto-save sink (disabled when absent)
    #[serde(default)]
    pub save_sink: Option<SaveSinkConfig>,
}

impl EngineConfig {
    /// Load configuration from a TOML file. Missing sections use defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker.enabled && self.worker.max_workers == 0 {
            return Err(Error::Config(
                "worker.max_workers must be at least 1 when workers are enabled".to_string(),
            ));
        }
        if self.worker.channel_capacity == 0 {
            return Err(Error::Config("worker.channel_capacity must be positive".to_string()));
        }
        if !self.event_timeout_covers_extraction() {
            tracing::warn!(
                "worker.event_timeout_secs ({:?}) is shorter than a fully retried extraction ({:?}); slow workers will be demoted",
                self.worker.event_timeout(),
                self.extraction.worst_case()
            );
        }
        if self.completion.ledger_ttl_secs < self.completion.retention_secs {
            return Err(Error::Config(
                "completion.ledger_ttl_secs must not be shorter than completion.retention_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a worker blocked on one fully retried extraction request
    /// stays within the event timeout
    pub fn event_timeout_covers_extraction(&self) -> bool {
        match self.worker.event_timeout() {
            Some(limit) if self.worker.enabled => limit >= self.extraction.worst_case(),
            _ => true,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum upload size in bytes (default: 100MB)
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            enable_cors: true,
            max_upload_size: 100 * 1024 * 1024, // 100MB
        }
    }
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Whether background execution is available at all
    pub enabled: bool,
    /// Maximum number of concurrently running workers
    pub max_workers: usize,
    /// A worker that sends no event for this long is treated as crashed.
    /// `None` or `0` disables the ceiling.
    pub event_timeout_secs: Option<u64>,
    /// Capacity of the worker event channel
    pub channel_capacity: usize,
    /// Largest payload (bytes) accepted by the transfer codec
    pub max_transfer_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: num_cpus::get().clamp(1, 4),
            event_timeout_secs: Some(600), // 10 minutes
            channel_capacity: 64,
            max_transfer_bytes: 50 * 1024 * 1024, // 50MB
        }
    }
}

impl WorkerConfig {
    pub fn event_timeout(&self) -> Option<Duration> {
        self.event_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Same-thread fallback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Pause between files so the calling context is not starved
    pub yield_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { yield_ms: 10 }
    }
}

/// Snapshot persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// SQLite database holding batch snapshots and engine records
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        let database_path = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
            .join("docbatch")
            .join("batches.db");

        Self { database_path }
    }
}

/// Completion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// How long a completed/cancelled batch stays resident before removal
    pub retention_secs: u64,
    /// How long a processed-batch ledger entry is kept; must outlive the
    /// retention window
    pub ledger_ttl_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            retention_secs: 300,
            ledger_ttl_secs: 7 * 24 * 3600, // 1 week
        }
    }
}

impl CompletionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_ttl_secs)
    }
}

/// Placeholder estimate used in `AddBatchResponse::estimated_seconds`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    pub seconds_per_file: u64,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self { seconds_per_file: 3 }
    }
}

/// Start-up recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Re-run restored batches that were not terminal
    pub auto_resume: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { auto_resume: true }
    }
}

/// HTTP extraction service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Base URL of the extraction service
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Number of retries for transport failures
    pub max_retries: u32,
}

impl ExtractionConfig {
    /// Longest time one extraction can take: every attempt hitting the
    /// request timeout plus the backoff between attempts
    pub fn worst_case(&self) -> Duration {
        let attempts = u64::from(self.max_retries) + 1;
        let backoff: u64 = (0..self.max_retries).map(|attempt| 2u64.saturating_pow(attempt)).sum();
        Duration::from_secs(self.timeout_secs.saturating_mul(attempts).saturating_add(backoff))
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8091".to_string(),
            timeout_secs: 120,
            max_retries: 2,
        }
    }
}

/// HTTP auto-save sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSinkConfig {
    /// Base URL of the business-record store
    pub base_url: String,
    /// Request timeout in seconds
    #[serde(default = "default_save_timeout")]
    pub timeout_secs: u64,
}

fn default_save_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [worker]
            enabled = false
            event_timeout_secs = 30

            [completion]
            retention_secs = 5
            "#,
        )
        .unwrap();

        assert!(!config.worker.enabled);
        assert_eq!(config.worker.channel_capacity, 64);
        assert_eq!(config.worker.event_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.completion.retention(), Duration::from_secs(5));
        assert_eq!(config.estimation.seconds_per_file, 3);
        assert!(config.recovery.auto_resume);
        assert!(config.save_sink.is_none());
    }

    #[test]
    fn test_zero_event_timeout_disables_ceiling() {
        let mut worker = WorkerConfig::default();
        assert_eq!(worker.event_timeout(), Some(Duration::from_secs(600)));

        worker.event_timeout_secs = Some(0);
        assert_eq!(worker.event_timeout(), None);
        worker.event_timeout_secs = None;
        assert_eq!(worker.event_timeout(), None);
    }

    #[test]
    fn test_default_timeout_covers_retried_extraction() {
        let mut config = EngineConfig::default();
        // 3 attempts of 120s plus 1s + 2s backoff
        assert_eq!(config.extraction.worst_case(), Duration::from_secs(363));
        assert!(config.event_timeout_covers_extraction());

        config.worker.event_timeout_secs = Some(300);
        assert!(!config.event_timeout_covers_extraction());
        // only a warning; the engine still starts
        assert!(config.validate().is_ok());

        config.worker.event_timeout_secs = Some(0);
        assert!(config.event_timeout_covers_extraction());
    }

    #[test]
    fn test_validate_rejects_short_ledger_ttl() {
        let mut config = EngineConfig::default();
        config.completion.ledger_ttl_secs = config.completion.retention_secs - 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = EngineConfig::default();
        config.worker.max_workers = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.worker.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docbatch.toml");
        std::fs::write(
            &path,
            r#"
            [save_sink]
            base_url = "http://records.local"
            "#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        let sink = config.save_sink.unwrap();
        assert_eq!(sink.base_url, "http://records.local");
        assert_eq!(sink.timeout_secs, 30);
    }
}
