//! Docbatch server binary
//!
//! Run with: cargo run -p docbatch --bin docbatch-server
//! Set DOCBATCH_CONFIG to a TOML file to override defaults.

use std::sync::Arc;

use docbatch::{
    config::EngineConfig,
    providers::{AutoSaveSink, HttpExtractionService, HttpSaveSink},
    server::DocbatchServer,
    BatchEngine,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docbatch=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::var("DOCBATCH_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading configuration from {}", path);
            EngineConfig::from_file(&path)?
        }
        Err(_) => EngineConfig::default(),
    };

    tracing::info!("Configuration loaded");
    tracing::info!("  - Extraction service: {}", config.extraction.base_url);
    tracing::info!(
        "  - Background workers: {} (max {})",
        config.worker.enabled,
        config.worker.max_workers
    );
    tracing::info!("  - Database: {}", config.persistence.database_path.display());

    let extractor = Arc::new(HttpExtractionService::new(&config.extraction)?);
    let sink: Option<Arc<dyn AutoSaveSink>> = match &config.save_sink {
        Some(sink_config) => {
            tracing::info!("  - Auto-save sink: {}", sink_config.base_url);
            Some(Arc::new(HttpSaveSink::new(sink_config)?) as Arc<dyn AutoSaveSink>)
        }
        None => {
            tracing::info!("  - Auto-save sink: disabled");
            None
        }
    };

    let engine = BatchEngine::new(config, extractor, sink)?;
    let restored = engine.start().await?;
    tracing::info!("Engine ready ({} batch(es) restored)", restored);

    // Log completions as they are delivered
    let mut completions = engine.subscribe_notifications();
    engine.set_foreground(true);
    tokio::spawn(async move {
        while let Ok(notification) = completions.recv().await {
            tracing::info!("Batch {}: {}", notification.batch_id, notification.message());
        }
    });

    let server = DocbatchServer::new(engine);

    println!("\nServer starting...");
    println!("  API: http://{}", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("  API Info: http://{}/api/info", server.address());
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}
