//! Manovale Server - Main entry point
//!
//! Hosts the dispatch runtime: the in-process job store with its TTL
//! sweeper, the expiry watcher, and the orchestrators the inbound
//! submission boundary calls into.

use std::sync::Arc;

use manovale_core::{
    config::Config,
    orchestrator::{ExecutionOrchestrator, SubmitOrchestrator},
    store::{InMemoryStore, StoreBackend},
    telemetry,
    watcher::ExpiryWatcher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize telemetry
    let telemetry_handle = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Manovale Server"
    );

    // Job store and its TTL sweeper
    let store = Arc::new(InMemoryStore::new(config.store.clone()));
    let sweeper = store.clone().start_sweeper();
    tracing::info!(table = %config.store.table, "Job store ready");

    // Dead-letter channel
    let dead_letter = config.dead_letter.build_channel()?;
    tracing::info!(channel = dead_letter.name(), queue = %config.dead_letter.queue, "Dead-letter channel ready");

    // Execution orchestrator, shared by both dispatch paths
    let executor = Arc::new(ExecutionOrchestrator::new(
        store.clone() as Arc<dyn StoreBackend>
    ));

    // Expiry watcher over the store's change feed
    let feed = store.subscribe().await;
    let watcher_handle = ExpiryWatcher::new(
        executor.clone(),
        dead_letter,
        config.watcher.clone(),
    )
    .start(feed);
    tracing::info!("Expiry watcher running");

    // Submission boundary (invoked by the external facade)
    let _submitter = SubmitOrchestrator::new(
        store.clone() as Arc<dyn StoreBackend>,
        executor,
    )
    .with_retry_policy(config.execution.retry_policy())
    .with_timeout(config.execution.timeout);
    tracing::info!("Submission interface ready");

    // Run until a shutdown signal arrives
    shutdown_signal().await;

    watcher_handle.stop().await;
    sweeper.stop().await;
    telemetry_handle.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
