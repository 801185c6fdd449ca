//! Cogbill Service - credit ledger and cog job dispatch over HTTP
//!
//! This is the main entry point for the cogbill service.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cogbill_cog::{CogClientOptions, HttpCogWorker};
use cogbill_engine::{Dispatcher, JobCorrelator, Ledger, LedgerOptions};
use cogbill_service::{create_router, AppState, ServiceConfig};
use cogbill_store::LedgerStore;

/// How often expired correlator entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cogbill=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Cogbill Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        cog_generation = %config.cog_endpoints.generation,
        cog_upscale = %config.cog_endpoints.upscale,
        cog_voiceover = %config.cog_endpoints.voiceover,
        webhook_url = %config.cog_webhook_url,
        "Service configuration loaded"
    );

    let store = open_store(&config)?;
    let ledger = Ledger::new(store, LedgerOptions::default());
    let correlator = JobCorrelator::new(config.correlator_grace());
    let worker = HttpCogWorker::with_options(
        config.cog_endpoints.clone(),
        CogClientOptions {
            bearer_token: config.cog_bearer_token.clone(),
            ..CogClientOptions::default()
        },
    )?;
    let dispatcher = Dispatcher::new(
        ledger,
        correlator.clone(),
        Arc::new(worker),
        config.dispatch_options(),
    );

    let shutdown = CancellationToken::new();
    let sweeper = correlator.spawn_sweeper(SWEEP_INTERVAL, shutdown.clone());

    let state = AppState::new(dispatcher.clone(), config.clone());
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    let signalled = dispatcher.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            signalled.shutdown();
        })
        .await?;

    // Detached jobs still owe a refund or an outcome record.
    dispatcher.shutdown_and_wait().await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Correlator sweeper ended abnormally");
    }

    tracing::info!("Cogbill Service stopped");
    Ok(())
}

type StoreResult = Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error>>;

#[cfg(feature = "rocksdb-backend")]
fn open_store(config: &ServiceConfig) -> StoreResult {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(cogbill_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store(_config: &ServiceConfig) -> StoreResult {
    tracing::warn!(
        "Built without rocksdb-backend - using the in-memory store, data is lost on exit"
    );
    Ok(Arc::new(cogbill_store::MemoryStore::new()))
}
