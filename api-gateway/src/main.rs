// api-gateway/src/main.rs

//! Weight gateway binary.
//!
//! Verifies attested weight bundles from the primary validator, relays
//! validator commit/reveal batches and miner leads, and serves the
//! hash-chained transparency log:
//!
//! - `GET /health`
//! - `GET /attestation/document`
//! - `POST /weights/submit`
//! - `GET /weights/latest/{netuid}/{epoch_id}`
//! - `GET /weights/current/{netuid}`
//! - `GET /weights/transparency/event/{event_hash}` and `/event/{event_hash}`
//! - `GET /weights/transparency/events`
//! - `POST /validate`, `POST /reveal`, `POST /submit`
//!
//! Every accepted request lands in a RocksDB-backed log signed by the
//! gateway's enclave key. A background task appends one `EPOCH_AUDIT` per
//! closed epoch, and Prometheus metrics are exported on `/metrics`.

mod audit_task;
mod config;
mod error;
mod ratelimit;
mod relay;
mod routes;
mod state;
mod verify;

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use weight_core::signer::DevAttestationProvider;
use weight_core::storage::GatewayStore;
use weight_core::{HttpChainClient, MetricsRegistry, RocksDbStore, run_prometheus_http_server};

use config::GatewayConfig;
use state::{AppState, SharedState};

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("api_gateway=info,weight_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let cfg = GatewayConfig::from_env().map_err(|e| format!("invalid configuration: {e}"))?;

    // ---------------------------
    // Metrics
    // ---------------------------

    let metrics = Arc::new(
        MetricsRegistry::new().map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if cfg.metrics.enabled {
        let metrics_clone = metrics.clone();
        let addr = cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics_clone, addr).await {
                tracing::error!(error = %e, "metrics HTTP server error");
            }
        });
        tracing::info!(%addr, "metrics exporter listening on /metrics");
    }

    // ---------------------------
    // Storage, chain bridge, verifier
    // ---------------------------

    let store: Arc<dyn GatewayStore> = Arc::new(RocksDbStore::open(&cfg.storage).map_err(|e| {
        format!("failed to open RocksDB store at {}: {e}", cfg.storage.path)
    })?);

    let chain = Arc::new(
        HttpChainClient::new(cfg.chain.base_url.clone(), cfg.chain.timeout)
            .map_err(|e| format!("failed to build chain client: {e}"))?,
    );

    let verifier = cfg
        .attestation
        .verifier(cfg.chain.timeout)
        .map_err(|e| format!("failed to build attestation verifier: {e}"))?;

    // ---------------------------
    // Shared state + boot session
    // ---------------------------

    if cfg.production {
        tracing::warn!(
            "gateway is using the development attestation provider; \
             auditors in production mode will reject its attestation"
        );
    }
    let listen_addr = cfg.listen_addr;
    let audit_interval = cfg.audit_interval;
    let prune_interval = cfg.limiter_prune_interval;
    let app_state: SharedState = Arc::new(
        AppState::new(
            cfg,
            store,
            chain,
            verifier,
            &DevAttestationProvider::default(),
            metrics,
        )
        .map_err(|e| format!("failed to initialise gateway state: {e}"))?,
    );
    app_state
        .announce()
        .await
        .map_err(|e| format!("failed to publish boot events: {e}"))?;

    // ---------------------------
    // Background tasks
    // ---------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let audit = tokio::spawn(audit_task::run_epoch_audits(
        app_state.clone(),
        audit_interval,
        shutdown_rx.clone(),
    ));
    let pruning = tokio::spawn(ratelimit::run_pruning(
        app_state.clone(),
        prune_interval,
        shutdown_rx,
    ));

    // ---------------------------
    // HTTP server
    // ---------------------------

    let app = routes::router(app_state);

    tracing::info!(%listen_addr, "weight gateway listening");

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| format!("failed to bind {listen_addr}: {e}"))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("API server error: {e}"));

    let _ = shutdown_tx.send(true);
    if let Err(e) = audit.await {
        tracing::warn!(error = %e, "epoch audit task ended abnormally");
    }
    if let Err(e) = pruning.await {
        tracing::warn!(error = %e, "rate limiter pruning task ended abnormally");
    }
    served
}

/// Waits for Ctrl-C and returns, used for graceful shutdown.
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
