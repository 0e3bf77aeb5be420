// src/main.rs
//
// `weight-node`: runs one validator role against a chain bridge and a gateway.
//
// - `primary`: scores arrive as JSON lines on stdin, are committed and
//   revealed through the gateway, and the epoch's weights are signed in the
//   enclave and set on chain.
// - `auditor`: replicates the primary's published weights, or burns.
//
// Both roles expose Prometheus metrics on /metrics and stop on Ctrl-C.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use sp_core::crypto::Ss58Codec;
use sp_core::{Pair, sr25519};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use weight_core::{
    Auditor, AuditorConfig, HttpChainClient, HttpGatewayClient, LeadValidation, MetricsRegistry,
    NodeConfig, PrimaryConfig, PrimaryValidator, WeightSigner, run_prometheus_http_server,
    signer::{DevAttestationProvider, SignerConfig},
};

#[derive(Parser, Debug)]
#[command(name = "weight-node", version, about = "Primary validator or auditor for attested subnet weights")]
struct Cli {
    /// Secret URI of the validator hotkey (e.g. a mnemonic or `//Alice`).
    #[arg(long, env = "WEIGHT_HOTKEY_URI", hide_env_values = true)]
    hotkey_uri: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Sign and publish weights from scored leads read on stdin.
    Primary {
        /// Code hash reported in the enclave binding.
        #[arg(long, env = "WEIGHT_CODE_HASH")]
        code_hash: String,
    },
    /// Replicate published weights or burn.
    Auditor,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("weight_node=info,weight_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run_node(Cli::parse()).await {
        tracing::error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

async fn run_node(cli: Cli) -> Result<(), String> {
    let cfg = NodeConfig::from_env().map_err(|e| format!("invalid configuration: {e}"))?;
    let hotkey = sr25519::Pair::from_string(&cli.hotkey_uri, None)
        .map_err(|e| format!("invalid hotkey URI: {e:?}"))?;

    // ---------------------------
    // Metrics registry + exporter
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
    // Chain bridge + gateway
    // ---------------------------

    let chain = Arc::new(
        HttpChainClient::new(cfg.chain.base_url.clone(), cfg.chain.timeout)
            .map_err(|e| format!("failed to build chain client: {e}"))?,
    );
    let gateway = Arc::new(
        HttpGatewayClient::new(cfg.gateway.base_url.clone(), cfg.gateway.timeout)
            .map_err(|e| format!("failed to build gateway client: {e}"))?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received Ctrl-C, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    match cli.role {
        Role::Auditor => {
            let verifier = cfg
                .attestation
                .verifier(cfg.gateway.timeout)
                .map_err(|e| format!("failed to build attestation verifier: {e}"))?;
            let auditor_cfg = AuditorConfig {
                netuid: cfg.network.netuid,
                chain_endpoint: cfg.network.chain_endpoint.clone(),
                expected_code_hash: cfg.attestation.expected_code_hash.clone(),
                production: cfg.attestation.production,
                ..AuditorConfig::default()
            };
            tracing::info!(
                hotkey = %hotkey.public().to_ss58check(),
                netuid = auditor_cfg.netuid,
                mode = ?verifier.mode(),
                "starting auditor"
            );

            let mut auditor = Auditor::new(auditor_cfg, cfg.schedule, chain, gateway, verifier)
                .map_err(|e| format!("failed to start auditor: {e}"))?
                .with_metrics(metrics.auditor.clone());
            auditor
                .run(shutdown_rx)
                .await
                .map_err(|e| format!("auditor stopped: {e}"))
        }
        Role::Primary { code_hash } => {
            if cfg.attestation.production {
                tracing::warn!(
                    "primary is using the development attestation provider; \
                     production auditors will burn its bundles"
                );
            }
            let signer = WeightSigner::new(
                SignerConfig {
                    netuid: cfg.network.netuid,
                    chain: cfg.network.chain_endpoint.clone(),
                    code_hash,
                },
                DevAttestationProvider::default(),
                hotkey.clone(),
            );
            let primary_cfg = PrimaryConfig {
                netuid: cfg.network.netuid,
                ..PrimaryConfig::default()
            };

            let mut primary = PrimaryValidator::new(
                primary_cfg,
                cfg.schedule,
                chain,
                gateway,
                signer,
                hotkey,
                &cfg.state_dir,
            )
            .map_err(|e| format!("failed to start primary: {e}"))?
            .with_metrics(metrics.auditor.clone());

            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(read_validations(tx));

            primary
                .run(rx, shutdown_rx)
                .await
                .map_err(|e| format!("primary stopped: {e}"))
        }
    }
}

/// One `LeadValidation` per stdin line; malformed lines are skipped.
async fn read_validations(tx: mpsc::Sender<Vec<LeadValidation>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<LeadValidation>(&line) {
                Ok(validation) => {
                    if tx.send(vec![validation]).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed validation line"),
            },
            Ok(None) => {
                tracing::info!("validation input closed");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to read validations");
                return;
            }
        }
    }
}
