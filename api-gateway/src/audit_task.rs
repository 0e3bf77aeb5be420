//! Background task logging one `EPOCH_AUDIT` per netuid per closed epoch.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use weight_core::audit::{EpochAudit, generate_epoch_audit};
use weight_core::canonical::LogEntry;
use weight_core::canonical::constants::event_types;
use weight_core::chain_client::ChainError;
use weight_core::storage::BundleStore;
use weight_core::transparency::LoggerError;

use crate::state::SharedState;

#[derive(Debug, Error)]
pub enum AuditTaskError {
    #[error("chain: {0}")]
    Chain(#[from] ChainError),
    #[error("storage: {0}")]
    Storage(#[from] weight_core::StorageError),
    #[error("log: {0}")]
    Log(#[from] LoggerError),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Audits `epoch_id` on `netuid` and appends the report to the log.
pub async fn audit_epoch(
    state: &SharedState,
    netuid: u64,
    epoch_id: u64,
) -> Result<(EpochAudit, LogEntry), AuditTaskError> {
    let bundle = state.store().latest_bundle(netuid, epoch_id)?;
    let hotkeys = state.chain.metagraph_hotkeys(netuid).await?;
    let audit =
        generate_epoch_audit(netuid, epoch_id, bundle.as_ref(), &hotkeys, state.chain.as_ref())
            .await;
    let entry = state
        .log_event(event_types::EPOCH_AUDIT, serde_json::to_value(&audit)?, None)
        .await?;
    tracing::info!(
        netuid,
        epoch_id,
        status = ?audit.status,
        matching = audit.summary.matching_tee,
        mismatched = audit.summary.mismatched,
        "epoch audit logged"
    );
    Ok((audit, entry))
}

/// Audits each closed epoch once, polling every `interval`.
pub async fn run_epoch_audits(
    state: SharedState,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_audited: BTreeMap<u64, u64> = BTreeMap::new();
    loop {
        match state.clock.current_block().await {
            Ok(block) => {
                let current = state.config.schedule.epoch_of(block);
                if let Some(closed) = current.checked_sub(1) {
                    for netuid in &state.config.allowed_netuids {
                        if last_audited.get(netuid).is_some_and(|e| *e >= closed) {
                            continue;
                        }
                        match audit_epoch(&state, *netuid, closed).await {
                            Ok(_) => {
                                last_audited.insert(*netuid, closed);
                            }
                            Err(e) => {
                                tracing::warn!(
                                    netuid,
                                    epoch_id = closed,
                                    error = %e,
                                    "epoch audit failed"
                                );
                            }
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "epoch audit skipped"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                tracing::info!("epoch audit task shutting down");
                return;
            }
        }
    }
}
