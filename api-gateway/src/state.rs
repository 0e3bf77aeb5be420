//! Shared application state.

use std::sync::Arc;

use tokio::sync::Mutex;

use weight_core::attestation::AttestationClaims;
use weight_core::attestation::encode_attestation_b64;
use weight_core::canonical::constants::{event_types, purposes};
use weight_core::canonical::LogEntry;
use weight_core::epoch::BlockClock;
use weight_core::signer::AttestationProvider;
use weight_core::storage::GatewayStore;
use weight_core::transparency::LoggerError;
use weight_core::{
    AttestationVerifier, ChainClient, EnclaveKeypair, EventLogger, GatewayAttestation,
    MetricsRegistry,
};

use crate::config::GatewayConfig;
use crate::ratelimit::{RateLimiter, RateLimits};

/// Shared state held by the API and background tasks.
///
/// This is wrapped in an [`Arc`] and passed to request handlers via Axum's
/// `State` extractor.
pub struct AppState {
    pub config: GatewayConfig,
    /// Transparency log writer; owns the gateway's event-signing key.
    pub logger: EventLogger<dyn GatewayStore>,
    pub chain: Arc<dyn ChainClient>,
    pub clock: BlockClock<dyn ChainClient>,
    pub verifier: AttestationVerifier,
    /// The gateway's own attestation, served on `/attestation/document`.
    pub attestation: GatewayAttestation,
    pub rate_limiter: RateLimiter,
    /// Held from the duplicate check of a commit or reveal batch until its
    /// insert, so each batch is logged at most once.
    pub batch_lock: Mutex<()>,
    pub metrics: Arc<MetricsRegistry>,
}

/// Thread-safe alias for `AppState`.
pub type SharedState = Arc<AppState>;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("transparency log: {0}")]
    Log(#[from] LoggerError),
    #[error("gateway attestation: {0}")]
    Attestation(String),
    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl AppState {
    /// Opens a boot session on `store` with a fresh enclave key and attests
    /// to that key with `provider`. Nothing is logged yet; see
    /// [`AppState::announce`].
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn GatewayStore>,
        chain: Arc<dyn ChainClient>,
        verifier: AttestationVerifier,
        provider: &dyn AttestationProvider,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, StartupError> {
        let keypair = EnclaveKeypair::generate();
        let enclave_pubkey = keypair.public_key_hex();
        let claims = AttestationClaims {
            enclave_pubkey: Some(enclave_pubkey.clone()),
            code_hash: Some(config.code_hash.clone()),
            purpose: Some(purposes::GATEWAY_EVENT_SIGNING.to_string()),
            epoch_id: None,
        };
        let document = provider
            .attest(&claims)
            .map_err(|e| StartupError::Attestation(e.to_string()))?;

        let attestation = GatewayAttestation {
            enclave_pubkey,
            attestation_document: encode_attestation_b64(&document),
            code_hash: config.code_hash.clone(),
            purpose: purposes::GATEWAY_EVENT_SIGNING.to_string(),
        };
        let logger = EventLogger::new(store, keypair)?;

        Ok(Self {
            clock: BlockClock::new(chain.clone()),
            config,
            logger,
            chain,
            verifier,
            attestation,
            rate_limiter: RateLimiter::new(RateLimits::default()),
            batch_lock: Mutex::new(()),
            metrics,
        })
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        self.logger.store()
    }

    /// Logs `ENCLAVE_RESTART` followed by `GATEWAY_ATTESTATION`. Must run
    /// before the server accepts requests.
    pub async fn announce(&self) -> Result<(), StartupError> {
        let restart = self.logger.publish_restart_event().await?;
        self.count_event(event_types::ENCLAVE_RESTART);
        tracing::info!(
            boot_id = %self.logger.boot_id(),
            event_hash = %restart.event_hash,
            "enclave restart published"
        );

        let payload = serde_json::to_value(&self.attestation)?;
        self.log_event(event_types::GATEWAY_ATTESTATION, payload, None)
            .await?;
        Ok(())
    }

    /// Appends one event and counts it.
    pub async fn log_event(
        &self,
        event_type: &'static str,
        payload: serde_json::Value,
        nonce: Option<&str>,
    ) -> Result<LogEntry, LoggerError> {
        let entry = self.logger.log_event(event_type, payload, nonce).await?;
        self.count_event(event_type);
        Ok(entry)
    }

    fn count_event(&self, event_type: &str) {
        self.metrics
            .gateway
            .events_logged_total
            .with_label_values(&[event_type])
            .inc();
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::test_support::{harness, state_on};
    use crate::config::GatewayConfig;
    use weight_core::canonical::constants::event_types;
    use weight_core::chain_client::InMemoryChain;
    use weight_core::storage::{EventQuery, LogStore};
    use weight_core::transparency::verify_log_segment;
    use weight_core::{RocksDbConfig, RocksDbStore};

    #[tokio::test]
    async fn startup_logs_restart_then_attestation() {
        let h = harness().await;
        let page = h
            .store
            .events(&EventQuery {
                limit: 10,
                ..EventQuery::default()
            })
            .unwrap();
        let types: Vec<_> = page.events.iter().map(|e| e.event_type().to_string()).collect();
        assert_eq!(
            types,
            vec![event_types::ENCLAVE_RESTART, event_types::GATEWAY_ATTESTATION]
        );
        verify_log_segment(&page.events, Some(&h.state.attestation.enclave_pubkey)).unwrap();
        assert_eq!(
            page.events[1].signed_event.payload["enclave_pubkey"],
            h.state.attestation.enclave_pubkey
        );
    }

    async fn boot(store: Arc<RocksDbStore>) -> super::AppState {
        state_on(GatewayConfig::default(), store, Arc::new(InMemoryChain::new(1))).await
    }

    #[tokio::test]
    async fn restart_links_to_the_previous_session() {
        let dir = TempDir::new().unwrap();
        let db = RocksDbConfig {
            path: dir.path().join("db").to_string_lossy().into_owned(),
            create_if_missing: true,
        };

        let first_tip = {
            let store = Arc::new(RocksDbStore::open(&db).unwrap());
            let state = boot(store.clone()).await;
            state
                .log_event(event_types::ARWEAVE_CHECKPOINT, serde_json::json!({}), None)
                .await
                .unwrap();
            store.tip().unwrap().unwrap().event_hash
        };

        let store = Arc::new(RocksDbStore::open(&db).unwrap());
        let state = boot(store.clone()).await;
        let page = store
            .events(&EventQuery {
                limit: 10,
                boot_id: Some(state.logger.boot_id().to_string()),
                ..EventQuery::default()
            })
            .unwrap();
        let restart = &page.events[0];
        assert!(restart.is_restart());
        assert_eq!(restart.signed_event.monotonic_seq, 1);
        assert_eq!(restart.signed_event.prev_event_hash.as_deref(), Some(first_tip.as_str()));
        assert_eq!(
            restart.signed_event.payload["prev_log_tip_event_hash"],
            first_tip.as_str()
        );
    }
}
