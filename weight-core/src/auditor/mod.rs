//! Auditor replicator.
//!
//! An auditor copies the primary's published weights onto the chain under
//! its own hotkey, but only after checking them end to end:
//!
//! 1. the enclave attestation (full Nitro in production, with a code-hash
//!    pin),
//! 2. the bundle hash and the enclave's Ed25519 signature over it,
//! 3. the hotkey → enclave binding,
//! 4. the gateway's signed transparency entry for the bundle, when the
//!    gateway's own attestation was verified at startup,
//! 5. that the primary put the same weights on chain (`equivocation`).
//!
//! Integrity failures burn the epoch: 100% of the auditor's weight goes to
//! the burn uid. Transient unavailability never burns; the cycle is
//! skipped and retried.

pub mod equivocation;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::attestation::{AttestationError, AttestationRequest, AttestationVerifier, VerificationMode};
use crate::canonical::constants::{BLOCK_TIME_SECS, BURN_UID, DEFAULT_NETUID};
use crate::canonical::{
    BindingExpectations, bundle_hash, fixed16_to_float, validate_weights_invariants,
    verify_binding_message, verify_ed25519_hex, verify_log_entry,
};
use crate::chain_client::{ChainClient, ChainError};
use crate::epoch::{BlockClock, ClockError, EpochSchedule};
use crate::gateway_client::{GatewayClient, GatewayClientError};
use crate::metrics::AuditorMetrics;
use crate::types::PublishedBundle;

pub use equivocation::{ComparisonMethod, check_equivocation};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditorState {
    Idle,
    Fetching,
    Verifying,
    Replicating,
    Burning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnReason {
    AttestationFailed,
    HashMismatch,
    SignatureInvalid,
    EquivocationDetected,
}

impl BurnReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BurnReason::AttestationFailed => "attestation_failed",
            BurnReason::HashMismatch => "hash_mismatch",
            BurnReason::SignatureInvalid => "signature_invalid",
            BurnReason::EquivocationDetected => "equivocation_detected",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditorError {
    #[error("invalid auditor configuration: {0}")]
    Config(String),
    #[error("gateway attestation rejected: {0}")]
    GatewayAttestation(AttestationError),
    #[error(transparent)]
    Gateway(#[from] GatewayClientError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error("epoch {epoch_id} ended before it was handled")]
    EpochRolledOver { epoch_id: u64 },
}

impl AuditorError {
    /// Whether the next poll may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            AuditorError::Gateway(e) => e.is_transient(),
            AuditorError::Chain(e) => e.is_transient(),
            AuditorError::Clock(_) | AuditorError::EpochRolledOver { .. } => true,
            AuditorError::Config(_) | AuditorError::GatewayAttestation(_) => false,
        }
    }
}

/// What happened to one epoch.
#[derive(Clone, Debug, PartialEq)]
pub enum EpochVerdict {
    Replicated {
        comparison: ComparisonMethod,
        uids: Vec<u32>,
        weights: Vec<f64>,
    },
    Burned {
        reason: BurnReason,
        detail: String,
    },
    /// The gateway has no bundle for the epoch yet.
    Absent,
}

/// Why a bundle check did not pass.
enum CheckFailure {
    Burn(BurnReason, String),
    Transient(AuditorError),
}

#[derive(Clone, Debug)]
pub struct AuditorConfig {
    pub netuid: u64,
    /// Chain endpoint named in validator binding messages.
    pub chain_endpoint: String,
    /// Validator code hash every bundle must carry. Required in production.
    pub expected_code_hash: Option<String>,
    pub production: bool,
    pub poll_interval: Duration,
    /// Wait after the gateway reports no bundle.
    pub absent_backoff: Duration,
    pub burn_uid: u32,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            netuid: u64::from(DEFAULT_NETUID),
            chain_endpoint: "wss://entrypoint-finney.opentensor.ai:443".to_string(),
            expected_code_hash: None,
            production: false,
            poll_interval: Duration::from_secs(BLOCK_TIME_SECS),
            absent_backoff: Duration::from_secs(30),
            burn_uid: BURN_UID,
        }
    }
}

pub struct Auditor<C: ChainClient + ?Sized, G: GatewayClient + ?Sized> {
    config: AuditorConfig,
    schedule: EpochSchedule,
    chain: Arc<C>,
    clock: BlockClock<C>,
    gateway: Arc<G>,
    verifier: AttestationVerifier,
    metrics: Option<AuditorMetrics>,
    state: AuditorState,
    last_handled: Option<u64>,
    gateway_pubkey: Option<String>,
}

impl<C: ChainClient + ?Sized, G: GatewayClient + ?Sized> Auditor<C, G> {
    pub fn new(
        config: AuditorConfig,
        schedule: EpochSchedule,
        chain: Arc<C>,
        gateway: Arc<G>,
        verifier: AttestationVerifier,
    ) -> Result<Self, AuditorError> {
        if config.production {
            if verifier.mode() != VerificationMode::Full {
                return Err(AuditorError::Config(
                    "production auditors require full attestation verification".into(),
                ));
            }
            if config.expected_code_hash.is_none() {
                return Err(AuditorError::Config(
                    "production auditors require a pinned validator code hash".into(),
                ));
            }
        }
        Ok(Self {
            clock: BlockClock::new(chain.clone()),
            config,
            schedule,
            chain,
            gateway,
            verifier,
            metrics: None,
            state: AuditorState::Idle,
            last_handled: None,
            gateway_pubkey: None,
        })
    }

    pub fn with_metrics(mut self, metrics: AuditorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_clock(mut self, clock: BlockClock<C>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> AuditorState {
        self.state
    }

    pub fn last_handled_epoch(&self) -> Option<u64> {
        self.last_handled
    }

    fn transition(&mut self, next: AuditorState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "auditor state");
            self.state = next;
        }
    }

    /// Fetches and verifies the gateway's own attestation and remembers its
    /// event-signing key.
    pub async fn verify_gateway(&mut self) -> Result<(), AuditorError> {
        let doc = self.gateway.attestation_document().await?;
        let request = AttestationRequest::gateway(&doc.enclave_pubkey);
        let verified = self
            .verifier
            .verify_b64(&doc.attestation_document, &request)
            .await
            .map_err(AuditorError::GatewayAttestation)?;
        tracing::info!(
            trust_level = verified.trust_level.as_str(),
            gateway_pubkey = %doc.enclave_pubkey,
            "gateway attestation verified"
        );
        self.gateway_pubkey = Some(doc.enclave_pubkey);
        Ok(())
    }

    async fn verify_bundle(
        &self,
        bundle: &PublishedBundle,
        epoch_id: u64,
    ) -> Result<ComparisonMethod, CheckFailure> {
        let burn = |reason, detail: String| CheckFailure::Burn(reason, detail);

        if let Some(pinned) = &self.config.expected_code_hash {
            if &bundle.validator_code_hash != pinned {
                return Err(burn(
                    BurnReason::AttestationFailed,
                    format!("code hash {} is not pinned", bundle.validator_code_hash),
                ));
            }
        }
        let request =
            AttestationRequest::validator_weights(&bundle.validator_enclave_pubkey, epoch_id);
        let verified = self
            .verifier
            .verify_b64(&bundle.validator_attestation_b64, &request)
            .await
            .map_err(|e| burn(BurnReason::AttestationFailed, format!("{}: {e}", e.stage())))?;
        if verified
            .claims
            .code_hash
            .as_ref()
            .is_some_and(|c| c != &bundle.validator_code_hash)
        {
            return Err(burn(
                BurnReason::AttestationFailed,
                "attested code hash differs from bundle".into(),
            ));
        }

        let widened: Vec<u64> = bundle.weights_u16.iter().map(|w| u64::from(*w)).collect();
        validate_weights_invariants(&bundle.uids, &widened)
            .map_err(|e| burn(BurnReason::HashMismatch, e.to_string()))?;
        let computed = bundle_hash(self.config.netuid, epoch_id, bundle.block, &bundle.pairs());
        if computed != bundle.weights_hash {
            return Err(burn(
                BurnReason::HashMismatch,
                format!("computed {computed}, bundle claims {}", bundle.weights_hash),
            ));
        }

        let hash_bytes = hex::decode(&computed)
            .map_err(|_| burn(BurnReason::HashMismatch, "hash is not hex".into()))?;
        verify_ed25519_hex(
            &bundle.validator_enclave_pubkey,
            &bundle.validator_signature,
            &hash_bytes,
        )
        .map_err(|e| burn(BurnReason::SignatureInvalid, e.to_string()))?;

        verify_binding_message(
            &bundle.binding_message,
            &bundle.validator_hotkey_signature,
            &bundle.validator_hotkey,
            &BindingExpectations {
                netuid: self.config.netuid,
                chain: &self.config.chain_endpoint,
                enclave_pubkey: &bundle.validator_enclave_pubkey,
                code_hash: &bundle.validator_code_hash,
            },
        )
        .map_err(|e| burn(BurnReason::SignatureInvalid, format!("binding: {e}")))?;

        if let Some(gateway_pubkey) = &self.gateway_pubkey {
            self.check_submission_event(bundle, gateway_pubkey).await?;
        }

        let comparison = check_equivocation(bundle, self.chain.as_ref())
            .await
            .map_err(|e| CheckFailure::Transient(e.into()))?;
        if !comparison.is_match() {
            return Err(burn(
                BurnReason::EquivocationDetected,
                "chain weights differ from published bundle".into(),
            ));
        }
        if comparison == ComparisonMethod::NotSubmitted {
            tracing::warn!(epoch_id, "primary has no chain weights yet; accepting bundle");
        }
        Ok(comparison)
    }

    /// The gateway's `WEIGHT_SUBMISSION` entry must be signed by the attested
    /// gateway key and name the same bundle hash.
    async fn check_submission_event(
        &self,
        bundle: &PublishedBundle,
        gateway_pubkey: &str,
    ) -> Result<(), CheckFailure> {
        let entry = match self.gateway.event(&bundle.weight_submission_event_hash).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tracing::warn!(
                    event_hash = %bundle.weight_submission_event_hash,
                    "gateway has no submission event for bundle"
                );
                return Ok(());
            }
            Err(e) => return Err(CheckFailure::Transient(e.into())),
        };
        verify_log_entry(&entry, Some(gateway_pubkey)).map_err(|e| {
            CheckFailure::Burn(BurnReason::SignatureInvalid, format!("submission event: {e}"))
        })?;
        let logged = entry.signed_event.payload["weights_hash"].as_str();
        if logged != Some(bundle.weights_hash.as_str()) {
            return Err(CheckFailure::Burn(
                BurnReason::HashMismatch,
                "submission event names a different bundle".into(),
            ));
        }
        Ok(())
    }

    async fn burn(&mut self, epoch_id: u64, reason: BurnReason) -> Result<(), AuditorError> {
        self.transition(AuditorState::Burning);
        tracing::error!(
            epoch_id,
            reason = reason.as_str(),
            burn_uid = self.config.burn_uid,
            "burning epoch weights"
        );
        self.chain
            .set_weights(self.config.netuid, &[self.config.burn_uid], &[1.0])
            .await?;
        if let Some(m) = &self.metrics {
            m.burns_total.with_label_values(&[reason.as_str()]).inc();
        }
        Ok(())
    }

    /// Runs one full fetch → verify → replicate/burn pass for `epoch_id`.
    pub async fn handle_epoch(&mut self, epoch_id: u64) -> Result<EpochVerdict, AuditorError> {
        let result = self.handle_epoch_inner(epoch_id).await;
        self.transition(AuditorState::Idle);
        result
    }

    async fn handle_epoch_inner(&mut self, epoch_id: u64) -> Result<EpochVerdict, AuditorError> {
        self.transition(AuditorState::Fetching);
        let Some(bundle) = self
            .gateway
            .latest_bundle(self.config.netuid, epoch_id)
            .await?
        else {
            return Ok(EpochVerdict::Absent);
        };

        self.transition(AuditorState::Verifying);
        match self.verify_bundle(&bundle, epoch_id).await {
            Ok(comparison) => {
                self.transition(AuditorState::Replicating);
                let (uids, weights) = fixed16_to_float(&bundle.pairs());
                self.chain
                    .set_weights(self.config.netuid, &uids, &weights)
                    .await?;
                tracing::info!(
                    epoch_id,
                    comparison = comparison.as_str(),
                    weights = uids.len(),
                    "replicated primary weights"
                );
                Ok(EpochVerdict::Replicated {
                    comparison,
                    uids,
                    weights,
                })
            }
            Err(CheckFailure::Burn(reason, detail)) => {
                tracing::warn!(epoch_id, reason = reason.as_str(), %detail, "bundle rejected");
                self.burn(epoch_id, reason).await?;
                Ok(EpochVerdict::Burned { reason, detail })
            }
            Err(CheckFailure::Transient(e)) => Err(e),
        }
    }

    /// One poll. Returns how long to sleep before the next one.
    pub async fn tick(&mut self) -> Result<Duration, AuditorError> {
        let block = self.clock.current_block().await?;
        let epoch_id = self.schedule.epoch_of(block);
        if !self.schedule.in_weight_window(block) || self.last_handled == Some(epoch_id) {
            return Ok(self.config.poll_interval);
        }

        // Abandon the attempt once the epoch is over.
        let remaining =
            Duration::from_secs(self.schedule.blocks_remaining(block) * BLOCK_TIME_SECS);
        let outcome = tokio::time::timeout(remaining, self.handle_epoch(epoch_id)).await;
        self.transition(AuditorState::Idle);

        match outcome {
            Err(_) => Err(AuditorError::EpochRolledOver { epoch_id }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(EpochVerdict::Absent)) => {
                tracing::info!(epoch_id, "no bundle published yet");
                Ok(self.config.absent_backoff)
            }
            Ok(Ok(verdict)) => {
                self.last_handled = Some(epoch_id);
                if let Some(m) = &self.metrics {
                    let label = match verdict {
                        EpochVerdict::Replicated { .. } => "replicated",
                        _ => "burned",
                    };
                    m.verdicts_total.with_label_values(&[label]).inc();
                    m.last_epoch.set(i64::try_from(epoch_id).unwrap_or(i64::MAX));
                }
                Ok(self.config.poll_interval)
            }
        }
    }

    /// Verifies the gateway, then polls until `shutdown` flips.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AuditorError> {
        match self.verify_gateway().await {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "gateway unreachable at startup; event checks disabled");
            }
            Err(e) => return Err(e),
        }

        loop {
            let wait = match self.tick().await {
                Ok(wait) => wait,
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(error = %e, "auditor cycle skipped");
                    } else {
                        tracing::error!(error = %e, "auditor cycle failed");
                    }
                    if let Some(m) = &self.metrics {
                        m.verdicts_total.with_label_values(&["skipped"]).inc();
                    }
                    self.config.absent_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    tracing::info!("auditor shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Genuinely signed bundles for auditor and audit-report tests.

    use std::sync::Arc;

    use sp_core::{Pair, sr25519};

    use crate::attestation::{
        AttestationClaims, AttestationVerifier, Pcr0Allowlist, VerificationMode,
        build_unsigned_attestation, encode_attestation_b64,
    };
    use crate::canonical::constants::purposes;
    use crate::signer::{DevAttestationProvider, SignerConfig, WeightSigner};
    use crate::types::{GatewayAttestation, PublishedBundle};

    pub const CHAIN: &str = "wss://test.endpoint:443";
    pub const CODE_HASH: &str = "ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12ab12";

    pub fn hotkey() -> sr25519::Pair {
        sr25519::Pair::from_string("//Alice", None).expect("dev seed")
    }

    pub fn signer() -> WeightSigner<DevAttestationProvider> {
        let signer = WeightSigner::new(
            SignerConfig {
                netuid: 71,
                chain: CHAIN.into(),
                code_hash: CODE_HASH.into(),
            },
            DevAttestationProvider::default(),
            hotkey(),
        );
        signer.initialize();
        signer
    }

    pub fn signed_bundle(epoch_id: u64, uids: &[u32], weights: &[f64]) -> PublishedBundle {
        let submission = signer()
            .sign_epoch(epoch_id, epoch_id * 360 + 346, uids, weights)
            .expect("sign");
        PublishedBundle::from_submission(
            &submission,
            None,
            format!("ev-{epoch_id}"),
            "2025-01-01T00:00:00Z".into(),
        )
    }

    pub fn dev_verifier() -> AttestationVerifier {
        AttestationVerifier::new(
            VerificationMode::SignatureOnly,
            false,
            Arc::new(Pcr0Allowlist::fallback()),
        )
        .expect("verifier")
    }

    pub fn gateway_attestation(pubkey: &str) -> GatewayAttestation {
        let claims = AttestationClaims {
            enclave_pubkey: Some(pubkey.into()),
            code_hash: Some(CODE_HASH.into()),
            purpose: Some(purposes::GATEWAY_EVENT_SIGNING.into()),
            epoch_id: None,
        };
        let raw = build_unsigned_attestation(&claims, &[0u8; 48]).expect("attestation");
        GatewayAttestation {
            enclave_pubkey: pubkey.into(),
            attestation_document: encode_attestation_b64(&raw),
            code_hash: CODE_HASH.into(),
            purpose: purposes::GATEWAY_EVENT_SIGNING.into(),
        }
    }
}
