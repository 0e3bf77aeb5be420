//! Enclave-side weight signing.
//!
//! The signer turns the primary validator's float weights into a
//! [`WeightSubmission`]: fixed16 conversion, canonical bundle hash, Ed25519
//! signature by the enclave key, a fresh attestation bound to the epoch,
//! and the operator hotkey's binding signature.

pub mod keys;
pub mod provider;

use std::sync::OnceLock;

use sp_core::crypto::Ss58Codec;
use sp_core::{Pair, sr25519};
use thiserror::Error;

use crate::attestation::{AttestationClaims, AttestationError, encode_attestation_b64};
use crate::canonical::constants::purposes;
use crate::canonical::{
    WeightsError, bundle_hash, create_binding_message, filter_nonzero, float_to_fixed16,
    sign_sr25519_hex,
};
use crate::types::WeightSubmission;

pub use keys::EnclaveKeypair;
pub use provider::{AttestationProvider, DevAttestationProvider};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("enclave keypair not initialized")]
    NotInitialized,
    #[error("no non-zero weights to sign")]
    EmptyWeights,
    #[error(transparent)]
    Weights(#[from] WeightsError),
    #[error("attestation failed: {0}")]
    Attestation(#[from] AttestationError),
    #[error("bundle hash is not valid hex")]
    BadHash,
}

/// Static identity of the signing enclave.
#[derive(Clone, Debug)]
pub struct SignerConfig {
    pub netuid: u64,
    /// Chain endpoint the gateway will check the binding against.
    pub chain: String,
    /// Hash of the validator code running in the enclave.
    pub code_hash: String,
}

pub struct WeightSigner<P: AttestationProvider> {
    config: SignerConfig,
    provider: P,
    hotkey: sr25519::Pair,
    keypair: OnceLock<EnclaveKeypair>,
}

impl<P: AttestationProvider> WeightSigner<P> {
    pub fn new(config: SignerConfig, provider: P, hotkey: sr25519::Pair) -> Self {
        Self {
            config,
            provider,
            hotkey,
            keypair: OnceLock::new(),
        }
    }

    /// Generates the enclave keypair on first call; later calls are no-ops.
    pub fn initialize(&self) -> String {
        self.keypair
            .get_or_init(EnclaveKeypair::generate)
            .public_key_hex()
    }

    pub fn enclave_pubkey(&self) -> Option<String> {
        self.keypair.get().map(EnclaveKeypair::public_key_hex)
    }

    pub fn hotkey_ss58(&self) -> String {
        self.hotkey.public().to_ss58check()
    }

    pub fn code_hash(&self) -> &str {
        &self.config.code_hash
    }

    /// Signs an sr25519 message with the operator hotkey, hex-encoded.
    pub fn sign_with_hotkey(&self, message: &[u8]) -> String {
        sign_sr25519_hex(&self.hotkey, message)
    }

    /// Builds a signed, attested submission for `epoch_id` at `block`.
    pub fn sign_epoch(
        &self,
        epoch_id: u64,
        block: u64,
        uids: &[u32],
        weights: &[f64],
    ) -> Result<WeightSubmission, SignerError> {
        let keypair = self.keypair.get().ok_or(SignerError::NotInitialized)?;

        let pairs = filter_nonzero(&float_to_fixed16(uids, weights)?);
        if pairs.is_empty() {
            return Err(SignerError::EmptyWeights);
        }

        let weights_hash = bundle_hash(self.config.netuid, epoch_id, block, &pairs);
        let hash_bytes = hex::decode(&weights_hash).map_err(|_| SignerError::BadHash)?;
        let signature = keypair.sign_hex(&hash_bytes);

        let enclave_pubkey = keypair.public_key_hex();
        let claims = AttestationClaims {
            enclave_pubkey: Some(enclave_pubkey.clone()),
            code_hash: Some(self.config.code_hash.clone()),
            purpose: Some(purposes::VALIDATOR_WEIGHTS.to_string()),
            epoch_id: Some(epoch_id),
        };
        let attestation = self.provider.attest(&claims)?;

        let binding_message = create_binding_message(
            self.config.netuid,
            &self.config.chain,
            &enclave_pubkey,
            &self.config.code_hash,
            None,
        );
        let hotkey_signature = self.sign_with_hotkey(binding_message.as_bytes());

        tracing::info!(
            epoch_id,
            block,
            weights = pairs.len(),
            weights_hash = %weights_hash,
            "signed weight bundle"
        );

        Ok(WeightSubmission {
            netuid: self.config.netuid,
            epoch_id,
            block,
            uids: pairs.iter().map(|(uid, _)| *uid).collect(),
            weights_u16: pairs.iter().map(|(_, w)| u64::from(*w)).collect(),
            weights_hash,
            validator_hotkey: self.hotkey_ss58(),
            validator_enclave_pubkey: enclave_pubkey,
            validator_signature: signature,
            validator_attestation_b64: encode_attestation_b64(&attestation),
            validator_code_hash: self.config.code_hash.clone(),
            binding_message,
            validator_hotkey_signature: hotkey_signature,
        })
    }
}
