//! Sources of attestation documents.

use crate::attestation::{AttestationClaims, build_unsigned_attestation};

use super::SignerError;

/// Produces an attestation document binding `claims` into `user_data`.
///
/// Hardware backends talk to the Nitro Security Module; the development
/// provider below fabricates an unsigned document.
pub trait AttestationProvider: Send + Sync {
    fn attest(&self, claims: &AttestationClaims) -> Result<Vec<u8>, SignerError>;
}

/// Unsigned COSE document with a fixed PCR0. Only accepted by verifiers
/// running in signature-only mode.
#[derive(Clone, Debug)]
pub struct DevAttestationProvider {
    pcr0: Vec<u8>,
}

impl DevAttestationProvider {
    pub fn new(pcr0: Vec<u8>) -> Self {
        Self { pcr0 }
    }
}

impl Default for DevAttestationProvider {
    fn default() -> Self {
        Self::new(vec![0; 48])
    }
}

impl AttestationProvider for DevAttestationProvider {
    fn attest(&self, claims: &AttestationClaims) -> Result<Vec<u8>, SignerError> {
        tracing::warn!("using development attestation provider (unsigned document)");
        build_unsigned_attestation(claims, &self.pcr0).map_err(SignerError::Attestation)
    }
}
