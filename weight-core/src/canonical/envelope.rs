//! Signed request envelopes for the validator and producer relay endpoints.
//!
//! The hotkey signs
//! `"{event_type}:{actor_hotkey}:{nonce}:{ts}:{payload_hash}:{build_id}"`
//! where `payload_hash` is the SHA-256 of the payload's canonical JSON.
//! Nonces are UUIDv4 strings; the gateway rejects reuse through the log's
//! nonce index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sp_core::crypto::Ss58Codec;
use sp_core::{Pair as _, sr25519};
use thiserror::Error;
use uuid::{Uuid, Version};

use super::binding::{BindingError, sign_sr25519_hex, verify_sr25519_hex};
use super::constants::MAX_REQUEST_SKEW_SECS;
use super::json::canonical_hash;
use super::timestamps::canonical_timestamp;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("payload could not be encoded: {0}")]
    Encoding(String),
    #[error("payload_hash does not match payload")]
    PayloadHashMismatch,
    #[error("signature invalid: {0}")]
    Signature(#[from] BindingError),
    #[error("nonce is not a UUIDv4: {0}")]
    BadNonce(String),
    #[error("timestamp unparseable: {0}")]
    BadTimestamp(String),
    #[error("timestamp {skew_secs}s away from gateway clock")]
    StaleTimestamp { skew_secs: i64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedRequest<P> {
    pub event_type: String,
    pub actor_hotkey: String,
    pub nonce: String,
    pub ts: String,
    pub payload_hash: String,
    pub build_id: String,
    pub signature: String,
    pub payload: P,
}

impl<P: Serialize> SignedRequest<P> {
    /// Builds and signs a request with a fresh nonce and timestamp.
    pub fn sign(
        event_type: &str,
        hotkey: &sr25519::Pair,
        build_id: &str,
        payload: P,
    ) -> Result<Self, EnvelopeError> {
        let payload_hash =
            canonical_hash(&payload).map_err(|e| EnvelopeError::Encoding(e.to_string()))?;
        let mut request = Self {
            event_type: event_type.to_string(),
            actor_hotkey: hotkey.public().to_ss58check(),
            nonce: Uuid::new_v4().to_string(),
            ts: canonical_timestamp(),
            payload_hash,
            build_id: build_id.to_string(),
            signature: String::new(),
            payload,
        };
        request.signature = sign_sr25519_hex(hotkey, request.signed_message().as_bytes());
        Ok(request)
    }

    pub fn signed_message(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.event_type,
            self.actor_hotkey,
            self.nonce,
            self.ts,
            self.payload_hash,
            self.build_id
        )
    }

    pub fn verify_payload_hash(&self) -> Result<(), EnvelopeError> {
        let computed =
            canonical_hash(&self.payload).map_err(|e| EnvelopeError::Encoding(e.to_string()))?;
        if computed != self.payload_hash {
            return Err(EnvelopeError::PayloadHashMismatch);
        }
        Ok(())
    }

    pub fn verify_signature(&self) -> Result<(), EnvelopeError> {
        verify_sr25519_hex(
            self.signed_message().as_bytes(),
            &self.signature,
            &self.actor_hotkey,
        )?;
        Ok(())
    }

    pub fn check_nonce_format(&self) -> Result<(), EnvelopeError> {
        match Uuid::parse_str(&self.nonce) {
            Ok(uuid) if uuid.get_version() == Some(Version::Random) => Ok(()),
            _ => Err(EnvelopeError::BadNonce(self.nonce.clone())),
        }
    }

    /// Accepts timestamps within [`MAX_REQUEST_SKEW_SECS`] of `now`.
    pub fn check_timestamp(&self, now: DateTime<Utc>) -> Result<(), EnvelopeError> {
        let ts = DateTime::parse_from_rfc3339(&self.ts)
            .map_err(|e| EnvelopeError::BadTimestamp(e.to_string()))?
            .with_timezone(&Utc);
        let skew_secs = (now - ts).num_seconds();
        if skew_secs.abs() > MAX_REQUEST_SKEW_SECS {
            return Err(EnvelopeError::StaleTimestamp { skew_secs });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::{Value, json};
    use sp_core::Pair;

    fn alice() -> sr25519::Pair {
        sr25519::Pair::from_string("//Alice", None).expect("dev seed")
    }

    fn request() -> SignedRequest<Value> {
        SignedRequest::sign(
            "VALIDATION_COMMIT_BATCH",
            &alice(),
            "build-1",
            json!({"epoch_id": 100, "validations": []}),
        )
        .unwrap()
    }

    #[test]
    fn signed_request_verifies() {
        let req = request();
        req.verify_payload_hash().unwrap();
        req.verify_signature().unwrap();
        req.check_nonce_format().unwrap();
        req.check_timestamp(Utc::now()).unwrap();
        assert!(req.signed_message().starts_with("VALIDATION_COMMIT_BATCH:5"));
    }

    #[test]
    fn payload_tampering_breaks_the_hash() {
        let mut req = request();
        req.payload["epoch_id"] = json!(101);
        assert_eq!(
            req.verify_payload_hash(),
            Err(EnvelopeError::PayloadHashMismatch)
        );
    }

    #[test]
    fn resigned_fields_break_the_signature() {
        let mut req = request();
        req.build_id = "build-2".into();
        assert!(matches!(
            req.verify_signature(),
            Err(EnvelopeError::Signature(BindingError::BadSignature))
        ));
    }

    #[test]
    fn nonce_must_be_uuid_v4() {
        let mut req = request();
        req.nonce = "not-a-uuid".into();
        assert!(req.check_nonce_format().is_err());
        req.nonce = "00000000-0000-1000-8000-000000000000".into();
        assert!(req.check_nonce_format().is_err());
    }

    #[test]
    fn timestamp_skew_is_bounded() {
        let req = request();
        let late = Utc::now() + Duration::seconds(481);
        assert!(matches!(
            req.check_timestamp(late),
            Err(EnvelopeError::StaleTimestamp { .. })
        ));
        assert!(req.check_timestamp(Utc::now() - Duration::seconds(400)).is_ok());
    }
}
