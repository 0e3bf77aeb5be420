//! Hardware attestation verification (AWS Nitro Enclaves).
//!
//! The verifier decides whether a blob proves that a given public key was
//! generated inside an enclave running allowlisted code. Full verification
//! runs, in order:
//!
//! 1. COSE_Sign1 + attestation document parsing (`cose`),
//! 2. leaf validity and the certificate chain to the pinned root (`chain`),
//! 3. the COSE signature with the leaf key,
//! 4. PCR0 against the role's allowlist (`allowlist`),
//! 5. only then the `user_data` claims (pubkey, purpose, epoch).
//!
//! `user_data` is attacker-controlled until PCR0 has been matched, so no
//! claim is trusted before step 4. The signature-only mode skips 2–4 and
//! is always reported as [`TrustLevel::SignatureOnly`].

pub mod allowlist;
pub mod chain;
pub mod cose;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::canonical::constants::purposes;

pub use allowlist::Pcr0Allowlist;
pub use cose::{AttestationDocument, CoseSign1};

/// How much an attestation result can be trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    FullNitro,
    SignatureOnly,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::FullNitro => "full_nitro",
            TrustLevel::SignatureOnly => "signature_only",
        }
    }
}

/// Which allowlist an attestation is checked against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Gateway,
    Validator,
}

/// Verification depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMode {
    Full,
    SignatureOnly,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("invalid base64 attestation: {0}")]
    Encoding(String),
    #[error("invalid COSE_Sign1: {0}")]
    Cose(String),
    #[error("invalid attestation document: {0}")]
    Document(String),
    #[error("certificate validity: {0}")]
    CertificateValidity(String),
    #[error("certificate chain: {0}")]
    Chain(String),
    #[error("COSE signature: {0}")]
    Signature(String),
    #[error("PCR0 not present in attestation")]
    Pcr0Missing,
    #[error("no allowed PCR0 values configured for this role")]
    NoAllowlist,
    #[error("PCR0 {0} is not allowlisted")]
    Pcr0NotAllowed(String),
    #[error("enclave pubkey mismatch: expected {expected}, got {actual:?}")]
    PubkeyMismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("purpose mismatch: expected {expected}, got {actual}")]
    PurposeMismatch { expected: String, actual: String },
    #[error("expected_epoch_id is required for validator weight attestations")]
    EpochRequired,
    #[error("epoch mismatch: expected {expected}, got {actual:?}")]
    EpochMismatch { expected: u64, actual: Option<u64> },
    #[error("signature-only attestation is refused in production")]
    SignatureOnlyForbidden,
    #[error("allowlist HTTP client: {0}")]
    AllowlistClient(String),
}

impl AttestationError {
    /// Short machine-readable stage name.
    pub fn stage(&self) -> &'static str {
        match self {
            AttestationError::Encoding(_) => "encoding",
            AttestationError::Cose(_) => "cose",
            AttestationError::Document(_) => "document",
            AttestationError::CertificateValidity(_) => "certificate_validity",
            AttestationError::Chain(_) => "certificate_chain",
            AttestationError::Signature(_) => "cose_signature",
            AttestationError::Pcr0Missing
            | AttestationError::NoAllowlist
            | AttestationError::Pcr0NotAllowed(_) => "pcr0",
            AttestationError::PubkeyMismatch { .. } => "pubkey",
            AttestationError::PurposeMismatch { .. } => "purpose",
            AttestationError::EpochRequired | AttestationError::EpochMismatch { .. } => "epoch",
            AttestationError::SignatureOnlyForbidden => "mode",
            AttestationError::AllowlistClient(_) => "allowlist",
        }
    }
}

/// Claims carried in the attestation's `user_data`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationClaims {
    pub enclave_pubkey: Option<String>,
    pub code_hash: Option<String>,
    pub purpose: Option<String>,
    pub epoch_id: Option<u64>,
}

impl AttestationClaims {
    /// Parses `user_data` as JSON, falling back to CBOR.
    pub fn from_user_data(raw: &[u8]) -> Option<Self> {
        if let Ok(json) = serde_json::from_slice::<JsonValue>(raw) {
            return Some(Self::from_json(&json));
        }
        let cbor: ciborium::value::Value = ciborium::de::from_reader(raw).ok()?;
        let json = cbor_to_json(cbor)?;
        Some(Self::from_json(&json))
    }

    fn from_json(json: &JsonValue) -> Self {
        let text = |key: &str| json.get(key).and_then(JsonValue::as_str).map(str::to_string);
        Self {
            enclave_pubkey: text("enclave_pubkey").or_else(|| text("enclave_public_key")),
            code_hash: text("code_hash"),
            purpose: text("purpose"),
            epoch_id: json.get("epoch_id").and_then(JsonValue::as_u64),
        }
    }

    /// JSON `user_data` as produced by our enclaves.
    pub fn to_user_data(&self) -> Vec<u8> {
        let mut map = serde_json::Map::new();
        if let Some(pk) = &self.enclave_pubkey {
            map.insert("enclave_pubkey".into(), pk.clone().into());
        }
        if let Some(code) = &self.code_hash {
            map.insert("code_hash".into(), code.clone().into());
        }
        if let Some(purpose) = &self.purpose {
            map.insert("purpose".into(), purpose.clone().into());
        }
        if let Some(epoch) = self.epoch_id {
            map.insert("epoch_id".into(), epoch.into());
        }
        crate::canonical::canonical_json_value(&JsonValue::Object(map)).into_bytes()
    }
}

fn cbor_to_json(value: ciborium::value::Value) -> Option<JsonValue> {
    use ciborium::value::Value as C;
    Some(match value {
        C::Null => JsonValue::Null,
        C::Bool(b) => JsonValue::Bool(b),
        C::Text(s) => JsonValue::String(s),
        C::Bytes(b) => JsonValue::String(hex::encode(b)),
        C::Integer(i) => {
            let i = i128::from(i);
            if let Ok(u) = u64::try_from(i) {
                JsonValue::from(u)
            } else {
                JsonValue::from(i64::try_from(i).ok()?)
            }
        }
        C::Float(f) => JsonValue::from(f),
        C::Array(items) => {
            JsonValue::Array(items.into_iter().map(cbor_to_json).collect::<Option<_>>()?)
        }
        C::Map(entries) => {
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                let C::Text(k) = k else { continue };
                map.insert(k, cbor_to_json(v)?);
            }
            JsonValue::Object(map)
        }
        C::Tag(_, inner) => cbor_to_json(*inner)?,
        _ => return None,
    })
}

/// What the caller expects the attestation to prove.
#[derive(Clone, Debug)]
pub struct AttestationRequest<'a> {
    pub role: Role,
    pub expected_pubkey: Option<&'a str>,
    pub expected_purpose: Option<&'a str>,
    pub expected_epoch_id: Option<u64>,
    /// Strict PCR0 pin; overrides the role allowlist when set.
    pub expected_pcr0: Option<&'a str>,
}

impl<'a> AttestationRequest<'a> {
    pub fn validator_weights(pubkey: &'a str, epoch_id: u64) -> Self {
        Self {
            role: Role::Validator,
            expected_pubkey: Some(pubkey),
            expected_purpose: Some(purposes::VALIDATOR_WEIGHTS),
            expected_epoch_id: Some(epoch_id),
            expected_pcr0: None,
        }
    }

    pub fn gateway(pubkey: &'a str) -> Self {
        Self {
            role: Role::Gateway,
            expected_pubkey: Some(pubkey),
            expected_purpose: Some(purposes::GATEWAY_EVENT_SIGNING),
            expected_epoch_id: None,
            expected_pcr0: None,
        }
    }
}

/// Outcome of a successful verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VerifiedAttestation {
    pub trust_level: TrustLevel,
    pub pcr0: Option<String>,
    pub module_id: String,
    pub timestamp: u64,
    pub claims: AttestationClaims,
    pub warning: Option<String>,
}

/// Attestation verifier for one deployment.
#[derive(Clone, Debug)]
pub struct AttestationVerifier {
    mode: VerificationMode,
    allowlist: Arc<Pcr0Allowlist>,
    pinned_root: Vec<u8>,
}

impl AttestationVerifier {
    /// Builds a verifier; `production` refuses the signature-only mode.
    pub fn new(
        mode: VerificationMode,
        production: bool,
        allowlist: Arc<Pcr0Allowlist>,
    ) -> Result<Self, AttestationError> {
        if production && mode == VerificationMode::SignatureOnly {
            return Err(AttestationError::SignatureOnlyForbidden);
        }
        Ok(Self {
            mode,
            allowlist,
            pinned_root: chain::nitro_root_der()?,
        })
    }

    /// Swaps the pinned Nitro root for a locally issued one.
    #[cfg(test)]
    pub(crate) fn with_root(mut self, pinned_root: Vec<u8>) -> Self {
        self.pinned_root = pinned_root;
        self
    }

    pub fn mode(&self) -> VerificationMode {
        self.mode
    }

    pub fn allowlist(&self) -> &Arc<Pcr0Allowlist> {
        &self.allowlist
    }

    pub async fn verify_b64(
        &self,
        attestation_b64: &str,
        request: &AttestationRequest<'_>,
    ) -> Result<VerifiedAttestation, AttestationError> {
        let raw = BASE64
            .decode(attestation_b64.trim())
            .map_err(|e| AttestationError::Encoding(e.to_string()))?;
        self.verify(&raw, request).await
    }

    pub async fn verify(
        &self,
        raw: &[u8],
        request: &AttestationRequest<'_>,
    ) -> Result<VerifiedAttestation, AttestationError> {
        match self.mode {
            VerificationMode::Full => {
                self.verify_full(raw, request, chrono::Utc::now().timestamp())
                    .await
            }
            VerificationMode::SignatureOnly => verify_signature_only(raw, request),
        }
    }

    async fn verify_full(
        &self,
        raw: &[u8],
        request: &AttestationRequest<'_>,
        now_unix: i64,
    ) -> Result<VerifiedAttestation, AttestationError> {
        let cose = CoseSign1::from_bytes(raw)?;
        let doc = AttestationDocument::from_cbor(&cose.payload)?;

        chain::check_leaf_validity(&doc.certificate, now_unix)?;
        chain::verify_certificate_chain(&self.pinned_root, &doc.cabundle, &doc.certificate)?;
        chain::verify_cose_signature(&doc.certificate, &cose.sig_structure()?, &cose.signature)?;

        let pcr0 = doc.pcr0_hex().ok_or(AttestationError::Pcr0Missing)?;
        match request.expected_pcr0 {
            Some(pinned) => {
                if !pinned.eq_ignore_ascii_case(&pcr0) {
                    return Err(AttestationError::Pcr0NotAllowed(pcr0));
                }
            }
            None => {
                let allowed = self.allowlist.allowed(request.role).await;
                if allowed.is_empty() {
                    return Err(AttestationError::NoAllowlist);
                }
                if !allowed.iter().any(|a| a == &pcr0) {
                    return Err(AttestationError::Pcr0NotAllowed(pcr0));
                }
            }
        }

        let claims = doc
            .user_data
            .as_deref()
            .and_then(AttestationClaims::from_user_data)
            .unwrap_or_default();
        check_claims(&claims, request)?;

        tracing::debug!(pcr0 = %pcr0, module_id = %doc.module_id, "attestation verified (full_nitro)");
        Ok(VerifiedAttestation {
            trust_level: TrustLevel::FullNitro,
            pcr0: Some(pcr0),
            module_id: doc.module_id,
            timestamp: doc.timestamp,
            claims,
            warning: None,
        })
    }
}

/// Structure and claims only. Never sufficient in production.
pub fn verify_signature_only(
    raw: &[u8],
    request: &AttestationRequest<'_>,
) -> Result<VerifiedAttestation, AttestationError> {
    let cose = CoseSign1::from_bytes(raw)?;
    let doc = AttestationDocument::from_cbor(&cose.payload)?;
    let claims = doc
        .user_data
        .as_deref()
        .and_then(AttestationClaims::from_user_data)
        .unwrap_or_default();
    check_claims(&claims, request)?;

    let warning = "signature-only verification: certificate chain, COSE signature and PCR0 were not checked";
    tracing::warn!(module_id = %doc.module_id, "{warning}");
    Ok(VerifiedAttestation {
        trust_level: TrustLevel::SignatureOnly,
        pcr0: doc.pcr0_hex(),
        module_id: doc.module_id,
        timestamp: doc.timestamp,
        claims,
        warning: Some(warning.to_string()),
    })
}

fn check_claims(
    claims: &AttestationClaims,
    request: &AttestationRequest<'_>,
) -> Result<(), AttestationError> {
    if let Some(expected) = request.expected_pubkey {
        let matches = claims
            .enclave_pubkey
            .as_deref()
            .is_some_and(|actual| actual.eq_ignore_ascii_case(expected));
        if !matches {
            return Err(AttestationError::PubkeyMismatch {
                expected: expected.to_string(),
                actual: claims.enclave_pubkey.clone(),
            });
        }
    }

    if let (Some(expected), Some(actual)) = (request.expected_purpose, claims.purpose.as_deref()) {
        if expected != actual {
            return Err(AttestationError::PurposeMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    if request.expected_purpose == Some(purposes::VALIDATOR_WEIGHTS) {
        let expected = request
            .expected_epoch_id
            .ok_or(AttestationError::EpochRequired)?;
        if claims.epoch_id != Some(expected) {
            return Err(AttestationError::EpochMismatch {
                expected,
                actual: claims.epoch_id,
            });
        }
    }
    Ok(())
}

/// Builds an unsigned attestation document carrying `claims`.
///
/// Used by development enclaves and tests; only the signature-only mode
/// accepts the result.
pub fn build_unsigned_attestation(
    claims: &AttestationClaims,
    pcr0: &[u8],
) -> Result<Vec<u8>, AttestationError> {
    let mut pcrs = std::collections::BTreeMap::new();
    pcrs.insert(0, pcr0.to_vec());
    let doc = AttestationDocument {
        module_id: "dev-enclave".to_string(),
        timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        digest: "SHA384".to_string(),
        pcrs,
        certificate: vec![0],
        cabundle: Vec::new(),
        public_key: None,
        user_data: Some(claims.to_user_data()),
        nonce: None,
    };
    let cose = CoseSign1 {
        protected: Vec::new(),
        unprotected: ciborium::value::Value::Map(Vec::new()),
        payload: doc.to_cbor()?,
        signature: Vec::new(),
    };
    cose.to_bytes()
}

pub fn encode_attestation_b64(raw: &[u8]) -> String {
    BASE64.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(epoch: Option<u64>) -> AttestationClaims {
        AttestationClaims {
            enclave_pubkey: Some("ab".repeat(32)),
            code_hash: Some("c0de".into()),
            purpose: Some(purposes::VALIDATOR_WEIGHTS.into()),
            epoch_id: epoch,
        }
    }

    fn verifier(mode: VerificationMode) -> AttestationVerifier {
        AttestationVerifier::new(mode, false, Arc::new(Pcr0Allowlist::fallback())).unwrap()
    }

    #[test]
    fn production_refuses_signature_only() {
        let err = AttestationVerifier::new(
            VerificationMode::SignatureOnly,
            true,
            Arc::new(Pcr0Allowlist::fallback()),
        )
        .unwrap_err();
        assert_eq!(err, AttestationError::SignatureOnlyForbidden);
    }

    #[tokio::test]
    async fn signature_only_extracts_claims_with_warning() {
        let raw = build_unsigned_attestation(&claims(Some(100)), &[1; 48]).unwrap();
        let pubkey = "ab".repeat(32);
        let verified = verifier(VerificationMode::SignatureOnly)
            .verify(&raw, &AttestationRequest::validator_weights(&pubkey, 100))
            .await
            .unwrap();
        assert_eq!(verified.trust_level, TrustLevel::SignatureOnly);
        assert!(verified.warning.is_some());
        assert_eq!(verified.claims.epoch_id, Some(100));
        assert_eq!(verified.pcr0.as_deref(), Some("01".repeat(48).as_str()));
    }

    #[tokio::test]
    async fn epoch_binding_prevents_replay() {
        let raw = build_unsigned_attestation(&claims(Some(100)), &[1; 48]).unwrap();
        let pubkey = "ab".repeat(32);
        let err = verifier(VerificationMode::SignatureOnly)
            .verify(&raw, &AttestationRequest::validator_weights(&pubkey, 101))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AttestationError::EpochMismatch {
                expected: 101,
                actual: Some(100)
            }
        );
    }

    #[tokio::test]
    async fn validator_purpose_requires_expected_epoch() {
        let raw = build_unsigned_attestation(&claims(Some(5)), &[1; 48]).unwrap();
        let pubkey = "ab".repeat(32);
        let mut request = AttestationRequest::validator_weights(&pubkey, 5);
        request.expected_epoch_id = None;
        let err = verifier(VerificationMode::SignatureOnly)
            .verify(&raw, &request)
            .await
            .unwrap_err();
        assert_eq!(err, AttestationError::EpochRequired);
    }

    #[tokio::test]
    async fn wrong_pubkey_and_purpose_are_rejected() {
        let raw = build_unsigned_attestation(&claims(Some(5)), &[1; 48]).unwrap();
        let other = "cd".repeat(32);
        let err = verifier(VerificationMode::SignatureOnly)
            .verify(&raw, &AttestationRequest::validator_weights(&other, 5))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "pubkey");

        let pubkey = "ab".repeat(32);
        let err = verifier(VerificationMode::SignatureOnly)
            .verify(&raw, &AttestationRequest::gateway(&pubkey))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "purpose");
    }

    #[tokio::test]
    async fn missing_purpose_is_tolerated() {
        let mut c = claims(None);
        c.purpose = None;
        let raw = build_unsigned_attestation(&c, &[1; 48]).unwrap();
        let pubkey = "ab".repeat(32);
        let verified = verifier(VerificationMode::SignatureOnly)
            .verify(&raw, &AttestationRequest::gateway(&pubkey))
            .await
            .unwrap();
        assert_eq!(verified.claims.purpose, None);
    }

    #[tokio::test]
    async fn full_mode_rejects_unsigned_documents() {
        let raw = build_unsigned_attestation(&claims(Some(100)), &[1; 48]).unwrap();
        let pubkey = "ab".repeat(32);
        let err = verifier(VerificationMode::Full)
            .verify(&raw, &AttestationRequest::validator_weights(&pubkey, 100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttestationError::Chain(_) | AttestationError::CertificateValidity(_)
        ));
    }

    #[tokio::test]
    async fn garbage_base64_fails_early() {
        let err = verifier(VerificationMode::Full)
            .verify_b64("%%%not-base64", &AttestationRequest::gateway("00"))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "encoding");
    }

    #[test]
    fn cbor_user_data_is_accepted() {
        use ciborium::value::Value as C;
        let mut raw = Vec::new();
        ciborium::ser::into_writer(
            &C::Map(vec![
                (C::Text("enclave_public_key".into()), C::Text("ff".into())),
                (C::Text("epoch_id".into()), C::Integer(7u64.into())),
            ]),
            &mut raw,
        )
        .unwrap();
        let parsed = AttestationClaims::from_user_data(&raw).unwrap();
        assert_eq!(parsed.enclave_pubkey.as_deref(), Some("ff"));
        assert_eq!(parsed.epoch_id, Some(7));
    }

    /// A root and leaf issued like the Nitro PKI, with the leaf key kept
    /// for signing COSE payloads.
    struct TestPki {
        root_der: Vec<u8>,
        leaf_der: Vec<u8>,
        leaf_key: p384::ecdsa::SigningKey,
    }

    impl TestPki {
        fn issue() -> Self {
            use p384::pkcs8::DecodePrivateKey;
            use rcgen::{
                BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, PKCS_ECDSA_P384_SHA384,
                date_time_ymd,
            };

            let root_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
            let mut root_params = CertificateParams::new(Vec::<String>::new()).unwrap();
            root_params
                .distinguished_name
                .push(DnType::CommonName, "test.nitro-enclaves");
            root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            root_params.not_before = date_time_ymd(2020, 1, 1);
            root_params.not_after = date_time_ymd(2090, 1, 1);
            let root = root_params.self_signed(&root_key).unwrap();

            let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
            let mut leaf_params = CertificateParams::new(Vec::<String>::new()).unwrap();
            leaf_params
                .distinguished_name
                .push(DnType::CommonName, "i-0test-enc01");
            leaf_params.not_before = date_time_ymd(2020, 1, 1);
            leaf_params.not_after = date_time_ymd(2090, 1, 1);
            let leaf = leaf_params.signed_by(&leaf_key, &root, &root_key).unwrap();

            Self {
                root_der: root.der().to_vec(),
                leaf_der: leaf.der().to_vec(),
                leaf_key: p384::ecdsa::SigningKey::from_pkcs8_der(&leaf_key.serialize_der())
                    .unwrap(),
            }
        }

        fn document(&self, claims: &AttestationClaims, pcr0: &[u8]) -> Vec<u8> {
            use p384::ecdsa::signature::Signer;

            let mut pcrs = std::collections::BTreeMap::new();
            pcrs.insert(0, pcr0.to_vec());
            let doc = AttestationDocument {
                module_id: "i-0test-enc01".to_string(),
                timestamp: 1_750_000_000_000,
                digest: "SHA384".to_string(),
                pcrs,
                certificate: self.leaf_der.clone(),
                cabundle: vec![self.root_der.clone()],
                public_key: None,
                user_data: Some(claims.to_user_data()),
                nonce: None,
            };
            let mut cose = CoseSign1 {
                // {1: -35}, ES384
                protected: vec![0xa1, 0x01, 0x38, 0x22],
                unprotected: ciborium::value::Value::Map(Vec::new()),
                payload: doc.to_cbor().unwrap(),
                signature: Vec::new(),
            };
            let signature: p384::ecdsa::Signature =
                self.leaf_key.sign(&cose.sig_structure().unwrap());
            cose.signature = signature.to_bytes().to_vec();
            cose.to_bytes().unwrap()
        }

        fn verifier(&self, allowed_validator_pcr0: &[u8]) -> AttestationVerifier {
            let allowlist =
                Pcr0Allowlist::fixed(Vec::new(), vec![hex::encode(allowed_validator_pcr0)]);
            AttestationVerifier::new(VerificationMode::Full, true, Arc::new(allowlist))
                .unwrap()
                .with_root(self.root_der.clone())
        }
    }

    #[tokio::test]
    async fn full_mode_accepts_allowlisted_pcr0() {
        let pki = TestPki::issue();
        let raw = pki.document(&claims(Some(100)), &[7; 48]);
        let pubkey = "ab".repeat(32);

        let verified = pki
            .verifier(&[7; 48])
            .verify(&raw, &AttestationRequest::validator_weights(&pubkey, 100))
            .await
            .unwrap();
        assert_eq!(verified.trust_level, TrustLevel::FullNitro);
        assert_eq!(verified.pcr0.as_deref(), Some("07".repeat(48).as_str()));
        assert_eq!(verified.module_id, "i-0test-enc01");
        assert_eq!(verified.claims.code_hash.as_deref(), Some("c0de"));
        assert!(verified.warning.is_none());
    }

    #[tokio::test]
    async fn full_mode_checks_pcr0_before_claims() {
        let pki = TestPki::issue();
        let pubkey = "ab".repeat(32);
        let other = "cd".repeat(32);

        let unlisted = pki.document(&claims(Some(100)), &[8; 48]);
        let err = pki
            .verifier(&[7; 48])
            .verify(&unlisted, &AttestationRequest::validator_weights(&pubkey, 100))
            .await
            .unwrap_err();
        assert_eq!(err, AttestationError::Pcr0NotAllowed("08".repeat(48)));
        assert_eq!(err.stage(), "pcr0");

        // Wrong claims too, but the measurement fails first.
        let err = pki
            .verifier(&[7; 48])
            .verify(&unlisted, &AttestationRequest::validator_weights(&other, 100))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "pcr0");

        let listed = pki.document(&claims(Some(100)), &[7; 48]);
        let err = pki
            .verifier(&[7; 48])
            .verify(&listed, &AttestationRequest::validator_weights(&other, 100))
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "pubkey");

        // A strict pin overrides the allowlist.
        let pin = "08".repeat(48);
        let mut pinned = AttestationRequest::validator_weights(&pubkey, 100);
        pinned.expected_pcr0 = Some(&pin);
        pki.verifier(&[7; 48]).verify(&unlisted, &pinned).await.unwrap();
    }

    #[tokio::test]
    async fn full_mode_rejects_foreign_roots_and_tampering() {
        let pki = TestPki::issue();
        let stranger = TestPki::issue();
        let raw = pki.document(&claims(Some(100)), &[7; 48]);
        let pubkey = "ab".repeat(32);
        let request = AttestationRequest::validator_weights(&pubkey, 100);

        let err = stranger
            .verifier(&[7; 48])
            .verify(&raw, &request)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "certificate_chain");

        let mut cose = CoseSign1::from_bytes(&raw).unwrap();
        let mut doc = AttestationDocument::from_cbor(&cose.payload).unwrap();
        doc.user_data = Some(claims(Some(101)).to_user_data());
        cose.payload = doc.to_cbor().unwrap();
        let err = pki
            .verifier(&[7; 48])
            .verify(&cose.to_bytes().unwrap(), &request)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "cose_signature");
    }
}
