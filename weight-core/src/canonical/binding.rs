//! Hotkey → enclave binding messages.
//!
//! A validator's hotkey signs a pipe-delimited message naming the subnet,
//! the chain endpoint, the enclave public key and the attested code hash.
//! Parsing is fail-closed: malformed tokens, duplicate keys and unknown
//! keys all reject the message.

use std::collections::BTreeMap;

use sp_core::crypto::Ss58Codec;
use sp_core::{Pair as _, sr25519};
use thiserror::Error;

pub const BINDING_MESSAGE_PREFIX: &str = "LEADPOET_VALIDATOR_BINDING";
pub const BINDING_MESSAGE_VERSION: &str = "1";

const KNOWN_KEYS: [&str; 5] = [
    "netuid",
    "chain",
    "enclave_pubkey",
    "validator_code_hash",
    "version",
];
const REQUIRED_KEYS: [&str; 4] = ["netuid", "chain", "enclave_pubkey", "validator_code_hash"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindingError {
    #[error("invalid prefix: expected {BINDING_MESSAGE_PREFIX}")]
    InvalidPrefix,
    #[error("malformed token (no '='): {0}")]
    MalformedToken(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("unknown key: {0}")]
    UnknownKey(String),
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("field {field} does not match expected value")]
    FieldMismatch { field: &'static str },
    #[error("invalid hotkey address: {0}")]
    InvalidHotkey(String),
    #[error("invalid signature encoding")]
    InvalidSignatureEncoding,
    #[error("hotkey signature does not verify")]
    BadSignature,
}

/// Parsed key/value fields of a binding message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingFields {
    pub netuid: String,
    pub chain: String,
    pub enclave_pubkey: String,
    pub validator_code_hash: String,
    pub version: Option<String>,
}

/// Values a binding message must carry to be accepted.
#[derive(Clone, Debug)]
pub struct BindingExpectations<'a> {
    pub netuid: u64,
    pub chain: &'a str,
    pub enclave_pubkey: &'a str,
    pub code_hash: &'a str,
}

pub fn create_binding_message(
    netuid: u64,
    chain: &str,
    enclave_pubkey: &str,
    validator_code_hash: &str,
    version: Option<&str>,
) -> String {
    format!(
        "{BINDING_MESSAGE_PREFIX}|netuid={netuid}|chain={chain}|enclave_pubkey={enclave_pubkey}|validator_code_hash={validator_code_hash}|version={}",
        version.unwrap_or(BINDING_MESSAGE_VERSION)
    )
}

pub fn parse_binding_message(message: &str) -> Result<BindingFields, BindingError> {
    let mut tokens = message.split('|');
    if tokens.next() != Some(BINDING_MESSAGE_PREFIX) {
        return Err(BindingError::InvalidPrefix);
    }

    let mut parts: BTreeMap<&str, &str> = BTreeMap::new();
    for token in tokens {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| BindingError::MalformedToken(token.to_string()))?;
        if parts.insert(key, value).is_some() {
            return Err(BindingError::DuplicateKey(key.to_string()));
        }
    }

    if let Some(unknown) = parts.keys().find(|k| !KNOWN_KEYS.contains(*k)) {
        return Err(BindingError::UnknownKey((*unknown).to_string()));
    }
    for key in REQUIRED_KEYS {
        if !parts.contains_key(key) {
            return Err(BindingError::MissingKey(key));
        }
    }

    let take = |key: &str| parts.get(key).map(|v| (*v).to_string()).unwrap_or_default();
    Ok(BindingFields {
        netuid: take("netuid"),
        chain: take("chain"),
        enclave_pubkey: take("enclave_pubkey"),
        validator_code_hash: take("validator_code_hash"),
        version: parts.get("version").map(|v| (*v).to_string()),
    })
}

/// Verifies field values and the hotkey's SR25519 signature over the raw
/// message bytes.
pub fn verify_binding_message(
    message: &str,
    signature_hex: &str,
    hotkey_ss58: &str,
    expected: &BindingExpectations<'_>,
) -> Result<BindingFields, BindingError> {
    let fields = parse_binding_message(message)?;

    let netuid: u64 = fields
        .netuid
        .parse()
        .map_err(|_| BindingError::FieldMismatch { field: "netuid" })?;
    if netuid != expected.netuid {
        return Err(BindingError::FieldMismatch { field: "netuid" });
    }
    if fields.chain != expected.chain {
        return Err(BindingError::FieldMismatch { field: "chain" });
    }
    if fields.enclave_pubkey != expected.enclave_pubkey {
        return Err(BindingError::FieldMismatch {
            field: "enclave_pubkey",
        });
    }
    if fields.validator_code_hash != expected.code_hash {
        return Err(BindingError::FieldMismatch {
            field: "validator_code_hash",
        });
    }

    verify_sr25519_hex(message.as_bytes(), signature_hex, hotkey_ss58)?;
    Ok(fields)
}

/// Verifies a hex SR25519 signature (optional `0x` prefix) from an SS58
/// address.
pub fn verify_sr25519_hex(
    message: &[u8],
    signature_hex: &str,
    hotkey_ss58: &str,
) -> Result<(), BindingError> {
    let public = sr25519::Public::from_ss58check(hotkey_ss58)
        .map_err(|e| BindingError::InvalidHotkey(format!("{e:?}")))?;
    let raw = hex::decode(signature_hex.trim_start_matches("0x"))
        .map_err(|_| BindingError::InvalidSignatureEncoding)?;
    let signature = sr25519::Signature::try_from(raw.as_slice())
        .map_err(|_| BindingError::InvalidSignatureEncoding)?;

    if sr25519::Pair::verify(&signature, message, &public) {
        Ok(())
    } else {
        Err(BindingError::BadSignature)
    }
}

/// Signs `message` with an SR25519 hotkey, returning hex.
pub fn sign_sr25519_hex(pair: &sr25519::Pair, message: &[u8]) -> String {
    let signature = pair.sign(message);
    let bytes: &[u8] = signature.as_ref();
    hex::encode(bytes)
}
