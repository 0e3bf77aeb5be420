//! Top-level configuration for a weight node.
//!
//! `NodeConfig` aggregates everything the `weight-node` binary needs to
//! run as a primary validator or as an auditor:
//!
//! - subnet identity (`network`),
//! - block timing (`schedule`),
//! - attestation policy (`attestation`),
//! - chain bridge and gateway clients (`chain`, `gateway`),
//! - the metrics exporter (`metrics`),
//! - where primary state files live (`state_dir`).
//!
//! Defaults describe a local development setup. `from_env` applies
//! `WEIGHT_*` environment overrides on top.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::attestation::allowlist::DEFAULT_ALLOWLIST_TTL;
use crate::attestation::{AttestationError, AttestationVerifier, Pcr0Allowlist, VerificationMode};
use crate::canonical::constants::DEFAULT_NETUID;
use crate::epoch::EpochSchedule;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0}")]
    Policy(String),
}

/// Subnet identity.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub netuid: u64,
    /// Chain endpoint named in validator binding messages.
    pub chain_endpoint: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            netuid: u64::from(DEFAULT_NETUID),
            chain_endpoint: "wss://entrypoint-finney.opentensor.ai:443".to_string(),
        }
    }
}

/// How attestation documents are checked.
#[derive(Clone, Debug)]
pub struct AttestationConfig {
    pub mode: VerificationMode,
    /// Production refuses signature-only verification and empty allowlists.
    pub production: bool,
    /// Validator code hash pinned by auditors.
    pub expected_code_hash: Option<String>,
    /// Remote PCR0 allowlist document; pinned fallbacks when unset.
    pub allowlist_url: Option<String>,
    pub allowlist_ttl: Duration,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            mode: VerificationMode::SignatureOnly,
            production: false,
            expected_code_hash: None,
            allowlist_url: None,
            allowlist_ttl: DEFAULT_ALLOWLIST_TTL,
        }
    }
}

impl AttestationConfig {
    pub fn allowlist(&self, timeout: Duration) -> Result<Pcr0Allowlist, AttestationError> {
        match &self.allowlist_url {
            Some(url) => Pcr0Allowlist::remote(url.clone(), self.allowlist_ttl, timeout)
                .map_err(|e| AttestationError::AllowlistClient(e.to_string())),
            None => Ok(Pcr0Allowlist::fallback()),
        }
    }

    pub fn verifier(&self, timeout: Duration) -> Result<AttestationVerifier, AttestationError> {
        AttestationVerifier::new(self.mode, self.production, Arc::new(self.allowlist(timeout)?))
    }
}

/// An HTTP peer (chain bridge sidecar or gateway).
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9898)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub network: NetworkConfig,
    pub schedule: EpochSchedule,
    pub attestation: AttestationConfig,
    pub chain: EndpointConfig,
    pub gateway: EndpointConfig,
    pub metrics: MetricsConfig,
    pub state_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            schedule: EpochSchedule::default(),
            attestation: AttestationConfig::default(),
            chain: EndpointConfig {
                base_url: "http://127.0.0.1:9944".to_string(),
                timeout: Duration::from_secs(10),
            },
            gateway: EndpointConfig {
                base_url: "http://127.0.0.1:8081".to_string(),
                timeout: Duration::from_secs(10),
            },
            metrics: MetricsConfig::default(),
            state_dir: PathBuf::from("validator_state"),
        }
    }
}

/// Parses `key` with `FromStr` if `lookup` has it.
pub fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// `true`/`false`/`1`/`0`.
pub fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(None),
        Some("1") | Some("true") => Ok(Some(true)),
        Some("0") | Some("false") => Ok(Some(false)),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
        }),
    }
}

pub fn parse_mode(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<VerificationMode>, ConfigError> {
    match lookup(key).as_deref().map(str::trim) {
        None => Ok(None),
        Some("full") | Some("full_nitro") => Ok(Some(VerificationMode::Full)),
        Some("signature_only") => Ok(Some(VerificationMode::SignatureOnly)),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
        }),
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `WEIGHT_*`
    /// keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&lookup, "WEIGHT_NETUID")? {
            cfg.network.netuid = v;
        }
        if let Some(v) = lookup("WEIGHT_CHAIN_ENDPOINT") {
            cfg.network.chain_endpoint = v;
        }
        if let Some(v) = lookup("WEIGHT_CHAIN_BRIDGE_URL") {
            cfg.chain.base_url = v;
        }
        if let Some(v) = lookup("WEIGHT_GATEWAY_URL") {
            cfg.gateway.base_url = v;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WEIGHT_HTTP_TIMEOUT_SECS")? {
            cfg.chain.timeout = Duration::from_secs(secs);
            cfg.gateway.timeout = Duration::from_secs(secs);
        }
        if let Some(v) = parse_flag(&lookup, "WEIGHT_PRODUCTION")? {
            cfg.attestation.production = v;
            if v {
                cfg.attestation.mode = VerificationMode::Full;
            }
        }
        if let Some(v) = parse_mode(&lookup, "WEIGHT_ATTESTATION_MODE")? {
            cfg.attestation.mode = v;
        }
        if let Some(v) = lookup("WEIGHT_EXPECTED_CODE_HASH") {
            cfg.attestation.expected_code_hash = Some(v.to_ascii_lowercase());
        }
        if let Some(v) = lookup("WEIGHT_PCR0_ALLOWLIST_URL") {
            cfg.attestation.allowlist_url = Some(v);
        }
        if let Some(v) = parse_flag(&lookup, "WEIGHT_METRICS_ENABLED")? {
            cfg.metrics.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "WEIGHT_METRICS_ADDR")? {
            cfg.metrics.listen_addr = v;
        }
        if let Some(v) = lookup("WEIGHT_STATE_DIR") {
            cfg.state_dir = PathBuf::from(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attestation.production && self.attestation.mode != VerificationMode::Full {
            return Err(ConfigError::Policy(
                "production requires full attestation verification".into(),
            ));
        }
        if self.schedule.weight_submission_block >= self.schedule.epoch_length
            || self.schedule.submit_cutoff >= self.schedule.epoch_length
        {
            return Err(ConfigError::Policy(
                "schedule offsets must fall inside the epoch".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_a_dev_setup() {
        let cfg = NodeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.network.netuid, 71);
        assert_eq!(cfg.attestation.mode, VerificationMode::SignatureOnly);
        assert!(!cfg.attestation.production);
        assert_eq!(cfg.schedule, EpochSchedule::default());
    }

    #[test]
    fn overrides_apply() {
        let cfg = NodeConfig::from_lookup(lookup(&[
            ("WEIGHT_NETUID", "401"),
            ("WEIGHT_PRODUCTION", "true"),
            ("WEIGHT_EXPECTED_CODE_HASH", "ABCD"),
            ("WEIGHT_METRICS_ADDR", "0.0.0.0:9100"),
            ("WEIGHT_HTTP_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(cfg.network.netuid, 401);
        assert_eq!(cfg.attestation.mode, VerificationMode::Full);
        assert_eq!(cfg.attestation.expected_code_hash.as_deref(), Some("abcd"));
        assert_eq!(cfg.metrics.listen_addr.port(), 9100);
        assert_eq!(cfg.gateway.timeout, Duration::from_secs(3));
    }

    #[test]
    fn production_cannot_downgrade_attestation() {
        let err = NodeConfig::from_lookup(lookup(&[
            ("WEIGHT_PRODUCTION", "1"),
            ("WEIGHT_ATTESTATION_MODE", "signature_only"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Policy(_)));
    }

    #[test]
    fn malformed_values_name_the_key() {
        let err = NodeConfig::from_lookup(lookup(&[("WEIGHT_NETUID", "seventy")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "WEIGHT_NETUID",
                value: "seventy".into()
            }
        );
    }

    #[tokio::test]
    async fn remote_allowlist_verifier_keeps_fallback_when_unreachable() {
        use crate::attestation::Role;
        use crate::attestation::allowlist::FALLBACK_VALIDATOR_PCR0;

        let cfg = AttestationConfig {
            allowlist_url: Some("http://127.0.0.1:9/pcr0_allowlist.json".into()),
            ..AttestationConfig::default()
        };
        let verifier = cfg.verifier(Duration::from_millis(200)).unwrap();
        assert_eq!(
            verifier.allowlist().allowed(Role::Validator).await,
            vec![FALLBACK_VALIDATOR_PCR0]
        );
        assert_eq!(
            AttestationError::AllowlistClient("tls backend".into()).stage(),
            "allowlist"
        );
    }
}
