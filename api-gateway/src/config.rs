//! API gateway configuration.
//!
//! Defaults describe a permissive development gateway: signature-only
//! attestation, every hotkey and the default netuid accepted. `from_env`
//! reads `GATEWAY_*` overrides; production settings are checked by
//! [`GatewayConfig::validate`].

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use weight_core::canonical::constants::DEFAULT_NETUID;
use weight_core::config::{ConfigError, parse_flag, parse_mode, parse_var};
use weight_core::{
    AttestationConfig, EndpointConfig, EpochSchedule, MetricsConfig, RocksDbConfig,
    VerificationMode,
};

/// Configuration for the API gateway HTTP server.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Address to bind the HTTP server to.
    pub listen_addr: SocketAddr,
    pub storage: RocksDbConfig,
    pub production: bool,
    /// How validator attestations are verified.
    pub attestation: AttestationConfig,
    /// Validator hotkeys allowed to publish weights and commit/reveal.
    /// Empty means "anyone" and is refused in production.
    pub allowed_hotkeys: BTreeSet<String>,
    pub allowed_netuids: BTreeSet<u64>,
    /// Chain endpoint validator binding messages must name.
    pub expected_chain: String,
    /// Code hash the gateway reports in its own attestation.
    pub code_hash: String,
    /// Chain bridge used for block height, metagraph and chain weights.
    pub chain: EndpointConfig,
    pub schedule: EpochSchedule,
    pub metrics: MetricsConfig,
    /// How often the epoch audit task checks for a newly closed epoch.
    pub audit_interval: Duration,
    /// How often stale `/submit` rate limiter entries are dropped.
    pub limiter_prune_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        // Bind to all interfaces so the container port mapping (8081→8081) is reachable
        // from the host when running under docker-compose.
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            storage: RocksDbConfig::default(),
            production: false,
            attestation: AttestationConfig::default(),
            allowed_hotkeys: BTreeSet::new(),
            allowed_netuids: BTreeSet::from([u64::from(DEFAULT_NETUID)]),
            expected_chain: "wss://entrypoint-finney.opentensor.ai:443".to_string(),
            code_hash: "0".repeat(64),
            chain: EndpointConfig {
                base_url: "http://127.0.0.1:9944".to_string(),
                timeout: Duration::from_secs(10),
            },
            schedule: EpochSchedule::default(),
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: SocketAddr::from(([0, 0, 0, 0], 9899)),
            },
            audit_interval: Duration::from_secs(60),
            limiter_prune_interval: Duration::from_secs(3600),
        }
    }
}

fn csv(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&lookup, "GATEWAY_LISTEN_ADDR")? {
            cfg.listen_addr = v;
        }
        if let Some(v) = lookup("GATEWAY_DB_PATH") {
            cfg.storage.path = v;
        }
        if let Some(v) = parse_flag(&lookup, "GATEWAY_PRODUCTION")? {
            cfg.production = v;
            cfg.attestation.production = v;
            if v {
                cfg.attestation.mode = VerificationMode::Full;
            }
        }
        if let Some(v) = parse_mode(&lookup, "GATEWAY_ATTESTATION_MODE")? {
            cfg.attestation.mode = v;
        }
        if let Some(v) = lookup("GATEWAY_PCR0_ALLOWLIST_URL") {
            cfg.attestation.allowlist_url = Some(v);
        }
        if let Some(v) = lookup("GATEWAY_ALLOWED_HOTKEYS") {
            cfg.allowed_hotkeys = csv(&v).map(str::to_string).collect();
        }
        if let Some(v) = lookup("GATEWAY_ALLOWED_NETUIDS") {
            cfg.allowed_netuids = csv(&v)
                .map(|n| {
                    n.parse().map_err(|_| ConfigError::Invalid {
                        key: "GATEWAY_ALLOWED_NETUIDS",
                        value: v.clone(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = lookup("GATEWAY_EXPECTED_CHAIN") {
            cfg.expected_chain = v;
        }
        if let Some(v) = lookup("GATEWAY_CODE_HASH") {
            cfg.code_hash = v.to_ascii_lowercase();
        }
        if let Some(v) = lookup("GATEWAY_CHAIN_BRIDGE_URL") {
            cfg.chain.base_url = v;
        }
        if let Some(v) = parse_flag(&lookup, "GATEWAY_METRICS_ENABLED")? {
            cfg.metrics.enabled = v;
        }
        if let Some(v) = parse_var(&lookup, "GATEWAY_METRICS_ADDR")? {
            cfg.metrics.listen_addr = v;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GATEWAY_AUDIT_INTERVAL_SECS")? {
            cfg.audit_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "GATEWAY_LIMITER_PRUNE_SECS")? {
            cfg.limiter_prune_interval = Duration::from_secs(secs.max(1));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_netuids.is_empty() {
            return Err(ConfigError::Policy("no netuid is allowed".into()));
        }
        if self.production {
            if self.attestation.mode != VerificationMode::Full {
                return Err(ConfigError::Policy(
                    "production requires full attestation verification".into(),
                ));
            }
            if self.allowed_hotkeys.is_empty() {
                return Err(ConfigError::Policy(
                    "production requires a validator hotkey allowlist".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether `hotkey` may act as a validator.
    pub fn hotkey_allowed(&self, hotkey: &str) -> bool {
        self.allowed_hotkeys.is_empty() || self.allowed_hotkeys.contains(hotkey)
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
    fn dev_defaults_allow_any_hotkey() {
        let cfg = GatewayConfig::from_lookup(|_| None).unwrap();
        assert!(cfg.hotkey_allowed("5Anything"));
        assert!(cfg.allowed_netuids.contains(&71));
        assert_eq!(cfg.listen_addr.port(), 8081);
    }

    #[test]
    fn allowlists_parse_from_csv() {
        let cfg = GatewayConfig::from_lookup(lookup(&[
            ("GATEWAY_ALLOWED_HOTKEYS", "5Primary, 5Auditor"),
            ("GATEWAY_ALLOWED_NETUIDS", "71,401"),
        ]))
        .unwrap();
        assert!(cfg.hotkey_allowed("5Auditor"));
        assert!(!cfg.hotkey_allowed("5Stranger"));
        assert_eq!(cfg.allowed_netuids, BTreeSet::from([71, 401]));
    }

    #[test]
    fn production_requires_allowlist() {
        let err = GatewayConfig::from_lookup(lookup(&[("GATEWAY_PRODUCTION", "true")])).unwrap_err();
        assert!(matches!(err, ConfigError::Policy(_)));

        let cfg = GatewayConfig::from_lookup(lookup(&[
            ("GATEWAY_PRODUCTION", "true"),
            ("GATEWAY_ALLOWED_HOTKEYS", "5Primary"),
        ]))
        .unwrap();
        assert_eq!(cfg.attestation.mode, VerificationMode::Full);
    }

    #[test]
    fn bad_netuid_list_is_rejected() {
        let err =
            GatewayConfig::from_lookup(lookup(&[("GATEWAY_ALLOWED_NETUIDS", "71,x")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "GATEWAY_ALLOWED_NETUIDS",
                ..
            }
        ));
    }
}
