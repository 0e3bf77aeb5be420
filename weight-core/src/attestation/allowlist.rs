//! PCR0 allowlist with pinned fallbacks and optional remote refresh.
//!
//! The remote document has the form
//! `{"gateway_pcr0": [{"pcr0": "..."}], "validator_pcr0": [{"pcr0": "..."}]}`.
//! A failed refresh keeps the last good set, so an unreachable allowlist
//! host never widens trust.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::RwLock;

use super::Role;

pub const FALLBACK_GATEWAY_PCR0: &str = "02797d0a3b02fdda186db756b7cae6ef283592bae6ea879c0c19e4ab0a787766bbbd2008eb49eb9de58f7346d6c834d5";
pub const FALLBACK_VALIDATOR_PCR0: &str = "1697ef7e8c095ff5fc3d7e0e79bb7d00d29d0bdfa487d2c7353812ebafb35667ebd428c42db59ad1efe1c2999d1e5d85";

/// PCR0 is a SHA-384 digest.
pub const PCR0_HEX_LEN: usize = 96;

pub const DEFAULT_ALLOWLIST_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct AllowlistEntry {
    pcr0: String,
}

#[derive(Debug, Deserialize)]
struct AllowlistDocument {
    #[serde(default)]
    gateway_pcr0: Vec<AllowlistEntry>,
    #[serde(default)]
    validator_pcr0: Vec<AllowlistEntry>,
}

#[derive(Debug)]
struct AllowlistState {
    gateway: Vec<String>,
    validator: Vec<String>,
    fetched_at: Option<Instant>,
}

/// Role-scoped set of accepted PCR0 measurements.
#[derive(Debug)]
pub struct Pcr0Allowlist {
    source_url: Option<String>,
    ttl: Duration,
    client: reqwest::Client,
    state: RwLock<AllowlistState>,
}

impl Pcr0Allowlist {
    /// Fixed allowlist, never refreshed.
    pub fn fixed(gateway: Vec<String>, validator: Vec<String>) -> Self {
        Self {
            source_url: None,
            ttl: DEFAULT_ALLOWLIST_TTL,
            client: reqwest::Client::new(),
            state: RwLock::new(AllowlistState {
                gateway: normalize(gateway),
                validator: normalize(validator),
                fetched_at: None,
            }),
        }
    }

    /// Pinned fallback values only.
    pub fn fallback() -> Self {
        Self::fixed(
            vec![FALLBACK_GATEWAY_PCR0.to_string()],
            vec![FALLBACK_VALIDATOR_PCR0.to_string()],
        )
    }

    /// Fallback values, refreshed from `url` at most every `ttl`.
    pub fn remote(
        url: impl Into<String>,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            source_url: Some(url.into()),
            ttl,
            client,
            ..Self::fallback()
        })
    }

    /// Current values for `role`, refreshing first if the cache is stale.
    pub async fn allowed(&self, role: Role) -> Vec<String> {
        if self.is_stale().await {
            self.refresh().await;
        }
        let state = self.state.read().await;
        match role {
            Role::Gateway => state.gateway.clone(),
            Role::Validator => state.validator.clone(),
        }
    }

    async fn is_stale(&self) -> bool {
        if self.source_url.is_none() {
            return false;
        }
        match self.state.read().await.fetched_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        }
    }

    /// Fetches the remote document. Errors are logged and the cached set kept.
    pub async fn refresh(&self) {
        let Some(url) = self.source_url.as_deref() else {
            return;
        };

        let fetched = async {
            let resp = self.client.get(url).send().await?.error_for_status()?;
            resp.json::<AllowlistDocument>().await
        }
        .await;

        let mut state = self.state.write().await;
        // Stamp even on failure so a dead host is retried once per TTL.
        state.fetched_at = Some(Instant::now());
        match fetched {
            Ok(doc) => {
                let gateway = normalize(doc.gateway_pcr0.into_iter().map(|e| e.pcr0).collect());
                let validator =
                    normalize(doc.validator_pcr0.into_iter().map(|e| e.pcr0).collect());
                tracing::info!(
                    gateway = gateway.len(),
                    validator = validator.len(),
                    "refreshed PCR0 allowlist"
                );
                if !gateway.is_empty() {
                    state.gateway = gateway;
                }
                if !validator.is_empty() {
                    state.validator = validator;
                }
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "PCR0 allowlist refresh failed; keeping cached values");
            }
        }
    }
}

fn normalize(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| v.len() == PCR0_HEX_LEN && v.chars().all(|c| c.is_ascii_hexdigit()))
        .collect()
}
