//! HTTP client for a chain bridge sidecar.
//!
//! The sidecar owns the chain connection and wallet and exposes:
//!
//! ```json
//! GET  /block                          -> {"block": 36346}
//! GET  /metagraph/{netuid}/hotkeys     -> {"hotkeys": ["5F...", "5G..."]}
//! GET  /weights/{netuid}/{uid}         -> {"weights": [[3, 65535], [7, 0.25]]}
//! POST /set_weights
//! {"netuid": 71, "uids": [3, 7], "weights": [0.8, 0.2], "version_key": 0}
//!                                      -> {"success": true, "message": ""}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Number;

use super::{ChainClient, ChainError};
use crate::canonical::RawChainWeight;
use crate::canonical::constants::VERSION_KEY;

pub struct HttpChainClient {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpChainClient {
    /// `base_url` is the sidecar root, e.g. `"http://127.0.0.1:9944"`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into(),
            client,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        let url = self.endpoint(path);
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        decode(resp).await
    }
}

fn transport(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout
    } else {
        ChainError::Transport(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ChainError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ChainError::Service(format!(
            "chain bridge returned HTTP status {status}"
        )));
    }
    resp.json::<T>()
        .await
        .map_err(|e| ChainError::Protocol(format!("failed to parse JSON response: {e}")))
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    block: u64,
}

#[derive(Debug, Deserialize)]
struct HotkeysResponse {
    hotkeys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WeightsResponse {
    weights: Vec<(u32, Number)>,
}

#[derive(Debug, Serialize)]
struct SetWeightsRequest<'a> {
    netuid: u64,
    uids: &'a [u32],
    weights: &'a [f64],
    version_key: u64,
}

#[derive(Debug, Deserialize)]
struct SetWeightsResponse {
    success: bool,
    #[serde(default)]
    message: String,
}

fn raw_weight(n: &Number) -> Result<RawChainWeight, ChainError> {
    if let Some(v) = n.as_u64() {
        return Ok(RawChainWeight::Fixed(v));
    }
    n.as_f64()
        .map(RawChainWeight::Float)
        .ok_or_else(|| ChainError::Protocol(format!("unrepresentable weight {n}")))
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(self.get_json::<BlockResponse>("/block").await?.block)
    }

    async fn metagraph_hotkeys(&self, netuid: u64) -> Result<Vec<String>, ChainError> {
        let path = format!("/metagraph/{netuid}/hotkeys");
        Ok(self.get_json::<HotkeysResponse>(&path).await?.hotkeys)
    }

    async fn weights(
        &self,
        netuid: u64,
        uid: u32,
    ) -> Result<Vec<(u32, RawChainWeight)>, ChainError> {
        let path = format!("/weights/{netuid}/{uid}");
        let body: WeightsResponse = self.get_json(&path).await?;
        body.weights
            .iter()
            .map(|(target, value)| Ok((*target, raw_weight(value)?)))
            .collect()
    }

    async fn set_weights(
        &self,
        netuid: u64,
        uids: &[u32],
        weights: &[f64],
    ) -> Result<(), ChainError> {
        let url = self.endpoint("/set_weights");
        let body = SetWeightsRequest {
            netuid,
            uids,
            weights,
            version_key: VERSION_KEY,
        };
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let result: SetWeightsResponse = decode(resp).await?;
        if result.success {
            Ok(())
        } else {
            Err(ChainError::Rejected(result.message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_avoids_double_slashes() {
        let c = HttpChainClient::new("http://127.0.0.1:9944/", Duration::from_secs(1)).unwrap();
        assert_eq!(c.endpoint("/block"), "http://127.0.0.1:9944/block");
    }

    #[test]
    fn mixed_weight_representations_parse() {
        let body: WeightsResponse =
            serde_json::from_str(r#"{"weights": [[3, 65535], [7, 0.25]]}"#).unwrap();
        let parsed: Vec<RawChainWeight> = body
            .weights
            .iter()
            .map(|(_, n)| raw_weight(n).unwrap())
            .collect();
        assert_eq!(
            parsed,
            vec![RawChainWeight::Fixed(65535), RawChainWeight::Float(0.25)]
        );
    }

    #[tokio::test]
    async fn unreachable_bridge_is_transient() {
        let c = HttpChainClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = c.current_block().await.unwrap_err();
        assert!(err.is_transient());
    }
}
