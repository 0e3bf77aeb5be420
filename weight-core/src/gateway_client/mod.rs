//! Validator-side access to the gateway.
//!
//! Auditors read published bundles, the gateway's own attestation and
//! transparency events; the primary posts weight submissions and its
//! commit/reveal batches. [`HttpGatewayClient`] does this over HTTP and
//! [`InMemoryGateway`] serves the same calls from memory for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::canonical::LogEntry;
use crate::types::{
    CommitAccepted, CommitRequest, GatewayAttestation, PublishedBundle, Rejection,
    RevealAccepted, RevealRequest, SubmitAccepted, WeightSubmission,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayClientError {
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("gateway request timed out")]
    Timeout,
    #[error("gateway protocol error: {0}")]
    Protocol(String),
    #[error("gateway service error: {0}")]
    Service(String),
    #[error("gateway rejected request ({status}): {}: {}", .rejection.stage, .rejection.reason)]
    Rejected { status: u16, rejection: Rejection },
}

impl GatewayClientError {
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            GatewayClientError::Protocol(_) | GatewayClientError::Rejected { .. }
        )
    }

    /// Rejection stage reported by the gateway, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            GatewayClientError::Rejected { rejection, .. } => Some(&rejection.stage),
            _ => None,
        }
    }
}

#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Bundle for `(netuid, epoch_id)`; `None` when the gateway has none.
    async fn latest_bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
    ) -> Result<Option<PublishedBundle>, GatewayClientError>;

    async fn attestation_document(&self) -> Result<GatewayAttestation, GatewayClientError>;

    async fn event(&self, event_hash: &str) -> Result<Option<LogEntry>, GatewayClientError>;

    async fn submit_weights(
        &self,
        submission: &WeightSubmission,
    ) -> Result<SubmitAccepted, GatewayClientError>;

    async fn submit_commit(
        &self,
        request: &CommitRequest,
    ) -> Result<CommitAccepted, GatewayClientError>;

    async fn submit_reveal(
        &self,
        request: &RevealRequest,
    ) -> Result<RevealAccepted, GatewayClientError>;
}

pub struct HttpGatewayClient {
    base_url: String,
    client: Client,
}

impl HttpGatewayClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayClientError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            GatewayClientError::Transport(format!("failed to build HTTP client: {e}"))
        })?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// GET `path`; a 404 maps to `Ok(None)`.
    async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, GatewayClientError> {
        let url = self.endpoint(path);
        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayClientError::Timeout
            } else {
                GatewayClientError::Transport(format!("HTTP GET {url} failed: {e}"))
            }
        })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GatewayClientError::Service(format!(
                "gateway returned HTTP status {status}"
            )));
        }
        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| GatewayClientError::Protocol(format!("failed to parse JSON response: {e}")))
    }

    /// POST `body` as JSON. Non-2xx responses carrying a rejection body map
    /// to [`GatewayClientError::Rejected`].
    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayClientError> {
        let url = self.endpoint(path);
        let resp = self.client.post(&url).json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayClientError::Timeout
            } else {
                GatewayClientError::Transport(format!("HTTP POST {url} failed: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let code = status.as_u16();
            return match resp.json::<Rejection>().await {
                Ok(rejection) if status.is_client_error() => Err(GatewayClientError::Rejected {
                    status: code,
                    rejection,
                }),
                _ => Err(GatewayClientError::Service(format!(
                    "gateway returned HTTP status {status}"
                ))),
            };
        }
        resp.json::<T>()
            .await
            .map_err(|e| GatewayClientError::Protocol(format!("failed to parse JSON response: {e}")))
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn latest_bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
    ) -> Result<Option<PublishedBundle>, GatewayClientError> {
        self.get_optional(&format!("/weights/latest/{netuid}/{epoch_id}"))
            .await
    }

    async fn attestation_document(&self) -> Result<GatewayAttestation, GatewayClientError> {
        self.get_optional("/attestation/document")
            .await?
            .ok_or_else(|| GatewayClientError::Service("gateway has no attestation".into()))
    }

    async fn event(&self, event_hash: &str) -> Result<Option<LogEntry>, GatewayClientError> {
        self.get_optional(&format!("/weights/transparency/event/{event_hash}"))
            .await
    }

    async fn submit_weights(
        &self,
        submission: &WeightSubmission,
    ) -> Result<SubmitAccepted, GatewayClientError> {
        self.post_json("/weights/submit", submission).await
    }

    async fn submit_commit(
        &self,
        request: &CommitRequest,
    ) -> Result<CommitAccepted, GatewayClientError> {
        self.post_json("/validate", request).await
    }

    async fn submit_reveal(
        &self,
        request: &RevealRequest,
    ) -> Result<RevealAccepted, GatewayClientError> {
        self.post_json("/reveal", request).await
    }
}

/// Gateway data served from memory. Posted requests are recorded and
/// accepted without verification.
#[derive(Default)]
pub struct InMemoryGateway {
    bundles: Mutex<HashMap<(u64, u64), PublishedBundle>>,
    events: Mutex<HashMap<String, LogEntry>>,
    attestation: Mutex<Option<GatewayAttestation>>,
    submissions: Mutex<Vec<WeightSubmission>>,
    commits: Mutex<Vec<CommitRequest>>,
    reveals: Mutex<Vec<RevealRequest>>,
    unavailable: Mutex<bool>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, bundle: PublishedBundle) {
        if let Ok(mut b) = self.bundles.lock() {
            b.insert((bundle.netuid, bundle.epoch_id), bundle);
        }
    }

    pub fn add_event(&self, entry: LogEntry) {
        if let Ok(mut e) = self.events.lock() {
            e.insert(entry.event_hash.clone(), entry);
        }
    }

    pub fn set_attestation(&self, attestation: GatewayAttestation) {
        if let Ok(mut a) = self.attestation.lock() {
            *a = Some(attestation);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut u) = self.unavailable.lock() {
            *u = unavailable;
        }
    }

    pub fn submissions(&self) -> Vec<WeightSubmission> {
        self.submissions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn commits(&self) -> Vec<CommitRequest> {
        self.commits.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn reveals(&self) -> Vec<RevealRequest> {
        self.reveals.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), GatewayClientError> {
        match self.unavailable.lock() {
            Ok(u) if !*u => Ok(()),
            _ => Err(GatewayClientError::Transport("gateway unavailable".into())),
        }
    }
}

fn poisoned<T>(_: T) -> GatewayClientError {
    GatewayClientError::Service("gateway state poisoned".into())
}

#[async_trait]
impl GatewayClient for InMemoryGateway {
    async fn latest_bundle(
        &self,
        netuid: u64,
        epoch_id: u64,
    ) -> Result<Option<PublishedBundle>, GatewayClientError> {
        self.check_available()?;
        Ok(self
            .bundles
            .lock()
            .map_err(poisoned)?
            .get(&(netuid, epoch_id))
            .cloned())
    }

    async fn attestation_document(&self) -> Result<GatewayAttestation, GatewayClientError> {
        self.check_available()?;
        self.attestation
            .lock()
            .map_err(poisoned)?
            .clone()
            .ok_or_else(|| GatewayClientError::Service("gateway has no attestation".into()))
    }

    async fn event(&self, event_hash: &str) -> Result<Option<LogEntry>, GatewayClientError> {
        self.check_available()?;
        Ok(self.events.lock().map_err(poisoned)?.get(event_hash).cloned())
    }

    async fn submit_weights(
        &self,
        submission: &WeightSubmission,
    ) -> Result<SubmitAccepted, GatewayClientError> {
        self.check_available()?;
        self.submissions
            .lock()
            .map_err(poisoned)?
            .push(submission.clone());
        Ok(SubmitAccepted {
            status: "accepted".into(),
            weight_submission_event_hash: submission.weights_hash.clone(),
            trust_level: "signature_only".into(),
        })
    }

    async fn submit_commit(
        &self,
        request: &CommitRequest,
    ) -> Result<CommitAccepted, GatewayClientError> {
        self.check_available()?;
        self.commits.lock().map_err(poisoned)?.push(request.clone());
        Ok(CommitAccepted {
            status: "recorded".into(),
            epoch_id: request.payload.epoch_id,
            validation_count: request.payload.validations.len(),
            event_hash: request.payload_hash.clone(),
            timestamp: request.ts.clone(),
        })
    }

    async fn submit_reveal(
        &self,
        request: &RevealRequest,
    ) -> Result<RevealAccepted, GatewayClientError> {
        self.check_available()?;
        self.reveals.lock().map_err(poisoned)?.push(request.clone());
        Ok(RevealAccepted {
            status: "revealed".into(),
            epoch_id: request.payload.epoch_id,
            reveal_count: request.payload.reveals.len(),
            event_hash: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_gateway_is_transient() {
        let client =
            HttpGatewayClient::new("http://127.0.0.1:9/", Duration::from_millis(200)).unwrap();
        assert_eq!(
            client.endpoint("/weights/latest/71/5"),
            "http://127.0.0.1:9/weights/latest/71/5"
        );
        let err = client.latest_bundle(71, 5).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn in_memory_gateway_reports_absence_and_outage() {
        let gw = InMemoryGateway::new();
        assert!(gw.latest_bundle(71, 1).await.unwrap().is_none());
        assert!(gw.attestation_document().await.is_err());
        gw.set_unavailable(true);
        assert!(gw.latest_bundle(71, 1).await.unwrap_err().is_transient());
    }

    #[test]
    fn rejections_are_not_transient() {
        let err = GatewayClientError::Rejected {
            status: 409,
            rejection: Rejection {
                stage: "duplicate_submission".into(),
                reason: "already submitted".into(),
                detail: None,
            },
        };
        assert!(!err.is_transient());
        assert_eq!(err.stage(), Some("duplicate_submission"));
        assert_eq!(GatewayClientError::Timeout.stage(), None);
    }
}
