//! Prometheus-backed metrics and HTTP exporter.
//!
//! [`MetricsRegistry`] owns a Prometheus registry under the `weights`
//! namespace with one metrics group per role. The exporter serves
//! `GET /metrics` over `hyper`.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, header::HeaderValue,
    server::conn::http1, service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Gateway ingress metrics.
#[derive(Clone)]
pub struct GatewayMetrics {
    /// Weight submissions by outcome stage (`accepted` or a rejection stage).
    pub submissions_total: IntCounterVec,
    /// Time spent verifying one weight submission, in seconds.
    pub verification_seconds: Histogram,
    /// Relay requests (`validate`, `reveal`, `submit`) by outcome stage.
    pub relay_requests_total: IntCounterVec,
    /// Transparency log appends by event type.
    pub events_logged_total: IntCounterVec,
}

impl GatewayMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let submissions_total = IntCounterVec::new(
            Opts::new(
                "gateway_submissions_total",
                "Weight submissions received, labelled by outcome stage",
            ),
            &["stage"],
        )?;
        registry.register(Box::new(submissions_total.clone()))?;

        // Attestation verification dominates; full mode walks a cert chain.
        let verification_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_verification_seconds",
                "Time to verify a weight submission in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        registry.register(Box::new(verification_seconds.clone()))?;

        let relay_requests_total = IntCounterVec::new(
            Opts::new(
                "gateway_relay_requests_total",
                "Commit, reveal and lead submission requests by endpoint and outcome",
            ),
            &["endpoint", "stage"],
        )?;
        registry.register(Box::new(relay_requests_total.clone()))?;

        let events_logged_total = IntCounterVec::new(
            Opts::new(
                "gateway_events_logged_total",
                "Transparency log events appended, by event type",
            ),
            &["event_type"],
        )?;
        registry.register(Box::new(events_logged_total.clone()))?;

        Ok(Self {
            submissions_total,
            verification_seconds,
            relay_requests_total,
            events_logged_total,
        })
    }
}

/// Auditor and primary validator metrics.
#[derive(Clone)]
pub struct AuditorMetrics {
    /// Epoch verdicts: `replicated`, `burned`, `skipped`.
    pub verdicts_total: IntCounterVec,
    /// Burns by reason.
    pub burns_total: IntCounterVec,
    /// Last epoch the auditor finished handling.
    pub last_epoch: IntGauge,
    /// Weight submissions made by the primary, by outcome.
    pub primary_submissions_total: IntCounterVec,
}

impl AuditorMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let verdicts_total = IntCounterVec::new(
            Opts::new(
                "auditor_verdicts_total",
                "Auditor epoch outcomes (replicated, burned, skipped)",
            ),
            &["verdict"],
        )?;
        registry.register(Box::new(verdicts_total.clone()))?;

        let burns_total = IntCounterVec::new(
            Opts::new("auditor_burns_total", "Auditor burns by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(burns_total.clone()))?;

        let last_epoch = IntGauge::with_opts(Opts::new(
            "auditor_last_epoch",
            "Last epoch handled by the auditor",
        ))?;
        registry.register(Box::new(last_epoch.clone()))?;

        let primary_submissions_total = IntCounterVec::new(
            Opts::new(
                "primary_submissions_total",
                "Primary validator weight submissions by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(primary_submissions_total.clone()))?;

        Ok(Self {
            verdicts_total,
            burns_total,
            last_epoch,
            primary_submissions_total,
        })
    }
}

/// Registry handle shared across tasks.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub gateway: GatewayMetrics,
    pub auditor: AuditorMetrics,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("weights".to_string()), None)?;
        let gateway = GatewayMetrics::register(&registry)?;
        let auditor = AuditorMetrics::register(&registry)?;
        Ok(Self {
            registry,
            gateway,
            auditor,
        })
    }

    /// Encodes all metrics in this registry into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "failed to encode Prometheus metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Serves `GET /metrics` on `addr`; every other path is a 404.
///
/// Intended to be spawned:
///
/// ```ignore
/// let registry = Arc::new(MetricsRegistry::new()?);
/// tokio::spawn(run_prometheus_http_server(registry.clone(), addr));
/// ```
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "prometheus exporter listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                tracing::warn!(error = %err, "prometheus HTTP connection error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.method(), req.uri().path(), &metrics))
}

fn route(method: &Method, path: &str, metrics: &MetricsRegistry) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/metrics") => {
            let mut resp = Response::new(Full::new(Bytes::from(metrics.gather_text())));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            resp
        }
        _ => {
            let mut resp = Response::new(Full::new(Bytes::from("not found")));
            *resp.status_mut() = StatusCode::NOT_FOUND;
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_metrics_register_and_record() {
        let registry = Registry::new();
        let metrics = GatewayMetrics::register(&registry).expect("register metrics");

        metrics
            .submissions_total
            .with_label_values(&["accepted"])
            .inc();
        metrics.verification_seconds.observe(0.012);
        metrics
            .relay_requests_total
            .with_label_values(&["validate", "accepted"])
            .inc();

        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn registry_text_uses_the_weights_namespace() {
        let registry = MetricsRegistry::new().expect("create metrics registry");
        registry
            .auditor
            .verdicts_total
            .with_label_values(&["burned"])
            .inc();
        registry.auditor.last_epoch.set(100);
        let text = registry.gather_text();
        assert!(text.contains("weights_auditor_verdicts_total"));
        assert!(text.contains("weights_auditor_last_epoch 100"));
    }

    #[test]
    fn exporter_routes_only_metrics() {
        let registry = MetricsRegistry::new().expect("create metrics registry");
        assert_eq!(
            route(&Method::GET, "/metrics", &registry).status(),
            StatusCode::OK
        );
        assert_eq!(
            route(&Method::GET, "/other", &registry).status(),
            StatusCode::NOT_FOUND
        );
    }
}
