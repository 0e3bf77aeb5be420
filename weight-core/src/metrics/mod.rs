//! Metrics and instrumentation.
//!
//! Prometheus metrics for the gateway, the auditor and the primary
//! validator, plus a small HTTP exporter that serves `/metrics` in the
//! Prometheus text format.
//!
//! ```ignore
//! use std::sync::Arc;
//! use weight_core::metrics::{MetricsRegistry, run_prometheus_http_server};
//!
//! let registry = Arc::new(MetricsRegistry::new()?);
//! tokio::spawn(run_prometheus_http_server(registry.clone(), "127.0.0.1:9898".parse()?));
//!
//! registry.auditor.verdicts_total.with_label_values(&["replicated"]).inc();
//! ```

pub mod prometheus;

pub use prometheus::{AuditorMetrics, GatewayMetrics, MetricsRegistry, run_prometheus_http_server};
