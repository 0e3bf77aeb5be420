//! Weight core library crate.
//!
//! Building blocks for publishing subnet weights from an attested enclave
//! and for holding every other validator to them:
//!
//! - the canonical codec shared by every party (`canonical`),
//! - Nitro attestation verification and PCR0 allowlists (`attestation`),
//! - the enclave weight signer (`signer`),
//! - the hash-chained transparency log (`transparency`, `storage`),
//! - epoch timing, partitioning and persisted validator state (`epoch`),
//! - chain and gateway clients (`chain_client`, `gateway_client`),
//! - the primary validator and auditor replicator roles (`primary`, `auditor`),
//! - per-epoch audit reports (`audit`),
//! - Prometheus metrics (`metrics`) and node configuration (`config`).
//!
//! The `api-gateway` crate and the `weight-node` binary compose these
//! pieces into running services.

pub mod attestation;
pub mod audit;
pub mod auditor;
pub mod canonical;
pub mod chain_client;
pub mod config;
pub mod epoch;
pub mod gateway_client;
pub mod metrics;
pub mod primary;
pub mod signer;
pub mod storage;
pub mod transparency;
pub mod types;

// Re-export top-level configuration types.
pub use config::{AttestationConfig, ConfigError, EndpointConfig, MetricsConfig, NodeConfig};

// Re-export the two validator roles.
pub use auditor::{Auditor, AuditorConfig, AuditorError, BurnReason, EpochVerdict};
pub use primary::{LeadValidation, PrimaryConfig, PrimaryError, PrimaryValidator};

// Re-export verification and signing entry points.
pub use attestation::{AttestationVerifier, Pcr0Allowlist, VerificationMode};
pub use signer::{EnclaveKeypair, WeightSigner};
pub use transparency::EventLogger;

// Re-export storage backends.
pub use storage::{InMemoryStore, RocksDbConfig, RocksDbStore, StorageError};

// Re-export clients.
pub use chain_client::{ChainClient, HttpChainClient};
pub use gateway_client::{GatewayClient, HttpGatewayClient};

// Re-export metrics registry.
pub use metrics::{MetricsRegistry, run_prometheus_http_server};

pub use epoch::EpochSchedule;

// Re-export domain types at the crate root for convenience.
pub use types::*;
