//! Wire types shared between the enclave signer, the gateway and auditors.
//!
//! These are the JSON bodies exchanged over HTTP. Hash inputs are never
//! built from these structs directly; they go through `crate::canonical`.

pub mod api;
pub mod bundle;

pub use api::{
    CommitAccepted, CommitPayload, CommitRequest, EventsPage, GatewayAttestation, LeadAccepted,
    LeadPayload, LeadRequest, RateLimitStats, Rejection, RevealAccepted, RevealPayload,
    RevealRequest, SubmitAccepted,
};
pub use bundle::{ChainSnapshot, PublishedBundle, WeightSubmission};
