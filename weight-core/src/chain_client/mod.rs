//! Access to the host chain.
//!
//! Everything the validator roles need from the chain goes through the
//! [`ChainClient`] trait:
//!
//! - the current block height,
//! - metagraph hotkeys (uid = index),
//! - a validator's on-chain weights, which the chain may report as fixed16
//!   integers or as floats,
//! - `set_weights` for the caller's own hotkey.
//!
//! [`http::HttpChainClient`] talks to a chain bridge sidecar over JSON;
//! [`mem::InMemoryChain`] backs tests and local devnets.

pub mod http;
pub mod mem;

use async_trait::async_trait;
use thiserror::Error;

use crate::canonical::RawChainWeight;

pub use http::HttpChainClient;
pub use mem::InMemoryChain;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("chain transport error: {0}")]
    Transport(String),
    #[error("chain request timed out")]
    Timeout,
    #[error("chain protocol error: {0}")]
    Protocol(String),
    #[error("chain service error: {0}")]
    Service(String),
    #[error("set_weights rejected: {0}")]
    Rejected(String),
}

impl ChainError {
    /// Errors worth retrying on the next poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Transport(_) | ChainError::Timeout | ChainError::Service(_)
        )
    }
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_block(&self) -> Result<u64, ChainError>;

    /// Hotkeys of the subnet's metagraph, indexed by uid.
    async fn metagraph_hotkeys(&self, netuid: u64) -> Result<Vec<String>, ChainError>;

    /// Raw weights set by `uid`, as `(target uid, value)`.
    async fn weights(
        &self,
        netuid: u64,
        uid: u32,
    ) -> Result<Vec<(u32, RawChainWeight)>, ChainError>;

    async fn set_weights(
        &self,
        netuid: u64,
        uids: &[u32],
        weights: &[f64],
    ) -> Result<(), ChainError>;
}

/// Looks up the uid of `hotkey` in the metagraph.
pub async fn uid_for_hotkey<C: ChainClient + ?Sized>(
    chain: &C,
    netuid: u64,
    hotkey: &str,
) -> Result<Option<u32>, ChainError> {
    let hotkeys = chain.metagraph_hotkeys(netuid).await?;
    Ok(hotkeys
        .iter()
        .position(|h| h == hotkey)
        .and_then(|i| u32::try_from(i).ok()))
}
