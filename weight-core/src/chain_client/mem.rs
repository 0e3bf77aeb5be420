//! In-memory chain for tests and local devnets.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{ChainClient, ChainError};
use crate::canonical::RawChainWeight;

/// One recorded `set_weights` call.
#[derive(Clone, Debug, PartialEq)]
pub struct SetWeightsCall {
    pub netuid: u64,
    pub uids: Vec<u32>,
    pub weights: Vec<f64>,
}

#[derive(Default)]
struct ChainState {
    block: u64,
    hotkeys: HashMap<u64, Vec<String>>,
    weights: HashMap<(u64, u32), Vec<(u32, RawChainWeight)>>,
    set_calls: Vec<SetWeightsCall>,
    unavailable: bool,
}

/// Chain state held in memory. `set_weights` writes the caller's row,
/// identified by `caller_uid`.
#[derive(Default)]
pub struct InMemoryChain {
    caller_uid: u32,
    state: Mutex<ChainState>,
}

impl InMemoryChain {
    pub fn new(caller_uid: u32) -> Self {
        Self {
            caller_uid,
            state: Mutex::new(ChainState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChainState>, ChainError> {
        self.state
            .lock()
            .map_err(|_| ChainError::Transport("chain state poisoned".into()))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ChainState) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut g| f(&mut g))
    }

    pub fn set_block(&self, block: u64) {
        self.with_state(|s| s.block = block);
    }

    pub fn advance(&self, blocks: u64) {
        self.with_state(|s| s.block += blocks);
    }

    pub fn set_hotkeys(&self, netuid: u64, hotkeys: Vec<String>) {
        self.with_state(|s| s.hotkeys.insert(netuid, hotkeys));
    }

    pub fn set_raw_weights(&self, netuid: u64, uid: u32, weights: Vec<(u32, RawChainWeight)>) {
        self.with_state(|s| s.weights.insert((netuid, uid), weights));
    }

    /// Makes every call fail with a transport error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.with_state(|s| s.unavailable = unavailable);
    }

    pub fn set_weights_calls(&self) -> Vec<SetWeightsCall> {
        self.with_state(|s| s.set_calls.clone()).unwrap_or_default()
    }

    fn available(&self) -> Result<MutexGuard<'_, ChainState>, ChainError> {
        let guard = self.lock()?;
        if guard.unavailable {
            return Err(ChainError::Transport("chain unavailable".into()));
        }
        Ok(guard)
    }
}

#[async_trait]
impl ChainClient for InMemoryChain {
    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(self.available()?.block)
    }

    async fn metagraph_hotkeys(&self, netuid: u64) -> Result<Vec<String>, ChainError> {
        Ok(self
            .available()?
            .hotkeys
            .get(&netuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn weights(
        &self,
        netuid: u64,
        uid: u32,
    ) -> Result<Vec<(u32, RawChainWeight)>, ChainError> {
        Ok(self
            .available()?
            .weights
            .get(&(netuid, uid))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_weights(
        &self,
        netuid: u64,
        uids: &[u32],
        weights: &[f64],
    ) -> Result<(), ChainError> {
        if uids.len() != weights.len() {
            return Err(ChainError::Rejected("length mismatch".into()));
        }
        let mut state = self.available()?;
        state.set_calls.push(SetWeightsCall {
            netuid,
            uids: uids.to_vec(),
            weights: weights.to_vec(),
        });
        let row = uids
            .iter()
            .zip(weights)
            .map(|(uid, w)| (*uid, RawChainWeight::Float(*w)))
            .collect();
        state.weights.insert((netuid, self.caller_uid), row);
        Ok(())
    }
}
