//! Block clock with retry and wall-clock estimation.
//!
//! Chain reads go through bounded retries with exponential backoff. When
//! every attempt fails, the last observed block is advanced by the elapsed
//! wall-clock time divided by the block time. Without any observation the
//! clock reports an error rather than guessing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::canonical::constants::BLOCK_TIME_SECS;
use crate::chain_client::{ChainClient, ChainError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("block height unavailable and no cached value: {0}")]
    Unavailable(ChainError),
}

#[derive(Clone, Copy, Debug)]
struct Observation {
    block: u64,
    at: Instant,
}

pub struct BlockClock<C: ChainClient + ?Sized> {
    chain: Arc<C>,
    retries: u32,
    base_backoff: Duration,
    block_time: Duration,
    last: Mutex<Option<Observation>>,
}

impl<C: ChainClient + ?Sized> BlockClock<C> {
    pub fn new(chain: Arc<C>) -> Self {
        Self::with_retry(chain, 3, Duration::from_millis(500))
    }

    pub fn with_retry(chain: Arc<C>, retries: u32, base_backoff: Duration) -> Self {
        Self {
            chain,
            retries: retries.max(1),
            base_backoff,
            block_time: Duration::from_secs(BLOCK_TIME_SECS),
            last: Mutex::new(None),
        }
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    /// Current block, live if possible, estimated otherwise.
    pub async fn current_block(&self) -> Result<u64, ClockError> {
        let mut last_error = ChainError::Timeout;
        for attempt in 0..self.retries {
            match self.chain.current_block().await {
                Ok(block) => {
                    if let Ok(mut last) = self.last.lock() {
                        *last = Some(Observation {
                            block,
                            at: Instant::now(),
                        });
                    }
                    return Ok(block);
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "block read failed");
                    last_error = e;
                    if attempt + 1 < self.retries {
                        tokio::time::sleep(self.base_backoff * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        let cached = self.last.lock().ok().and_then(|g| *g);
        match cached {
            Some(obs) => {
                let estimate = estimate_block(obs.block, obs.at.elapsed(), self.block_time);
                tracing::warn!(
                    cached = obs.block,
                    estimate,
                    error = %last_error,
                    "chain unreachable; estimating block from wall clock"
                );
                Ok(estimate)
            }
            None => Err(ClockError::Unavailable(last_error)),
        }
    }
}

/// `cached + elapsed / block_time`, rounded down.
pub fn estimate_block(cached: u64, elapsed: Duration, block_time: Duration) -> u64 {
    if block_time.is_zero() {
        return cached;
    }
    cached + (elapsed.as_millis() / block_time.as_millis()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_client::InMemoryChain;

    fn clock(chain: Arc<InMemoryChain>) -> BlockClock<InMemoryChain> {
        BlockClock::with_retry(chain, 2, Duration::from_millis(1))
    }

    #[test]
    fn estimation_counts_whole_blocks() {
        let bt = Duration::from_secs(12);
        assert_eq!(estimate_block(100, Duration::from_secs(0), bt), 100);
        assert_eq!(estimate_block(100, Duration::from_secs(35), bt), 102);
        assert_eq!(estimate_block(100, Duration::from_secs(36), bt), 103);
    }

    #[tokio::test]
    async fn outage_without_cache_is_an_error() {
        let chain = Arc::new(InMemoryChain::new(0));
        chain.set_unavailable(true);
        assert!(clock(chain).current_block().await.is_err());
    }

    #[tokio::test]
    async fn outage_after_a_read_falls_back_to_cache() {
        let chain = Arc::new(InMemoryChain::new(0));
        chain.set_block(36_000);
        let clock = clock(chain.clone());
        assert_eq!(clock.current_block().await.unwrap(), 36_000);

        chain.set_unavailable(true);
        let estimate = clock.current_block().await.unwrap();
        assert!((36_000..36_002).contains(&estimate));
    }
}
