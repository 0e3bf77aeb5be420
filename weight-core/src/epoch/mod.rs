//! Epoch timing.
//!
//! Block-derived epoch arithmetic shared by every role, plus:
//!
//! - a drift-tolerant block clock (`clock`),
//! - deterministic work partitioning with a hard cutoff (`partition`),
//! - the primary validator's persisted per-epoch state (`state`).

pub mod clock;
pub mod partition;
pub mod state;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::canonical::constants::{
    EARLY_SUBMISSION_WINDOW, EPOCH_LENGTH, MAX_BLOCK_DRIFT, REVEAL_DEADLINE_BLOCK,
    SUBMIT_CUTOFF_BLOCK, WEIGHT_SUBMISSION_BLOCK,
};

pub use clock::{BlockClock, ClockError};
pub use partition::{CutoffGuard, PartitionAggregator, partition_ranges};
pub use state::{EpochAccumulator, EpochScores, PendingReveals, StateFileError};

/// Why a weight submission is not fresh.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FreshnessError {
    #[error("block drift too large: submitted {submitted}, gateway sees {gateway}")]
    BlockDrift { submitted: u64, gateway: u64 },
    #[error("epoch_id {epoch_id} not accepted at gateway epoch {gateway_epoch}")]
    WrongEpoch { epoch_id: u64, gateway_epoch: u64 },
    #[error("epoch_id {epoch_id} does not match block-derived epoch {block_epoch}")]
    BlockEpochMismatch { epoch_id: u64, block_epoch: u64 },
    #[error("block offset {offset} is before the submission window (starts at {window_start})")]
    TooEarly { offset: u64, window_start: u64 },
}

/// Where a commit epoch's reveal window stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevealStatus {
    /// The commit epoch has not closed yet.
    NotYetOpen,
    Open,
    /// Inside epoch N+1 but past the reveal deadline offset.
    DeadlinePassed,
    /// Epoch N+2 or later.
    Expired,
}

/// Block offsets that drive every role's timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochSchedule {
    pub epoch_length: u64,
    /// Last offset at which commits are accepted.
    pub submit_cutoff: u64,
    /// Offset from which the primary submits and auditors replicate.
    pub weight_submission_block: u64,
    pub max_block_drift: u64,
    pub early_submission_window: u64,
    /// Last offset in epoch N+1 at which epoch N may be revealed.
    pub reveal_deadline: u64,
}

impl Default for EpochSchedule {
    fn default() -> Self {
        Self {
            epoch_length: EPOCH_LENGTH,
            submit_cutoff: SUBMIT_CUTOFF_BLOCK,
            weight_submission_block: WEIGHT_SUBMISSION_BLOCK,
            max_block_drift: MAX_BLOCK_DRIFT,
            early_submission_window: EARLY_SUBMISSION_WINDOW,
            reveal_deadline: REVEAL_DEADLINE_BLOCK,
        }
    }
}

impl EpochSchedule {
    pub fn epoch_of(&self, block: u64) -> u64 {
        block / self.epoch_length
    }

    pub fn offset_in_epoch(&self, block: u64) -> u64 {
        block % self.epoch_length
    }

    pub fn epoch_start(&self, epoch_id: u64) -> u64 {
        epoch_id * self.epoch_length
    }

    pub fn epoch_end(&self, epoch_id: u64) -> u64 {
        self.epoch_start(epoch_id) + self.epoch_length - 1
    }

    pub fn blocks_remaining(&self, block: u64) -> u64 {
        self.epoch_length - self.offset_in_epoch(block)
    }

    pub fn accepts_commits(&self, block: u64) -> bool {
        self.offset_in_epoch(block) <= self.submit_cutoff
    }

    pub fn in_weight_window(&self, block: u64) -> bool {
        self.offset_in_epoch(block) >= self.weight_submission_block
    }

    /// First offset at which a weight submission is considered fresh.
    pub fn submission_window_start(&self) -> u64 {
        self.weight_submission_block
            .saturating_sub(self.early_submission_window)
    }

    /// Gateway-side freshness of a submission for `epoch_id` signed at
    /// `block`, judged against the gateway's own view `gateway_block`.
    pub fn check_freshness(
        &self,
        gateway_block: u64,
        epoch_id: u64,
        block: u64,
    ) -> Result<(), FreshnessError> {
        if gateway_block.abs_diff(block) > self.max_block_drift {
            return Err(FreshnessError::BlockDrift {
                submitted: block,
                gateway: gateway_block,
            });
        }

        let gateway_epoch = self.epoch_of(gateway_block);
        let early_in_epoch = self.offset_in_epoch(gateway_block) < self.max_block_drift;
        let accepted =
            epoch_id == gateway_epoch || (early_in_epoch && epoch_id + 1 == gateway_epoch);
        if !accepted {
            return Err(FreshnessError::WrongEpoch {
                epoch_id,
                gateway_epoch,
            });
        }

        let block_epoch = self.epoch_of(block);
        if epoch_id != block_epoch {
            return Err(FreshnessError::BlockEpochMismatch {
                epoch_id,
                block_epoch,
            });
        }

        let offset = self.offset_in_epoch(block);
        let window_start = self.submission_window_start();
        if offset < window_start {
            return Err(FreshnessError::TooEarly {
                offset,
                window_start,
            });
        }
        Ok(())
    }

    /// Reveals for `commit_epoch` are accepted only during epoch
    /// `commit_epoch + 1`, up to the reveal deadline offset.
    pub fn reveal_status(&self, commit_epoch: u64, current_block: u64) -> RevealStatus {
        let current_epoch = self.epoch_of(current_block);
        if current_epoch <= commit_epoch {
            RevealStatus::NotYetOpen
        } else if current_epoch > commit_epoch + 1 {
            RevealStatus::Expired
        } else if self.offset_in_epoch(current_block) > self.reveal_deadline {
            RevealStatus::DeadlinePassed
        } else {
            RevealStatus::Open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_arithmetic() {
        let s = EpochSchedule::default();
        assert_eq!(s.epoch_of(36_346), 100);
        assert_eq!(s.offset_in_epoch(36_346), 346);
        assert_eq!(s.epoch_start(100), 36_000);
        assert_eq!(s.epoch_end(100), 36_359);
        assert_eq!(s.blocks_remaining(36_346), 14);
        assert!(s.accepts_commits(36_355));
        assert!(!s.accepts_commits(36_356));
        assert!(s.in_weight_window(36_345));
        assert!(!s.in_weight_window(36_344));
    }

    #[test]
    fn freshness_accepts_window_submissions() {
        let s = EpochSchedule::default();
        assert!(s.check_freshness(36_350, 100, 36_346).is_ok());
        assert!(s.check_freshness(36_346, 100, 36_330).is_ok());
    }

    #[test]
    fn freshness_allows_previous_epoch_early_in_next() {
        let s = EpochSchedule::default();
        // Gateway at offset 10 of epoch 101, submission from 100 at offset 355.
        assert!(s.check_freshness(36_370, 100, 36_355).is_ok());
        // Gateway at offset 40: previous epoch closed for good (also drifts).
        assert!(matches!(
            s.check_freshness(36_400, 100, 36_355),
            Err(FreshnessError::BlockDrift { .. })
        ));
    }

    #[test]
    fn freshness_rejections() {
        let s = EpochSchedule::default();
        assert!(matches!(
            s.check_freshness(36_350, 100, 36_300),
            Err(FreshnessError::BlockDrift { .. })
        ));
        assert!(matches!(
            s.check_freshness(36_350, 99, 36_346),
            Err(FreshnessError::WrongEpoch { .. })
        ));
        assert!(matches!(
            s.check_freshness(36_010, 99, 36_005),
            Err(FreshnessError::BlockEpochMismatch { .. })
        ));
        assert_eq!(
            s.check_freshness(36_335, 100, 36_329),
            Err(FreshnessError::TooEarly {
                offset: 329,
                window_start: 330
            })
        );
    }

    #[test]
    fn reveal_window_for_epoch_ten() {
        let s = EpochSchedule::default();
        assert_eq!(s.reveal_status(10, 3_700), RevealStatus::NotYetOpen);
        assert_eq!(s.reveal_status(10, 3_960), RevealStatus::Open);
        assert_eq!(s.reveal_status(10, 3_960 + 328), RevealStatus::Open);
        assert_eq!(s.reveal_status(10, 3_960 + 329), RevealStatus::DeadlinePassed);
        assert_eq!(s.reveal_status(10, 4_320), RevealStatus::Expired);
    }
}
