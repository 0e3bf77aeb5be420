//! Primary validator state that must survive a restart.
//!
//! Two JSON files under the state directory:
//!
//! - `weights_history.json`: per-epoch miner score totals,
//! - `pending_reveals.json`: salted decisions waiting for the reveal window.
//!
//! Writes go to a temporary sibling first and are renamed into place.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{EpochSchedule, RevealStatus};
use crate::canonical::{ValidationReveal, canonical_timestamp};

/// Epochs kept in the accumulator file.
pub const MAX_RETAINED_EPOCHS: u64 = 50;

pub const ACCUMULATOR_FILE: &str = "weights_history.json";
pub const PENDING_REVEALS_FILE: &str = "pending_reveals.json";

#[derive(Debug, Error)]
pub enum StateFileError {
    #[error("state file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("state file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StateFileError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StateFileError::Json {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StateFileError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StateFileError> {
    let io_err = |source| StateFileError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StateFileError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

/// Score totals for one epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochScores {
    pub epoch: u64,
    pub start_block: u64,
    pub end_block: u64,
    /// Miner hotkey → summed effective reputation score.
    pub miner_scores: BTreeMap<String, f64>,
    pub approved_lead_count: u64,
    pub last_updated: String,
}

impl EpochScores {
    fn empty(schedule: &EpochSchedule, epoch: u64) -> Self {
        Self {
            epoch,
            start_block: schedule.epoch_start(epoch),
            end_block: schedule.epoch_start(epoch + 1),
            miner_scores: BTreeMap::new(),
            approved_lead_count: 0,
            last_updated: canonical_timestamp(),
        }
    }
}

/// Per-epoch miner scores, persisted after every update.
#[derive(Debug)]
pub struct EpochAccumulator {
    path: PathBuf,
    schedule: EpochSchedule,
    epochs: BTreeMap<u64, EpochScores>,
}

impl EpochAccumulator {
    pub fn load(state_dir: &Path, schedule: EpochSchedule) -> Result<Self, StateFileError> {
        let path = state_dir.join(ACCUMULATOR_FILE);
        let epochs = read_json(&path)?;
        Ok(Self {
            path,
            schedule,
            epochs,
        })
    }

    pub fn epoch(&self, epoch: u64) -> Option<&EpochScores> {
        self.epochs.get(&epoch)
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Creates the epoch entry if missing, so an all-deny epoch still has a
    /// record to submit from.
    pub fn ensure_epoch(&mut self, epoch: u64) -> Result<(), StateFileError> {
        if self.epochs.contains_key(&epoch) {
            return Ok(());
        }
        self.epochs
            .insert(epoch, EpochScores::empty(&self.schedule, epoch));
        self.prune(epoch);
        self.save()
    }

    /// Adds an approved lead's score for `miner_hotkey`.
    pub fn record_approved(
        &mut self,
        epoch: u64,
        miner_hotkey: &str,
        score: f64,
    ) -> Result<(), StateFileError> {
        let schedule = self.schedule;
        let entry = self
            .epochs
            .entry(epoch)
            .or_insert_with(|| EpochScores::empty(&schedule, epoch));
        *entry
            .miner_scores
            .entry(miner_hotkey.to_string())
            .or_insert(0.0) += score.max(0.0);
        entry.approved_lead_count += 1;
        entry.last_updated = canonical_timestamp();
        self.prune(epoch);
        self.save()
    }

    /// Summed scores over epochs `current - window ..= current - 1`.
    pub fn rolling_scores(&self, current: u64, window: u64) -> (BTreeMap<String, f64>, u64) {
        let start = current.saturating_sub(window);
        let mut totals = BTreeMap::new();
        let mut leads = 0;
        for scores in self.epochs.range(start..current).map(|(_, s)| s) {
            for (hotkey, score) in &scores.miner_scores {
                *totals.entry(hotkey.clone()).or_insert(0.0) += score;
            }
            leads += scores.approved_lead_count;
        }
        (totals, leads)
    }

    /// Keeps the `MAX_RETAINED_EPOCHS` epochs ending at `current`.
    fn prune(&mut self, current: u64) {
        if self.epochs.len() as u64 <= MAX_RETAINED_EPOCHS {
            return;
        }
        let cutoff = (current + 1).saturating_sub(MAX_RETAINED_EPOCHS);
        let before = self.epochs.len();
        self.epochs.retain(|epoch, _| *epoch >= cutoff);
        tracing::debug!(removed = before - self.epochs.len(), cutoff, "pruned epoch history");
    }

    pub fn save(&self) -> Result<(), StateFileError> {
        write_json(&self.path, &self.epochs)
    }
}

/// Salted decisions committed in an epoch and not yet revealed.
#[derive(Debug)]
pub struct PendingReveals {
    path: PathBuf,
    pending: BTreeMap<u64, Vec<ValidationReveal>>,
}

impl PendingReveals {
    pub fn load(state_dir: &Path) -> Result<Self, StateFileError> {
        let path = state_dir.join(PENDING_REVEALS_FILE);
        let pending = read_json(&path)?;
        Ok(Self { path, pending })
    }

    pub fn epochs(&self) -> Vec<u64> {
        self.pending.keys().copied().collect()
    }

    pub fn get(&self, epoch: u64) -> Option<&[ValidationReveal]> {
        self.pending.get(&epoch).map(Vec::as_slice)
    }

    pub fn add(&mut self, epoch: u64, reveals: Vec<ValidationReveal>) -> Result<(), StateFileError> {
        self.pending.entry(epoch).or_default().extend(reveals);
        self.save()
    }

    /// Removes an epoch after its reveal was accepted.
    pub fn mark_revealed(&mut self, epoch: u64) -> Result<(), StateFileError> {
        if self.pending.remove(&epoch).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// Epochs whose reveal window is open at `current_block`. Epochs whose
    /// window has closed are dropped and persisted.
    pub fn due(
        &mut self,
        schedule: &EpochSchedule,
        current_block: u64,
    ) -> Result<Vec<u64>, StateFileError> {
        let mut due = Vec::new();
        let mut expired = Vec::new();
        for epoch in self.pending.keys() {
            match schedule.reveal_status(*epoch, current_block) {
                RevealStatus::Open => due.push(*epoch),
                RevealStatus::DeadlinePassed | RevealStatus::Expired => expired.push(*epoch),
                RevealStatus::NotYetOpen => {}
            }
        }
        if !expired.is_empty() {
            for epoch in &expired {
                self.pending.remove(epoch);
            }
            tracing::warn!(epochs = ?expired, "dropping pending reveals past their window");
            self.save()?;
        }
        Ok(due)
    }

    fn save(&self) -> Result<(), StateFileError> {
        write_json(&self.path, &self.pending)
    }
}
