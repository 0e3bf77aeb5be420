//! Turns accumulated miner scores into the float weights the primary signs.
//!
//! Miners share a fixed slice of emissions that scales linearly with how
//! many approved leads the subnet produced; everything not earned goes to
//! the burn uid. Scores of miners no longer in the metagraph are burned
//! rather than redistributed.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::canonical::constants::BURN_UID;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmissionPolicy {
    /// Always burned.
    pub base_burn_share: f64,
    /// Ceiling for miners scored in the epoch being submitted.
    pub current_share: f64,
    /// Ceiling for miners scored over the rolling window.
    pub rolling_share: f64,
    /// Closed epochs counted by the rolling share.
    pub rolling_window: u64,
    /// Approved leads per epoch that earn the full share.
    pub max_leads_per_epoch: u64,
    pub burn_uid: u32,
}

impl Default for EmissionPolicy {
    fn default() -> Self {
        Self {
            base_burn_share: 0.05,
            current_share: 0.0,
            rolling_share: 0.95,
            rolling_window: 30,
            max_leads_per_epoch: 50,
            burn_uid: BURN_UID,
        }
    }
}

/// Scores and approved-lead count for one slice of history.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScoreWindow {
    pub scores: BTreeMap<String, f64>,
    pub approved_leads: u64,
}

impl EmissionPolicy {
    fn approval_rate(&self, leads: u64, epochs: u64) -> f64 {
        let capacity = self.max_leads_per_epoch.saturating_mul(epochs);
        if leads == 0 || capacity == 0 {
            return 0.0;
        }
        (leads as f64 / capacity as f64).min(1.0)
    }

    /// Weights sorted by uid. `hotkeys` is the metagraph indexed by uid.
    ///
    /// With nothing to distribute the result is 100% to the burn uid.
    pub fn compute(
        &self,
        current: &ScoreWindow,
        rolling: &ScoreWindow,
        hotkeys: &[String],
    ) -> (Vec<u32>, Vec<f64>) {
        let uid_of: HashMap<&str, u32> = hotkeys
            .iter()
            .enumerate()
            .filter_map(|(uid, h)| u32::try_from(uid).ok().map(|uid| (h.as_str(), uid)))
            .collect();

        let current_share = self.current_share * self.approval_rate(current.approved_leads, 1);
        let rolling_share =
            self.rolling_share * self.approval_rate(rolling.approved_leads, self.rolling_window);

        let mut weights: BTreeMap<u32, f64> = BTreeMap::new();
        let mut burned = self.base_burn_share
            + (self.current_share - current_share)
            + (self.rolling_share - rolling_share);

        for (window, share) in [(current, current_share), (rolling, rolling_share)] {
            let total: f64 = window.scores.values().sum();
            if total <= 0.0 || share <= 0.0 {
                burned += share;
                continue;
            }
            for (hotkey, score) in &window.scores {
                let portion = share * score / total;
                match uid_of.get(hotkey.as_str()) {
                    Some(uid) => *weights.entry(*uid).or_insert(0.0) += portion,
                    None => burned += portion,
                }
            }
        }

        if weights.values().all(|w| *w <= 0.0) {
            tracing::info!("no registered miners earned weight; burning epoch");
            return (vec![self.burn_uid], vec![1.0]);
        }
        *weights.entry(self.burn_uid).or_insert(0.0) += burned;

        weights.into_iter().filter(|(_, w)| *w > 0.0).unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hotkeys() -> Vec<String> {
        vec!["owner".into(), "m1".into(), "m2".into()]
    }

    fn window(entries: &[(&str, f64)], leads: u64) -> ScoreWindow {
        ScoreWindow {
            scores: entries.iter().map(|(h, s)| (h.to_string(), *s)).collect(),
            approved_leads: leads,
        }
    }

    #[test]
    fn empty_history_burns_everything() {
        let policy = EmissionPolicy::default();
        let (uids, weights) =
            policy.compute(&ScoreWindow::default(), &ScoreWindow::default(), &hotkeys());
        assert_eq!(uids, vec![0]);
        assert_eq!(weights, vec![1.0]);
    }

    #[test]
    fn full_rolling_window_pays_miners_proportionally() {
        let policy = EmissionPolicy::default();
        let rolling = window(&[("m1", 30.0), ("m2", 10.0)], 50 * 30);
        let (uids, weights) = policy.compute(&ScoreWindow::default(), &rolling, &hotkeys());
        assert_eq!(uids, vec![0, 1, 2]);
        assert!((weights[0] - 0.05).abs() < 1e-9);
        assert!((weights[1] - 0.7125).abs() < 1e-9);
        assert!((weights[2] - 0.2375).abs() < 1e-9);
        assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unearned_and_deregistered_shares_are_burned() {
        let policy = EmissionPolicy::default();
        // Half the window's lead capacity, and "gone" has left the subnet.
        let rolling = window(&[("m1", 10.0), ("gone", 10.0)], 50 * 15);
        let (uids, weights) = policy.compute(&ScoreWindow::default(), &rolling, &hotkeys());
        assert_eq!(uids, vec![0, 1]);
        // 5% base + 47.5% unearned + 23.75% deregistered.
        assert!((weights[0] - 0.7625).abs() < 1e-9);
        assert!((weights[1] - 0.2375).abs() < 1e-9);
    }
}
