//! Per-hotkey limits for `POST /submit`.
//!
//! Each lead producer gets a daily budget of submissions and of rejected
//! submissions, plus a cooldown between consecutive submissions. Days roll
//! over at midnight US Eastern (05:00 UTC). Callers key the limiter by a
//! hotkey whose signature has already been checked. Entries from past days
//! are dropped by [`run_pruning`].

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use thiserror::Error;
use tokio::sync::watch;

use weight_core::RateLimitStats;

use crate::state::SharedState;

/// Hours subtracted from UTC to find the limiter's calendar day.
const DAY_ROLLOVER_HOURS: i64 = 5;

#[derive(Clone, Copy, Debug)]
pub struct RateLimits {
    pub max_submissions: u32,
    pub max_rejections: u32,
    pub cooldown: Duration,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_submissions: 500,
            max_rejections: 100,
            cooldown: Duration::seconds(45),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("daily submission limit of {0} reached")]
    Submissions(u32),
    #[error("daily rejection limit of {0} reached")]
    Rejections(u32),
    #[error("cooldown active, retry in {retry_after_secs}s")]
    Cooldown { retry_after_secs: i64 },
    #[error("rate limiter state poisoned")]
    Poisoned,
}

#[derive(Clone, Debug)]
struct Usage {
    day: NaiveDate,
    submissions: u32,
    rejections: u32,
    last_submission: Option<DateTime<Utc>>,
}

impl Usage {
    fn fresh(day: NaiveDate) -> Self {
        Self {
            day,
            submissions: 0,
            rejections: 0,
            last_submission: None,
        }
    }
}

pub struct RateLimiter {
    limits: RateLimits,
    usage: Mutex<HashMap<String, Usage>>,
}

fn limiter_day(now: DateTime<Utc>) -> NaiveDate {
    (now - Duration::hours(DAY_ROLLOVER_HOURS)).date_naive()
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            usage: Mutex::new(HashMap::new()),
        }
    }

    fn stats(&self, usage: &Usage) -> RateLimitStats {
        RateLimitStats {
            submissions: usage.submissions,
            max_submissions: self.limits.max_submissions,
            rejections: usage.rejections,
            max_rejections: self.limits.max_rejections,
        }
    }

    /// Checks every limit and, if none is hit, counts a submission.
    pub fn reserve(&self, hotkey: &str, now: DateTime<Utc>) -> Result<RateLimitStats, RateLimitError> {
        let mut usage = self.usage.lock().map_err(|_| RateLimitError::Poisoned)?;
        let day = limiter_day(now);
        let entry = usage
            .entry(hotkey.to_string())
            .or_insert_with(|| Usage::fresh(day));
        if entry.day != day {
            *entry = Usage::fresh(day);
        }

        if entry.submissions >= self.limits.max_submissions {
            return Err(RateLimitError::Submissions(self.limits.max_submissions));
        }
        if entry.rejections >= self.limits.max_rejections {
            return Err(RateLimitError::Rejections(self.limits.max_rejections));
        }
        if let Some(last) = entry.last_submission {
            let elapsed = now - last;
            if elapsed < self.limits.cooldown {
                return Err(RateLimitError::Cooldown {
                    retry_after_secs: (self.limits.cooldown - elapsed).num_seconds().max(1),
                });
            }
        }

        entry.submissions += 1;
        entry.last_submission = Some(now);
        Ok(self.stats(entry))
    }

    /// Counts a reserved submission that was then rejected.
    pub fn record_rejection(&self, hotkey: &str, now: DateTime<Utc>) {
        let Ok(mut usage) = self.usage.lock() else {
            return;
        };
        let day = limiter_day(now);
        let entry = usage
            .entry(hotkey.to_string())
            .or_insert_with(|| Usage::fresh(day));
        if entry.day == day {
            entry.rejections += 1;
        }
    }

    /// Drops entries from past days and returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let Ok(mut usage) = self.usage.lock() else {
            return 0;
        };
        let day = limiter_day(now);
        let before = usage.len();
        usage.retain(|_, entry| entry.day == day);
        before - usage.len()
    }

    pub fn tracked_hotkeys(&self) -> usize {
        self.usage.lock().map(|u| u.len()).unwrap_or(0)
    }

    pub fn usage(&self, hotkey: &str, now: DateTime<Utc>) -> RateLimitStats {
        let day = limiter_day(now);
        let usage = self
            .usage
            .lock()
            .ok()
            .and_then(|u| u.get(hotkey).filter(|e| e.day == day).cloned())
            .unwrap_or_else(|| Usage::fresh(day));
        self.stats(&usage)
    }
}

/// Prunes stale limiter entries every `interval` until shutdown.
pub async fn run_pruning(
    state: SharedState,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                tracing::info!("rate limiter pruning task shutting down");
                return;
            }
        }
        let removed = state.rate_limiter.prune(Utc::now());
        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = state.rate_limiter.tracked_hotkeys(),
                "pruned rate limiter entries"
            );
        }
    }
}
