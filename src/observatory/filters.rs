//! Filter-change rate limiting.
//!
//! The filter exchanger has a finite lifetime, so changes are limited in
//! bursts (`burst_num` changes within `burst_time`) and on average
//! (`avg_num` changes within `avg_time`). A change is refused only while
//! every enabled limit is exceeded.

use serde::{Deserialize, Serialize};

/// Limits on how often filters may be exchanged. Times in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterChangeLimits {
    pub burst_num: usize,
    pub burst_time: f64,
    pub avg_num: usize,
    pub avg_time: f64,
}

impl FilterChangeLimits {
    /// Mean spacing between changes allowed by the average limit.
    pub fn avg_interval(&self) -> f64 {
        if self.avg_num == 0 {
            0.0
        } else {
            self.avg_time / self.avg_num as f64
        }
    }
}

/// Timestamps of every filter change made so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChangeHistory {
    changes: Vec<f64>,
}

impl FilterChangeHistory {
    pub fn record(&mut self, time: f64) {
        self.changes.push(time);
    }

    pub fn count(&self) -> usize {
        self.changes.len()
    }

    /// Whether one more change at `now` is allowed. A zero count disables
    /// the corresponding limit.
    pub fn is_change_allowed(&self, now: f64, limits: &FilterChangeLimits) -> bool {
        let exceeded: Vec<bool> = [
            (limits.burst_num, limits.burst_time),
            (limits.avg_num, limits.avg_time),
        ]
        .into_iter()
        .filter(|&(num, _)| num > 0)
        .map(|(num, window)| exceeded(&self.changes, now, num, window))
        .collect();
        exceeded.is_empty() || exceeded.contains(&false)
    }

    /// Seconds since the most recent change, or `now` if none happened yet.
    pub fn since_last(&self, now: f64) -> f64 {
        self.changes.last().map_or(now, |last| now - last)
    }
}

/// Whether the last `num` changes all fall within `window` of `now`.
fn exceeded(changes: &[f64], now: f64, num: usize, window: f64) -> bool {
    changes.len() >= num && now - changes[changes.len() - num] < window
}
