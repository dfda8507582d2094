//! Execution window bookkeeping shared by both rate limiters.
//!
//! Timestamps are purged lazily, right before each decision.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// Counts reset at boundaries aligned to the limiter's creation.
    #[default]
    Fixed,
    /// Counts the executions in the trailing `window`.
    Sliding,
}

/// Passed to `on_reject` when a call is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub limit: u32,
    pub remaining: u32,
    pub ms_until_next_window: u64,
}

/// Window geometry resolved for one decision.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub(crate) kind: WindowType,
    pub(crate) length: Duration,
    pub(crate) limit: u32,
    /// Alignment origin for fixed windows.
    pub(crate) epoch: Instant,
}

impl Window {
    /// Start of the fixed window containing `now`.
    fn fixed_start(&self, now: Instant) -> Instant {
        let length = self.length.as_nanos();
        if length == 0 {
            return now;
        }
        let elapsed = now.saturating_duration_since(self.epoch).as_nanos();
        self.epoch + nanos(elapsed - elapsed % length)
    }

    fn counts(&self, at: Instant, now: Instant) -> bool {
        match self.kind {
            WindowType::Fixed => at >= self.fixed_start(now),
            WindowType::Sliding => now.saturating_duration_since(at) < self.length,
        }
    }

    /// Whether any timestamp fell out of the window.
    pub(crate) fn has_stale(&self, times: &[Instant], now: Instant) -> bool {
        times.iter().any(|&at| !self.counts(at, now))
    }

    /// Drop timestamps that fell out of the window.
    pub(crate) fn purge(&self, times: &mut Vec<Instant>, now: Instant) {
        times.retain(|&at| self.counts(at, now));
    }

    /// Calls still allowed in the current window, assuming `times` is purged.
    pub(crate) fn remaining(&self, times: &[Instant]) -> u32 {
        let used = u32::try_from(times.len()).unwrap_or(u32::MAX);
        self.limit.saturating_sub(used)
    }

    /// Time until another call would be accepted; zero if one would be now.
    pub(crate) fn until_next(&self, times: &[Instant], now: Instant) -> Duration {
        if self.remaining(times) > 0 {
            return Duration::ZERO;
        }
        let reopens = match self.kind {
            WindowType::Fixed => self.fixed_start(now) + self.length,
            WindowType::Sliding => match times.first() {
                Some(&oldest) => oldest + self.length,
                None => now,
            },
        };
        reopens.saturating_duration_since(now)
    }

    pub(crate) fn rejection(&self, times: &[Instant], now: Instant) -> Rejection {
        Rejection {
            limit: self.limit,
            remaining: self.remaining(times),
            ms_until_next_window: millis(self.until_next(times, now)),
        }
    }
}

fn nanos(n: u128) -> Duration {
    Duration::from_nanos(u64::try_from(n).unwrap_or(u64::MAX))
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
