//! Throttle: at most one execution per `wait` window.
//!
//! A call inside the window never re-arms an armed trailing timer; it only
//! replaces the arguments the trailing execution will use.

mod async_throttler;
mod throttler;

pub use async_throttler::{AsyncThrottler, AsyncThrottlerOptions, AsyncThrottlerState};
pub use throttler::{Throttler, ThrottlerOptions, ThrottlerState};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlerStatus {
    Disabled,
    #[default]
    Idle,
    Pending,
    Executing,
}

/// Time left in the current window. A throttler that never executed
/// waits a full window before its first trailing execution.
pub(crate) fn remaining(last: Option<Instant>, now: Instant, wait: Duration) -> Duration {
    match last {
        Some(last) => wait.saturating_sub(now.saturating_duration_since(last)),
        None => wait,
    }
}

/// Whether a leading call may execute right now.
pub(crate) fn window_open(last: Option<Instant>, now: Instant, wait: Duration) -> bool {
    last.is_none_or(|last| now.saturating_duration_since(last) >= wait)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down_from_last_execution() {
        let wait = Duration::from_millis(100);
        let start = Instant::now();
        assert_eq!(remaining(None, start, wait), wait);
        assert_eq!(
            remaining(Some(start), start + Duration::from_millis(30), wait),
            Duration::from_millis(70)
        );
        assert_eq!(remaining(Some(start), start + Duration::from_secs(1), wait), Duration::ZERO);
        assert!(window_open(None, start, wait));
        assert!(!window_open(Some(start), start + Duration::from_millis(99), wait));
        assert!(window_open(Some(start), start + wait, wait));
    }
}
