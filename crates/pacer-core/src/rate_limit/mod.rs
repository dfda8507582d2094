//! Rate limiting: a hard cap of `limit` executions per `window`.
//!
//! Unlike throttling, rejected calls are dropped rather than deferred.
//! Callers learn about them from the `bool` (sync) or empty (async) return
//! and from `on_reject`.

mod async_rate_limiter;
mod rate_limiter;
mod window;

pub use async_rate_limiter::{AsyncRateLimiter, AsyncRateLimiterOptions, AsyncRateLimiterState};
pub use rate_limiter::{RateLimiter, RateLimiterOptions, RateLimiterState};
pub use window::{Rejection, WindowType};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimiterStatus {
    Disabled,
    #[default]
    Idle,
    /// Async only.
    Executing,
    /// The current window is used up.
    Exceeded,
}
