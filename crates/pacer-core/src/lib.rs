//! pacer-core
//!
//! Execution-control primitives: decide when and how often a wrapped
//! operation may run.
//!
//! # Modules
//! - **debounce**: Debouncer / AsyncDebouncer (leading/trailing edge, run after quiet period)
//! - **throttle**: Throttler / AsyncThrottler (at most one run per `wait`)
//! - **rate_limit**: RateLimiter / AsyncRateLimiter (hard cap per fixed or sliding window)
//! - **queue**: Queuer / AsyncQueuer (ordered buffer drained on a schedule, optionally concurrent)
//! - **batch**: Batcher / AsyncBatcher (group items, flush on size, predicate or timer)
//! - **retry**: Retryer (backoff, jitter, per-attempt and total timeouts)
//!
//! Every primitive is a cheap `Clone` handle. Options accept static values
//! or [`Dynamic`] resolvers evaluated against the live state, and every
//! state change is published to `subscribe` listeners.
//!
//! Timer-driven primitives spawn tokio tasks and must be used inside a
//! tokio runtime. Under a paused clock (`tokio::time::pause`) they run on
//! simulated time unchanged.

pub mod abort;
pub mod batch;
pub mod debounce;
pub mod error;
pub mod options;
pub mod outcome;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod store;
pub mod throttle;

mod exec;
mod timer;

pub use abort::{AbortController, AbortSignal};
pub use batch::{AsyncBatcher, AsyncBatcherOptions, Batcher, BatcherOptions, DedupStrategy};
pub use debounce::{AsyncDebouncer, AsyncDebouncerOptions, Debouncer, DebouncerOptions};
pub use error::ExecutionError;
pub use options::Dynamic;
pub use outcome::{Outcome, Pending};
pub use queue::{AsyncQueuer, AsyncQueuerOptions, QueuePosition, Queuer, QueuerOptions};
pub use rate_limit::{AsyncRateLimiter, AsyncRateLimiterOptions, RateLimiter, RateLimiterOptions, WindowType};
pub use retry::{Backoff, Retryer, RetryerOptions, ThrowOnError};
pub use throttle::{AsyncThrottler, AsyncThrottlerOptions, Throttler, ThrottlerOptions};
