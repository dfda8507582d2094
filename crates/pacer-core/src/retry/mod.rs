//! Retry: backoff policy and the async Retryer built on it.

mod backoff;
mod retryer;

pub use backoff::{Backoff, apply_jitter};
pub use retryer::{
    RetryHook, Retryer, RetryerOptions, RetryerState, RetryerStatus, ThrowOnError,
};
