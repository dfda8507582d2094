//! Debounce: run once after calls stop arriving for `wait`.
//!
//! State transitions:
//! - Idle -> Pending (call arrives, timer armed)
//! - Pending -> Pending (another call re-arms the timer)
//! - Pending -> Executing -> Idle (timer fires or `flush`)
//! - any -> Disabled (while `enabled` resolves to false)

mod async_debouncer;
mod debouncer;

pub use async_debouncer::{AsyncDebouncer, AsyncDebouncerOptions, AsyncDebouncerState};
pub use debouncer::{Debouncer, DebouncerOptions, DebouncerState};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebouncerStatus {
    Disabled,
    #[default]
    Idle,
    Pending,
    /// Async only: the wrapped future is running.
    Executing,
}
