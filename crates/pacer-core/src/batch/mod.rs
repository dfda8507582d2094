//! Batching: collect items and hand them over as a group.
//!
//! A batch is flushed when it reaches `max_size`, when
//! `get_should_execute` says so, or `wait` after the first item of the
//! batch arrived. The pending list is swapped out before the batch
//! function runs, so items added meanwhile start the next batch.

mod async_batcher;
mod batcher;
mod dedup;

pub use async_batcher::{AsyncBatcher, AsyncBatcherOptions, AsyncBatcherState};
pub use batcher::{Batcher, BatcherOptions, BatcherState};
pub use dedup::DedupStrategy;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatcherStatus {
    #[default]
    Idle,
    /// Items are waiting for a trigger.
    Pending,
    /// Async only.
    Executing,
    Stopped,
}

impl BatcherStatus {
    pub(crate) fn of(is_running: bool, is_executing: bool, size: usize) -> Self {
        if !is_running {
            BatcherStatus::Stopped
        } else if is_executing {
            BatcherStatus::Executing
        } else if size > 0 {
            BatcherStatus::Pending
        } else {
            BatcherStatus::Idle
        }
    }
}

/// Dedup key of an item.
pub type KeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Early-flush predicate, given the pending items and current state.
pub type ShouldExecuteFn<T, S> = Arc<dyn Fn(&[T], &S) -> bool + Send + Sync>;

/// Hook receiving a whole batch and the state after it ran.
pub type BatchHook<T, S> = Arc<dyn Fn(&[T], &S) + Send + Sync>;

/// Called with an item dropped as a duplicate.
pub type DuplicateHook<T, S> = Arc<dyn Fn(&T, &S) + Send + Sync>;

/// Default bound on remembered processed keys.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 1000;
