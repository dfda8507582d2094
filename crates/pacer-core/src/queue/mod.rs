//! Queuing: ordered buffers drained by a scheduler.
//!
//! Both queuers share one double-ended item sequence. `add_items_to` and
//! `get_items_from` pick the ends, giving FIFO (back/front), LIFO
//! (back/back) or deque use; `get_priority` overrides the insertion end.
//!
//! Scheduler states:
//! - Idle -> Running (started with items waiting or in flight)
//! - Running -> Idle (drained)
//! - any -> Stopped (`stop`); Stopped -> Idle/Running (`start`)

mod async_queuer;
mod items;
mod queuer;

pub use async_queuer::{AsyncQueuer, AsyncQueuerOptions, AsyncQueuerState};
pub use queuer::{Queuer, QueuerOptions, QueuerState};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Which end of the queue an operation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePosition {
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuerStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

impl QueuerStatus {
    pub(crate) fn of(started: bool, busy: bool) -> Self {
        match (started, busy) {
            (false, _) => QueuerStatus::Stopped,
            (true, true) => QueuerStatus::Running,
            (true, false) => QueuerStatus::Idle,
        }
    }

    /// Will the scheduler pick up new items?
    pub fn is_accepting_work(self) -> bool {
        !matches!(self, QueuerStatus::Stopped)
    }
}

/// Priority of an item; lower values leave the front first.
pub type PriorityFn<T> = Arc<dyn Fn(&T) -> i64 + Send + Sync>;

/// Extra expiry predicate, given the item and when it was added.
pub type ExpiryFn<T> = Arc<dyn Fn(&T, Instant) -> bool + Send + Sync>;

/// Hook receiving an item together with the state after the event.
pub type ItemHook<T, S> = Arc<dyn Fn(&T, &S) + Send + Sync>;
