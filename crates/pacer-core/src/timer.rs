//! Owned timer handles.
//!
//! A timer is a spawned tokio task that sleeps until its deadline and then
//! runs a callback. Dropping or cancelling the handle aborts the task. Every
//! arm bumps a generation number so a callback that already woke up can
//! tell that it was superseded.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Timer {
    handle: Option<JoinHandle<()>>,
    deadline: Instant,
}

impl Timer {
    fn spawn<F>(delay: Duration, fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire.await;
        });
        Self {
            handle: Some(handle),
            deadline,
        }
    }

    /// Let the task run to completion without owning it any more.
    fn release(mut self) {
        self.handle.take();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// At most one armed timer plus its generation counter.
#[derive(Default)]
pub(crate) struct TimerSlot {
    timer: Option<Timer>,
    generation: u64,
}

impl TimerSlot {
    /// Arm (or re-arm) the slot. `fire` receives the generation it must
    /// present to `claim` when it runs.
    pub(crate) fn arm<F, Fut>(&mut self, delay: Duration, fire: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        tracing::trace!(?delay, generation, "timer armed");
        self.timer = Some(Timer::spawn(delay, fire(generation)));
    }

    /// Disarm. Returns whether a timer was armed.
    pub(crate) fn cancel(&mut self) -> bool {
        self.generation = self.generation.wrapping_add(1);
        self.timer.take().is_some()
    }

    /// Called by the firing task. Returns `false` if the timer was cancelled
    /// or re-armed since it was spawned.
    pub(crate) fn claim(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return false;
        }
        match self.timer.take() {
            Some(timer) => {
                timer.release();
                self.generation = self.generation.wrapping_add(1);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timer.as_ref().map(|t| t.deadline)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::store::lock;

    fn fire_into(slot: Arc<Mutex<TimerSlot>>, hits: Arc<AtomicU32>) -> impl FnOnce(u64) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> {
        move |generation| {
            Box::pin(async move {
                if lock(&slot).claim(generation) {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let slot = Arc::new(Mutex::new(TimerSlot::default()));
        let hits = Arc::new(AtomicU32::new(0));
        lock(&slot).arm(
            Duration::from_millis(100),
            fire_into(Arc::clone(&slot), Arc::clone(&hits)),
        );
        assert!(lock(&slot).is_armed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!lock(&slot).is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let slot = Arc::new(Mutex::new(TimerSlot::default()));
        let hits = Arc::new(AtomicU32::new(0));
        lock(&slot).arm(
            Duration::from_millis(100),
            fire_into(Arc::clone(&slot), Arc::clone(&hits)),
        );
        assert!(lock(&slot).cancel());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let mut slot = TimerSlot::default();
        assert!(!slot.claim(0));
        slot.cancel();
        assert!(!slot.claim(0));
    }
}
