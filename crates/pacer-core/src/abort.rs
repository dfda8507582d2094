//! Cooperative cancellation for in-flight executions.
//!
//! An `AbortController` owns a `watch` channel; every `AbortSignal` cloned
//! from it observes the flip to aborted. Executions race their future
//! against the signal, so aborting drops the wrapped future at its next
//! suspension point.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::sync::watch;

use crate::outcome::Outcome;

/// Owner side of an abort token.
#[derive(Debug)]
pub struct AbortController {
    tx: watch::Sender<bool>,
}

/// Observer side of an abort token, handed to wrapped functions that want
/// to stop early on their own.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn abort(&self) {
        // send_replace never fails, even with no live receivers
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the controller aborts. Never resolves if the
    /// controller is dropped without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Race `fut` against `signal`.
pub(crate) async fn run_abortable<T, E, F>(fut: F, signal: &AbortSignal) -> Outcome<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    if signal.is_aborted() {
        return Outcome::Cancelled;
    }
    tokio::select! {
        biased;
        _ = signal.aborted() => Outcome::Cancelled,
        result = fut => Outcome::from(result),
    }
}

/// Controllers of every execution a primitive currently has in flight.
#[derive(Debug, Default)]
pub(crate) struct AbortSet {
    next_id: u64,
    live: BTreeMap<u64, AbortController>,
}

impl AbortSet {
    pub(crate) fn register(&mut self) -> (u64, AbortSignal) {
        let id = self.next_id;
        self.next_id += 1;
        let controller = AbortController::new();
        let signal = controller.signal();
        self.live.insert(id, controller);
        (id, signal)
    }

    pub(crate) fn release(&mut self, id: u64) {
        self.live.remove(&id);
    }

    /// Abort everything in flight. Returns how many executions were hit.
    pub(crate) fn abort_all(&mut self) -> usize {
        let count = self.live.len();
        for controller in self.live.values() {
            controller.abort();
        }
        self.live.clear();
        count
    }

    /// Signal of the most recently started execution.
    pub(crate) fn latest_signal(&self) -> Option<AbortSignal> {
        self.live.values().next_back().map(AbortController::signal)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn abort_is_observed_by_all_signals() {
        let controller = AbortController::new();
        let a = controller.signal();
        let b = a.clone();
        assert!(!a.is_aborted());
        controller.abort();
        assert!(a.is_aborted());
        b.aborted().await;
        assert!(controller.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn run_abortable_cancels_slow_future() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let handle = tokio::spawn(async move {
            run_abortable(
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, String>(1)
                },
                &signal,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort();
        assert_eq!(handle.await.unwrap(), Outcome::Cancelled);
    }

    #[tokio::test]
    async fn run_abortable_passes_through_results() {
        let signal = AbortController::new().signal();
        let out = run_abortable(async { Err::<u32, _>("nope") }, &signal).await;
        assert_eq!(out, Outcome::Failure("nope"));
    }

    #[test]
    fn abort_set_tracks_live_executions() {
        let mut set = AbortSet::default();
        let (first, s1) = set.register();
        let (_second, s2) = set.register();
        set.release(first);
        assert!(set.latest_signal().is_some());
        assert_eq!(set.abort_all(), 1);
        assert!(!s1.is_aborted());
        assert!(s2.is_aborted());
        assert!(set.latest_signal().is_none());
    }
}
