//! Synchronous throttler.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{ThrottlerStatus, remaining, window_open};
use crate::exec::SyncFn;
use crate::options::{Dynamic, Hook};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};
use crate::timer::TimerSlot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerState {
    pub execution_count: u64,
    pub maybe_execute_count: u64,
    pub is_pending: bool,
    pub enabled: bool,
    #[serde(skip)]
    pub last_execution_time: Option<Instant>,
    /// Earliest instant the next execution may happen.
    #[serde(skip)]
    pub next_execution_time: Option<Instant>,
    pub status: ThrottlerStatus,
}

impl Default for ThrottlerState {
    fn default() -> Self {
        Self {
            execution_count: 0,
            maybe_execute_count: 0,
            is_pending: false,
            enabled: true,
            last_execution_time: None,
            next_execution_time: None,
            status: ThrottlerStatus::Idle,
        }
    }
}

impl Derive for ThrottlerState {
    fn derive(&mut self) {
        self.status = if !self.enabled {
            ThrottlerStatus::Disabled
        } else if self.is_pending {
            ThrottlerStatus::Pending
        } else {
            ThrottlerStatus::Idle
        };
    }
}

#[derive(Clone)]
pub struct ThrottlerOptions {
    pub wait: Dynamic<Duration, ThrottlerState>,
    pub leading: bool,
    pub trailing: bool,
    pub enabled: Dynamic<bool, ThrottlerState>,
    pub initial_state: Option<ThrottlerState>,
    pub on_execute: Option<Hook<ThrottlerState>>,
}

impl ThrottlerOptions {
    pub fn new(wait: impl Into<Dynamic<Duration, ThrottlerState>>) -> Self {
        Self {
            wait: wait.into(),
            leading: true,
            trailing: true,
            enabled: true.into(),
            initial_state: None,
            on_execute: None,
        }
    }

    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    pub fn enabled(mut self, enabled: impl Into<Dynamic<bool, ThrottlerState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn initial_state(mut self, state: ThrottlerState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&ThrottlerState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }
}

/// Limits calls to `f` to one per `wait`.
pub struct Throttler<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Throttler<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A> {
    func: SyncFn<A>,
    options: Mutex<Arc<ThrottlerOptions>>,
    store: Store<ThrottlerState>,
    core: Mutex<Core<A>>,
}

struct Core<A> {
    timer: TimerSlot,
    last_args: Option<A>,
}

impl<A: Send + 'static> Throttler<A> {
    pub fn new(f: impl Fn(A) + Send + Sync + 'static, options: ThrottlerOptions) -> Self {
        let initial = options.initial_state.clone().unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                func: Arc::new(f),
                options: Mutex::new(Arc::new(options)),
                store: Store::new(initial),
                core: Mutex::new(Core {
                    timer: TimerSlot::default(),
                    last_args: None,
                }),
            }),
        }
    }

    pub fn maybe_execute(&self, args: A) {
        let options = self.options();
        let snapshot = self.inner.store.get();
        if !options.enabled.resolve(&snapshot) {
            self.inner.store.update(|s| s.enabled = false);
            return;
        }
        let wait = options.wait.resolve(&snapshot);
        let now = Instant::now();
        let last = snapshot.last_execution_time;

        let (run_now, next) = {
            let mut core = lock(&self.inner.core);
            if options.leading && window_open(last, now, wait) {
                core.timer.cancel();
                core.last_args = None;
                (Some(args), None)
            } else {
                core.last_args = Some(args);
                if options.trailing && !core.timer.is_armed() {
                    let weak = Arc::downgrade(&self.inner);
                    core.timer
                        .arm(remaining(last, now, wait), move |generation| fire(weak, generation));
                }
                (None, core.timer.deadline())
            }
        };

        self.inner.store.update(|s| {
            s.enabled = true;
            s.maybe_execute_count += 1;
            s.is_pending = next.is_some();
            if next.is_some() {
                s.next_execution_time = next;
            }
        });

        if let Some(args) = run_now {
            tracing::trace!("throttle leading edge");
            self.inner.execute(args, wait);
        }
    }

    /// Run the pending trailing call now.
    pub fn flush(&self) {
        let args = {
            let mut core = lock(&self.inner.core);
            let Some(args) = core.last_args.take() else {
                return;
            };
            core.timer.cancel();
            args
        };
        let wait = self.options().wait.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.is_pending = false);
        self.inner.execute(args, wait);
    }

    pub fn cancel(&self) {
        {
            let mut core = lock(&self.inner.core);
            core.timer.cancel();
            core.last_args = None;
        }
        self.inner.store.update(|s| {
            s.is_pending = false;
            s.next_execution_time = None;
        });
    }

    pub fn reset(&self) {
        self.cancel();
        let enabled = self.options().enabled.resolve(&self.inner.store.get());
        self.inner.store.replace(ThrottlerState {
            enabled,
            ..ThrottlerState::default()
        });
    }

    pub fn options(&self) -> Arc<ThrottlerOptions> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut ThrottlerOptions)) {
        let mut next = ThrottlerOptions::clone(&self.options());
        edit(&mut next);
        let enabled = next.enabled.clone();
        *lock(&self.inner.options) = Arc::new(next);
        let enabled = enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.enabled = enabled);
    }

    pub fn state(&self) -> ThrottlerState {
        self.inner.store.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&ThrottlerState) + Send + Sync + 'static) -> SubscriptionId {
        let listener: Listener<ThrottlerState> = Arc::new(listener);
        self.inner.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }
}

async fn fire<A>(weak: Weak<Inner<A>>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let args = {
        let mut core = lock(&inner.core);
        if !core.timer.claim(generation) {
            return;
        }
        core.last_args.take()
    };
    let options = Arc::clone(&lock(&inner.options));
    let wait = options.wait.resolve(&inner.store.get());
    inner.store.update(|s| s.is_pending = false);
    if let Some(args) = args.filter(|_| options.trailing) {
        tracing::trace!("throttle trailing edge");
        inner.execute(args, wait);
    }
}

impl<A> Inner<A> {
    fn execute(&self, args: A, wait: Duration) {
        (self.func)(args);
        let now = Instant::now();
        let state = self.store.update(|s| {
            s.execution_count += 1;
            s.last_execution_time = Some(now);
            s.next_execution_time = Some(now + wait);
            s.clone()
        });
        tracing::debug!(execution_count = state.execution_count, "throttled execution");
        let hook = lock(&self.options).on_execute.clone();
        if let Some(hook) = hook {
            hook(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn recorder() -> (Arc<Mutex<Vec<(u32, Duration)>>>, impl Fn(u32) + Send + Sync + 'static) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let start = Instant::now();
        (calls, move |v| lock(&sink).push((v, start.elapsed())))
    }

    #[tokio::test(start_paused = true)]
    async fn leading_then_trailing_with_latest_args() {
        let (calls, f) = recorder();
        let throttler = Throttler::new(f, ThrottlerOptions::new(ms(100)));

        throttler.maybe_execute(1);
        tokio::time::sleep(ms(20)).await;
        throttler.maybe_execute(2);
        tokio::time::sleep(ms(20)).await;
        throttler.maybe_execute(3);
        assert_eq!(throttler.state().status, ThrottlerStatus::Pending);
        assert_eq!(
            throttler.state().next_execution_time,
            Some(Instant::now() + ms(60))
        );

        tokio::time::sleep(ms(200)).await;
        assert_eq!(*lock(&calls), vec![(1, ms(0)), (3, ms(100))]);
        assert_eq!(throttler.state().execution_count, 2);
        assert_eq!(throttler.state().maybe_execute_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn executions_are_spaced_by_wait() {
        let (calls, f) = recorder();
        let throttler = Throttler::new(f, ThrottlerOptions::new(ms(100)));
        for i in 0..50 {
            throttler.maybe_execute(i);
            tokio::time::sleep(ms(15)).await;
        }
        tokio::time::sleep(ms(200)).await;

        let calls = lock(&calls).clone();
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= ms(100), "{pair:?}");
        }
        // 50 calls over 750ms, trailing included
        assert!(calls.len() as u64 <= 750 / 100 + 2);
        assert_eq!(calls.last().map(|c| c.0), Some(49));
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_only_waits_a_full_window_first() {
        let (calls, f) = recorder();
        let throttler = Throttler::new(f, ThrottlerOptions::new(ms(100)).leading(false));
        throttler.maybe_execute(1);
        tokio::time::sleep(ms(50)).await;
        throttler.maybe_execute(2);
        tokio::time::sleep(ms(100)).await;
        assert_eq!(*lock(&calls), vec![(2, ms(100))]);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_only_drops_calls_inside_window() {
        let (calls, f) = recorder();
        let throttler = Throttler::new(f, ThrottlerOptions::new(ms(100)).trailing(false));
        throttler.maybe_execute(1);
        throttler.maybe_execute(2);
        tokio::time::sleep(ms(150)).await;
        throttler.maybe_execute(3);
        assert_eq!(*lock(&calls), vec![(1, ms(0)), (3, ms(150))]);
        assert!(!throttler.state().is_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_cancel_reset() {
        let (calls, f) = recorder();
        let throttler = Throttler::new(f, ThrottlerOptions::new(ms(100)));
        throttler.maybe_execute(1);
        throttler.maybe_execute(2);
        throttler.flush();
        assert_eq!(*lock(&calls), vec![(1, ms(0)), (2, ms(0))]);

        throttler.maybe_execute(3);
        throttler.cancel();
        tokio::time::sleep(ms(300)).await;
        assert_eq!(lock(&calls).len(), 2);

        throttler.reset();
        assert_eq!(throttler.state(), ThrottlerState::default());
    }
}
