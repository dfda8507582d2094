//! Synchronous debouncer.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::DebouncerStatus;
use crate::exec::SyncFn;
use crate::options::{Dynamic, Hook};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};
use crate::timer::TimerSlot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebouncerState {
    pub execution_count: u64,
    pub maybe_execute_count: u64,
    /// A trailing execution is scheduled.
    pub is_pending: bool,
    pub enabled: bool,
    #[serde(skip)]
    pub last_execution_time: Option<Instant>,
    pub status: DebouncerStatus,
}

impl Default for DebouncerState {
    fn default() -> Self {
        Self {
            execution_count: 0,
            maybe_execute_count: 0,
            is_pending: false,
            enabled: true,
            last_execution_time: None,
            status: DebouncerStatus::Idle,
        }
    }
}

impl Derive for DebouncerState {
    fn derive(&mut self) {
        self.status = if !self.enabled {
            DebouncerStatus::Disabled
        } else if self.is_pending {
            DebouncerStatus::Pending
        } else {
            DebouncerStatus::Idle
        };
    }
}

#[derive(Clone)]
pub struct DebouncerOptions {
    pub wait: Dynamic<Duration, DebouncerState>,
    /// Execute on the first call of a burst.
    pub leading: bool,
    /// Execute with the latest arguments once the burst ends.
    pub trailing: bool,
    pub enabled: Dynamic<bool, DebouncerState>,
    pub initial_state: Option<DebouncerState>,
    pub on_execute: Option<Hook<DebouncerState>>,
}

impl DebouncerOptions {
    pub fn new(wait: impl Into<Dynamic<Duration, DebouncerState>>) -> Self {
        Self {
            wait: wait.into(),
            leading: false,
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

    pub fn enabled(mut self, enabled: impl Into<Dynamic<bool, DebouncerState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn initial_state(mut self, state: DebouncerState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&DebouncerState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }
}

/// Delays calls to `f` until `wait` has passed without another call.
///
/// Timers run on the ambient tokio runtime, so `maybe_execute` must be
/// called from within one.
pub struct Debouncer<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for Debouncer<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A> {
    func: SyncFn<A>,
    options: Mutex<Arc<DebouncerOptions>>,
    store: Store<DebouncerState>,
    core: Mutex<Core<A>>,
}

struct Core<A> {
    timer: TimerSlot,
    last_args: Option<A>,
}

impl<A: Send + 'static> Debouncer<A> {
    pub fn new(f: impl Fn(A) + Send + Sync + 'static, options: DebouncerOptions) -> Self {
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

    /// Register a call. Depending on `leading`/`trailing` this executes now,
    /// schedules a trailing execution, or both.
    pub fn maybe_execute(&self, args: A) {
        let options = self.options();
        let snapshot = self.inner.store.get();
        let enabled = options.enabled.resolve(&snapshot);
        if !enabled {
            self.inner.store.update(|s| s.enabled = false);
            return;
        }
        let wait = options.wait.resolve(&snapshot);

        let leading_args = {
            let mut core = lock(&self.inner.core);
            let leading = options.leading && !core.timer.is_armed();
            let leading_args = if leading {
                core.last_args = None;
                Some(args)
            } else {
                core.last_args = Some(args);
                None
            };
            let weak = Arc::downgrade(&self.inner);
            core.timer.arm(wait, move |generation| fire(weak, generation));
            leading_args
        };

        let is_pending = options.trailing && leading_args.is_none();
        self.inner.store.update(|s| {
            s.enabled = true;
            s.maybe_execute_count += 1;
            s.is_pending = is_pending;
        });
        tracing::trace!(?wait, leading = leading_args.is_some(), "debounce call registered");

        if let Some(args) = leading_args {
            self.inner.execute(args);
        }
    }

    /// Run the pending call now, if there is one.
    pub fn flush(&self) {
        let args = {
            let mut core = lock(&self.inner.core);
            let Some(args) = core.last_args.take() else {
                return;
            };
            core.timer.cancel();
            args
        };
        self.inner.store.update(|s| s.is_pending = false);
        self.inner.execute(args);
    }

    /// Drop the pending call without running it.
    pub fn cancel(&self) {
        {
            let mut core = lock(&self.inner.core);
            core.timer.cancel();
            core.last_args = None;
        }
        self.inner.store.update(|s| s.is_pending = false);
    }

    /// Cancel and return state to its defaults.
    pub fn reset(&self) {
        self.cancel();
        let enabled = self.options().enabled.resolve(&self.inner.store.get());
        self.inner.store.replace(DebouncerState {
            enabled,
            ..DebouncerState::default()
        });
    }

    pub fn options(&self) -> Arc<DebouncerOptions> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut DebouncerOptions)) {
        let mut next = DebouncerOptions::clone(&self.options());
        edit(&mut next);
        let enabled = next.enabled.clone();
        *lock(&self.inner.options) = Arc::new(next);
        let enabled = enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.enabled = enabled);
    }

    pub fn state(&self) -> DebouncerState {
        self.inner.store.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&DebouncerState) + Send + Sync + 'static) -> SubscriptionId {
        let listener: Listener<DebouncerState> = Arc::new(listener);
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
    let trailing = lock(&inner.options).trailing;
    inner.store.update(|s| s.is_pending = false);
    if let Some(args) = args.filter(|_| trailing) {
        inner.execute(args);
    }
}

impl<A> Inner<A> {
    fn execute(&self, args: A) {
        (self.func)(args);
        let state = self.store.update(|s| {
            s.execution_count += 1;
            s.last_execution_time = Some(Instant::now());
            s.clone()
        });
        tracing::debug!(execution_count = state.execution_count, "debounced execution");
        let hook = lock(&self.options).on_execute.clone();
        if let Some(hook) = hook {
            hook(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

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
    async fn trailing_runs_once_wait_after_last_call() {
        let (calls, f) = recorder();
        let debouncer = Debouncer::new(f, DebouncerOptions::new(ms(100)));

        debouncer.maybe_execute(1);
        tokio::time::sleep(ms(50)).await;
        debouncer.maybe_execute(2);
        tokio::time::sleep(ms(50)).await;
        debouncer.maybe_execute(3);
        assert_eq!(debouncer.state().status, DebouncerStatus::Pending);

        tokio::time::sleep(ms(99)).await;
        assert!(lock(&calls).is_empty());
        tokio::time::sleep(ms(300)).await;

        assert_eq!(*lock(&calls), vec![(3, ms(200))]);
        let state = debouncer.state();
        assert_eq!(state.execution_count, 1);
        assert_eq!(state.maybe_execute_count, 3);
        assert_eq!(state.status, DebouncerStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_executes_immediately_and_trailing_only_after_more_calls() {
        let (calls, f) = recorder();
        let debouncer = Debouncer::new(f, DebouncerOptions::new(ms(100)).leading(true));

        debouncer.maybe_execute(1);
        assert_eq!(*lock(&calls), vec![(1, ms(0))]);
        assert!(!debouncer.state().is_pending);

        // lone leading call: no trailing execution
        tokio::time::sleep(ms(150)).await;
        assert_eq!(lock(&calls).len(), 1);

        debouncer.maybe_execute(2);
        tokio::time::sleep(ms(10)).await;
        debouncer.maybe_execute(3);
        tokio::time::sleep(ms(200)).await;
        assert_eq!(*lock(&calls), vec![(1, ms(0)), (2, ms(150)), (3, ms(260))]);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_only_suppresses_burst() {
        let (calls, f) = recorder();
        let debouncer = Debouncer::new(f, DebouncerOptions::new(ms(100)).leading(true).trailing(false));
        for i in 0..5 {
            debouncer.maybe_execute(i);
            tokio::time::sleep(ms(20)).await;
        }
        tokio::time::sleep(ms(200)).await;
        assert_eq!(*lock(&calls), vec![(0, ms(0))]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_and_cancel() {
        let count = Arc::new(AtomicU32::new(0));
        let hits = Arc::clone(&count);
        let debouncer = Debouncer::new(
            move |n: u32| {
                hits.fetch_add(n, Ordering::SeqCst);
            },
            DebouncerOptions::new(ms(100)),
        );

        debouncer.maybe_execute(5);
        debouncer.flush();
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(!debouncer.state().is_pending);

        debouncer.maybe_execute(7);
        debouncer.cancel();
        tokio::time::sleep(ms(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);

        // nothing pending: flush is a no-op
        debouncer.flush();
        assert_eq!(debouncer.state().execution_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_ignores_calls_and_dynamic_wait_is_resolved_per_call() {
        let (calls, f) = recorder();
        let debouncer = Debouncer::new(
            f,
            DebouncerOptions::new(Dynamic::resolver(|s: &DebouncerState| {
                ms(100 * (s.execution_count + 1))
            }))
            .enabled(false),
        );
        debouncer.maybe_execute(1);
        assert_eq!(debouncer.state().status, DebouncerStatus::Disabled);
        assert_eq!(debouncer.state().maybe_execute_count, 0);

        debouncer.set_options(|o| o.enabled = true.into());
        debouncer.maybe_execute(2);
        tokio::time::sleep(ms(150)).await;
        debouncer.maybe_execute(3);
        tokio::time::sleep(ms(250)).await;
        assert_eq!(*lock(&calls), vec![(2, ms(100)), (3, ms(350))]);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_status_changes_and_reset_clears() {
        let (_calls, f) = recorder();
        let debouncer = Debouncer::new(f, DebouncerOptions::new(ms(50)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        debouncer.subscribe(move |s: &DebouncerState| lock(&sink).push(s.status));

        debouncer.maybe_execute(1);
        tokio::time::sleep(ms(100)).await;
        let statuses = lock(&seen).clone();
        assert_eq!(statuses.first(), Some(&DebouncerStatus::Pending));
        assert_eq!(statuses.last(), Some(&DebouncerStatus::Idle));

        debouncer.reset();
        assert_eq!(debouncer.state().execution_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_last_handle_disarms_timer() {
        let count = Arc::new(AtomicU32::new(0));
        let hits = Arc::clone(&count);
        let debouncer = Debouncer::new(
            move |_: ()| {
                hits.fetch_add(1, Ordering::SeqCst);
            },
            DebouncerOptions::new(ms(100)),
        );
        debouncer.maybe_execute(());
        drop(debouncer);
        tokio::time::sleep(ms(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
