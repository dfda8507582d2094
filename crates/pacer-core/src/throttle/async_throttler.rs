//! Async throttler. Executions are serialized: a trailing edge that comes
//! due while the previous execution is running waits for it to settle.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{ThrottlerStatus, remaining, window_open};
use crate::abort::{AbortSet, AbortSignal, run_abortable};
use crate::exec::{AsyncFn, ResultHooks, SettleCounters, boxed, reply_all, settle};
use crate::options::{Dynamic, Hook, ValueHook};
use crate::outcome::{Pending, Settle};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};
use crate::timer::TimerSlot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncThrottlerState {
    pub execution_count: u64,
    pub maybe_execute_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    pub is_pending: bool,
    pub is_executing: bool,
    pub enabled: bool,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub last_execution_time: Option<Instant>,
    #[serde(skip)]
    pub next_execution_time: Option<Instant>,
    pub status: ThrottlerStatus,
}

impl Default for AsyncThrottlerState {
    fn default() -> Self {
        Self {
            execution_count: 0,
            maybe_execute_count: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            is_pending: false,
            is_executing: false,
            enabled: true,
            last_error: None,
            last_execution_time: None,
            next_execution_time: None,
            status: ThrottlerStatus::Idle,
        }
    }
}

impl Derive for AsyncThrottlerState {
    fn derive(&mut self) {
        self.status = if !self.enabled {
            ThrottlerStatus::Disabled
        } else if self.is_executing {
            ThrottlerStatus::Executing
        } else if self.is_pending {
            ThrottlerStatus::Pending
        } else {
            ThrottlerStatus::Idle
        };
    }
}

impl SettleCounters for AsyncThrottlerState {
    fn record_success(&mut self) {
        self.success_count += 1;
        self.settle_count += 1;
    }

    fn record_error(&mut self, error: String) {
        self.error_count += 1;
        self.settle_count += 1;
        self.last_error = Some(error);
    }
}

pub struct AsyncThrottlerOptions<T, E> {
    pub wait: Dynamic<Duration, AsyncThrottlerState>,
    pub leading: bool,
    pub trailing: bool,
    pub enabled: Dynamic<bool, AsyncThrottlerState>,
    pub throw_on_error: Option<bool>,
    pub initial_state: Option<AsyncThrottlerState>,
    pub on_execute: Option<Hook<AsyncThrottlerState>>,
    pub on_success: Option<ValueHook<T>>,
    pub on_error: Option<ValueHook<E>>,
    pub on_settled: Option<Hook<AsyncThrottlerState>>,
}

impl<T, E> Clone for AsyncThrottlerOptions<T, E> {
    fn clone(&self) -> Self {
        Self {
            wait: self.wait.clone(),
            leading: self.leading,
            trailing: self.trailing,
            enabled: self.enabled.clone(),
            throw_on_error: self.throw_on_error,
            initial_state: self.initial_state.clone(),
            on_execute: self.on_execute.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T, E> AsyncThrottlerOptions<T, E> {
    pub fn new(wait: impl Into<Dynamic<Duration, AsyncThrottlerState>>) -> Self {
        Self {
            wait: wait.into(),
            leading: true,
            trailing: true,
            enabled: true.into(),
            throw_on_error: None,
            initial_state: None,
            on_execute: None,
            on_success: None,
            on_error: None,
            on_settled: None,
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

    pub fn enabled(mut self, enabled: impl Into<Dynamic<bool, AsyncThrottlerState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncThrottlerState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&AsyncThrottlerState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled(mut self, f: impl Fn(&AsyncThrottlerState) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

pub struct AsyncThrottler<A, T, E> {
    inner: Arc<Inner<A, T, E>>,
}

impl<A, T, E> Clone for AsyncThrottler<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A, T, E> {
    func: AsyncFn<A, T, E>,
    options: Mutex<Arc<AsyncThrottlerOptions<T, E>>>,
    store: Store<AsyncThrottlerState>,
    core: Mutex<Core<A, T, E>>,
    aborts: Mutex<AbortSet>,
}

struct Core<A, T, E> {
    timer: TimerSlot,
    last_args: Option<A>,
    waiters: Vec<Settle<T, E>>,
    is_executing: bool,
    run_after_current: bool,
}

/// Abort registration happens when the job is built, before any task
/// runs it.
struct Job<A, T, E> {
    args: A,
    waiters: Vec<Settle<T, E>>,
    exec_id: u64,
    signal: AbortSignal,
}

impl<A, T, E> Core<A, T, E> {
    fn take_job(&mut self, aborts: &Mutex<AbortSet>) -> Option<Job<A, T, E>> {
        let args = self.last_args.take()?;
        self.is_executing = true;
        self.run_after_current = false;
        let (exec_id, signal) = lock(aborts).register();
        Some(Job {
            args,
            waiters: std::mem::take(&mut self.waiters),
            exec_id,
            signal,
        })
    }
}

impl<A, T, E> AsyncThrottler<A, T, E>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + std::fmt::Display + Send + 'static,
{
    pub fn new<F, Fut>(f: F, options: AsyncThrottlerOptions<T, E>) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let initial = options.initial_state.clone().unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                func: boxed(f),
                options: Mutex::new(Arc::new(options)),
                store: Store::new(initial),
                core: Mutex::new(Core {
                    timer: TimerSlot::default(),
                    last_args: None,
                    waiters: Vec::new(),
                    is_executing: false,
                    run_after_current: false,
                }),
                aborts: Mutex::new(AbortSet::default()),
            }),
        }
    }

    /// Resolves with the result of the execution covering this call:
    /// either this call's own leading execution or the next trailing one.
    pub fn maybe_execute(&self, args: A) -> Pending<T, E> {
        let options = self.options();
        let snapshot = self.inner.store.get();
        if !options.enabled.resolve(&snapshot) {
            self.inner.store.update(|s| s.enabled = false);
            return Pending::skipped();
        }
        let wait = options.wait.resolve(&snapshot);
        let now = Instant::now();
        let last = snapshot.last_execution_time;
        let (tx, pending) = Pending::channel();

        let (leading_job, next) = {
            let mut core = lock(&self.inner.core);
            if options.leading && !core.is_executing && window_open(last, now, wait) {
                core.timer.cancel();
                core.last_args = None;
                core.is_executing = true;
                // calls waiting for a trailing edge are covered by this run
                let mut waiters = std::mem::take(&mut core.waiters);
                waiters.push(tx);
                let (exec_id, signal) = lock(&self.inner.aborts).register();
                let job = Job {
                    args,
                    waiters,
                    exec_id,
                    signal,
                };
                (Some(job), None)
            } else {
                core.last_args = Some(args);
                core.waiters.push(tx);
                if options.trailing && !core.timer.is_armed() {
                    let weak = Arc::downgrade(&self.inner);
                    core.timer
                        .arm(remaining(last, now, wait), move |generation| fire(weak, generation));
                }
                if !options.trailing && !core.is_executing {
                    // no trailing edge will ever pick these up
                    core.last_args = None;
                    core.waiters.clear();
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

        if let Some(job) = leading_job {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run(job).await });
        }
        pending
    }

    pub fn flush(&self) -> Pending<T, E> {
        let (tx, pending) = Pending::channel();
        let job = {
            let mut core = lock(&self.inner.core);
            if core.last_args.is_none() {
                return Pending::skipped();
            }
            core.timer.cancel();
            core.waiters.push(tx);
            if core.is_executing {
                core.run_after_current = true;
                None
            } else {
                core.take_job(&self.inner.aborts)
            }
        };
        self.inner.store.update(|s| s.is_pending = false);
        if let Some(job) = job {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run(job).await });
        }
        pending
    }

    pub fn cancel(&self) {
        {
            let mut core = lock(&self.inner.core);
            core.timer.cancel();
            core.last_args = None;
            core.waiters.clear();
            core.run_after_current = false;
        }
        self.inner.store.update(|s| {
            s.is_pending = false;
            s.next_execution_time = None;
        });
    }

    pub fn abort(&self) {
        let aborted = lock(&self.inner.aborts).abort_all();
        tracing::debug!(aborted, "throttler abort requested");
    }

    pub fn abort_signal(&self) -> Option<AbortSignal> {
        lock(&self.inner.aborts).latest_signal()
    }

    pub fn reset(&self) {
        self.cancel();
        self.abort();
        let enabled = self.options().enabled.resolve(&self.inner.store.get());
        self.inner.store.replace(AsyncThrottlerState {
            enabled,
            ..AsyncThrottlerState::default()
        });
    }

    pub fn options(&self) -> Arc<AsyncThrottlerOptions<T, E>> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut AsyncThrottlerOptions<T, E>)) {
        let mut next = AsyncThrottlerOptions::clone(&self.options());
        edit(&mut next);
        let enabled = next.enabled.clone();
        *lock(&self.inner.options) = Arc::new(next);
        let enabled = enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.enabled = enabled);
    }

    pub fn state(&self) -> AsyncThrottlerState {
        self.inner.store.get()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&AsyncThrottlerState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let listener: Listener<AsyncThrottlerState> = Arc::new(listener);
        self.inner.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }
}

async fn fire<A, T, E>(weak: Weak<Inner<A, T, E>>, generation: u64)
where
    T: Clone + Send + 'static,
    E: Clone + std::fmt::Display + Send + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let job = {
        let mut core = lock(&inner.core);
        if !core.timer.claim(generation) {
            return;
        }
        if core.is_executing {
            core.run_after_current = core.last_args.is_some();
            None
        } else {
            core.take_job(&inner.aborts)
        }
    };
    inner.store.update(|s| s.is_pending = false);
    if let Some(job) = job {
        tracing::trace!("throttle trailing edge");
        inner.run(job).await;
    }
}

impl<A, T, E> Inner<A, T, E>
where
    T: Clone + Send + 'static,
    E: Clone + std::fmt::Display + Send + 'static,
{
    async fn run(&self, mut job: Job<A, T, E>) {
        loop {
            self.execute_once(job).await;
            let next = {
                let mut core = lock(&self.core);
                if core.run_after_current {
                    core.take_job(&self.aborts)
                } else {
                    core.is_executing = false;
                    None
                }
            };
            match next {
                Some(queued) => job = queued,
                None => break,
            }
        }
        self.store.update(|s| s.is_executing = false);
    }

    async fn execute_once(&self, job: Job<A, T, E>) {
        if job.signal.is_aborted() {
            lock(&self.aborts).release(job.exec_id);
            reply_all(Ok(None), job.waiters, "throttled execution");
            return;
        }
        let options = Arc::clone(&lock(&self.options));
        let now = Instant::now();
        let wait = options.wait.resolve(&self.store.get());
        let state = self.store.update(|s| {
            s.is_executing = true;
            s.execution_count += 1;
            s.last_execution_time = Some(now);
            s.next_execution_time = Some(now + wait);
            s.clone()
        });
        tracing::debug!(execution_count = state.execution_count, "throttled execution");
        if let Some(hook) = &options.on_execute {
            hook(&state);
        }

        let outcome = run_abortable((self.func)(job.args), &job.signal).await;
        lock(&self.aborts).release(job.exec_id);
        let hooks = ResultHooks {
            on_success: options.on_success.as_ref(),
            on_error: options.on_error.as_ref(),
            on_settled: options.on_settled.as_ref(),
            throw_on_error: options.throw_on_error,
        };
        let reply = settle(&self.store, hooks, outcome);
        reply_all(reply, job.waiters, "throttled execution");
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    type Log = Arc<Mutex<Vec<(u32, Duration)>>>;
    type Call = Pin<Box<dyn Future<Output = Result<u32, String>> + Send>>;

    fn doubler(log: Log, work: Duration) -> impl Fn(u32) -> Call + Send + Sync + 'static {
        let start = Instant::now();
        move |n| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                lock(&log).push((n, start.elapsed()));
                tokio::time::sleep(work).await;
                if n == 0 { Err("zero".to_string()) } else { Ok(n * 2) }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn leading_and_trailing_results_reach_their_callers() {
        let log: Log = Arc::default();
        let throttler = AsyncThrottler::new(doubler(Arc::clone(&log), ms(5)), AsyncThrottlerOptions::new(ms(100)));

        let first = throttler.maybe_execute(1);
        let second = throttler.maybe_execute(2);
        let third = throttler.maybe_execute(3);

        assert_eq!(first.await, Ok(Some(2)));
        assert_eq!(second.await, Ok(Some(6)));
        assert_eq!(third.await, Ok(Some(6)));
        assert_eq!(*lock(&log), vec![(1, ms(0)), (3, ms(100))]);
        assert_eq!(throttler.state().success_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_execution_delays_the_trailing_edge() {
        let log: Log = Arc::default();
        let throttler = AsyncThrottler::new(doubler(Arc::clone(&log), ms(250)), AsyncThrottlerOptions::new(ms(100)));

        let first = throttler.maybe_execute(1);
        tokio::time::sleep(ms(10)).await;
        let second = throttler.maybe_execute(2);

        assert_eq!(first.await, Ok(Some(2)));
        assert_eq!(second.await, Ok(Some(4)));
        // trailing edge due at 100, first execution settles at 250
        assert_eq!(*lock(&log), vec![(1, ms(0)), (2, ms(250))]);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_only_resolves_dropped_calls_empty() {
        let log: Log = Arc::default();
        let throttler = AsyncThrottler::new(
            doubler(Arc::clone(&log), ms(0)),
            AsyncThrottlerOptions::new(ms(100)).trailing(false),
        );
        assert_eq!(throttler.maybe_execute(4).await, Ok(Some(8)));
        assert_eq!(throttler.maybe_execute(5).await, Ok(None));
        assert_eq!(lock(&log).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_with_hook_is_swallowed() {
        let log: Log = Arc::default();
        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&errors);
        let throttler = AsyncThrottler::new(
            doubler(Arc::clone(&log), ms(0)),
            AsyncThrottlerOptions::new(ms(100)).on_error(move |e: &String| lock(&sink).push(e.clone())),
        );
        assert_eq!(throttler.maybe_execute(0).await, Ok(None));
        assert_eq!(*lock(&errors), vec!["zero".to_string()]);
        let state = throttler.state();
        assert_eq!(state.error_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("zero"));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_skips_and_abort_cancels() {
        let log: Log = Arc::default();
        let throttler = AsyncThrottler::new(
            doubler(Arc::clone(&log), ms(1_000)),
            AsyncThrottlerOptions::new(ms(100)).enabled(false),
        );
        assert_eq!(throttler.maybe_execute(1).await, Ok(None));
        assert_eq!(throttler.state().status, ThrottlerStatus::Disabled);

        throttler.set_options(|o| o.enabled = true.into());
        let running = throttler.maybe_execute(2);
        tokio::time::sleep(ms(10)).await;
        assert_eq!(throttler.state().status, ThrottlerStatus::Executing);
        throttler.abort();
        assert_eq!(running.await, Ok(None));
        assert_eq!(throttler.state().settle_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_reaches_a_leading_call_before_it_starts() {
        let log: Log = Arc::default();
        let throttler = AsyncThrottler::new(
            doubler(Arc::clone(&log), ms(10)),
            AsyncThrottlerOptions::new(ms(100)).trailing(false),
        );
        let pending = throttler.maybe_execute(1);
        throttler.abort();
        assert_eq!(pending.await, Ok(None));
        assert!(lock(&log).is_empty());
        let state = throttler.state();
        assert_eq!(state.execution_count, 0);
        assert_eq!(state.settle_count, 0);
        assert!(!state.is_executing);
    }
}
