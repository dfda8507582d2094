//! Async debouncer: like [`Debouncer`](super::Debouncer) for functions
//! returning futures.
//!
//! Executions never overlap. A timer that fires while the previous
//! execution is still running defers to it; the newest arguments run as
//! soon as it settles.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::DebouncerStatus;
use crate::abort::{AbortSet, AbortSignal, run_abortable};
use crate::exec::{AsyncFn, ResultHooks, SettleCounters, boxed, reply_all, settle};
use crate::options::{Dynamic, Hook, ValueHook};
use crate::outcome::{Pending, Settle};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};
use crate::timer::TimerSlot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncDebouncerState {
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
    pub status: DebouncerStatus,
}

impl Default for AsyncDebouncerState {
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
            status: DebouncerStatus::Idle,
        }
    }
}

impl Derive for AsyncDebouncerState {
    fn derive(&mut self) {
        self.status = if !self.enabled {
            DebouncerStatus::Disabled
        } else if self.is_executing {
            DebouncerStatus::Executing
        } else if self.is_pending {
            DebouncerStatus::Pending
        } else {
            DebouncerStatus::Idle
        };
    }
}

pub struct AsyncDebouncerOptions<T, E> {
    pub wait: Dynamic<Duration, AsyncDebouncerState>,
    pub leading: bool,
    pub trailing: bool,
    pub enabled: Dynamic<bool, AsyncDebouncerState>,
    /// `None` means: raise errors unless `on_error` is set.
    pub throw_on_error: Option<bool>,
    pub initial_state: Option<AsyncDebouncerState>,
    pub on_execute: Option<Hook<AsyncDebouncerState>>,
    pub on_success: Option<ValueHook<T>>,
    pub on_error: Option<ValueHook<E>>,
    pub on_settled: Option<Hook<AsyncDebouncerState>>,
}

impl<T, E> Clone for AsyncDebouncerOptions<T, E> {
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

impl<T, E> AsyncDebouncerOptions<T, E> {
    pub fn new(wait: impl Into<Dynamic<Duration, AsyncDebouncerState>>) -> Self {
        Self {
            wait: wait.into(),
            leading: false,
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

    pub fn enabled(mut self, enabled: impl Into<Dynamic<bool, AsyncDebouncerState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncDebouncerState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&AsyncDebouncerState) + Send + Sync + 'static) -> Self {
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

    pub fn on_settled(mut self, f: impl Fn(&AsyncDebouncerState) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

/// Debounces an async function. Every `maybe_execute` returns a
/// [`Pending`] that resolves with the result of the execution which
/// eventually covers that call.
pub struct AsyncDebouncer<A, T, E> {
    inner: Arc<Inner<A, T, E>>,
}

impl<A, T, E> Clone for AsyncDebouncer<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A, T, E> {
    func: AsyncFn<A, T, E>,
    options: Mutex<Arc<AsyncDebouncerOptions<T, E>>>,
    store: Store<AsyncDebouncerState>,
    core: Mutex<Core<A, T, E>>,
    aborts: Mutex<AbortSet>,
}

struct Core<A, T, E> {
    timer: TimerSlot,
    last_args: Option<A>,
    waiters: Vec<Settle<T, E>>,
    is_executing: bool,
    /// The timer fired (or `flush` ran) during an execution.
    run_after_current: bool,
}

/// Arguments plus the callers waiting for their result. The abort
/// registration is taken when the job is built so `abort` reaches it
/// before the task running it is first polled.
struct Job<A, T, E> {
    args: A,
    waiters: Vec<Settle<T, E>>,
    exec_id: u64,
    signal: AbortSignal,
}

impl<A, T, E> AsyncDebouncer<A, T, E>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + std::fmt::Display + Send + 'static,
{
    pub fn new<F, Fut>(f: F, options: AsyncDebouncerOptions<T, E>) -> Self
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

    pub fn maybe_execute(&self, args: A) -> Pending<T, E> {
        let options = self.options();
        let snapshot = self.inner.store.get();
        if !options.enabled.resolve(&snapshot) {
            self.inner.store.update(|s| s.enabled = false);
            return Pending::skipped();
        }
        let wait = options.wait.resolve(&snapshot);
        let (tx, pending) = Pending::channel();

        let leading_job = {
            let mut core = lock(&self.inner.core);
            let leading = options.leading && !core.timer.is_armed() && !core.is_executing;
            let job = if leading {
                core.is_executing = true;
                let (exec_id, signal) = lock(&self.inner.aborts).register();
                Some(Job {
                    args,
                    waiters: vec![tx],
                    exec_id,
                    signal,
                })
            } else {
                core.last_args = Some(args);
                core.waiters.push(tx);
                None
            };
            let weak = Arc::downgrade(&self.inner);
            core.timer.arm(wait, move |generation| fire(weak, generation));
            job
        };

        let is_pending = options.trailing && leading_job.is_none();
        self.inner.store.update(|s| {
            s.enabled = true;
            s.maybe_execute_count += 1;
            s.is_pending = is_pending;
        });

        if let Some(job) = leading_job {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.run(job).await });
        }
        pending
    }

    /// Execute the pending call now. Resolves with that execution's result,
    /// or `Ok(None)` if nothing was pending.
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

    /// Drop the pending call. Callers waiting on it resolve to `Ok(None)`.
    /// In-flight executions are untouched; see [`abort`](Self::abort).
    pub fn cancel(&self) {
        {
            let mut core = lock(&self.inner.core);
            core.timer.cancel();
            core.last_args = None;
            core.waiters.clear();
            core.run_after_current = false;
        }
        self.inner.store.update(|s| s.is_pending = false);
    }

    /// Abort in-flight executions. Pending (not yet started) calls stay.
    pub fn abort(&self) {
        let aborted = lock(&self.inner.aborts).abort_all();
        tracing::debug!(aborted, "debouncer abort requested");
    }

    pub fn abort_signal(&self) -> Option<AbortSignal> {
        lock(&self.inner.aborts).latest_signal()
    }

    pub fn reset(&self) {
        self.cancel();
        self.abort();
        let enabled = self.options().enabled.resolve(&self.inner.store.get());
        self.inner.store.replace(AsyncDebouncerState {
            enabled,
            ..AsyncDebouncerState::default()
        });
    }

    pub fn options(&self) -> Arc<AsyncDebouncerOptions<T, E>> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut AsyncDebouncerOptions<T, E>)) {
        let mut next = AsyncDebouncerOptions::clone(&self.options());
        edit(&mut next);
        let enabled = next.enabled.clone();
        *lock(&self.inner.options) = Arc::new(next);
        let enabled = enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.enabled = enabled);
    }

    pub fn state(&self) -> AsyncDebouncerState {
        self.inner.store.get()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&AsyncDebouncerState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let listener: Listener<AsyncDebouncerState> = Arc::new(listener);
        self.inner.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }
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

async fn fire<A, T, E>(weak: Weak<Inner<A, T, E>>, generation: u64)
where
    T: Clone + Send + 'static,
    E: Clone + std::fmt::Display + Send + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let trailing = lock(&inner.options).trailing;
    let job = {
        let mut core = lock(&inner.core);
        if !core.timer.claim(generation) {
            return;
        }
        if !trailing {
            core.last_args = None;
            core.waiters.clear();
            None
        } else if core.is_executing {
            core.run_after_current = core.last_args.is_some();
            None
        } else {
            core.take_job(&inner.aborts)
        }
    };
    inner.store.update(|s| s.is_pending = false);
    if let Some(job) = job {
        inner.run(job).await;
    }
}

impl<A, T, E> Inner<A, T, E>
where
    T: Clone + Send + 'static,
    E: Clone + std::fmt::Display + Send + 'static,
{
    /// Run `job`, then any call that queued up behind it.
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
            reply_all(Ok(None), job.waiters, "debounced execution");
            return;
        }
        let options = Arc::clone(&lock(&self.options));
        let state = self.store.update(|s| {
            s.is_executing = true;
            s.execution_count += 1;
            s.last_execution_time = Some(Instant::now());
            s.clone()
        });
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
        reply_all(reply, job.waiters, "debounced execution");
    }
}

impl SettleCounters for AsyncDebouncerState {
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
