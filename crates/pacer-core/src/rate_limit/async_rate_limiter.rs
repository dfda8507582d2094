//! Async rate limiter. Accepted calls start immediately and may overlap;
//! only their start times count against the window.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::RateLimiterStatus;
use super::window::{Rejection, Window, WindowType, millis};
use crate::abort::{AbortSet, AbortSignal, run_abortable};
use crate::exec::{AsyncFn, ResultHooks, SettleCounters, boxed, reply_all, settle};
use crate::options::{Dynamic, Hook, ValueHook};
use crate::outcome::Pending;
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncRateLimiterState {
    #[serde(skip)]
    pub execution_times: Vec<Instant>,
    pub execution_count: u64,
    pub rejection_count: u64,
    pub maybe_execute_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    /// Executions currently running.
    pub in_flight: u32,
    pub is_executing: bool,
    pub is_exceeded: bool,
    pub enabled: bool,
    pub last_error: Option<String>,
    pub status: RateLimiterStatus,
}

impl Default for AsyncRateLimiterState {
    fn default() -> Self {
        Self {
            execution_times: Vec::new(),
            execution_count: 0,
            rejection_count: 0,
            maybe_execute_count: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            in_flight: 0,
            is_executing: false,
            is_exceeded: false,
            enabled: true,
            last_error: None,
            status: RateLimiterStatus::Idle,
        }
    }
}

impl Derive for AsyncRateLimiterState {
    fn derive(&mut self) {
        self.is_executing = self.in_flight > 0;
        self.status = if !self.enabled {
            RateLimiterStatus::Disabled
        } else if self.is_exceeded {
            RateLimiterStatus::Exceeded
        } else if self.is_executing {
            RateLimiterStatus::Executing
        } else {
            RateLimiterStatus::Idle
        };
    }
}

impl SettleCounters for AsyncRateLimiterState {
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

pub struct AsyncRateLimiterOptions<T, E> {
    pub limit: Dynamic<u32, AsyncRateLimiterState>,
    pub window: Dynamic<Duration, AsyncRateLimiterState>,
    pub window_type: WindowType,
    pub enabled: Dynamic<bool, AsyncRateLimiterState>,
    pub throw_on_error: Option<bool>,
    pub initial_state: Option<AsyncRateLimiterState>,
    pub on_execute: Option<Hook<AsyncRateLimiterState>>,
    pub on_reject: Option<ValueHook<Rejection>>,
    pub on_success: Option<ValueHook<T>>,
    pub on_error: Option<ValueHook<E>>,
    pub on_settled: Option<Hook<AsyncRateLimiterState>>,
}

impl<T, E> Clone for AsyncRateLimiterOptions<T, E> {
    fn clone(&self) -> Self {
        Self {
            limit: self.limit.clone(),
            window: self.window.clone(),
            window_type: self.window_type,
            enabled: self.enabled.clone(),
            throw_on_error: self.throw_on_error,
            initial_state: self.initial_state.clone(),
            on_execute: self.on_execute.clone(),
            on_reject: self.on_reject.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T, E> AsyncRateLimiterOptions<T, E> {
    pub fn new(
        limit: impl Into<Dynamic<u32, AsyncRateLimiterState>>,
        window: impl Into<Dynamic<Duration, AsyncRateLimiterState>>,
    ) -> Self {
        Self {
            limit: limit.into(),
            window: window.into(),
            window_type: WindowType::default(),
            enabled: true.into(),
            throw_on_error: None,
            initial_state: None,
            on_execute: None,
            on_reject: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn window_type(mut self, window_type: WindowType) -> Self {
        self.window_type = window_type;
        self
    }

    pub fn enabled(mut self, enabled: impl Into<Dynamic<bool, AsyncRateLimiterState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncRateLimiterState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&AsyncRateLimiterState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }

    pub fn on_reject(mut self, f: impl Fn(&Rejection) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Arc::new(f));
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

    pub fn on_settled(mut self, f: impl Fn(&AsyncRateLimiterState) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

pub struct AsyncRateLimiter<A, T, E> {
    inner: Arc<Inner<A, T, E>>,
}

impl<A, T, E> Clone for AsyncRateLimiter<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A, T, E> {
    func: AsyncFn<A, T, E>,
    options: Mutex<Arc<AsyncRateLimiterOptions<T, E>>>,
    store: Store<AsyncRateLimiterState>,
    aborts: Mutex<AbortSet>,
    epoch: Instant,
}

impl<A, T, E> AsyncRateLimiter<A, T, E>
where
    A: Send + 'static,
    T: Clone + Send + 'static,
    E: Clone + std::fmt::Display + Send + 'static,
{
    pub fn new<F, Fut>(f: F, options: AsyncRateLimiterOptions<T, E>) -> Self
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
                aborts: Mutex::new(AbortSet::default()),
                epoch: Instant::now(),
            }),
        }
    }

    /// Start `f` if the window has room. A rejected or disabled call
    /// resolves to `Ok(None)` without running anything.
    pub fn maybe_execute(&self, args: A) -> Pending<T, E> {
        let options = self.options();
        let snapshot = self.inner.store.get();
        if !options.enabled.resolve(&snapshot) {
            self.inner.store.update(|s| s.enabled = false);
            return Pending::skipped();
        }
        let window = self.window(&options, &snapshot);
        let now = Instant::now();

        let decision = self.inner.store.update(|s| {
            s.enabled = true;
            s.maybe_execute_count += 1;
            window.purge(&mut s.execution_times, now);
            if window.remaining(&s.execution_times) == 0 {
                s.rejection_count += 1;
                s.is_exceeded = true;
                Err(window.rejection(&s.execution_times, now))
            } else {
                s.execution_times.push(now);
                s.execution_count += 1;
                s.in_flight += 1;
                s.is_exceeded = window.remaining(&s.execution_times) == 0;
                Ok(s.clone())
            }
        });

        let state = match decision {
            Ok(state) => state,
            Err(rejection) => {
                tracing::debug!(?rejection, "rate limit rejected");
                if let Some(hook) = &options.on_reject {
                    hook(&rejection);
                }
                return Pending::skipped();
            }
        };
        tracing::debug!(execution_count = state.execution_count, "rate limit accepted");
        if let Some(hook) = &options.on_execute {
            hook(&state);
        }

        let (tx, pending) = Pending::channel();
        let (exec_id, signal) = lock(&self.inner.aborts).register();
        let future = (self.inner.func)(args);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = run_abortable(future, &signal).await;
            lock(&inner.aborts).release(exec_id);
            inner.store.update(|s| s.in_flight = s.in_flight.saturating_sub(1));
            let options = Arc::clone(&lock(&inner.options));
            let hooks = ResultHooks {
                on_success: options.on_success.as_ref(),
                on_error: options.on_error.as_ref(),
                on_settled: options.on_settled.as_ref(),
                throw_on_error: options.throw_on_error,
            };
            let reply = settle(&inner.store, hooks, outcome);
            reply_all(reply, vec![tx], "rate limited execution");
        });
        pending
    }

    pub fn remaining_in_window(&self) -> u32 {
        let options = self.options();
        let window = self.window(&options, &self.inner.store.get());
        let now = Instant::now();
        window.remaining(&self.live_times(&window, now))
    }

    pub fn ms_until_next_window(&self) -> u64 {
        let options = self.options();
        let window = self.window(&options, &self.inner.store.get());
        let now = Instant::now();
        millis(window.until_next(&self.live_times(&window, now), now))
    }

    /// Abort every running execution. The window is left as is.
    pub fn abort(&self) {
        let aborted = lock(&self.inner.aborts).abort_all();
        tracing::debug!(aborted, "rate limiter abort requested");
    }

    pub fn abort_signal(&self) -> Option<AbortSignal> {
        lock(&self.inner.aborts).latest_signal()
    }

    pub fn reset(&self) {
        self.abort();
        let enabled = self.options().enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| {
            *s = AsyncRateLimiterState {
                enabled,
                // aborted executions still decrement as they unwind
                in_flight: s.in_flight,
                ..AsyncRateLimiterState::default()
            }
        });
    }

    pub fn options(&self) -> Arc<AsyncRateLimiterOptions<T, E>> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut AsyncRateLimiterOptions<T, E>)) {
        let mut next = AsyncRateLimiterOptions::clone(&self.options());
        edit(&mut next);
        let enabled = next.enabled.clone();
        *lock(&self.inner.options) = Arc::new(next);
        let enabled = enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.enabled = enabled);
    }

    pub fn state(&self) -> AsyncRateLimiterState {
        self.inner.store.get()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&AsyncRateLimiterState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let listener: Listener<AsyncRateLimiterState> = Arc::new(listener);
        self.inner.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }

    /// Timestamps still inside the window. The store is only written,
    /// and listeners notified, when some fell out.
    fn live_times(&self, window: &Window, now: Instant) -> Vec<Instant> {
        let live = self
            .inner
            .store
            .read(|s| (!window.has_stale(&s.execution_times, now)).then(|| s.execution_times.clone()));
        live.unwrap_or_else(|| {
            self.inner.store.update(|s| {
                window.purge(&mut s.execution_times, now);
                s.is_exceeded = window.remaining(&s.execution_times) == 0;
                s.execution_times.clone()
            })
        })
    }

    fn window(&self, options: &AsyncRateLimiterOptions<T, E>, snapshot: &AsyncRateLimiterState) -> Window {
        Window {
            kind: options.window_type,
            length: options.window.resolve(snapshot),
            limit: options.limit.resolve(snapshot),
            epoch: self.inner.epoch,
        }
    }
}
