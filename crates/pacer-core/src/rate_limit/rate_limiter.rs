//! Synchronous rate limiter.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::RateLimiterStatus;
use super::window::{Rejection, Window, WindowType, millis};
use crate::exec::SyncFn;
use crate::options::{Dynamic, Hook, ValueHook};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterState {
    /// Accepted executions still inside the window, oldest first.
    #[serde(skip)]
    pub execution_times: Vec<Instant>,
    pub execution_count: u64,
    pub rejection_count: u64,
    pub maybe_execute_count: u64,
    /// No calls remain in the window as of the last decision.
    pub is_exceeded: bool,
    pub enabled: bool,
    pub status: RateLimiterStatus,
}

impl Default for RateLimiterState {
    fn default() -> Self {
        Self {
            execution_times: Vec::new(),
            execution_count: 0,
            rejection_count: 0,
            maybe_execute_count: 0,
            is_exceeded: false,
            enabled: true,
            status: RateLimiterStatus::Idle,
        }
    }
}

impl Derive for RateLimiterState {
    fn derive(&mut self) {
        self.status = if !self.enabled {
            RateLimiterStatus::Disabled
        } else if self.is_exceeded {
            RateLimiterStatus::Exceeded
        } else {
            RateLimiterStatus::Idle
        };
    }
}

#[derive(Clone)]
pub struct RateLimiterOptions {
    pub limit: Dynamic<u32, RateLimiterState>,
    pub window: Dynamic<Duration, RateLimiterState>,
    pub window_type: WindowType,
    pub enabled: Dynamic<bool, RateLimiterState>,
    pub initial_state: Option<RateLimiterState>,
    pub on_execute: Option<Hook<RateLimiterState>>,
    pub on_reject: Option<ValueHook<Rejection>>,
}

impl RateLimiterOptions {
    pub fn new(
        limit: impl Into<Dynamic<u32, RateLimiterState>>,
        window: impl Into<Dynamic<Duration, RateLimiterState>>,
    ) -> Self {
        Self {
            limit: limit.into(),
            window: window.into(),
            window_type: WindowType::default(),
            enabled: true.into(),
            initial_state: None,
            on_execute: None,
            on_reject: None,
        }
    }

    pub fn window_type(mut self, window_type: WindowType) -> Self {
        self.window_type = window_type;
        self
    }

    pub fn enabled(mut self, enabled: impl Into<Dynamic<bool, RateLimiterState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn initial_state(mut self, state: RateLimiterState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&RateLimiterState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }

    pub fn on_reject(mut self, f: impl Fn(&Rejection) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Arc::new(f));
        self
    }
}

/// Runs `f` at most `limit` times per window; extra calls are rejected.
pub struct RateLimiter<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for RateLimiter<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<A> {
    func: SyncFn<A>,
    options: Mutex<Arc<RateLimiterOptions>>,
    store: Store<RateLimiterState>,
    epoch: Instant,
}

impl<A> RateLimiter<A> {
    pub fn new(f: impl Fn(A) + Send + Sync + 'static, options: RateLimiterOptions) -> Self {
        let initial = options.initial_state.clone().unwrap_or_default();
        Self {
            inner: Arc::new(Inner {
                func: Arc::new(f),
                options: Mutex::new(Arc::new(options)),
                store: Store::new(initial),
                epoch: Instant::now(),
            }),
        }
    }

    /// Execute `f` if the window has room. Returns whether it ran.
    pub fn maybe_execute(&self, args: A) -> bool {
        let options = self.options();
        let snapshot = self.inner.store.get();
        if !options.enabled.resolve(&snapshot) {
            self.inner.store.update(|s| s.enabled = false);
            return false;
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
                s.is_exceeded = window.remaining(&s.execution_times) == 0;
                Ok(s.execution_count)
            }
        });

        match decision {
            Ok(execution_count) => {
                tracing::debug!(execution_count, "rate limit accepted");
                (self.inner.func)(args);
                if let Some(hook) = &options.on_execute {
                    hook(&self.inner.store.get());
                }
                true
            }
            Err(rejection) => {
                tracing::debug!(?rejection, "rate limit rejected");
                if let Some(hook) = &options.on_reject {
                    hook(&rejection);
                }
                false
            }
        }
    }

    /// Calls still allowed in the current window.
    pub fn remaining_in_window(&self) -> u32 {
        let options = self.options();
        let window = self.window(&options, &self.inner.store.get());
        let now = Instant::now();
        window.remaining(&self.live_times(&window, now))
    }

    /// Milliseconds until another call would be accepted; 0 if one would be
    /// accepted now.
    pub fn ms_until_next_window(&self) -> u64 {
        let options = self.options();
        let window = self.window(&options, &self.inner.store.get());
        let now = Instant::now();
        millis(window.until_next(&self.live_times(&window, now), now))
    }

    pub fn reset(&self) {
        let enabled = self.options().enabled.resolve(&self.inner.store.get());
        self.inner.store.replace(RateLimiterState {
            enabled,
            ..RateLimiterState::default()
        });
    }

    pub fn options(&self) -> Arc<RateLimiterOptions> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut RateLimiterOptions)) {
        let mut next = RateLimiterOptions::clone(&self.options());
        edit(&mut next);
        let enabled = next.enabled.clone();
        *lock(&self.inner.options) = Arc::new(next);
        let enabled = enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.enabled = enabled);
    }

    pub fn state(&self) -> RateLimiterState {
        self.inner.store.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&RateLimiterState) + Send + Sync + 'static) -> SubscriptionId {
        let listener: Listener<RateLimiterState> = Arc::new(listener);
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

    fn window(&self, options: &RateLimiterOptions, snapshot: &RateLimiterState) -> Window {
        Window {
            kind: options.window_type,
            length: options.window.resolve(snapshot),
            limit: options.limit.resolve(snapshot),
            epoch: self.inner.epoch,
        }
    }
}
