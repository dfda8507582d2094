//! Retryer: run a fallible async function, retrying with backoff.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::backoff::{Backoff, apply_jitter};
use crate::abort::{AbortSet, AbortSignal, run_abortable};
use crate::error::ExecutionError;
use crate::exec::{AsyncFn, boxed};
use crate::options::{Dynamic, Hook, ValueHook};
use crate::outcome::Outcome;
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};

/// What `execute` does with errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrowOnError {
    /// Retry, then return the terminal error once attempts are exhausted.
    #[default]
    Last,
    /// Return the first error immediately; no retries.
    Always,
    /// Retry, then swallow the terminal error and return `Ok(None)`.
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryerStatus {
    #[default]
    Idle,
    Executing,
    Retrying,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryerState {
    /// Attempt number of the current (or last) execution, 1-indexed.
    pub current_attempt: u32,
    /// Number of times the wrapped function has been invoked.
    pub execution_count: u64,
    pub is_executing: bool,
    /// True while waiting out a backoff and during the attempts after it.
    pub is_retrying: bool,
    pub enabled: bool,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub last_execution_time: Option<Instant>,
    /// Elapsed time of the current (or last) top-level execution.
    pub total_execution_time: Duration,
    pub status: RetryerStatus,
}

impl Default for RetryerState {
    fn default() -> Self {
        Self {
            current_attempt: 0,
            execution_count: 0,
            is_executing: false,
            is_retrying: false,
            enabled: true,
            last_error: None,
            last_execution_time: None,
            total_execution_time: Duration::ZERO,
            status: RetryerStatus::Idle,
        }
    }
}

impl Derive for RetryerState {
    fn derive(&mut self) {
        self.status = if !self.enabled {
            RetryerStatus::Disabled
        } else if self.is_executing && self.is_retrying {
            RetryerStatus::Retrying
        } else if self.is_executing {
            RetryerStatus::Executing
        } else {
            RetryerStatus::Idle
        };
    }
}

pub type RetryHook<E> = Arc<dyn Fn(u32, &ExecutionError<E>) + Send + Sync>;

/// Options for [`Retryer`].
pub struct RetryerOptions<T, E> {
    pub max_attempts: Dynamic<u32, RetryerState>,
    pub backoff: Backoff,
    pub base_wait: Dynamic<Duration, RetryerState>,
    /// Fraction of the computed wait used as symmetric random spread.
    pub jitter: f64,
    pub max_execution_time: Option<Duration>,
    pub max_total_execution_time: Option<Duration>,
    pub throw_on_error: ThrowOnError,
    pub enabled: Dynamic<bool, RetryerState>,
    pub initial_state: Option<RetryerState>,
    /// Called with the failed attempt number before waiting to retry.
    pub on_retry: Option<RetryHook<E>>,
    pub on_error: Option<ValueHook<ExecutionError<E>>>,
    pub on_last_error: Option<ValueHook<ExecutionError<E>>>,
    pub on_success: Option<ValueHook<T>>,
    pub on_settled: Option<Hook<RetryerState>>,
    pub on_abort: Option<Hook<RetryerState>>,
    pub on_execution_timeout: Option<Hook<RetryerState>>,
    pub on_total_execution_timeout: Option<Hook<RetryerState>>,
}

impl<T, E> Default for RetryerOptions<T, E> {
    fn default() -> Self {
        Self {
            max_attempts: 3.into(),
            backoff: Backoff::Exponential,
            base_wait: Duration::from_secs(1).into(),
            jitter: 0.0,
            max_execution_time: None,
            max_total_execution_time: None,
            throw_on_error: ThrowOnError::Last,
            enabled: true.into(),
            initial_state: None,
            on_retry: None,
            on_error: None,
            on_last_error: None,
            on_success: None,
            on_settled: None,
            on_abort: None,
            on_execution_timeout: None,
            on_total_execution_timeout: None,
        }
    }
}

impl<T, E> Clone for RetryerOptions<T, E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts.clone(),
            backoff: self.backoff,
            base_wait: self.base_wait.clone(),
            jitter: self.jitter,
            max_execution_time: self.max_execution_time,
            max_total_execution_time: self.max_total_execution_time,
            throw_on_error: self.throw_on_error,
            enabled: self.enabled.clone(),
            initial_state: self.initial_state.clone(),
            on_retry: self.on_retry.clone(),
            on_error: self.on_error.clone(),
            on_last_error: self.on_last_error.clone(),
            on_success: self.on_success.clone(),
            on_settled: self.on_settled.clone(),
            on_abort: self.on_abort.clone(),
            on_execution_timeout: self.on_execution_timeout.clone(),
            on_total_execution_timeout: self.on_total_execution_timeout.clone(),
        }
    }
}

impl<T, E> RetryerOptions<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, n: impl Into<Dynamic<u32, RetryerState>>) -> Self {
        self.max_attempts = n.into();
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_wait(mut self, wait: impl Into<Dynamic<Duration, RetryerState>>) -> Self {
        self.base_wait = wait.into();
        self
    }

    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = Some(limit);
        self
    }

    pub fn max_total_execution_time(mut self, limit: Duration) -> Self {
        self.max_total_execution_time = Some(limit);
        self
    }

    pub fn throw_on_error(mut self, mode: ThrowOnError) -> Self {
        self.throw_on_error = mode;
        self
    }

    pub fn enabled(mut self, enabled: impl Into<Dynamic<bool, RetryerState>>) -> Self {
        self.enabled = enabled.into();
        self
    }

    pub fn initial_state(mut self, state: RetryerState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_retry(mut self, f: impl Fn(u32, &ExecutionError<E>) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ExecutionError<E>) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_last_error(mut self, f: impl Fn(&ExecutionError<E>) + Send + Sync + 'static) -> Self {
        self.on_last_error = Some(Arc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_settled(mut self, f: impl Fn(&RetryerState) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    pub fn on_abort(mut self, f: impl Fn(&RetryerState) + Send + Sync + 'static) -> Self {
        self.on_abort = Some(Arc::new(f));
        self
    }

    pub fn on_execution_timeout(mut self, f: impl Fn(&RetryerState) + Send + Sync + 'static) -> Self {
        self.on_execution_timeout = Some(Arc::new(f));
        self
    }

    pub fn on_total_execution_timeout(
        mut self,
        f: impl Fn(&RetryerState) + Send + Sync + 'static,
    ) -> Self {
        self.on_total_execution_timeout = Some(Arc::new(f));
        self
    }

    fn delay_after(&self, attempt: u32, state: &RetryerState) -> Duration {
        let base = self.base_wait.resolve(state);
        let delay = self.backoff.delay(base, attempt);
        apply_jitter(delay, self.jitter, &mut rand::thread_rng())
    }
}

/// Retries a fallible async function according to [`RetryerOptions`].
///
/// Cloning yields another handle to the same instance.
///
/// ```ignore
/// let retryer = Retryer::new(
///     |url: String| async move { fetch(&url).await },
///     RetryerOptions::new().max_attempts(3).base_wait(Duration::from_millis(100)),
/// );
/// let body = retryer.execute("https://example.com".into()).await?;
/// ```
pub struct Retryer<A, T, E> {
    inner: Arc<RetryerInner<A, T, E>>,
}

impl<A, T, E> Clone for Retryer<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RetryerInner<A, T, E> {
    func: AsyncFn<A, T, E>,
    options: Mutex<Arc<RetryerOptions<T, E>>>,
    store: Store<RetryerState>,
    aborts: Mutex<AbortSet>,
}

impl<A, T, E> Retryer<A, T, E>
where
    A: Clone + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    pub fn new<F, Fut>(f: F, options: RetryerOptions<T, E>) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::from_boxed(boxed(f), options)
    }

    pub(crate) fn from_boxed(func: AsyncFn<A, T, E>, options: RetryerOptions<T, E>) -> Self {
        let initial = options.initial_state.clone().unwrap_or_default();
        Self {
            inner: Arc::new(RetryerInner {
                func,
                options: Mutex::new(Arc::new(options)),
                store: Store::new(initial),
                aborts: Mutex::new(AbortSet::default()),
            }),
        }
    }

    /// Run with retries and apply `throw_on_error`.
    ///
    /// Returns `Ok(None)` when the execution was aborted, the retryer is
    /// disabled, or the terminal error was swallowed (`ThrowOnError::Never`).
    pub async fn execute(&self, args: A) -> Result<Option<T>, ExecutionError<E>> {
        let mode = self.options().throw_on_error;
        match self.execute_outcome(args).await {
            Outcome::Success(v) => Ok(Some(v)),
            Outcome::Cancelled => Ok(None),
            Outcome::Failure(_) if mode == ThrowOnError::Never => Ok(None),
            Outcome::Failure(e) => Err(e),
        }
    }

    /// Run with retries and report the three-way outcome without applying
    /// `throw_on_error` to the return value (it still stops retries when
    /// set to `Always`). A disabled retryer reports `Cancelled`.
    pub async fn execute_outcome(&self, args: A) -> Outcome<T, ExecutionError<E>> {
        let options = self.options();
        let enabled = options.enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.enabled = enabled);
        if !enabled {
            tracing::debug!("retryer disabled, skipping execution");
            return Outcome::Cancelled;
        }

        let (exec_id, signal) = lock(&self.inner.aborts).register();
        let started = Instant::now();
        self.inner.store.update(|s| {
            s.current_attempt = 0;
            s.is_executing = true;
            s.is_retrying = false;
            s.last_error = None;
            s.total_execution_time = Duration::ZERO;
        });

        let outcome = match options.max_total_execution_time {
            Some(budget) => {
                tokio::select! {
                    outcome = self.attempts(args, &options, &signal, started) => outcome,
                    _ = tokio::time::sleep(budget) => {
                        tracing::warn!(?budget, "total execution time exceeded");
                        let err = ExecutionError::TotalTimeout(budget);
                        self.inner.store.update(|s| s.last_error = Some(err.to_string()));
                        if let Some(hook) = &options.on_total_execution_timeout {
                            hook(&self.inner.store.get());
                        }
                        if let Some(hook) = &options.on_error {
                            hook(&err);
                        }
                        if let Some(hook) = &options.on_last_error {
                            hook(&err);
                        }
                        Outcome::Failure(err)
                    }
                }
            }
            None => self.attempts(args, &options, &signal, started).await,
        };

        lock(&self.inner.aborts).release(exec_id);
        let state = self.inner.store.update(|s| {
            s.is_executing = false;
            s.is_retrying = false;
            s.last_execution_time = Some(Instant::now());
            s.total_execution_time = started.elapsed();
            s.clone()
        });

        match &outcome {
            Outcome::Success(value) => {
                if let Some(hook) = &options.on_success {
                    hook(value);
                }
                if let Some(hook) = &options.on_settled {
                    hook(&state);
                }
            }
            Outcome::Failure(_) => {
                if let Some(hook) = &options.on_settled {
                    hook(&state);
                }
            }
            Outcome::Cancelled => {
                tracing::debug!(attempt = state.current_attempt, "retryer aborted");
                if let Some(hook) = &options.on_abort {
                    hook(&state);
                }
            }
        }
        outcome
    }

    async fn attempts(
        &self,
        args: A,
        options: &RetryerOptions<T, E>,
        signal: &AbortSignal,
        started: Instant,
    ) -> Outcome<T, ExecutionError<E>> {
        let max_attempts = options.max_attempts.resolve(&self.inner.store.get()).max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.inner.store.update(|s| {
                s.current_attempt = attempt;
                s.execution_count += 1;
            });

            let fut = (self.inner.func)(args.clone());
            let result = match options.max_execution_time {
                Some(limit) => {
                    run_abortable(
                        async {
                            match tokio::time::timeout(limit, fut).await {
                                Ok(r) => r.map_err(ExecutionError::Failed),
                                Err(_elapsed) => {
                                    if let Some(hook) = &options.on_execution_timeout {
                                        hook(&self.inner.store.get());
                                    }
                                    Err(ExecutionError::Timeout(limit))
                                }
                            }
                        },
                        signal,
                    )
                    .await
                }
                None => run_abortable(async { fut.await.map_err(ExecutionError::Failed) }, signal).await,
            };
            self.inner
                .store
                .update(|s| s.total_execution_time = started.elapsed());

            let err = match result {
                Outcome::Success(v) => return Outcome::Success(v),
                Outcome::Cancelled => return Outcome::Cancelled,
                Outcome::Failure(err) => err,
            };

            self.inner.store.update(|s| s.last_error = Some(err.to_string()));
            if let Some(hook) = &options.on_error {
                hook(&err);
            }

            if options.throw_on_error == ThrowOnError::Always || attempt >= max_attempts {
                tracing::debug!(attempt, max_attempts, error = %err, "giving up");
                if let Some(hook) = &options.on_last_error {
                    hook(&err);
                }
                return Outcome::Failure(err);
            }

            let delay = options.delay_after(attempt, &self.inner.store.get());
            tracing::warn!(attempt, max_attempts, ?delay, error = %err, "attempt failed, retrying");
            if let Some(hook) = &options.on_retry {
                hook(attempt, &err);
            }
            self.inner.store.update(|s| s.is_retrying = true);

            let waited = run_abortable(
                async {
                    tokio::time::sleep(delay).await;
                    Ok::<(), ()>(())
                },
                signal,
            )
            .await;
            if waited.is_cancelled() {
                return Outcome::Cancelled;
            }
        }
    }

    /// Abort every execution in flight. Pending backoff waits end too;
    /// the affected `execute` calls return `Ok(None)`.
    pub fn abort(&self) {
        let aborted = lock(&self.inner.aborts).abort_all();
        if aborted > 0 {
            tracing::debug!(aborted, "retryer abort requested");
        }
    }

    /// Signal of the most recent in-flight execution, for wrapped functions
    /// that want to observe cancellation themselves.
    pub fn abort_signal(&self) -> Option<AbortSignal> {
        lock(&self.inner.aborts).latest_signal()
    }

    /// Abort in-flight work and return state to defaults.
    pub fn reset(&self) {
        self.abort();
        self.inner.store.replace(RetryerState::default());
    }

    pub fn options(&self) -> Arc<RetryerOptions<T, E>> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut RetryerOptions<T, E>)) {
        let mut next = RetryerOptions::clone(&self.options());
        edit(&mut next);
        let enabled = next.enabled.clone();
        *lock(&self.inner.options) = Arc::new(next);
        let enabled = enabled.resolve(&self.inner.store.get());
        self.inner.store.update(|s| s.enabled = enabled);
    }

    pub fn state(&self) -> RetryerState {
        self.inner.store.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&RetryerState) + Send + Sync + 'static) -> SubscriptionId {
        let listener: Listener<RetryerState> = Arc::new(listener);
        self.inner.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }
}
