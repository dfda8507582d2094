//! Async batcher. Every flush runs through its own [`Retryer`].

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::dedup::{Admission, DedupStrategy, Entry, ProcessedKeys, admit};
use super::{BatchHook, BatcherStatus, DEFAULT_MAX_TRACKED_KEYS, DuplicateHook, KeyFn, ShouldExecuteFn};
use crate::abort::{AbortController, AbortSignal};
use crate::error::ExecutionError;
use crate::exec::{AsyncFn, ResultHooks, SettleCounters, boxed, settle};
use crate::options::{Dynamic, Hook, ValueHook};
use crate::outcome::Outcome;
use crate::retry::{Retryer, RetryerOptions};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};
use crate::timer::TimerSlot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncBatcherState {
    pub execution_count: u64,
    pub total_items_processed: u64,
    pub add_item_count: u64,
    pub duplicate_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    /// Items of batches that failed every attempt.
    pub failed_item_count: usize,
    pub size: usize,
    /// Batches currently running.
    pub active_batches: usize,
    pub is_empty: bool,
    pub is_pending: bool,
    pub is_executing: bool,
    pub is_running: bool,
    pub last_error: Option<String>,
    pub status: BatcherStatus,
}

impl Default for AsyncBatcherState {
    fn default() -> Self {
        Self {
            execution_count: 0,
            total_items_processed: 0,
            add_item_count: 0,
            duplicate_count: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            failed_item_count: 0,
            size: 0,
            active_batches: 0,
            is_empty: true,
            is_pending: false,
            is_executing: false,
            is_running: true,
            last_error: None,
            status: BatcherStatus::Idle,
        }
    }
}

impl Derive for AsyncBatcherState {
    fn derive(&mut self) {
        self.is_empty = self.size == 0;
        self.is_executing = self.active_batches > 0;
        self.status = BatcherStatus::of(self.is_running, self.is_executing, self.size);
    }
}

impl SettleCounters for AsyncBatcherState {
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

pub struct AsyncBatcherOptions<T, R, E> {
    pub max_size: Option<usize>,
    pub wait: Dynamic<Option<Duration>, AsyncBatcherState>,
    pub get_should_execute: Option<ShouldExecuteFn<T, AsyncBatcherState>>,
    pub started: bool,
    pub get_item_key: Option<KeyFn<T>>,
    pub dedup_strategy: DedupStrategy,
    pub track_processed_keys: bool,
    pub max_tracked_keys: usize,
    /// Retry policy applied to each batch. One attempt by default.
    pub retry: RetryerOptions<R, E>,
    pub throw_on_error: Option<bool>,
    pub initial_state: Option<AsyncBatcherState>,
    /// Called when a batch starts.
    pub on_execute: Option<BatchHook<T, AsyncBatcherState>>,
    pub on_items_change: Option<Hook<AsyncBatcherState>>,
    pub on_duplicate: Option<DuplicateHook<T, AsyncBatcherState>>,
    pub on_success: Option<ValueHook<R>>,
    pub on_error: Option<ValueHook<ExecutionError<E>>>,
    pub on_settled: Option<Hook<AsyncBatcherState>>,
}

impl<T, R, E> Clone for AsyncBatcherOptions<T, R, E> {
    fn clone(&self) -> Self {
        Self {
            max_size: self.max_size,
            wait: self.wait.clone(),
            get_should_execute: self.get_should_execute.clone(),
            started: self.started,
            get_item_key: self.get_item_key.clone(),
            dedup_strategy: self.dedup_strategy,
            track_processed_keys: self.track_processed_keys,
            max_tracked_keys: self.max_tracked_keys,
            retry: self.retry.clone(),
            throw_on_error: self.throw_on_error,
            initial_state: self.initial_state.clone(),
            on_execute: self.on_execute.clone(),
            on_items_change: self.on_items_change.clone(),
            on_duplicate: self.on_duplicate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T, R, E> Default for AsyncBatcherOptions<T, R, E> {
    fn default() -> Self {
        Self {
            max_size: None,
            wait: Dynamic::Static(None),
            get_should_execute: None,
            started: true,
            get_item_key: None,
            dedup_strategy: DedupStrategy::default(),
            track_processed_keys: false,
            max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
            retry: RetryerOptions::new().max_attempts(1),
            throw_on_error: None,
            initial_state: None,
            on_execute: None,
            on_items_change: None,
            on_duplicate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<T, R, E> AsyncBatcherOptions<T, R, E> {
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Dynamic::Static(Some(wait));
        self
    }

    pub fn get_should_execute(
        mut self,
        f: impl Fn(&[T], &AsyncBatcherState) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.get_should_execute = Some(Arc::new(f));
        self
    }

    pub fn started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    pub fn get_item_key(mut self, f: impl Fn(&T) -> String + Send + Sync + 'static) -> Self {
        self.get_item_key = Some(Arc::new(f));
        self
    }

    pub fn dedup_strategy(mut self, strategy: DedupStrategy) -> Self {
        self.dedup_strategy = strategy;
        self
    }

    pub fn track_processed_keys(mut self, max_tracked_keys: usize) -> Self {
        self.track_processed_keys = true;
        self.max_tracked_keys = max_tracked_keys;
        self
    }

    pub fn retry(mut self, retry: RetryerOptions<R, E>) -> Self {
        self.retry = retry;
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncBatcherState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&[T], &AsyncBatcherState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }

    pub fn on_items_change(mut self, f: impl Fn(&AsyncBatcherState) + Send + Sync + 'static) -> Self {
        self.on_items_change = Some(Arc::new(f));
        self
    }

    pub fn on_duplicate(mut self, f: impl Fn(&T, &AsyncBatcherState) + Send + Sync + 'static) -> Self {
        self.on_duplicate = Some(Arc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ExecutionError<E>) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled(mut self, f: impl Fn(&AsyncBatcherState) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

/// Groups items and hands each group to an async function, retrying
/// failed groups per the `retry` policy.
pub struct AsyncBatcher<T, R, E> {
    inner: Arc<Inner<T, R, E>>,
}

impl<T, R, E> Clone for AsyncBatcher<T, R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T, R, E> {
    func: AsyncFn<Vec<T>, R, E>,
    options: Mutex<Arc<AsyncBatcherOptions<T, R, E>>>,
    store: Store<AsyncBatcherState>,
    core: Mutex<Core<T, R>>,
}

struct Core<T, R> {
    entries: Vec<Entry<T>>,
    processed: ProcessedKeys,
    timer: TimerSlot,
    failed: Vec<T>,
    last_result: Option<R>,
    /// Retryers of running batches, keyed by batch number.
    active: BTreeMap<u64, AbortController>,
    next_batch: u64,
}

impl<T, R, E> AsyncBatcher<T, R, E>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new<F, Fut>(f: F, options: AsyncBatcherOptions<T, R, E>) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_running = options.started;
        Self {
            inner: Arc::new(Inner {
                func: boxed(f),
                options: Mutex::new(Arc::new(options)),
                store: Store::new(initial),
                core: Mutex::new(Core {
                    entries: Vec::new(),
                    processed: ProcessedKeys::default(),
                    timer: TimerSlot::default(),
                    failed: Vec::new(),
                    last_result: None,
                    active: BTreeMap::new(),
                    next_batch: 0,
                }),
            }),
        }
    }

    /// Add an item to the pending batch. Returns `false` if it was dropped
    /// as a duplicate. A trigger fired by this item runs the batch in the
    /// background.
    pub fn add_item(&self, item: T) -> bool {
        let options = self.options();
        let key = options.get_item_key.as_ref().map(|f| f(&item));
        let (admission, len) = {
            let mut core = lock(&self.inner.core);
            let Core {
                entries, processed, ..
            } = &mut *core;
            let admission = admit(entries, item, key, options.dedup_strategy, processed);
            (admission, entries.len())
        };
        let (added, dropped) = match admission {
            Admission::Added => (true, None),
            Admission::Replaced(old) => (true, Some(old)),
            Admission::Duplicate(new) => (false, Some(new)),
        };
        let state = self.inner.store.update(|s| {
            if added {
                s.add_item_count += 1;
            }
            if dropped.is_some() {
                s.duplicate_count += 1;
            }
            s.size = len;
            s.clone()
        });
        if let Some(item) = &dropped {
            tracing::debug!(added, "duplicate batch item");
            if let Some(hook) = &options.on_duplicate {
                hook(item, &state);
            }
        }
        if let Some(hook) = &options.on_items_change {
            hook(&state);
        }
        if added {
            self.inner.check_triggers(&options);
        }
        added
    }

    /// Process the pending batch now and wait for it. `Ok(None)` when
    /// nothing was pending, the batch was aborted, or its error was
    /// swallowed.
    pub async fn flush(&self) -> Result<Option<R>, ExecutionError<E>> {
        self.inner.flush().await
    }

    /// Disarm the `wait` timer. Pending items stay.
    pub fn cancel(&self) {
        lock(&self.inner.core).timer.cancel();
        self.inner.store.update(|s| s.is_pending = false);
    }

    /// Abort running batches. Their items are neither retried nor moved to
    /// the failed list.
    pub fn abort(&self) {
        let core = lock(&self.inner.core);
        if !core.active.is_empty() {
            tracing::debug!(batches = core.active.len(), "aborting running batches");
        }
        for controller in core.active.values() {
            controller.abort();
        }
    }

    pub fn start(&self) {
        self.inner.store.update(|s| s.is_running = true);
        let options = self.options();
        self.inner.check_triggers(&options);
    }

    pub fn stop(&self) {
        self.cancel();
        self.inner.store.update(|s| s.is_running = false);
    }

    pub fn clear(&self) {
        {
            let mut core = lock(&self.inner.core);
            core.timer.cancel();
            core.entries.clear();
        }
        let state = self.inner.store.update(|s| {
            s.size = 0;
            s.is_pending = false;
            s.clone()
        });
        if let Some(hook) = &self.options().on_items_change {
            hook(&state);
        }
    }

    /// Abort running batches, drop pending and failed items, forget
    /// processed keys and return state to its defaults.
    pub fn reset(&self) {
        self.abort();
        {
            let mut core = lock(&self.inner.core);
            core.timer.cancel();
            core.entries.clear();
            core.processed.clear();
            core.failed.clear();
            core.last_result = None;
        }
        let started = self.options().started;
        self.inner.store.replace(AsyncBatcherState {
            is_running: started,
            ..AsyncBatcherState::default()
        });
    }

    pub fn peek_all_items(&self) -> Vec<T> {
        lock(&self.inner.core).entries.iter().map(|e| e.item.clone()).collect()
    }

    pub fn peek_failed_items(&self) -> Vec<T> {
        lock(&self.inner.core).failed.clone()
    }

    /// Drop the failed items and return them.
    pub fn clear_failed_items(&self) -> Vec<T> {
        let failed = std::mem::take(&mut lock(&self.inner.core).failed);
        self.inner.store.update(|s| s.failed_item_count = 0);
        failed
    }

    /// Result of the most recent successful batch.
    pub fn last_result(&self) -> Option<R> {
        lock(&self.inner.core).last_result.clone()
    }

    pub fn options(&self) -> Arc<AsyncBatcherOptions<T, R, E>> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut AsyncBatcherOptions<T, R, E>)) {
        let mut next = AsyncBatcherOptions::clone(&self.options());
        edit(&mut next);
        *lock(&self.inner.options) = Arc::new(next);
    }

    pub fn state(&self) -> AsyncBatcherState {
        self.inner.store.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&AsyncBatcherState) + Send + Sync + 'static) -> SubscriptionId {
        let listener: Listener<AsyncBatcherState> = Arc::new(listener);
        self.inner.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }
}

async fn fire<T, R, E>(weak: Weak<Inner<T, R, E>>, generation: u64)
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + 'static,
    E: Display + Send + 'static,
{
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if !lock(&inner.core).timer.claim(generation) {
        return;
    }
    tracing::trace!("batch wait elapsed");
    if let Err(err) = inner.flush().await {
        tracing::error!(error = %err, "batch failed");
    }
}

impl<T, R, E> Inner<T, R, E>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + 'static,
    E: Display + Send + 'static,
{
    fn check_triggers(self: &Arc<Self>, options: &AsyncBatcherOptions<T, R, E>) {
        let state = self.store.get();
        if !state.is_running || state.size == 0 {
            return;
        }
        let full = options.max_size.is_some_and(|max| state.size >= max);
        let asked = !full
            && options.get_should_execute.as_ref().is_some_and(|f| {
                let items: Vec<T> = lock(&self.core).entries.iter().map(|e| e.item.clone()).collect();
                f(&items, &state)
            });
        if full || asked {
            if let Some(batch) = self.take_batch() {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = inner.run(batch).await {
                        tracing::error!(error = %err, "batch failed");
                    }
                });
            }
            return;
        }
        let Some(wait) = options.wait.resolve(&state) else {
            return;
        };
        let armed = {
            let mut core = lock(&self.core);
            if core.timer.is_armed() {
                false
            } else {
                let weak = Arc::downgrade(self);
                core.timer.arm(wait, move |generation| fire(weak, generation));
                true
            }
        };
        if armed {
            self.store.update(|s| s.is_pending = true);
        }
    }

    async fn flush(&self) -> Result<Option<R>, ExecutionError<E>> {
        match self.take_batch() {
            Some(batch) => self.run(batch).await,
            None => Ok(None),
        }
    }

    /// Swap the pending items out and register an abort controller for
    /// them. Items stay pending while the retry options are disabled.
    fn take_batch(&self) -> Option<Batch<T, R, E>> {
        let options = Arc::clone(&lock(&self.options));
        let retryer = Retryer::from_boxed(Arc::clone(&self.func), options.retry.clone());
        if !options.retry.enabled.resolve(&retryer.state()) {
            tracing::debug!("batch retry disabled, items stay pending");
            lock(&self.core).timer.cancel();
            self.store.update(|s| s.is_pending = false);
            return None;
        }
        let controller = AbortController::new();
        let signal = controller.signal();
        let (entries, id) = {
            let mut core = lock(&self.core);
            core.timer.cancel();
            let entries = std::mem::take(&mut core.entries);
            let id = core.next_batch;
            if !entries.is_empty() {
                core.next_batch += 1;
                core.active.insert(id, controller);
            }
            (entries, id)
        };
        if entries.is_empty() {
            self.store.update(|s| s.is_pending = false);
            return None;
        }
        let (items, keys): (Vec<T>, Vec<Option<String>>) = entries.into_iter().map(|e| (e.item, e.key)).unzip();
        if options.track_processed_keys {
            lock(&self.core)
                .processed
                .remember(keys.into_iter().flatten(), options.max_tracked_keys);
        }
        let count = items.len() as u64;
        let state = self.store.update(|s| {
            s.size = 0;
            s.is_pending = false;
            s.execution_count += 1;
            s.total_items_processed += count;
            s.active_batches += 1;
            s.clone()
        });
        tracing::debug!(items = count, execution_count = state.execution_count, "batch started");
        if let Some(hook) = &options.on_items_change {
            hook(&state);
        }
        if let Some(hook) = &options.on_execute {
            hook(&items, &state);
        }
        Some(Batch {
            id,
            items,
            retryer,
            signal,
            options,
        })
    }

    async fn run(&self, batch: Batch<T, R, E>) -> Result<Option<R>, ExecutionError<E>> {
        let Batch {
            id,
            items,
            retryer,
            signal,
            options,
        } = batch;
        let outcome = if signal.is_aborted() {
            Outcome::Cancelled
        } else {
            tokio::select! {
                biased;
                _ = signal.aborted() => Outcome::Cancelled,
                outcome = retryer.execute_outcome(items.clone()) => outcome,
            }
        };
        let failed = if outcome.is_failure() { items.len() } else { 0 };
        {
            let mut core = lock(&self.core);
            core.active.remove(&id);
            if let Outcome::Success(value) = &outcome {
                core.last_result = Some(value.clone());
            }
            if failed > 0 {
                core.failed.extend(items);
            }
        }
        self.store.update(|s| {
            s.active_batches = s.active_batches.saturating_sub(1);
            s.failed_item_count += failed;
        });
        if failed > 0 {
            tracing::warn!(items = failed, "batch failed, items moved to the failed list");
        }

        let hooks = ResultHooks {
            on_success: options.on_success.as_ref(),
            on_error: options.on_error.as_ref(),
            on_settled: options.on_settled.as_ref(),
            throw_on_error: options.throw_on_error,
        };
        settle(&self.store, hooks, outcome)
    }
}

/// A batch swapped out of the pending list, not yet settled.
struct Batch<T, R, E> {
    id: u64,
    items: Vec<T>,
    retryer: Retryer<Vec<T>, R, E>,
    signal: AbortSignal,
    options: Arc<AsyncBatcherOptions<T, R, E>>,
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    type Call = Pin<Box<dyn Future<Output = Result<usize, String>> + Send>>;
    type Batches = Arc<Mutex<Vec<(Vec<u32>, Duration)>>>;

    /// Records each batch, takes 10ms and returns the batch length. A batch
    /// holding `0` fails.
    fn sink(batches: Batches) -> impl Fn(Vec<u32>) -> Call + Send + Sync + 'static {
        let start = Instant::now();
        move |batch| {
            let batches = Arc::clone(&batches);
            Box::pin(async move {
                lock(&batches).push((batch.clone(), start.elapsed()));
                tokio::time::sleep(ms(10)).await;
                if batch.contains(&0) {
                    Err("zero in batch".to_string())
                } else {
                    Ok(batch.len())
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_runs_in_background() {
        let batches: Batches = Arc::default();
        let batcher = AsyncBatcher::new(sink(Arc::clone(&batches)), AsyncBatcherOptions::default().max_size(2));
        batcher.add_item(1);
        batcher.add_item(2);
        batcher.add_item(3);
        assert_eq!(batcher.peek_all_items(), vec![3]);
        tokio::time::sleep(ms(20)).await;
        assert_eq!(lock(&batches).iter().map(|b| b.0.clone()).collect::<Vec<_>>(), vec![vec![1, 2]]);
        let state = batcher.state();
        assert_eq!(state.success_count, 1);
        assert!(!state.is_executing);
        assert_eq!(state.status, BatcherStatus::Pending);
        assert_eq!(batcher.last_result(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_trigger_and_explicit_flush() {
        let batches: Batches = Arc::default();
        let batcher = AsyncBatcher::new(sink(Arc::clone(&batches)), AsyncBatcherOptions::default().wait(ms(50)));
        batcher.add_item(1);
        tokio::time::sleep(ms(100)).await;
        batcher.add_item(2);
        batcher.add_item(3);
        assert_eq!(batcher.flush().await, Ok(Some(2)));
        assert_eq!(
            *lock(&batches),
            vec![(vec![1], ms(50)), (vec![2, 3], ms(100))]
        );
        assert!(!batcher.state().is_pending);
        assert_eq!(batcher.flush().await, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_retried_then_kept() {
        let batches: Batches = Arc::default();
        let retries = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&retries);
        let batcher = AsyncBatcher::new(
            sink(Arc::clone(&batches)),
            AsyncBatcherOptions::default().started(false).retry(
                RetryerOptions::new()
                    .max_attempts(3)
                    .base_wait(ms(100))
                    .on_retry(move |_, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
            ),
        );
        batcher.add_item(4);
        batcher.add_item(0);
        let err = batcher.flush().await.unwrap_err();
        assert_eq!(err.to_string(), "zero in batch");
        assert_eq!(lock(&batches).len(), 3);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert_eq!(batcher.peek_failed_items(), vec![4, 0]);
        let state = batcher.state();
        assert_eq!(state.error_count, 1);
        assert_eq!(state.failed_item_count, 2);
        assert_eq!(state.last_error.as_deref(), Some("zero in batch"));

        assert_eq!(batcher.clear_failed_items(), vec![4, 0]);
        assert_eq!(batcher.state().failed_item_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_hook_swallows_background_failures() {
        let batches: Batches = Arc::default();
        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let seen = Arc::clone(&errors);
        let batcher = AsyncBatcher::new(
            sink(Arc::clone(&batches)),
            AsyncBatcherOptions::default()
                .max_size(1)
                .on_error(move |err| lock(&seen).push(err.to_string())),
        );
        batcher.add_item(0);
        tokio::time::sleep(ms(20)).await;
        assert_eq!(*lock(&errors), vec!["zero in batch".to_string()]);
        assert_eq!(batcher.peek_failed_items(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_drops_the_running_batch() {
        let batches: Batches = Arc::default();
        let batcher = AsyncBatcher::new(sink(Arc::clone(&batches)), AsyncBatcherOptions::default().started(false));
        batcher.add_item(7);
        let running = batcher.clone();
        let flushed = tokio::spawn(async move { running.flush().await });
        tokio::time::sleep(ms(5)).await;
        assert!(batcher.state().is_executing);
        batcher.abort();
        assert_eq!(flushed.await.unwrap(), Ok(None));
        let state = batcher.state();
        assert_eq!(state.settle_count, 0);
        assert!(!state.is_executing);
        assert!(batcher.peek_failed_items().is_empty());
        assert_eq!(batcher.last_result(), None);
    }

    #[tokio::test]
    async fn keep_last_replaces_pending_duplicate() {
        let batches: Batches = Arc::default();
        let dropped: Arc<Mutex<Vec<u32>>> = Arc::default();
        let seen = Arc::clone(&dropped);
        let batcher = AsyncBatcher::new(
            sink(Arc::clone(&batches)),
            AsyncBatcherOptions::default()
                .started(false)
                .get_item_key(|n: &u32| (n % 10).to_string())
                .dedup_strategy(DedupStrategy::KeepLast)
                .on_duplicate(move |n, _| lock(&seen).push(*n)),
        );
        assert!(batcher.add_item(1));
        assert!(batcher.add_item(2));
        assert!(batcher.add_item(11));
        assert_eq!(batcher.peek_all_items(), vec![11, 2]);
        assert_eq!(*lock(&dropped), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_reaches_a_triggered_batch_before_it_starts() {
        let batches: Batches = Arc::default();
        let batcher = AsyncBatcher::new(sink(Arc::clone(&batches)), AsyncBatcherOptions::default().max_size(1));
        batcher.add_item(7);
        assert!(batcher.state().is_executing);
        batcher.abort();
        tokio::time::sleep(ms(500)).await;
        assert!(lock(&batches).is_empty());
        let state = batcher.state();
        assert_eq!(state.success_count, 0);
        assert_eq!(state.settle_count, 0);
        assert_eq!(state.active_batches, 0);
        assert!(!state.is_executing);
        assert_eq!(batcher.last_result(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_retry_keeps_items_pending() {
        let batches: Batches = Arc::default();
        let batcher = AsyncBatcher::new(
            sink(Arc::clone(&batches)),
            AsyncBatcherOptions::default()
                .max_size(2)
                .retry(RetryerOptions::new().enabled(false)),
        );
        batcher.add_item(1);
        batcher.add_item(2);
        assert_eq!(batcher.flush().await, Ok(None));
        tokio::time::sleep(ms(50)).await;
        assert!(lock(&batches).is_empty());
        assert_eq!(batcher.peek_all_items(), vec![1, 2]);
        let state = batcher.state();
        assert_eq!(state.execution_count, 0);
        assert_eq!(state.total_items_processed, 0);

        batcher.set_options(|o| o.retry = RetryerOptions::new());
        assert_eq!(batcher.flush().await, Ok(Some(2)));
        assert!(batcher.peek_all_items().is_empty());
    }
}
