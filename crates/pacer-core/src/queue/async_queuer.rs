//! Async queuer: drains items through up to `concurrency` slots.
//!
//! Dispatch order follows the queue; completion order does not. A slot
//! that finishes an item waits `wait` before taking the next one.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::items::{ItemQueue, expired};
use super::{ExpiryFn, ItemHook, PriorityFn, QueuePosition, QueuerStatus};
use crate::abort::{AbortSet, AbortSignal, run_abortable};
use crate::exec::{AsyncFn, ResultHooks, SettleCounters, boxed, settle};
use crate::options::{Dynamic, Hook, ValueHook};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncQueuerState {
    pub execution_count: u64,
    pub add_item_count: u64,
    pub rejection_count: u64,
    pub expiration_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    pub size: usize,
    /// Items currently being processed.
    pub active_count: usize,
    pub is_empty: bool,
    pub is_full: bool,
    pub is_running: bool,
    pub last_error: Option<String>,
    pub status: QueuerStatus,
}

impl Default for AsyncQueuerState {
    fn default() -> Self {
        Self {
            execution_count: 0,
            add_item_count: 0,
            rejection_count: 0,
            expiration_count: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            size: 0,
            active_count: 0,
            is_empty: true,
            is_full: false,
            is_running: true,
            last_error: None,
            status: QueuerStatus::Idle,
        }
    }
}

impl Derive for AsyncQueuerState {
    fn derive(&mut self) {
        self.is_empty = self.size == 0;
        self.status = QueuerStatus::of(self.is_running, !self.is_empty || self.active_count > 0);
    }
}

impl SettleCounters for AsyncQueuerState {
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

pub struct AsyncQueuerOptions<T, R, E> {
    pub concurrency: Dynamic<usize, AsyncQueuerState>,
    pub wait: Dynamic<Duration, AsyncQueuerState>,
    pub max_size: Option<usize>,
    pub get_priority: Option<PriorityFn<T>>,
    pub add_items_to: QueuePosition,
    pub get_items_from: QueuePosition,
    pub started: bool,
    pub initial_items: Vec<T>,
    pub expiration_duration: Option<Duration>,
    pub get_is_expired: Option<ExpiryFn<T>>,
    pub throw_on_error: Option<bool>,
    pub initial_state: Option<AsyncQueuerState>,
    pub on_execute: Option<ItemHook<T, AsyncQueuerState>>,
    pub on_reject: Option<ItemHook<T, AsyncQueuerState>>,
    pub on_expire: Option<ItemHook<T, AsyncQueuerState>>,
    pub on_items_change: Option<Hook<AsyncQueuerState>>,
    pub on_success: Option<ValueHook<R>>,
    pub on_error: Option<ValueHook<E>>,
    pub on_settled: Option<Hook<AsyncQueuerState>>,
}

impl<T: Clone, R, E> Clone for AsyncQueuerOptions<T, R, E> {
    fn clone(&self) -> Self {
        Self {
            concurrency: self.concurrency.clone(),
            wait: self.wait.clone(),
            max_size: self.max_size,
            get_priority: self.get_priority.clone(),
            add_items_to: self.add_items_to,
            get_items_from: self.get_items_from,
            started: self.started,
            initial_items: self.initial_items.clone(),
            expiration_duration: self.expiration_duration,
            get_is_expired: self.get_is_expired.clone(),
            throw_on_error: self.throw_on_error,
            initial_state: self.initial_state.clone(),
            on_execute: self.on_execute.clone(),
            on_reject: self.on_reject.clone(),
            on_expire: self.on_expire.clone(),
            on_items_change: self.on_items_change.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T, R, E> Default for AsyncQueuerOptions<T, R, E> {
    fn default() -> Self {
        Self {
            concurrency: 1.into(),
            wait: Duration::ZERO.into(),
            max_size: None,
            get_priority: None,
            add_items_to: QueuePosition::Back,
            get_items_from: QueuePosition::Front,
            started: true,
            initial_items: Vec::new(),
            expiration_duration: None,
            get_is_expired: None,
            throw_on_error: None,
            initial_state: None,
            on_execute: None,
            on_reject: None,
            on_expire: None,
            on_items_change: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<T, R, E> AsyncQueuerOptions<T, R, E> {
    pub fn concurrency(mut self, concurrency: impl Into<Dynamic<usize, AsyncQueuerState>>) -> Self {
        self.concurrency = concurrency.into();
        self
    }

    pub fn wait(mut self, wait: impl Into<Dynamic<Duration, AsyncQueuerState>>) -> Self {
        self.wait = wait.into();
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn get_priority(mut self, f: impl Fn(&T) -> i64 + Send + Sync + 'static) -> Self {
        self.get_priority = Some(Arc::new(f));
        self
    }

    pub fn add_items_to(mut self, position: QueuePosition) -> Self {
        self.add_items_to = position;
        self
    }

    pub fn get_items_from(mut self, position: QueuePosition) -> Self {
        self.get_items_from = position;
        self
    }

    pub fn started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    pub fn initial_items(mut self, items: Vec<T>) -> Self {
        self.initial_items = items;
        self
    }

    pub fn expiration_duration(mut self, age: Duration) -> Self {
        self.expiration_duration = Some(age);
        self
    }

    pub fn get_is_expired(mut self, f: impl Fn(&T, Instant) -> bool + Send + Sync + 'static) -> Self {
        self.get_is_expired = Some(Arc::new(f));
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&T, &AsyncQueuerState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }

    pub fn on_reject(mut self, f: impl Fn(&T, &AsyncQueuerState) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Arc::new(f));
        self
    }

    pub fn on_expire(mut self, f: impl Fn(&T, &AsyncQueuerState) + Send + Sync + 'static) -> Self {
        self.on_expire = Some(Arc::new(f));
        self
    }

    pub fn on_items_change(mut self, f: impl Fn(&AsyncQueuerState) + Send + Sync + 'static) -> Self {
        self.on_items_change = Some(Arc::new(f));
        self
    }

    pub fn on_success(mut self, f: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled(mut self, f: impl Fn(&AsyncQueuerState) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

/// Buffers items and processes them with an async function, several at a
/// time.
pub struct AsyncQueuer<T, R, E> {
    inner: Arc<Inner<T, R, E>>,
}

impl<T, R, E> Clone for AsyncQueuer<T, R, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T, R, E> {
    func: AsyncFn<T, R, E>,
    options: Mutex<Arc<AsyncQueuerOptions<T, R, E>>>,
    store: Store<AsyncQueuerState>,
    core: Mutex<Core<T>>,
    aborts: Mutex<AbortSet>,
}

struct Core<T> {
    items: ItemQueue<T>,
    /// Items in flight, keyed by execution id.
    active: BTreeMap<u64, T>,
    /// Slots taken, including slots pausing for `wait`.
    busy_slots: usize,
    /// One thread fills slots at a time so calls start in removal order.
    dispatching: bool,
    /// `dispatch` was requested while another thread was filling slots.
    redispatch: bool,
}

/// An item whose call has started: the future still has to be driven.
struct InFlight<R, E> {
    exec_id: u64,
    signal: AbortSignal,
    call: BoxFuture<'static, Result<R, E>>,
}

impl<T, R, E> AsyncQueuer<T, R, E>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new<F, Fut>(f: F, mut options: AsyncQueuerOptions<T, R, E>) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_running = options.started;
        let seed = std::mem::take(&mut options.initial_items);
        let queuer = Self {
            inner: Arc::new(Inner {
                func: boxed(f),
                options: Mutex::new(Arc::new(options)),
                store: Store::new(initial),
                core: Mutex::new(Core {
                    items: ItemQueue::default(),
                    active: BTreeMap::new(),
                    busy_slots: 0,
                    dispatching: false,
                    redispatch: false,
                }),
                aborts: Mutex::new(AbortSet::default()),
            }),
        };
        for item in seed {
            queuer.add_item(item);
        }
        queuer
    }

    pub fn add_item(&self, item: T) -> bool {
        let position = self.options().add_items_to;
        self.add_item_at(item, position)
    }

    /// Returns `false` if the queue is full.
    pub fn add_item_at(&self, item: T, position: QueuePosition) -> bool {
        let options = self.options();
        self.inner.expire(&options);
        let priority = options.get_priority.as_ref().map(|f| f(&item));
        let added = {
            let mut core = lock(&self.inner.core);
            if options.max_size.is_some_and(|max| core.items.len() >= max) {
                Err(item)
            } else {
                core.items.insert(item, position, priority, Instant::now());
                Ok(core.items.len())
            }
        };
        match added {
            Ok(len) => {
                self.inner.record(len, &options, |s| s.add_item_count += 1);
                self.inner.dispatch();
                true
            }
            Err(item) => {
                let state = self.inner.store.update(|s| {
                    s.rejection_count += 1;
                    s.clone()
                });
                tracing::debug!(size = state.size, "queue full, item rejected");
                if let Some(hook) = &options.on_reject {
                    hook(&item, &state);
                }
                false
            }
        }
    }

    pub fn get_next_item(&self, position: QueuePosition) -> Option<T> {
        self.inner.take(position)
    }

    /// Remove the next item and process it now, outside the slot limit.
    /// Resolves to `Ok(None)` if the queue is empty.
    pub async fn execute(&self, position: QueuePosition) -> Result<Option<R>, E> {
        let Some(item) = self.inner.take(position) else {
            return Ok(None);
        };
        let flight = self.inner.launch(item);
        self.inner.finish(flight).await
    }

    /// Process up to `n` items (all when `None`) one after another, then
    /// resume normal dispatch. Returns how many were processed.
    pub async fn flush(&self, n: Option<usize>, position: QueuePosition) -> usize {
        let mut done = 0;
        while n.is_none_or(|n| done < n) {
            let Some(item) = self.inner.take(position) else {
                break;
            };
            let flight = self.inner.launch(item);
            let reply = self.inner.finish(flight).await;
            if let Err(err) = reply {
                tracing::error!(error = %err, "flushed item failed");
            }
            done += 1;
        }
        self.inner.dispatch();
        done
    }

    pub fn peek_next_item(&self, position: QueuePosition) -> Option<T> {
        self.inner.expire(&self.options());
        lock(&self.inner.core).items.peek(position).cloned()
    }

    pub fn peek_all_items(&self) -> Vec<T> {
        self.inner.expire(&self.options());
        lock(&self.inner.core).items.items().cloned().collect()
    }

    pub fn peek_active_items(&self) -> Vec<T> {
        lock(&self.inner.core).active.values().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.inner.core).items.clear();
        self.inner.record(0, &self.options(), |_| {});
    }

    pub fn start(&self) {
        self.inner.store.update(|s| s.is_running = true);
        self.inner.dispatch();
    }

    /// Stop taking new items. In-flight items finish; see [`abort`](Self::abort).
    pub fn stop(&self) {
        self.inner.store.update(|s| s.is_running = false);
    }

    /// Abort every in-flight item. Queued items are untouched.
    pub fn abort(&self) {
        let aborted = lock(&self.inner.aborts).abort_all();
        tracing::debug!(aborted, "queuer abort requested");
    }

    pub fn abort_signal(&self) -> Option<AbortSignal> {
        lock(&self.inner.aborts).latest_signal()
    }

    /// Abort in-flight work, drop queued items and reset counters.
    pub fn reset(&self) {
        self.abort();
        let active_count = {
            let mut core = lock(&self.inner.core);
            core.items.clear();
            core.active.len()
        };
        let started = self.options().started;
        self.inner.store.replace(AsyncQueuerState {
            is_running: started,
            active_count,
            ..AsyncQueuerState::default()
        });
    }

    pub fn options(&self) -> Arc<AsyncQueuerOptions<T, R, E>> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut AsyncQueuerOptions<T, R, E>)) {
        let mut next = AsyncQueuerOptions::clone(&self.options());
        edit(&mut next);
        *lock(&self.inner.options) = Arc::new(next);
        // a raised concurrency can take more items right away
        self.inner.dispatch();
    }

    pub fn state(&self) -> AsyncQueuerState {
        self.inner.store.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&AsyncQueuerState) + Send + Sync + 'static) -> SubscriptionId {
        let listener: Listener<AsyncQueuerState> = Arc::new(listener);
        self.inner.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }
}

impl<T, R, E> Inner<T, R, E>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
    E: Display + Send + 'static,
{
    /// Fill free slots while started. Re-entrant and concurrent calls hand
    /// their request to the thread already filling.
    fn dispatch(self: &Arc<Self>) {
        {
            let mut core = lock(&self.core);
            if core.dispatching {
                core.redispatch = true;
                return;
            }
            core.dispatching = true;
        }
        loop {
            self.fill_slots();
            let mut core = lock(&self.core);
            if core.redispatch {
                core.redispatch = false;
            } else {
                core.dispatching = false;
                return;
            }
        }
    }

    fn fill_slots(self: &Arc<Self>) {
        loop {
            if !self.store.read(|s| s.is_running) {
                return;
            }
            let options = Arc::clone(&lock(&self.options));
            let concurrency = options.concurrency.resolve(&self.store.get()).max(1);
            self.expire(&options);
            let (item, len) = {
                let mut core = lock(&self.core);
                if core.busy_slots >= concurrency {
                    return;
                }
                let Some(item) = core.items.take(options.get_items_from) else {
                    return;
                };
                core.busy_slots += 1;
                (item, core.items.len())
            };
            self.record(len, &options, |_| {});
            let flight = self.launch(item);
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = inner.finish(flight).await {
                    tracing::error!(error = %err, "queued item failed");
                }
                inner.release_slot(&options).await;
            });
        }
    }

    /// Keep the slot through the `wait` pause, then free it and refill.
    async fn release_slot(self: Arc<Self>, options: &AsyncQueuerOptions<T, R, E>) {
        let wait = options.wait.resolve(&self.store.get());
        let this = if wait.is_zero() {
            self
        } else {
            let weak = Arc::downgrade(&self);
            drop(self);
            tokio::time::sleep(wait).await;
            match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            }
        };
        {
            let mut core = lock(&this.core);
            core.busy_slots = core.busy_slots.saturating_sub(1);
        }
        this.dispatch();
    }

    /// Mark `item` active, give it an abort token and call the wrapped
    /// function. Only the returned future is left to drive.
    fn launch(&self, item: T) -> InFlight<R, E> {
        let (exec_id, signal) = lock(&self.aborts).register();
        let active_count = {
            let mut core = lock(&self.core);
            core.active.insert(exec_id, item.clone());
            core.active.len()
        };
        let state = self.store.update(|s| {
            s.active_count = active_count;
            s.execution_count += 1;
            s.clone()
        });
        let options = Arc::clone(&lock(&self.options));
        if let Some(hook) = &options.on_execute {
            hook(&item, &state);
        }
        InFlight {
            exec_id,
            signal,
            call: (self.func)(item),
        }
    }

    async fn finish(&self, flight: InFlight<R, E>) -> Result<Option<R>, E> {
        let InFlight { exec_id, signal, call } = flight;
        let outcome = run_abortable(call, &signal).await;
        let options = Arc::clone(&lock(&self.options));
        lock(&self.aborts).release(exec_id);
        let active_count = {
            let mut core = lock(&self.core);
            core.active.remove(&exec_id);
            core.active.len()
        };
        self.store.update(|s| s.active_count = active_count);
        let hooks = ResultHooks {
            on_success: options.on_success.as_ref(),
            on_error: options.on_error.as_ref(),
            on_settled: options.on_settled.as_ref(),
            throw_on_error: options.throw_on_error,
        };
        settle(&self.store, hooks, outcome)
    }

    fn take(&self, position: QueuePosition) -> Option<T> {
        let options = Arc::clone(&lock(&self.options));
        self.expire(&options);
        let (item, len) = {
            let mut core = lock(&self.core);
            let item = core.items.take(position)?;
            (item, core.items.len())
        };
        self.record(len, &options, |_| {});
        Some(item)
    }

    fn expire(&self, options: &AsyncQueuerOptions<T, R, E>) {
        if options.expiration_duration.is_none() && options.get_is_expired.is_none() {
            return;
        }
        let now = Instant::now();
        let (gone, len) = {
            let mut core = lock(&self.core);
            let gone = core.items.remove_expired(|r| {
                expired(r, now, options.expiration_duration, options.get_is_expired.as_ref())
            });
            (gone, core.items.len())
        };
        if gone.is_empty() {
            return;
        }
        tracing::debug!(expired = gone.len(), "queued items expired");
        let count = gone.len() as u64;
        let state = self.store.update(|s| {
            s.expiration_count += count;
            s.clone()
        });
        if let Some(hook) = &options.on_expire {
            for item in &gone {
                hook(item, &state);
            }
        }
        self.record(len, options, |_| {});
    }

    fn record(&self, len: usize, options: &AsyncQueuerOptions<T, R, E>, edit: impl FnOnce(&mut AsyncQueuerState)) {
        let full = options.max_size.is_some_and(|max| len >= max);
        let state = self.store.update(|s| {
            edit(s);
            s.size = len;
            s.is_full = full;
            s.clone()
        });
        if let Some(hook) = &options.on_items_change {
            hook(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;

    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    type Log = Arc<Mutex<Vec<(&'static str, u32, Duration)>>>;
    type Call = Pin<Box<dyn Future<Output = Result<u32, String>> + Send>>;

    /// Items are `(work_ms)`; logs start and end times.
    fn worker(log: Log) -> impl Fn(u32) -> Call + Send + Sync + 'static {
        let start = Instant::now();
        move |work| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                lock(&log).push(("start", work, start.elapsed()));
                tokio::time::sleep(ms(u64::from(work))).await;
                lock(&log).push(("end", work, start.elapsed()));
                if work == 0 { Err("no work".to_string()) } else { Ok(work) }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_bounds_in_flight_items() {
        let log: Log = Arc::default();
        let queuer = AsyncQueuer::new(worker(Arc::clone(&log)), AsyncQueuerOptions::default().concurrency(2));
        for work in [100, 50, 30] {
            queuer.add_item(work);
        }
        assert_eq!(queuer.state().active_count, 2);
        assert_eq!(queuer.peek_all_items(), vec![30]);
        assert_eq!(queuer.peek_active_items(), vec![100, 50]);

        tokio::time::sleep(ms(200)).await;
        let starts: Vec<_> = lock(&log)
            .iter()
            .filter(|e| e.0 == "start")
            .map(|e| (e.1, e.2))
            .collect();
        // the third item takes the slot freed at 50
        assert_eq!(starts, vec![(100, ms(0)), (50, ms(0)), (30, ms(50))]);
        let state = queuer.state();
        assert_eq!(state.success_count, 3);
        assert_eq!(state.active_count, 0);
        assert_eq!(state.status, QueuerStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_pauses_a_slot_between_items() {
        let log: Log = Arc::default();
        let queuer = AsyncQueuer::new(worker(Arc::clone(&log)), AsyncQueuerOptions::default().wait(ms(100)));
        queuer.add_item(10);
        queuer.add_item(20);
        tokio::time::sleep(ms(500)).await;
        let starts: Vec<_> = lock(&log).iter().filter(|e| e.0 == "start").map(|e| e.2).collect();
        assert_eq!(starts, vec![ms(0), ms(110)]);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_and_flush_drive_a_stopped_queue() {
        let log: Log = Arc::default();
        let queuer = AsyncQueuer::new(
            worker(Arc::clone(&log)),
            AsyncQueuerOptions::default()
                .started(false)
                .initial_items(vec![5, 6, 7]),
        );
        assert_eq!(queuer.state().size, 3);
        assert_eq!(queuer.execute(QueuePosition::Back).await, Ok(Some(7)));
        assert_eq!(queuer.flush(None, QueuePosition::Front).await, 2);
        assert_eq!(queuer.execute(QueuePosition::Front).await, Ok(None));
        let order: Vec<_> = lock(&log).iter().filter(|e| e.0 == "end").map(|e| e.1).collect();
        assert_eq!(order, vec![7, 5, 6]);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_are_counted_and_returned_from_execute() {
        let log: Log = Arc::default();
        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&errors);
        let queuer = AsyncQueuer::new(
            worker(Arc::clone(&log)),
            AsyncQueuerOptions::default().on_error(move |e: &String| lock(&sink).push(e.clone())),
        );
        queuer.add_item(0);
        tokio::time::sleep(ms(10)).await;
        assert_eq!(*lock(&errors), vec!["no work".to_string()]);
        assert_eq!(queuer.state().error_count, 1);

        let strict = AsyncQueuer::new(
            worker(Arc::clone(&log)),
            AsyncQueuerOptions::default().started(false).throw_on_error(true),
        );
        strict.add_item(0);
        assert_eq!(strict.execute(QueuePosition::Front).await, Err("no work".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_cancels_active_items_only() {
        let log: Log = Arc::default();
        let queuer = AsyncQueuer::new(worker(Arc::clone(&log)), AsyncQueuerOptions::default());
        queuer.add_item(1_000);
        queuer.stop();
        queuer.add_item(1_000);
        tokio::time::sleep(ms(10)).await;
        queuer.abort();
        tokio::time::sleep(ms(10)).await;
        assert!(queuer.peek_active_items().is_empty());
        assert_eq!(queuer.peek_all_items(), vec![1_000]);
        assert_eq!(queuer.state().settle_count, 0);
        assert!(lock(&log).iter().all(|e| e.0 == "start"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn calls_start_in_removal_order_across_threads() {
        let called: Arc<Mutex<Vec<u32>>> = Arc::default();
        let hooked: Arc<Mutex<Vec<u32>>> = Arc::default();
        let calls = Arc::clone(&called);
        let hooks = Arc::clone(&hooked);
        let queuer = AsyncQueuer::new(
            move |n: u32| {
                lock(&calls).push(n);
                async move {
                    tokio::time::sleep(ms(1)).await;
                    Ok::<_, String>(n)
                }
            },
            AsyncQueuerOptions::default()
                .concurrency(16)
                .started(false)
                .on_execute(move |n: &u32, _| lock(&hooks).push(*n)),
        );
        for n in 0..64 {
            queuer.add_item(n);
        }
        queuer.start();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while queuer.state().settle_count < 64 {
                tokio::time::sleep(ms(5)).await;
            }
        })
        .await;
        assert!(drained.is_ok());

        let expected: Vec<u32> = (0..64).collect();
        assert_eq!(*lock(&called), expected);
        assert_eq!(*lock(&hooked), expected);
    }
}
