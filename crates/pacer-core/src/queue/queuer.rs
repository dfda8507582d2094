//! Synchronous queuer: processes one item at a time, optionally spaced by
//! `wait`.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::items::{ItemQueue, expired};
use super::{ExpiryFn, ItemHook, PriorityFn, QueuePosition, QueuerStatus};
use crate::exec::SyncFn;
use crate::options::{Dynamic, Hook};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};
use crate::timer::TimerSlot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuerState {
    pub execution_count: u64,
    pub add_item_count: u64,
    pub rejection_count: u64,
    pub expiration_count: u64,
    pub size: usize,
    pub is_empty: bool,
    pub is_full: bool,
    /// Started: the scheduler drains items as they arrive.
    pub is_running: bool,
    /// A `wait` timer is armed before the next item is taken.
    pub pending_tick: bool,
    pub status: QueuerStatus,
}

impl Default for QueuerState {
    fn default() -> Self {
        Self {
            execution_count: 0,
            add_item_count: 0,
            rejection_count: 0,
            expiration_count: 0,
            size: 0,
            is_empty: true,
            is_full: false,
            is_running: true,
            pending_tick: false,
            status: QueuerStatus::Idle,
        }
    }
}

impl Derive for QueuerState {
    fn derive(&mut self) {
        self.is_empty = self.size == 0;
        self.status = QueuerStatus::of(self.is_running, !self.is_empty || self.pending_tick);
    }
}

pub struct QueuerOptions<T> {
    /// Pause between items. Zero drains back to back.
    pub wait: Dynamic<Duration, QueuerState>,
    /// `add_item` is rejected at this size.
    pub max_size: Option<usize>,
    pub get_priority: Option<PriorityFn<T>>,
    pub add_items_to: QueuePosition,
    pub get_items_from: QueuePosition,
    /// Start draining immediately.
    pub started: bool,
    pub initial_items: Vec<T>,
    pub expiration_duration: Option<Duration>,
    pub get_is_expired: Option<ExpiryFn<T>>,
    pub initial_state: Option<QueuerState>,
    pub on_execute: Option<ItemHook<T, QueuerState>>,
    pub on_reject: Option<ItemHook<T, QueuerState>>,
    pub on_expire: Option<ItemHook<T, QueuerState>>,
    pub on_items_change: Option<Hook<QueuerState>>,
}

impl<T: Clone> Clone for QueuerOptions<T> {
    fn clone(&self) -> Self {
        Self {
            wait: self.wait.clone(),
            max_size: self.max_size,
            get_priority: self.get_priority.clone(),
            add_items_to: self.add_items_to,
            get_items_from: self.get_items_from,
            started: self.started,
            initial_items: self.initial_items.clone(),
            expiration_duration: self.expiration_duration,
            get_is_expired: self.get_is_expired.clone(),
            initial_state: self.initial_state.clone(),
            on_execute: self.on_execute.clone(),
            on_reject: self.on_reject.clone(),
            on_expire: self.on_expire.clone(),
            on_items_change: self.on_items_change.clone(),
        }
    }
}

impl<T> Default for QueuerOptions<T> {
    fn default() -> Self {
        Self {
            wait: Duration::ZERO.into(),
            max_size: None,
            get_priority: None,
            add_items_to: QueuePosition::Back,
            get_items_from: QueuePosition::Front,
            started: true,
            initial_items: Vec::new(),
            expiration_duration: None,
            get_is_expired: None,
            initial_state: None,
            on_execute: None,
            on_reject: None,
            on_expire: None,
            on_items_change: None,
        }
    }
}

impl<T> QueuerOptions<T> {
    pub fn wait(mut self, wait: impl Into<Dynamic<Duration, QueuerState>>) -> Self {
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

    pub fn initial_state(mut self, state: QueuerState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&T, &QueuerState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }

    pub fn on_reject(mut self, f: impl Fn(&T, &QueuerState) + Send + Sync + 'static) -> Self {
        self.on_reject = Some(Arc::new(f));
        self
    }

    pub fn on_expire(mut self, f: impl Fn(&T, &QueuerState) + Send + Sync + 'static) -> Self {
        self.on_expire = Some(Arc::new(f));
        self
    }

    pub fn on_items_change(mut self, f: impl Fn(&QueuerState) + Send + Sync + 'static) -> Self {
        self.on_items_change = Some(Arc::new(f));
        self
    }
}

/// Buffers items and feeds them to `f` one at a time.
pub struct Queuer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Queuer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    func: SyncFn<T>,
    options: Mutex<Arc<QueuerOptions<T>>>,
    store: Store<QueuerState>,
    core: Mutex<Core<T>>,
}

struct Core<T> {
    items: ItemQueue<T>,
    timer: TimerSlot,
    /// A drain loop is on the stack; re-entrant calls leave the work to it.
    draining: bool,
}

impl<T: Clone + Send + Sync + 'static> Queuer<T> {
    pub fn new(f: impl Fn(T) + Send + Sync + 'static, mut options: QueuerOptions<T>) -> Self {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_running = options.started;
        let seed = std::mem::take(&mut options.initial_items);
        let queuer = Self {
            inner: Arc::new(Inner {
                func: Arc::new(f),
                options: Mutex::new(Arc::new(options)),
                store: Store::new(initial),
                core: Mutex::new(Core {
                    items: ItemQueue::default(),
                    timer: TimerSlot::default(),
                    draining: false,
                }),
            }),
        };
        queuer.seed(seed);
        queuer
    }

    fn seed(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let options = self.options();
        let now = Instant::now();
        let prioritized: Vec<(T, Option<i64>)> = items
            .into_iter()
            .map(|item| {
                let priority = options.get_priority.as_ref().map(|f| f(&item));
                (item, priority)
            })
            .collect();
        let len = {
            let mut core = lock(&self.inner.core);
            for (item, priority) in prioritized {
                core.items.insert(item, options.add_items_to, priority, now);
            }
            core.items.len()
        };
        self.inner.record(len, &options, |_| {});
        self.inner.drain();
    }

    /// Add at the configured end. Returns `false` if the queue is full.
    pub fn add_item(&self, item: T) -> bool {
        let position = self.options().add_items_to;
        self.add_item_at(item, position)
    }

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
                self.inner.drain();
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

    /// Remove the next item without processing it.
    pub fn get_next_item(&self, position: QueuePosition) -> Option<T> {
        self.inner.take(position)
    }

    /// Remove the next item and process it now. Returns the item.
    pub fn execute(&self, position: QueuePosition) -> Option<T> {
        let item = self.inner.take(position)?;
        self.inner.process(item.clone());
        Some(item)
    }

    /// Process up to `n` items now (all when `None`), ignoring `wait`.
    pub fn flush(&self, n: Option<usize>, position: QueuePosition) {
        lock(&self.inner.core).timer.cancel();
        self.inner.store.update(|s| s.pending_tick = false);
        let mut done = 0;
        while n.is_none_or(|n| done < n) {
            if self.execute(position).is_none() {
                break;
            }
            done += 1;
        }
        tracing::debug!(done, "queue flushed");
        self.inner.drain();
    }

    pub fn peek_next_item(&self, position: QueuePosition) -> Option<T> {
        self.inner.expire(&self.options());
        lock(&self.inner.core).items.peek(position).cloned()
    }

    pub fn peek_all_items(&self) -> Vec<T> {
        self.inner.expire(&self.options());
        lock(&self.inner.core).items.items().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.inner.core).items.clear();
        self.inner.record(0, &self.options(), |_| {});
    }

    pub fn start(&self) {
        self.inner.store.update(|s| s.is_running = true);
        self.inner.drain();
    }

    /// Stop draining. Items stay queued.
    pub fn stop(&self) {
        lock(&self.inner.core).timer.cancel();
        self.inner.store.update(|s| {
            s.is_running = false;
            s.pending_tick = false;
        });
    }

    /// Drop all items and return state to its defaults.
    pub fn reset(&self) {
        {
            let mut core = lock(&self.inner.core);
            core.timer.cancel();
            core.items.clear();
        }
        let started = self.options().started;
        self.inner.store.replace(QueuerState {
            is_running: started,
            ..QueuerState::default()
        });
    }

    pub fn options(&self) -> Arc<QueuerOptions<T>> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut QueuerOptions<T>)) {
        let mut next = QueuerOptions::clone(&self.options());
        edit(&mut next);
        *lock(&self.inner.options) = Arc::new(next);
    }

    pub fn state(&self) -> QueuerState {
        self.inner.store.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&QueuerState) + Send + Sync + 'static) -> SubscriptionId {
        let listener: Listener<QueuerState> = Arc::new(listener);
        self.inner.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }
}

async fn fire<T: Clone + Send + Sync + 'static>(weak: Weak<Inner<T>>, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    if !lock(&inner.core).timer.claim(generation) {
        return;
    }
    inner.store.update(|s| s.pending_tick = false);
    inner.drain();
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Process items while started, pausing `wait` between them.
    fn drain(self: &Arc<Self>) {
        {
            let mut core = lock(&self.core);
            if core.draining || core.timer.is_armed() {
                return;
            }
            core.draining = true;
        }
        loop {
            if !self.store.read(|s| s.is_running) {
                break;
            }
            let options = Arc::clone(&lock(&self.options));
            let Some(item) = self.take(options.get_items_from) else {
                break;
            };
            self.process(item);
            let wait = options.wait.resolve(&self.store.get());
            if !wait.is_zero() {
                let weak = Arc::downgrade(self);
                lock(&self.core).timer.arm(wait, move |generation| fire(weak, generation));
                self.store.update(|s| s.pending_tick = true);
                break;
            }
        }
        lock(&self.core).draining = false;
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

    fn process(&self, item: T) {
        let hook = lock(&self.options).on_execute.clone();
        let kept = hook.as_ref().map(|_| item.clone());
        (self.func)(item);
        let state = self.store.update(|s| {
            s.execution_count += 1;
            s.clone()
        });
        tracing::trace!(execution_count = state.execution_count, "queued item processed");
        if let (Some(hook), Some(item)) = (hook, kept) {
            hook(&item, &state);
        }
    }

    fn expire(&self, options: &QueuerOptions<T>) {
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

    /// Publish a new item count, then notify `on_items_change`.
    fn record(&self, len: usize, options: &QueuerOptions<T>, edit: impl FnOnce(&mut QueuerState)) {
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
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn collector<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |item| lock(&sink).push(item))
    }

    #[tokio::test]
    async fn started_queue_processes_items_as_they_arrive() {
        let (seen, f) = collector();
        let queuer = Queuer::new(f, QueuerOptions::default());
        assert!(queuer.add_item("a"));
        assert!(queuer.add_item("b"));
        assert_eq!(*lock(&seen), vec!["a", "b"]);
        let state = queuer.state();
        assert_eq!(state.execution_count, 2);
        assert!(state.is_empty);
        assert_eq!(state.status, QueuerStatus::Idle);
    }

    #[tokio::test]
    async fn stopped_queue_buffers_and_lifo_drains_newest_first() {
        let (seen, f) = collector();
        let queuer = Queuer::new(
            f,
            QueuerOptions::default()
                .started(false)
                .get_items_from(QueuePosition::Back),
        );
        for c in ["a", "b", "c"] {
            queuer.add_item(c);
        }
        assert_eq!(queuer.state().status, QueuerStatus::Stopped);
        assert_eq!(queuer.peek_next_item(QueuePosition::Back), Some("c"));
        assert_eq!(queuer.peek_all_items(), vec!["a", "b", "c"]);

        queuer.start();
        assert_eq!(*lock(&seen), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn priority_orders_lowest_first() {
        let (seen, f) = collector();
        let queuer = Queuer::new(
            f,
            QueuerOptions::default().started(false).get_priority(|n: &u32| i64::from(*n)),
        );
        for n in [3, 1, 2] {
            queuer.add_item_at(n, QueuePosition::Front);
        }
        queuer.flush(None, QueuePosition::Front);
        assert_eq!(*lock(&seen), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_evicting() {
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&rejected);
        let (_seen, f) = collector();
        let queuer = Queuer::new(
            f,
            QueuerOptions::default()
                .started(false)
                .max_size(2)
                .on_reject(move |item: &u32, _| lock(&sink).push(*item)),
        );
        assert!(queuer.add_item(1));
        assert!(queuer.add_item(2));
        assert!(queuer.state().is_full);
        assert!(!queuer.add_item(3));
        assert_eq!(*lock(&rejected), vec![3]);
        assert_eq!(queuer.peek_all_items(), vec![1, 2]);
        assert_eq!(queuer.state().rejection_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_spaces_out_processing() {
        let start = Instant::now();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let queuer = Queuer::new(
            move |n: u32| lock(&sink).push((n, start.elapsed())),
            QueuerOptions::default().wait(ms(100)),
        );
        for n in 1..=3 {
            queuer.add_item(n);
        }
        assert_eq!(queuer.state().status, QueuerStatus::Running);
        tokio::time::sleep(ms(250)).await;
        assert_eq!(*lock(&seen), vec![(1, ms(0)), (2, ms(100)), (3, ms(200))]);

        queuer.stop();
        queuer.add_item(4);
        tokio::time::sleep(ms(500)).await;
        assert_eq!(lock(&seen).len(), 3);
        assert_eq!(queuer.get_next_item(QueuePosition::Front), Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn old_items_expire_before_processing() {
        let expired_items = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&expired_items);
        let (seen, f) = collector();
        let queuer = Queuer::new(
            f,
            QueuerOptions::default()
                .started(false)
                .expiration_duration(ms(100))
                .on_expire(move |item: &u32, _| lock(&sink).push(*item)),
        );
        queuer.add_item(1);
        tokio::time::advance(ms(60)).await;
        queuer.add_item(2);
        tokio::time::advance(ms(60)).await;
        queuer.start();
        assert_eq!(*lock(&seen), vec![2]);
        assert_eq!(*lock(&expired_items), vec![1]);
        assert_eq!(queuer.state().expiration_count, 1);
    }

    #[tokio::test]
    async fn initial_items_reentrant_adds_and_reset() {
        let queuer_slot: Arc<Mutex<Option<Queuer<u32>>>> = Arc::default();
        let handle = Arc::clone(&queuer_slot);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let queuer = Queuer::new(
            move |n: u32| {
                lock(&sink).push(n);
                let queuer = lock(&handle).clone();
                if let Some(queuer) = queuer
                    && n < 3
                {
                    queuer.add_item(n + 10);
                }
            },
            QueuerOptions::default().started(false).initial_items(vec![1, 2]),
        );
        *lock(&queuer_slot) = Some(queuer.clone());
        assert_eq!(queuer.state().size, 2);

        queuer.start();
        assert_eq!(*lock(&seen), vec![1, 2, 11, 12]);

        queuer.stop();
        queuer.add_item(7);
        queuer.reset();
        assert!(queuer.peek_all_items().is_empty());
        let state = queuer.state();
        assert_eq!(state.execution_count, 0);
        assert_eq!(state.size, 0);
        assert_eq!(state.status, QueuerStatus::Stopped);
        *lock(&queuer_slot) = None;
    }
}
