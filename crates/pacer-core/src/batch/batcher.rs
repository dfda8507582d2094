//! Synchronous batcher.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::dedup::{Admission, DedupStrategy, Entry, ProcessedKeys, admit};
use super::{BatchHook, BatcherStatus, DEFAULT_MAX_TRACKED_KEYS, DuplicateHook, KeyFn, ShouldExecuteFn};
use crate::options::{Dynamic, Hook};
use crate::store::{Derive, Listener, Store, SubscriptionId, lock};
use crate::timer::TimerSlot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatcherState {
    pub execution_count: u64,
    pub total_items_processed: u64,
    pub add_item_count: u64,
    pub duplicate_count: u64,
    pub size: usize,
    pub is_empty: bool,
    /// The `wait` timer is armed.
    pub is_pending: bool,
    pub is_running: bool,
    pub status: BatcherStatus,
}

impl Default for BatcherState {
    fn default() -> Self {
        Self {
            execution_count: 0,
            total_items_processed: 0,
            add_item_count: 0,
            duplicate_count: 0,
            size: 0,
            is_empty: true,
            is_pending: false,
            is_running: true,
            status: BatcherStatus::Idle,
        }
    }
}

impl Derive for BatcherState {
    fn derive(&mut self) {
        self.is_empty = self.size == 0;
        self.status = BatcherStatus::of(self.is_running, false, self.size);
    }
}

pub struct BatcherOptions<T> {
    pub max_size: Option<usize>,
    /// Flush this long after the first item of a batch. `None` disables
    /// the timer.
    pub wait: Dynamic<Option<Duration>, BatcherState>,
    pub get_should_execute: Option<ShouldExecuteFn<T, BatcherState>>,
    pub started: bool,
    pub get_item_key: Option<KeyFn<T>>,
    pub dedup_strategy: DedupStrategy,
    pub track_processed_keys: bool,
    pub max_tracked_keys: usize,
    pub initial_state: Option<BatcherState>,
    pub on_execute: Option<BatchHook<T, BatcherState>>,
    pub on_items_change: Option<Hook<BatcherState>>,
    /// Receives the item that was dropped: the new one under `KeepFirst`
    /// or a processed key, the replaced one under `KeepLast`.
    pub on_duplicate: Option<DuplicateHook<T, BatcherState>>,
}

impl<T> Clone for BatcherOptions<T> {
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
            initial_state: self.initial_state.clone(),
            on_execute: self.on_execute.clone(),
            on_items_change: self.on_items_change.clone(),
            on_duplicate: self.on_duplicate.clone(),
        }
    }
}

impl<T> Default for BatcherOptions<T> {
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
            initial_state: None,
            on_execute: None,
            on_items_change: None,
            on_duplicate: None,
        }
    }
}

impl<T> BatcherOptions<T> {
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Dynamic::Static(Some(wait));
        self
    }

    pub fn get_should_execute(mut self, f: impl Fn(&[T], &BatcherState) -> bool + Send + Sync + 'static) -> Self {
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

    pub fn initial_state(mut self, state: BatcherState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute(mut self, f: impl Fn(&[T], &BatcherState) + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Arc::new(f));
        self
    }

    pub fn on_items_change(mut self, f: impl Fn(&BatcherState) + Send + Sync + 'static) -> Self {
        self.on_items_change = Some(Arc::new(f));
        self
    }

    pub fn on_duplicate(mut self, f: impl Fn(&T, &BatcherState) + Send + Sync + 'static) -> Self {
        self.on_duplicate = Some(Arc::new(f));
        self
    }
}

/// Groups items and passes each group to `f`.
pub struct Batcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    func: Arc<dyn Fn(Vec<T>) + Send + Sync>,
    options: Mutex<Arc<BatcherOptions<T>>>,
    store: Store<BatcherState>,
    core: Mutex<Core<T>>,
}

struct Core<T> {
    entries: Vec<Entry<T>>,
    processed: ProcessedKeys,
    timer: TimerSlot,
}

impl<T: Clone + Send + Sync + 'static> Batcher<T> {
    pub fn new(f: impl Fn(Vec<T>) + Send + Sync + 'static, options: BatcherOptions<T>) -> Self {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_running = options.started;
        Self {
            inner: Arc::new(Inner {
                func: Arc::new(f),
                options: Mutex::new(Arc::new(options)),
                store: Store::new(initial),
                core: Mutex::new(Core {
                    entries: Vec::new(),
                    processed: ProcessedKeys::default(),
                    timer: TimerSlot::default(),
                }),
            }),
        }
    }

    /// Add an item to the pending batch. Returns `false` if it was dropped
    /// as a duplicate.
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

    /// Process the pending batch now.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Disarm the `wait` timer. Pending items stay.
    pub fn cancel(&self) {
        lock(&self.inner.core).timer.cancel();
        self.inner.store.update(|s| s.is_pending = false);
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

    /// Drop pending items without processing them.
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

    /// Clear items and forgotten keys, and return state to its defaults.
    pub fn reset(&self) {
        {
            let mut core = lock(&self.inner.core);
            core.timer.cancel();
            core.entries.clear();
            core.processed.clear();
        }
        let started = self.options().started;
        self.inner.store.replace(BatcherState {
            is_running: started,
            ..BatcherState::default()
        });
    }

    pub fn peek_all_items(&self) -> Vec<T> {
        lock(&self.inner.core).entries.iter().map(|e| e.item.clone()).collect()
    }

    pub fn options(&self) -> Arc<BatcherOptions<T>> {
        Arc::clone(&lock(&self.inner.options))
    }

    pub fn set_options(&self, edit: impl FnOnce(&mut BatcherOptions<T>)) {
        let mut next = BatcherOptions::clone(&self.options());
        edit(&mut next);
        *lock(&self.inner.options) = Arc::new(next);
    }

    pub fn state(&self) -> BatcherState {
        self.inner.store.get()
    }

    pub fn subscribe(&self, listener: impl Fn(&BatcherState) + Send + Sync + 'static) -> SubscriptionId {
        let listener: Listener<BatcherState> = Arc::new(listener);
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
    tracing::trace!("batch wait elapsed");
    inner.flush();
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Flush on size or predicate, otherwise make sure the timer runs.
    fn check_triggers(self: &Arc<Self>, options: &BatcherOptions<T>) {
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
            self.flush();
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

    fn flush(&self) {
        let options = Arc::clone(&lock(&self.options));
        let entries = {
            let mut core = lock(&self.core);
            core.timer.cancel();
            std::mem::take(&mut core.entries)
        };
        if entries.is_empty() {
            self.store.update(|s| s.is_pending = false);
            return;
        }
        let (batch, keys): (Vec<T>, Vec<Option<String>>) = entries.into_iter().map(|e| (e.item, e.key)).unzip();
        if options.track_processed_keys {
            lock(&self.core)
                .processed
                .remember(keys.into_iter().flatten(), options.max_tracked_keys);
        }
        let count = batch.len() as u64;
        let cleared = self.store.update(|s| {
            s.size = 0;
            s.is_pending = false;
            s.clone()
        });
        if let Some(hook) = &options.on_items_change {
            hook(&cleared);
        }

        let kept = options.on_execute.as_ref().map(|_| batch.clone());
        (self.func)(batch);
        let state = self.store.update(|s| {
            s.execution_count += 1;
            s.total_items_processed += count;
            s.clone()
        });
        tracing::debug!(items = count, execution_count = state.execution_count, "batch executed");
        if let (Some(hook), Some(batch)) = (&options.on_execute, kept) {
            hook(&batch, &state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    type Batches<T> = Arc<Mutex<Vec<Vec<T>>>>;

    fn collector<T: Send + 'static>() -> (Batches<T>, impl Fn(Vec<T>) + Send + Sync + 'static) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        (batches, move |batch| lock(&sink).push(batch))
    }

    #[tokio::test]
    async fn full_batch_flushes_in_order_and_empties_list() {
        let (batches, f) = collector();
        let batcher = Batcher::new(f, BatcherOptions::default().max_size(3));
        batcher.add_item(1);
        batcher.add_item(2);
        assert!(lock(&batches).is_empty());
        assert_eq!(batcher.state().status, BatcherStatus::Pending);
        batcher.add_item(3);
        assert_eq!(*lock(&batches), vec![vec![1, 2, 3]]);
        assert!(batcher.peek_all_items().is_empty());
        let state = batcher.state();
        assert_eq!(state.total_items_processed, 3);
        assert!(state.is_empty);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_flushes_after_first_item() {
        let start = Instant::now();
        let times = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&times);
        let batcher = Batcher::new(
            move |batch: Vec<u32>| lock(&sink).push((batch, start.elapsed())),
            BatcherOptions::default().wait(ms(100)),
        );
        batcher.add_item(1);
        tokio::time::sleep(ms(60)).await;
        batcher.add_item(2);
        assert!(batcher.state().is_pending);
        tokio::time::sleep(ms(100)).await;
        assert_eq!(*lock(&times), vec![(vec![1, 2], ms(100))]);
    }

    #[tokio::test]
    async fn predicate_triggers_flush() {
        let (batches, f) = collector();
        let batcher = Batcher::new(
            f,
            BatcherOptions::default().get_should_execute(|items: &[u32], _| items.iter().sum::<u32>() >= 10),
        );
        for n in [4, 5, 6, 1] {
            batcher.add_item(n);
        }
        assert_eq!(*lock(&batches), vec![vec![4, 5, 6]]);
        assert_eq!(batcher.peek_all_items(), vec![1]);
    }

    #[tokio::test]
    async fn stopped_batcher_holds_items_until_flush() {
        let (batches, f) = collector();
        let batcher = Batcher::new(f, BatcherOptions::default().max_size(2).started(false));
        batcher.add_item("a");
        batcher.add_item("b");
        batcher.add_item("c");
        assert_eq!(batcher.state().status, BatcherStatus::Stopped);
        assert!(lock(&batches).is_empty());
        batcher.flush();
        assert_eq!(*lock(&batches), vec![vec!["a", "b", "c"]]);
        batcher.flush();
        assert_eq!(lock(&batches).len(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_reported_and_processed_keys_remembered() {
        let dupes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dupes);
        let (batches, f) = collector();
        let batcher = Batcher::new(
            f,
            BatcherOptions::default()
                .started(false)
                .get_item_key(|s: &&str| s.to_string())
                .track_processed_keys(10)
                .on_duplicate(move |item, _| lock(&sink).push(*item)),
        );
        assert!(batcher.add_item("x"));
        assert!(!batcher.add_item("x"));
        assert!(batcher.add_item("y"));
        batcher.flush();
        assert!(!batcher.add_item("y"));
        assert!(batcher.add_item("z"));
        assert_eq!(*lock(&dupes), vec!["x", "y"]);
        assert_eq!(*lock(&batches), vec![vec!["x", "y"]]);
        assert_eq!(batcher.state().duplicate_count, 2);

        batcher.reset();
        assert!(batcher.add_item("y"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_clear() {
        let (batches, f) = collector::<u32>();
        let batcher = Batcher::new(f, BatcherOptions::default().wait(ms(50)));
        batcher.add_item(1);
        batcher.cancel();
        tokio::time::sleep(ms(100)).await;
        assert!(lock(&batches).is_empty());
        assert_eq!(batcher.peek_all_items(), vec![1]);
        batcher.clear();
        assert_eq!(batcher.state().size, 0);
        batcher.flush();
        assert!(lock(&batches).is_empty());
    }

    #[tokio::test]
    async fn persisted_state_seeds_a_new_batcher() {
        let (_, f) = collector::<u32>();
        let batcher = Batcher::new(f, BatcherOptions::default().max_size(2));
        for n in 0..4 {
            batcher.add_item(n);
        }
        let saved = serde_json::to_string(&batcher.state()).unwrap();

        let (_, f) = collector::<u32>();
        let restored: BatcherState = serde_json::from_str(&saved).unwrap();
        let batcher = Batcher::new(f, BatcherOptions::default().initial_state(restored));
        let state = batcher.state();
        assert_eq!(state.execution_count, 2);
        assert_eq!(state.total_items_processed, 4);
        assert_eq!(state.status, BatcherStatus::Idle);
    }
}
