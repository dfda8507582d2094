//! Store - the single state container every primitive writes through.
//!
//! `update` applies an edit, recomputes derived fields and then notifies
//! subscribers with a fresh snapshot. Listeners run after the lock is
//! released, so a listener may read the store (or call back into the
//! primitive) without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Recompute fields that are functions of other fields (`status`,
/// `is_empty`, ...).
pub trait Derive {
    fn derive(&mut self);
}

pub type Listener<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub(crate) struct Store<S> {
    state: Mutex<S>,
    listeners: Mutex<Vec<(SubscriptionId, Listener<S>)>>,
    next_id: AtomicU64,
}

impl<S: Clone + Derive> Store<S> {
    pub(crate) fn new(mut initial: S) -> Self {
        initial.derive();
        Self {
            state: Mutex::new(initial),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn get(&self) -> S {
        lock(&self.state).clone()
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&lock(&self.state))
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let (out, snapshot) = {
            let mut state = lock(&self.state);
            let out = f(&mut state);
            state.derive();
            let snapshot = self.has_listeners().then(|| state.clone());
            (out, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.notify(&snapshot);
        }
        out
    }

    /// Replace the whole state (used by `reset`).
    pub(crate) fn replace(&self, next: S) {
        self.update(|s| *s = next);
    }

    pub(crate) fn subscribe(&self, listener: Listener<S>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn has_listeners(&self) -> bool {
        !lock(&self.listeners).is_empty()
    }

    fn notify(&self, snapshot: &S) {
        let listeners: Vec<Listener<S>> = lock(&self.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

/// Lock a mutex, recovering the data if a panicking user callback poisoned it.
///
/// No critical section in this crate calls user code, so the protected data
/// is always consistent.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
