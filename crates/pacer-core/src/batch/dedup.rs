//! Duplicate detection for batched items.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Which occurrence of a repeated key stays in the pending batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    #[default]
    KeepFirst,
    /// The newer item replaces the older one in place.
    KeepLast,
}

/// A pending item and its dedup key.
#[derive(Debug, Clone)]
pub(crate) struct Entry<T> {
    pub(crate) item: T,
    pub(crate) key: Option<String>,
}

/// What happened to an item offered to the pending batch.
#[derive(Debug, PartialEq)]
pub(crate) enum Admission<T> {
    Added,
    /// Replaced an older entry with the same key, which is returned.
    Replaced(T),
    /// Skipped; the offered item is handed back.
    Duplicate(T),
}

/// Offer `item` to `entries` under `strategy`. Keys in `processed` are
/// always duplicates.
pub(crate) fn admit<T>(
    entries: &mut Vec<Entry<T>>,
    item: T,
    key: Option<String>,
    strategy: DedupStrategy,
    processed: &ProcessedKeys,
) -> Admission<T> {
    let Some(key) = key else {
        entries.push(Entry { item, key: None });
        return Admission::Added;
    };
    if processed.contains(&key) {
        return Admission::Duplicate(item);
    }
    match entries.iter().position(|e| e.key.as_deref() == Some(key.as_str())) {
        None => {
            entries.push(Entry {
                item,
                key: Some(key),
            });
            Admission::Added
        }
        Some(_) if strategy == DedupStrategy::KeepFirst => Admission::Duplicate(item),
        Some(at) => Admission::Replaced(std::mem::replace(&mut entries[at].item, item)),
    }
}

/// Keys of already processed items, bounded; the oldest are forgotten first.
#[derive(Debug, Default)]
pub(crate) struct ProcessedKeys {
    order: VecDeque<String>,
    known: HashSet<String>,
}

impl ProcessedKeys {
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.known.contains(key)
    }

    pub(crate) fn remember(&mut self, keys: impl IntoIterator<Item = String>, capacity: usize) {
        for key in keys {
            if self.known.insert(key.clone()) {
                self.order.push_back(key);
            }
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.known.remove(&oldest);
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.known.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(entries: &mut Vec<Entry<u32>>, n: u32, strategy: DedupStrategy, processed: &ProcessedKeys) -> Admission<u32> {
        admit(entries, n, Some((n % 10).to_string()), strategy, processed)
    }

    #[test]
    fn keep_first_rejects_repeats() {
        let processed = ProcessedKeys::default();
        let mut entries = Vec::new();
        assert_eq!(offer(&mut entries, 1, DedupStrategy::KeepFirst, &processed), Admission::Added);
        assert_eq!(offer(&mut entries, 11, DedupStrategy::KeepFirst, &processed), Admission::Duplicate(11));
        assert_eq!(entries.iter().map(|e| e.item).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn keep_last_replaces_in_place() {
        let processed = ProcessedKeys::default();
        let mut entries = Vec::new();
        offer(&mut entries, 1, DedupStrategy::KeepLast, &processed);
        offer(&mut entries, 2, DedupStrategy::KeepLast, &processed);
        assert_eq!(offer(&mut entries, 11, DedupStrategy::KeepLast, &processed), Admission::Replaced(1));
        assert_eq!(entries.iter().map(|e| e.item).collect::<Vec<_>>(), vec![11, 2]);
    }

    #[test]
    fn processed_keys_are_bounded() {
        let mut processed = ProcessedKeys::default();
        processed.remember(["a", "b", "c"].map(String::from), 2);
        assert!(!processed.contains("a"));
        assert!(processed.contains("b"));
        assert!(processed.contains("c"));

        let mut entries = Vec::new();
        let outcome = admit(&mut entries, 7, Some("c".to_string()), DedupStrategy::KeepLast, &processed);
        assert_eq!(outcome, Admission::Duplicate(7));
        assert!(entries.is_empty());
    }
}
