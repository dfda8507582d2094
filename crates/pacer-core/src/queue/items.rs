//! Item storage: payload plus the metadata the queuers need.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::{ExpiryFn, QueuePosition};

/// A queued item and when it arrived.
#[derive(Debug, Clone)]
pub(crate) struct ItemRecord<T> {
    pub(crate) item: T,
    pub(crate) added_at: Instant,
    pub(crate) priority: Option<i64>,
}

/// One double-ended sequence backing FIFO, LIFO, deque and priority use.
#[derive(Debug, Clone)]
pub(crate) struct ItemQueue<T> {
    records: VecDeque<ItemRecord<T>>,
}

impl<T> Default for ItemQueue<T> {
    fn default() -> Self {
        Self {
            records: VecDeque::new(),
        }
    }
}

impl<T> ItemQueue<T> {
    /// Insert at `position`, or by priority when one is given.
    ///
    /// Prioritized items go after every item whose priority is <= theirs,
    /// so the front holds the lowest priority and ties keep arrival order.
    pub(crate) fn insert(&mut self, item: T, position: QueuePosition, priority: Option<i64>, now: Instant) {
        let record = ItemRecord {
            item,
            added_at: now,
            priority,
        };
        match priority {
            Some(p) => {
                let at = self
                    .records
                    .partition_point(|r| r.priority.is_none_or(|q| q <= p));
                self.records.insert(at, record);
            }
            None => match position {
                QueuePosition::Front => self.records.push_front(record),
                QueuePosition::Back => self.records.push_back(record),
            },
        }
    }

    pub(crate) fn take(&mut self, position: QueuePosition) -> Option<T> {
        let record = match position {
            QueuePosition::Front => self.records.pop_front(),
            QueuePosition::Back => self.records.pop_back(),
        };
        record.map(|r| r.item)
    }

    pub(crate) fn peek(&self, position: QueuePosition) -> Option<&T> {
        let record = match position {
            QueuePosition::Front => self.records.front(),
            QueuePosition::Back => self.records.back(),
        };
        record.map(|r| &r.item)
    }

    pub(crate) fn items(&self) -> impl Iterator<Item = &T> {
        self.records.iter().map(|r| &r.item)
    }

    /// Remove and return every item `is_expired` flags, preserving order.
    pub(crate) fn remove_expired(&mut self, mut is_expired: impl FnMut(&ItemRecord<T>) -> bool) -> Vec<T> {
        if !self.records.iter().any(&mut is_expired) {
            return Vec::new();
        }
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.records.len());
        for record in self.records.drain(..) {
            if is_expired(&record) {
                expired.push(record.item);
            } else {
                kept.push_back(record);
            }
        }
        self.records = kept;
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

/// Expiry check combining the age limit and the caller's predicate.
pub(crate) fn expired<T>(
    record: &ItemRecord<T>,
    now: Instant,
    max_age: Option<Duration>,
    predicate: Option<&ExpiryFn<T>>,
) -> bool {
    let too_old = max_age.is_some_and(|age| now.saturating_duration_since(record.added_at) >= age);
    too_old || predicate.is_some_and(|f| f(&record.item, record.added_at))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn drain(queue: &mut ItemQueue<u32>, from: QueuePosition) -> Vec<u32> {
        std::iter::from_fn(|| queue.take(from)).collect()
    }

    #[rstest]
    #[case::fifo(QueuePosition::Back, QueuePosition::Front, vec![1, 2, 3])]
    #[case::lifo(QueuePosition::Back, QueuePosition::Back, vec![3, 2, 1])]
    #[case::front_insert(QueuePosition::Front, QueuePosition::Front, vec![3, 2, 1])]
    #[tokio::test]
    async fn positions_define_order(#[case] add: QueuePosition, #[case] take: QueuePosition, #[case] expected: Vec<u32>) {
        let mut queue = ItemQueue::default();
        for n in [1, 2, 3] {
            queue.insert(n, add, None, Instant::now());
        }
        assert_eq!(drain(&mut queue, take), expected);
    }

    #[tokio::test]
    async fn priority_is_ascending_and_stable() {
        let mut queue = ItemQueue::default();
        let now = Instant::now();
        for (item, priority) in [(30, 3), (10, 1), (20, 2), (11, 1)] {
            queue.insert(item, QueuePosition::Front, Some(priority), now);
        }
        assert_eq!(queue.items().copied().collect::<Vec<_>>(), vec![10, 11, 20, 30]);
        assert_eq!(queue.peek(QueuePosition::Back), Some(&30));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_items_are_removed_in_order() {
        let mut queue = ItemQueue::default();
        let start = Instant::now();
        queue.insert(1, QueuePosition::Back, None, start);
        queue.insert(2, QueuePosition::Back, None, start + Duration::from_millis(50));
        queue.insert(3, QueuePosition::Back, None, start);
        let now = start + Duration::from_millis(100);
        let gone = queue.remove_expired(|r| expired(r, now, Some(Duration::from_millis(80)), None));
        assert_eq!(gone, vec![1, 3]);
        assert_eq!(queue.len(), 1);

        let odd: ExpiryFn<u32> = std::sync::Arc::new(|n: &u32, _: Instant| n % 2 == 0);
        assert_eq!(queue.remove_expired(|r| expired(r, now, None, Some(&odd))), vec![2]);
        assert!(queue.is_empty());
    }
}
