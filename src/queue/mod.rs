//! Generic priority queue (component A), backed by a binary heap behind a
//! single lock. The Download Queue (component E) holds one of these
//! parameterized over `DownloadTask`.

use std::collections::BinaryHeap;

use tokio::sync::Mutex;

/// A max-heap priority queue shared across tasks via interior locking.
///
/// All operations serialize through a single `tokio::sync::Mutex`, so
/// strictly sequential callers observe perfect priority ordering; under true
/// concurrency, ordering is best-effort (bounded reordering as items race to
/// acquire the lock).
pub struct PriorityQueue<T> {
    inner: Mutex<BinaryHeap<T>>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    /// Builds an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Number of items currently queued.
    pub async fn count(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// True if the queue holds no items.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

impl<T: Ord> PriorityQueue<T> {
    /// Inserts an item, restoring heap order.
    pub async fn enqueue(&self, item: T) {
        self.inner.lock().await.push(item);
    }

    /// Removes and returns the highest-priority item, if any.
    pub async fn dequeue(&self) -> Option<T> {
        self.inner.lock().await.pop()
    }

    /// Removes every item matching `predicate`, rebuilding the heap from the
    /// survivors. Returns the removed items in arbitrary order.
    pub async fn remove_where<F>(&self, predicate: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut guard = self.inner.lock().await;
        let drained: Vec<T> = guard.drain().collect();
        let (removed, survivors): (Vec<T>, Vec<T>) =
            drained.into_iter().partition(|item| predicate(item));
        *guard = survivors.into_iter().collect();
        removed
    }
}

impl<T: Ord + Clone> PriorityQueue<T> {
    /// Returns a clone of the highest-priority item without removing it.
    pub async fn peek(&self) -> Option<T> {
        self.inner.lock().await.peek().cloned()
    }

    /// Returns a drained copy of the queue, in priority order, without
    /// mutating the source. Useful for introspection and tests.
    pub async fn snapshot(&self) -> Vec<T> {
        let guard = self.inner.lock().await;
        let mut copy: BinaryHeap<T> = guard.clone();
        let mut ordered = Vec::with_capacity(copy.len());
        while let Some(item) = copy.pop() {
            ordered.push(item);
        }
        ordered
    }
}

impl<T: Ord + PartialEq> PriorityQueue<T> {
    /// Removes the first item equal to `target`, if present.
    pub async fn remove_first(&self, target: &T) -> bool {
        let mut guard = self.inner.lock().await;
        let drained: Vec<T> = guard.drain().collect();
        let mut removed = false;
        let survivors: Vec<T> = drained
            .into_iter()
            .filter(|item| {
                if !removed && item == target {
                    removed = true;
                    false
                } else {
                    true
                }
            })
            .collect();
        *guard = survivors.into_iter().collect();
        removed
    }

    /// Removes every item equal to `target`. Returns how many were removed.
    pub async fn remove_all(&self, target: &T) -> usize {
        let mut guard = self.inner.lock().await;
        let drained: Vec<T> = guard.drain().collect();
        let before = drained.len();
        let survivors: Vec<T> = drained.into_iter().filter(|item| item != target).collect();
        let removed = before - survivors.len();
        *guard = survivors.into_iter().collect();
        removed
    }
}
