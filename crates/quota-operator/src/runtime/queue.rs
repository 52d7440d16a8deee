use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
    sync::Arc,
};

use tokio::sync::{Mutex, Notify};

pub const DEFAULT_CAPACITY: usize = 4096;

/// A bounded, deduplicating work queue of reconcile keys.
///
/// - A key already waiting in the queue is not enqueued twice.
/// - A key currently being reconciled is parked as dirty and re-queued
///   when [`WorkQueue::done`] is called, so no two workers ever process
///   the same key concurrently and no change is lost.
/// - After [`WorkQueue::shutdown`], [`WorkQueue::next`] drains to `None`
///   without handing out queued keys.
pub struct WorkQueue<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    capacity: usize,
}

struct State<K> {
    order: VecDeque<K>,
    queued: HashSet<K>,
    active: HashSet<K>,
    dirty: HashSet<K>,
    shutdown: bool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                order: VecDeque::new(),
                queued: HashSet::new(),
                active: HashSet::new(),
                dirty: HashSet::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Adds a key, deduplicating against queued and in-flight work.
    pub async fn enqueue(&self, key: K) {
        {
            let mut state = self.state.lock().await;
            if state.shutdown {
                return;
            }
            if state.active.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            if state.queued.contains(&key) {
                return;
            }
            if state.order.len() >= self.capacity {
                tracing::warn!(capacity = self.capacity, "work queue full, dropping key");
                return;
            }
            state.queued.insert(key.clone());
            state.order.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Hands out the next key, marking it in flight. Returns `None` once
    /// the queue has been shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.order.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks a key's reconcile as finished and re-queues it if changes
    /// arrived while it was in flight.
    pub async fn done(&self, key: &K) {
        let requeue = {
            let mut state = self.state.lock().await;
            state.active.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.enqueue(key.clone()).await;
        }
    }

    /// Stops handing out keys. In-flight reconciles finish; queued keys
    /// are dropped.
    pub async fn shutdown(&self) {
        self.state.lock().await.shutdown = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedupes_queued_keys() {
        let queue = WorkQueue::new(DEFAULT_CAPACITY);
        queue.enqueue("a").await;
        queue.enqueue("a").await;
        queue.enqueue("b").await;

        assert_eq!(queue.next().await, Some("a"));
        assert_eq!(queue.next().await, Some("b"));
    }

    #[tokio::test]
    async fn key_enqueued_while_active_is_requeued_on_done() {
        let queue = WorkQueue::new(DEFAULT_CAPACITY);
        queue.enqueue("a").await;

        let key = queue.next().await.expect("queued key");
        // Change arrives while the key is being reconciled.
        queue.enqueue("a").await;

        // The key must not be handed to a second worker yet.
        assert!(queue.state.lock().await.order.is_empty());

        queue.done(&key).await;
        assert_eq!(queue.next().await, Some("a"));
    }

    #[tokio::test]
    async fn next_returns_none_after_shutdown() {
        let queue = WorkQueue::new(DEFAULT_CAPACITY);
        queue.enqueue("a").await;
        queue.shutdown().await;

        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_workers() {
        let queue: Arc<WorkQueue<&str>> = WorkQueue::new(DEFAULT_CAPACITY);
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };

        // Let the worker park on the empty queue before shutting down.
        tokio::task::yield_now().await;
        queue.shutdown().await;

        assert_eq!(worker.await.expect("worker task"), None);
    }

    #[tokio::test]
    async fn capacity_bounds_queued_keys() {
        let queue = WorkQueue::new(2);
        queue.enqueue(1).await;
        queue.enqueue(2).await;
        queue.enqueue(3).await;

        assert_eq!(queue.state.lock().await.order.len(), 2);
    }
}
