//! Bounded FIFO hand-off queue between pipeline stages.
//!
//! Every cross-task hand-off in the engine goes through a [`BoundedQueue`]:
//! receivers -> timeshift, timeshift -> processors, processors -> mixers. The
//! queue offers both overflow disciplines the pipeline needs: awaiting
//! `push` for bounded back-pressure, and `force_push` which drops the oldest
//! entry so a slow consumer can never stall its producer.
//!
//! `stop()` is idempotent: it wakes all waiters, makes further pushes no-ops
//! and lets consumers drain what is already queued before `pop` returns
//! `None`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<T> {
    deque: VecDeque<T>,
    stopped: bool,
    /// Entries evicted by `force_push` since creation.
    dropped: u64,
}

/// Single-producer/multi-consumer bounded FIFO with cooperative stop.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                deque: VecDeque::with_capacity(capacity),
                stopped: false,
                dropped: 0,
            }),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Pushes with back-pressure: waits for space while the queue is full.
    ///
    /// Returns `false` if the queue was stopped (the item is discarded).
    pub async fn push(&self, item: T) -> bool {
        let mut item = Some(item);
        loop {
            {
                let mut guard = self.inner.lock();
                if guard.stopped {
                    return false;
                }
                if guard.deque.len() < self.capacity {
                    guard.deque.push_back(item.take().expect("item taken once"));
                    drop(guard);
                    self.not_empty.notify_one();
                    return true;
                }
            }

            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after registering so a pop between the first check and
            // registration cannot be missed.
            {
                let mut guard = self.inner.lock();
                if guard.stopped {
                    return false;
                }
                if guard.deque.len() < self.capacity {
                    guard.deque.push_back(item.take().expect("item taken once"));
                    drop(guard);
                    self.not_empty.notify_one();
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Pushes without waiting: when full, the oldest entry is evicted and
    /// counted. Returns `false` if the queue was stopped.
    pub fn force_push(&self, item: T) -> bool {
        {
            let mut guard = self.inner.lock();
            if guard.stopped {
                return false;
            }
            if guard.deque.len() >= self.capacity {
                guard.deque.pop_front();
                guard.dropped += 1;
            }
            guard.deque.push_back(item);
        }
        self.not_empty.notify_one();
        true
    }

    /// Waits for the next entry.
    ///
    /// Returns `None` only after `stop()` and the queue has drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.pop_or_stopped()? {
                return Some(item);
            }

            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.pop_or_stopped()? {
                return Some(item);
            }
            notified.await;
        }
    }

    /// One locked attempt: `None` = stopped and drained, `Some(None)` = empty.
    fn pop_or_stopped(&self) -> Option<Option<T>> {
        let mut guard = self.inner.lock();
        if let Some(item) = guard.deque.pop_front() {
            drop(guard);
            self.not_full.notify_one();
            return Some(Some(item));
        }
        if guard.stopped {
            return None;
        }
        Some(None)
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.inner.lock().deque.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Stops the queue: wakes all waiters, discards further pushes.
    /// Idempotent.
    pub fn stop(&self) {
        {
            let mut guard = self.inner.lock();
            if guard.stopped {
                return;
            }
            guard.stopped = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Whether `stop()` has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub fn len(&self) -> usize {
        self.inner.lock().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().deque.is_empty()
    }

    /// Entries evicted by `force_push` overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Non-removing look at the head of the queue.
    pub fn peek(&self) -> Option<T> {
        self.inner.lock().deque.front().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn preserves_fifo_order() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            assert!(q.push(i).await);
        }
        for i in 0..5 {
            assert_eq!(q.pop().await, Some(i));
        }
    }

    #[tokio::test]
    async fn force_push_evicts_oldest() {
        let q = BoundedQueue::new(3);
        for i in 0..5 {
            q.force_push(i);
        }
        assert_eq!(q.dropped(), 2);
        assert_eq!(q.pop().await, Some(2));
        assert_eq!(q.pop().await, Some(3));
        assert_eq!(q.pop().await, Some(4));
    }

    #[tokio::test]
    async fn pop_waits_for_producer() {
        let q = Arc::new(BoundedQueue::new(4));
        let q2 = Arc::clone(&q);
        let popper = tokio::spawn(async move { q2.pop().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(q.push(42).await);
        assert_eq!(popper.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn push_blocks_until_space() {
        let q = Arc::new(BoundedQueue::new(1));
        assert!(q.push(1).await);

        // Queue is full: a second push must not complete yet.
        let q2 = Arc::clone(&q);
        let pusher = tokio::spawn(async move { q2.push(2).await });
        assert!(timeout(Duration::from_millis(20), async {
            while q.len() < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .is_ok());
        assert!(!pusher.is_finished());

        assert_eq!(q.pop().await, Some(1));
        assert!(pusher.await.unwrap());
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn stop_wakes_blocked_pop_and_drains() {
        let q = Arc::new(BoundedQueue::new(4));
        assert!(q.push(7).await);
        q.stop();
        q.stop(); // idempotent

        // Already-queued entries still drain
        assert_eq!(q.pop().await, Some(7));
        // Then the queue reports end-of-stream
        assert_eq!(q.pop().await, None);
        // Pushes after stop are discarded
        assert!(!q.push(8).await);
        assert!(!q.force_push(9));
    }

    #[tokio::test]
    async fn peek_does_not_remove() {
        let q = BoundedQueue::new(4);
        q.force_push(1);
        assert_eq!(q.peek(), Some(1));
        assert_eq!(q.len(), 1);
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), None);
    }
}
