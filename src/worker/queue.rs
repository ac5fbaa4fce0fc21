use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

/// Default mailbox capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// What a full queue does with a new message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until the consumer frees a slot.
    Block,
    /// Evict the oldest queued message to make room.
    DropOldest,
    /// Refuse the new message.
    Reject,
}

impl OverflowPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::DropOldest => "drop_oldest",
            Self::Reject => "reject",
        }
    }
}

/// Mailbox sizing and overflow behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl QueueConfig {
    /// Queue facing external producers: full means push back on the caller.
    pub fn ingest() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::Reject,
        }
    }

    /// Queue between stages: full means the upstream stage waits.
    pub fn internal() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overflow: OverflowPolicy::Block,
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is closed")]
    Closed,
}

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Enqueued,
    /// The message was enqueued after evicting the oldest one.
    EvictedOldest,
}

/// Bounded FIFO mailbox with an explicit overflow policy.
///
/// Any number of producers may push. Pops are meant for a single consumer
/// task. After [`WorkQueue::close`] pushes fail with [`QueueError::Closed`]
/// and pops return what is left, then `None`.
pub struct WorkQueue<M> {
    items: Mutex<VecDeque<M>>,
    capacity: usize,
    overflow: OverflowPolicy,
    closed: AtomicBool,
    not_empty: Notify,
    not_full: Notify,
}

impl<M> WorkQueue<M> {
    pub fn new(cfg: QueueConfig) -> Self {
        let capacity = cfg.capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
            overflow: cfg.overflow,
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueues `msg`, applying the overflow policy when full.
    ///
    /// Only the `Block` policy ever waits.
    pub async fn push(&self, msg: M) -> Result<Pushed, QueueError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut items = self.items.lock();
                if self.is_closed() {
                    return Err(QueueError::Closed);
                }
                if items.len() < self.capacity {
                    items.push_back(msg);
                    drop(items);
                    self.not_empty.notify_one();
                    return Ok(Pushed::Enqueued);
                }
                match self.overflow {
                    OverflowPolicy::Reject => return Err(QueueError::Full),
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(msg);
                        drop(items);
                        self.not_empty.notify_one();
                        return Ok(Pushed::EvictedOldest);
                    }
                    OverflowPolicy::Block => {}
                }
            }

            notified.await;
        }
    }

    /// Dequeues the oldest message, waiting while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and drained. Cancel-safe.
    pub async fn pop(&self) -> Option<M> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_pop() {
                return Some(msg);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Waits for at least one message, then takes up to `max` of them.
    ///
    /// Returns `None` once the queue is closed and drained. Cancel-safe.
    pub async fn pop_batch(&self, max: usize) -> Option<Vec<M>> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.drain(max);
            if !batch.is_empty() {
                return Some(batch);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Dequeues the oldest message without waiting.
    pub fn try_pop(&self) -> Option<M> {
        let msg = self.items.lock().pop_front();
        if msg.is_some() {
            self.not_full.notify_waiters();
        }
        msg
    }

    /// Takes up to `max` queued messages without waiting.
    pub fn drain(&self, max: usize) -> Vec<M> {
        let batch: Vec<M> = {
            let mut items = self.items.lock();
            let n = items.len().min(max.max(1));
            items.drain(..n).collect()
        };
        if !batch.is_empty() {
            self.not_full.notify_waiters();
        }
        batch
    }

    /// Stops accepting messages and wakes every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn queue(capacity: usize, overflow: OverflowPolicy) -> WorkQueue<u32> {
        WorkQueue::new(QueueConfig { capacity, overflow })
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = queue(4, OverflowPolicy::Reject);
        for i in 0..3 {
            q.push(i).await.unwrap();
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().await, Some(0));
        assert_eq!(q.drain(10), vec![1, 2]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let q = queue(2, OverflowPolicy::Reject);
        q.push(1).await.unwrap();
        q.push(2).await.unwrap();
        assert_eq!(q.push(3).await, Err(QueueError::Full));
        assert_eq!(q.drain(10), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_drop_oldest_when_full() {
        let q = queue(2, OverflowPolicy::DropOldest);
        q.push(1).await.unwrap();
        q.push(2).await.unwrap();
        assert_eq!(q.push(3).await, Ok(Pushed::EvictedOldest));
        assert_eq!(q.drain(10), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_block_waits_for_room() {
        let q = Arc::new(queue(1, OverflowPolicy::Block));
        q.push(1).await.unwrap();

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push(2).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(q.len(), 1);

        assert_eq!(q.pop().await, Some(1));
        assert_eq!(producer.await.unwrap(), Ok(Pushed::Enqueued));
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let q = queue(4, OverflowPolicy::Block);
        q.push(7).await.unwrap();
        q.close();
        assert_eq!(q.push(8).await, Err(QueueError::Closed));
        assert_eq!(q.pop().await, Some(7));
        assert_eq!(q.pop().await, None);
        assert_eq!(q.pop_batch(8).await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer() {
        let q = Arc::new(queue(4, OverflowPolicy::Block));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pop_batch_limits_size() {
        let q = queue(8, OverflowPolicy::Block);
        for i in 0..5 {
            q.push(i).await.unwrap();
        }
        assert_eq!(q.pop_batch(3).await, Some(vec![0, 1, 2]));
        assert_eq!(q.pop_batch(3).await, Some(vec![3, 4]));
    }
}
