//! Buffer pool and bounded work queues
//!
//! The pipeline reuses fixed-size message buffers across packets instead of
//! allocating per packet, and per-peer queues are bounded with head-drop
//! semantics: when full, the oldest in-flight item is discarded so stalled
//! old data never blocks new data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

/// Room for the largest UDP datagram plus transport overhead
pub const MAX_BUF_SIZE: usize = 65535 + 32;

/// Headroom reserved at the front of outbound buffers for the transport header
pub const HEADER_RESERVE: usize = 16;

/// Pool of reusable message buffers
pub struct BufferPool {
    bufs: ArrayQueue<Vec<u8>>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            bufs: ArrayQueue::new(capacity),
        }
    }

    /// Take a cleared buffer of MAX_BUF_SIZE length
    pub fn get(&self) -> Vec<u8> {
        match self.bufs.pop() {
            Some(buf) => buf,
            None => vec![0u8; MAX_BUF_SIZE],
        }
    }

    /// Return a buffer; dropped on the floor if the pool is full
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() < MAX_BUF_SIZE {
            return;
        }
        buf.resize(MAX_BUF_SIZE, 0);
        let _ = self.bufs.push(buf);
    }
}

/// Bounded MPSC queue with head-drop overflow and async pop
pub struct PacketQueue<T> {
    inner: Arc<QueueInner<T>>,
}

struct QueueInner<T> {
    queue: parking_lot::Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl<T> Clone for PacketQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PacketQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queue: parking_lot::Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue; when full the oldest item is dropped and returned
    pub fn push(&self, item: T) -> Option<T> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Some(item);
        }

        let dropped = {
            let mut queue = self.inner.queue.lock();
            let dropped = if queue.len() >= self.inner.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(item);
            dropped
        };

        self.inner.notify.notify_one();
        dropped
    }

    /// Await the next item; None once closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.inner.queue.lock().pop_front() {
                return Some(item);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Drop everything queued, returning what was flushed
    pub fn flush(&self) -> Vec<T> {
        self.inner.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }

    /// Close the queue; pending items remain poppable
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_buffers() {
        let pool = BufferPool::new(4);
        let mut buf = pool.get();
        assert_eq!(buf.len(), MAX_BUF_SIZE);

        buf[0] = 0xff;
        let ptr = buf.as_ptr();
        pool.put(buf);

        let again = pool.get();
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(again.len(), MAX_BUF_SIZE);
    }

    #[test]
    fn pool_overflow_discards() {
        let pool = BufferPool::new(1);
        pool.put(vec![0u8; MAX_BUF_SIZE]);
        pool.put(vec![0u8; MAX_BUF_SIZE]);
        // Second put was dropped; only one buffer is pooled
        assert!(pool.bufs.pop().is_some());
        assert!(pool.bufs.pop().is_none());
    }

    #[tokio::test]
    async fn queue_orders_and_head_drops() {
        let queue: PacketQueue<u32> = PacketQueue::new(3);
        assert_eq!(queue.push(1), None);
        assert_eq!(queue.push(2), None);
        assert_eq!(queue.push(3), None);
        // Full: the oldest is dropped in favor of the new item
        assert_eq!(queue.push(4), Some(1));

        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
        assert_eq!(queue.pop().await, Some(4));
    }

    #[tokio::test]
    async fn queue_close_drains_then_ends() {
        let queue: PacketQueue<u32> = PacketQueue::new(8);
        queue.push(7);
        queue.close();

        assert_eq!(queue.pop().await, Some(7));
        assert_eq!(queue.pop().await, None);
        // Pushing after close hands the item back
        assert_eq!(queue.push(8), Some(8));
    }

    #[tokio::test]
    async fn queue_wakes_waiter() {
        let queue: PacketQueue<u32> = PacketQueue::new(8);
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(42);
        assert_eq!(popper.await.unwrap(), Some(42));
    }
}
