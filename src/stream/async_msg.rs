//! Bounded queue for asynchronous device status messages.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

/// Queue depth; beyond this the oldest message is shed. Status messages
/// are advisory, a reader that falls this far behind prefers fresh ones.
pub const DEFAULT_ASYNC_QUEUE_DEPTH: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncMsg {
    pub channel: usize,
    pub sequence_number: u32,
    /// Raw status payload words, host order.
    pub payload: Vec<u32>,
}

pub struct AsyncMsgQueue {
    inner: Mutex<VecDeque<AsyncMsg>>,
    available: Condvar,
    capacity: usize,
}

impl AsyncMsgQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue, shedding the oldest entry when full. Never blocks.
    pub fn push(&self, msg: AsyncMsg) {
        let mut queue = self.inner.lock().expect("async queue poisoned");
        if queue.len() == self.capacity {
            queue.pop_front();
            trace!("async message queue full, oldest message dropped");
        }
        queue.push_back(msg);
        self.available.notify_one();
    }

    /// Dequeue the oldest message, waiting up to `timeout`.
    pub fn pop(&self, timeout: Duration) -> Option<AsyncMsg> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock().expect("async queue poisoned");
        loop {
            if let Some(msg) = queue.pop_front() {
                return Some(msg);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(queue, remaining)
                .expect("async queue poisoned");
            queue = guard;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("async queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AsyncMsgQueue {
    fn default() -> Self {
        Self::new(DEFAULT_ASYNC_QUEUE_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seq: u32) -> AsyncMsg {
        AsyncMsg {
            channel: 0,
            sequence_number: seq,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = AsyncMsgQueue::new(4);
        queue.push(msg(1));
        queue.push(msg(2));
        assert_eq!(queue.pop(Duration::ZERO).unwrap().sequence_number, 1);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().sequence_number, 2);
        assert!(queue.pop(Duration::ZERO).is_none());
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let queue = AsyncMsgQueue::new(3);
        for seq in 0..5 {
            queue.push(msg(seq));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(Duration::ZERO).unwrap().sequence_number, 2);
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = std::sync::Arc::new(AsyncMsgQueue::new(8));
        let writer = std::sync::Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.push(msg(7));
        });
        let got = queue.pop(Duration::from_secs(2)).unwrap();
        assert_eq!(got.sequence_number, 7);
        handle.join().unwrap();
    }
}
