//! Signaling queue
//!
//! A FIFO shared between any number of producers and consumers, paired
//! with a readiness signal a consumer can await. The RPC engine's
//! outgoing queue is built on this; the serve loop selects on the
//! signal next to the pipe itself.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// MPMC FIFO with an awaitable readiness signal.
pub struct SignalingQueue<T> {
    items: Mutex<VecDeque<T>>,
    signal: Notify,
}

impl<T> SignalingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            signal: Notify::new(),
        }
    }

    /// Append an element and wake one waiting consumer.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.signal.notify_one();
    }

    /// Remove and return all queued elements in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Wait until at least one element has been pushed since the last
    /// drain. A permit stored by an earlier `push` completes the wait
    /// immediately.
    pub async fn ready(&self) {
        self.signal.notified().await;
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }
}

impl<T> Default for SignalingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn drain_preserves_fifo_order() {
        let q = SignalingQueue::new();
        for n in 0..16 {
            q.push(n);
        }
        assert_eq!(q.drain(), (0..16).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn ready_wakes_consumer() {
        let q = Arc::new(SignalingQueue::new());
        let q2 = q.clone();

        let consumer = tokio::spawn(async move {
            q2.ready().await;
            q2.drain()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(42u32);

        let drained = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer timed out")
            .unwrap();
        assert_eq!(drained, vec![42]);
    }

    #[tokio::test]
    async fn push_before_wait_leaves_permit() {
        let q: SignalingQueue<u8> = SignalingQueue::new();
        q.push(1);
        // must not hang: the push stored a permit
        tokio::time::timeout(Duration::from_millis(100), q.ready())
            .await
            .expect("permit was lost");
    }
}
