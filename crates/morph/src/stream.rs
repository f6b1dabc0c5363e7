//! An in-memory byte queue that turns transport chunks into a readable stream.
//!
//! Transports deliver bytes in arbitrary chunks; the frame reader needs exact
//! counts. Reads wait until enough bytes exist or the queue is closed.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::lock;

#[derive(Default)]
struct QueueState {
    bytes: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct ByteQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: &[u8]) {
        lock(&self.state).bytes.extend(chunk);
        self.changed.notify_waiters();
    }

    /// Wakes every reader; reads that cannot complete return `None`.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).bytes.len()
    }

    /// Removes exactly `n` bytes, waiting for them. `None` once closed short.
    pub async fn read_exact(&self, n: usize) -> Option<Vec<u8>> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            {
                let mut state = lock(&self.state);
                if state.bytes.len() >= n {
                    return Some(state.bytes.drain(..n).collect());
                }
                if state.closed {
                    return None;
                }
            }
            changed.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_read_waits_for_enough_bytes() {
        let queue = Arc::new(ByteQueue::new());
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.read_exact(4).await })
        };
        queue.push(&[1, 2]);
        tokio::task::yield_now().await;
        queue.push(&[3, 4, 5]);
        assert_eq!(reader.await.unwrap(), Some(vec![1, 2, 3, 4]));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_short_read() {
        let queue = ByteQueue::new();
        queue.push(&[1]);
        queue.close();
        assert_eq!(queue.read_exact(2).await, None);
        assert_eq!(queue.read_exact(1).await, Some(vec![1]));
    }
}
