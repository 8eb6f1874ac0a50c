//! Send-before-connect buffer for the multiplexed body socket.
//!
//! Messages are kept per path but flushed in global enqueue order, so a
//! reconnect replays exactly what was sent while offline, in order.

use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub path: String,
    pub payload: Vec<u8>,
}

pub struct SendQueue {
    queue: VecDeque<QueuedMessage>,
    max_size: usize,
}

impl SendQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a message for later delivery. Returns false when full.
    pub fn enqueue(&mut self, path: impl Into<String>, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedMessage {
            path: path.into(),
            payload,
        });
        true
    }

    /// Everything queued, oldest first. Leaves the queue empty.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.queue.drain(..).collect()
    }

    /// Put undelivered messages back ahead of everything queued since.
    pub fn requeue_front(&mut self, messages: Vec<QueuedMessage>) {
        for message in messages.into_iter().rev() {
            self.queue.push_front(message);
        }
    }

    /// Drop everything queued, returning how many messages were dropped.
    pub fn discard(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_global_order() {
        let mut q = SendQueue::new(100);
        q.enqueue("a.md", vec![1]);
        q.enqueue("b.md", vec![2]);
        q.enqueue("a.md", vec![3]);

        let drained = q.drain();
        let order: Vec<(&str, u8)> = drained
            .iter()
            .map(|m| (m.path.as_str(), m.payload[0]))
            .collect();
        assert_eq!(order, vec![("a.md", 1), ("b.md", 2), ("a.md", 3)]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_discard_counts() {
        let mut q = SendQueue::new(100);
        assert_eq!(q.discard(), 0);
        for i in 0..7 {
            q.enqueue("a.md", vec![i]);
        }
        assert_eq!(q.discard(), 7);
        assert!(q.is_empty());
        assert_eq!(q.discard(), 0);
    }

    #[test]
    fn test_capacity_limit() {
        let mut q = SendQueue::new(2);
        assert!(q.enqueue("a.md", vec![]));
        assert!(q.enqueue("a.md", vec![]));
        assert!(!q.enqueue("a.md", vec![]));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut q = SendQueue::new(10);
        q.enqueue("later.md", vec![3]);
        q.requeue_front(vec![
            QueuedMessage { path: "a.md".into(), payload: vec![1] },
            QueuedMessage { path: "b.md".into(), payload: vec![2] },
        ]);
        let order: Vec<u8> = q.drain().iter().map(|m| m.payload[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
