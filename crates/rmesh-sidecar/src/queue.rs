// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable bounded send queue owned by the supervisor.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::Notify;

use rmesh_proto::DmOptions;

/// Default queue capacity.
pub const SEND_QUEUE_MAX: usize = 2000;

/// One queued outbound DM.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedDm {
    /// Destination overlay address.
    pub to: String,
    /// JSON payload.
    pub data: Value,
    /// Delivery options, if any.
    pub opts: Option<DmOptions>,
}

/// Bounded FIFO of outbound DMs with discard-oldest overflow.
///
/// The queue belongs to the supervisor, not the bridge child, so entries
/// accepted before a crash are still delivered to the next child. Under
/// sustained backpressure the oldest entry is displaced to admit the newest:
/// for streams, stale frames lose to fresher ones.
pub struct DmQueue {
    entries: Mutex<VecDeque<QueuedDm>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl DmQueue {
    /// Create a queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append an entry, displacing the oldest when full.
    ///
    /// Returns `false` when an entry was displaced.
    pub fn push(&self, item: QueuedDm) -> bool {
        let displaced = {
            let mut entries = self.entries.lock().expect("send queue lock poisoned");
            let displaced = if entries.len() >= self.capacity {
                entries.pop_front();
                true
            } else {
                false
            };
            entries.push_back(item);
            displaced
        };
        if displaced {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        !displaced
    }

    /// Remove the oldest entry without waiting.
    pub fn pop_now(&self) -> Option<QueuedDm> {
        self.entries
            .lock()
            .expect("send queue lock poisoned")
            .pop_front()
    }

    /// Wait for the next entry.
    pub async fn recv(&self) -> QueuedDm {
        loop {
            if let Some(item) = self.pop_now() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Current queue depth.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("send queue lock poisoned").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries displaced by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dm(n: usize) -> QueuedDm {
        QueuedDm {
            to: format!("peer.{n}"),
            data: json!({"n": n}),
            opts: None,
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = DmQueue::new(10);
        q.push(dm(1));
        q.push(dm(2));
        q.push(dm(3));
        assert_eq!(q.pop_now().unwrap().to, "peer.1");
        assert_eq!(q.pop_now().unwrap().to, "peer.2");
        assert_eq!(q.pop_now().unwrap().to, "peer.3");
        assert!(q.pop_now().is_none());
    }

    #[test]
    fn overflow_displaces_oldest() {
        let q = DmQueue::new(3);
        assert!(q.push(dm(1)));
        assert!(q.push(dm(2)));
        assert!(q.push(dm(3)));
        assert!(!q.push(dm(4)));
        assert_eq!(q.len(), 3);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop_now().unwrap().to, "peer.2");
        assert_eq!(q.pop_now().unwrap().to, "peer.3");
        assert_eq!(q.pop_now().unwrap().to, "peer.4");
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let q = std::sync::Arc::new(DmQueue::new(4));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.recv().await });
        tokio::task::yield_now().await;
        q.push(dm(9));
        let got = waiter.await.unwrap();
        assert_eq!(got.to, "peer.9");
    }

    #[tokio::test]
    async fn push_before_recv_is_not_lost() {
        let q = DmQueue::new(4);
        q.push(dm(1));
        let got = q.recv().await;
        assert_eq!(got.to, "peer.1");
    }
}
