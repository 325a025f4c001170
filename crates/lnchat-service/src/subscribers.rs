//! Fan-out of incoming messages to live subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a
//! subscriber whose queue is full, or whose receiver is gone, is dropped
//! and its queue closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use lnchat_shared::constants::SUBSCRIBER_CHANNEL_CAPACITY;
use lnchat_store::Message;

#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    senders: Mutex<HashMap<u64, mpsc::Sender<Message>>>,
}

/// Receiving end of one subscription.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Message>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<Message>>> {
        self.senders.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().insert(id, tx);
        debug!(subscriber = id, "subscriber added");
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.lock().remove(&id).is_some() {
            debug!(subscriber = id, "subscriber removed");
        }
    }

    /// Deliver `message` to every subscriber; returns how many got it.
    pub fn publish(&self, message: &Message) -> usize {
        let mut senders = self.lock();
        let mut delivered = 0;
        senders.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = *id, "subscriber too slow, dropping it");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = *id, "subscriber went away");
                false
            }
        });
        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscriber, closing their queues.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64) -> Message {
        Message {
            id,
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_everyone() {
        let subscribers = Subscribers::new();
        let mut a = subscribers.subscribe();
        let mut b = subscribers.subscribe();
        assert_ne!(a.id, b.id);

        assert_eq!(subscribers.publish(&message(1)), 2);
        assert_eq!(a.receiver.recv().await.unwrap().id, 1);
        assert_eq!(b.receiver.recv().await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let subscribers = Subscribers::new();
        let mut slow = subscribers.subscribe();
        let mut fast = subscribers.subscribe();

        for id in 1..=SUBSCRIBER_CHANNEL_CAPACITY as u64 + 1 {
            subscribers.publish(&message(id));
            assert_eq!(fast.receiver.recv().await.unwrap().id, id);
        }
        assert_eq!(subscribers.len(), 1);

        // The slow one still drains what it got, then sees the end.
        let mut drained = 0;
        while let Some(m) = slow.receiver.recv().await {
            drained += 1;
            assert_eq!(m.id, drained);
        }
        assert_eq!(drained, SUBSCRIBER_CHANNEL_CAPACITY as u64);

        subscribers.publish(&message(100));
        assert_eq!(fast.receiver.recv().await.unwrap().id, 100);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let subscribers = Subscribers::new();
        let sub = subscribers.subscribe();
        drop(sub);
        assert_eq!(subscribers.publish(&message(1)), 0);
        assert!(subscribers.is_empty());
    }
}
