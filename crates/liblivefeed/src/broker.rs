use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use livefeed_protocol::UserId;

/// Per-user fan-out: every subscriber owns a bounded mpsc queue and only
/// receives items published for its own user. A full queue drops the new
/// item for that subscriber.
pub struct FeedBroker<T> {
    feed: &'static str,
    subscribers: DashMap<UserId, Vec<(u64, mpsc::Sender<T>)>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl<T: Clone> FeedBroker<T> {
    pub fn new(feed: &'static str, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            feed,
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        })
    }

    pub fn subscribe(self: &Arc<Self>, user_id: UserId) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.entry(user_id).or_default().push((id, tx));
        Subscription {
            user_id,
            id,
            rx,
            broker: Arc::downgrade(self),
        }
    }

    /// Offer `item` to every subscriber of `user_id` without waiting.
    /// Returns the number of queues that accepted it.
    pub fn publish(&self, user_id: UserId, item: T) -> usize {
        let Some(subs) = self.subscribers.get(&user_id) else {
            return 0;
        };
        let mut accepted = 0;
        for (id, tx) in subs.iter() {
            match tx.try_send(item.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(feed = self.feed, user_id, subscriber = id, "queue full, dropping item");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        accepted
    }

    pub fn subscriber_count(&self, user_id: UserId) -> usize {
        self.subscribers.get(&user_id).map_or(0, |subs| subs.len())
    }

    /// Number of users with at least one subscriber.
    pub fn active_users(&self) -> usize {
        self.subscribers.len()
    }

    /// Drop every sender. Subscribers drain what is queued, then see the end
    /// of the feed.
    pub fn close(&self) {
        self.subscribers.clear();
    }

    fn unsubscribe(&self, user_id: UserId, id: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(&user_id) {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        self.subscribers.remove_if(&user_id, |_, subs| subs.is_empty());
    }
}

/// A live subscription to one user's items. Dropping it unregisters the queue.
pub struct Subscription<T: Clone> {
    user_id: UserId,
    id: u64,
    rx: mpsc::Receiver<T>,
    broker: Weak<FeedBroker<T>>,
}

impl<T: Clone> Subscription<T> {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Next item, or `None` once the broker has closed the feed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(broker) = self.broker.upgrade() {
            broker.unsubscribe(self.user_id, self.id);
        }
    }
}
