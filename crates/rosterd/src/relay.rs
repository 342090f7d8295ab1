//! Live relay: fan-out of camera frames to dashboard viewers.
//!
//! One bounded queue per subscriber. Publishing never waits: a subscriber
//! whose queue is full or closed is removed on the spot, and nothing is
//! retained for subscribers that join later.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Frames a viewer may fall behind by before it is dropped.
pub const DEFAULT_VIEWER_QUEUE: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    /// Encoded camera frame, forwarded as-is.
    Frame(Bytes),
    /// JSON text notice, e.g. a check-in.
    Notice(Arc<str>),
}

#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

struct Inner {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Broadcast>>>,
    queue: usize,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: Uuid,
    rx: mpsc::Receiver<Broadcast>,
    relay: Relay,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next message, or `None` once the relay dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Broadcast> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.relay.unsubscribe(self.id);
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_QUEUE)
    }
}

impl Relay {
    pub fn new(queue: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                queue: queue.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue);
        let id = Uuid::new_v4();
        let count = {
            let mut subs = self.inner.subscribers.lock();
            subs.insert(id, tx);
            subs.len()
        };
        tracing::info!(viewer = %id, viewers = count, "viewer subscribed");
        Subscription {
            id,
            rx,
            relay: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.inner.subscribers.lock().remove(&id).is_some();
        if removed {
            tracing::info!(viewer = %id, "viewer unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Deliver a frame to every current subscriber. Returns how many took it.
    pub fn publish(&self, frame: Bytes) -> usize {
        self.broadcast(Broadcast::Frame(frame))
    }

    pub fn notify(&self, text: impl Into<Arc<str>>) -> usize {
        self.broadcast(Broadcast::Notice(text.into()))
    }

    fn broadcast(&self, message: Broadcast) -> usize {
        let mut subs = self.inner.subscribers.lock();
        let mut delivered = 0;
        subs.retain(|id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(viewer = %id, "viewer too slow; dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }
}
