//! Event broker: fans each inbound event out to every registered subscriber queue.
//!
//! Queues are bounded and filled with `try_send`, so a slow subscriber never blocks the
//! publisher or the other subscribers. When a subscriber's queue is full the new event is
//! dropped for that subscriber only (drop-new). Each subscriber sees events in publish order.

use crate::channels::InboundEvent;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Opaque subscriber identifier.
pub type SubscriberId = String;

/// Caller-owned receiving end of one subscriber queue.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<InboundEvent>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event. Returns None once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }
}

/// Registry of subscriber queues. Holds only the sending side; subscribers own their receivers.
pub struct EventBroker {
    subscribers: RwLock<HashMap<SubscriberId, mpsc::Sender<InboundEvent>>>,
    capacity: usize,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new queue and return its receiving end.
    pub async fn subscribe(&self) -> Subscription {
        let id = format!("sub-{}", uuid::Uuid::new_v4());
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.write().await.insert(id.clone(), tx);
        log::debug!("broker: subscriber {} registered", id);
        Subscription { id, rx }
    }

    /// Remove a subscriber. Unknown or already-removed ids are a no-op; returns whether one was removed.
    pub async fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.subscribers.write().await.remove(id).is_some();
        if removed {
            log::debug!("broker: subscriber {} removed", id);
        }
        removed
    }

    /// Deliver a clone of the event to every subscriber. Returns how many queues accepted it.
    pub async fn publish(&self, event: InboundEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let g = self.subscribers.read().await;
            for (id, tx) in g.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        log::warn!("broker: queue full for subscriber {}, dropping event {}", id, event.msg_id);
                    }
                    Err(TrySendError::Closed(_)) => closed.push(id.clone()),
                }
            }
        }
        if !closed.is_empty() {
            let mut g = self.subscribers.write().await;
            for id in closed {
                g.remove(&id);
                log::debug!("broker: pruned closed subscriber {}", id);
            }
        }
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
