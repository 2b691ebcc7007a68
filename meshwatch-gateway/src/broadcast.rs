//! Subscriber registry and update fan-out.
//!
//! Ingestion never touches a socket. It hands finished frames to the
//! `Publisher`, which pushes them into one bounded handoff channel. The
//! `Broadcaster` task is the only consumer of that channel; for each frame it
//! sweeps the registry in registration order and enqueues the frame on every
//! subscriber's own bounded queue. The per-connection writer task (see
//! `http.rs`) drains that queue onto the socket.
//!
//! A subscriber whose queue is full or closed is marked dead during the sweep
//! and removed once the sweep finishes. Dropping its sender ends its writer
//! task, which closes the connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes};
use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::health::HealthTracker;

pub type SubscriberId = u64;

/// Channel sender half feeding one connection's writer task.
pub type SubscriberSender = mpsc::Sender<Message>;

pub struct Subscriber {
    pub sender: SubscriberSender,
    pub connected_at: OffsetDateTime,
}

/// Live subscribers, iterated in registration order.
#[derive(Clone)]
pub struct SubscriberRegistry {
    subscribers: Arc<RwLock<BTreeMap<SubscriberId, Subscriber>>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub pruned: usize,
}

impl SubscriberRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a connection whose first queued frame is `snapshot`.
    ///
    /// Returns the receiver the connection's writer drains.
    pub fn register(&self, snapshot: Utf8Bytes) -> (SubscriberId, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        // fresh queue, cannot be full
        let _ = tx.try_send(Message::Text(snapshot));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(
            id,
            Subscriber { sender: tx, connected_at: OffsetDateTime::now_utc() },
        );
        (id, rx)
    }

    pub fn deregister(&self, id: SubscriberId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Enqueues `frame` for every subscriber, then prunes the ones that could
    /// not take it. One dead subscriber never blocks the others.
    pub fn deliver(&self, frame: &Utf8Bytes) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut dead = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, sub) in subs.iter() {
                match sub.sender.try_send(Message::Text(frame.clone())) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(subscriber = id, "subscriber lagging, disconnecting");
                        dead.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!(subscriber = id, "subscriber gone");
                        dead.push(*id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut subs = self.subscribers.write();
            for id in &dead {
                subs.remove(id);
            }
            report.pruned = dead.len();
        }
        report
    }

    /// Sends a Close frame to every subscriber and forgets them all.
    pub fn close_all(&self) -> usize {
        let mut subs = self.subscribers.write();
        let count = subs.len();
        for sub in subs.values() {
            let _ = sub.sender.try_send(Message::Close(None));
        }
        subs.clear();
        count
    }
}

/// Ingestion-side handle onto the handoff channel.
#[derive(Clone)]
pub struct Publisher {
    handoff: mpsc::Sender<Utf8Bytes>,
    registry: SubscriberRegistry,
    health: HealthTracker,
}

impl Publisher {
    pub fn has_subscribers(&self) -> bool {
        !self.registry.is_empty()
    }

    /// Hands `frame` to the broadcaster without waiting. Returns `false` when
    /// the frame was dropped (handoff full or broadcaster stopped).
    pub fn publish(&self, frame: String) -> bool {
        match self.handoff.try_send(Utf8Bytes::from(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("handoff channel full, dropping update");
                self.health.record_update_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!("broadcaster stopped, dropping update");
                self.health.record_update_dropped();
                false
            }
        }
    }
}

/// Sole consumer of the handoff channel and sole producer of subscriber frames.
pub struct Broadcaster {
    handoff: mpsc::Receiver<Utf8Bytes>,
    registry: SubscriberRegistry,
}

impl Broadcaster {
    pub async fn run(mut self) {
        while let Some(frame) = self.handoff.recv().await {
            let report = self.registry.deliver(&frame);
            tracing::trace!(delivered = report.delivered, pruned = report.pruned, "update delivered");
        }
        tracing::debug!("handoff channel closed, broadcaster exiting");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Builds the publisher/broadcaster pair around one handoff channel.
pub fn handoff(
    capacity: usize,
    registry: SubscriberRegistry,
    health: HealthTracker,
) -> (Publisher, Broadcaster) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Publisher { handoff: tx, registry: registry.clone(), health },
        Broadcaster { handoff: rx, registry },
    )
}
