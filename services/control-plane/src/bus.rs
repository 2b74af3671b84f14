//! Typed in-process event bus with bounded per-subscriber queues.
//!
//! Three instances exist (execution, node, reasoner), constructed in
//! `AppState` and passed explicitly to every component that needs one.
//!
//! # Backpressure
//! Publishing is non-blocking: each subscriber has its own bounded queue and
//! a full queue drops the event for that subscriber only, incrementing the
//! bus drop counter.  A slow subscriber can never stall the publisher or
//! starve a fast subscriber.
//!
//! # Ordering
//! Per-subscriber FIFO.  No ordering is guaranteed across subscribers or
//! across buses.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// A typed publish/subscribe bus.
pub struct EventBus<T> {
    name: &'static str,
    capacity: usize,
    subscribers: RwLock<HashMap<String, mpsc::Sender<T>>>,
    dropped: AtomicU64,
}

impl<T: Clone + Send + 'static> EventBus<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        EventBus {
            name,
            capacity,
            subscribers: RwLock::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a bounded queue for `subscriber_id` and return its receive end.
    ///
    /// Re-subscribing with an existing id replaces the old queue (the old
    /// receiver sees its channel close).
    pub fn subscribe(&self, subscriber_id: &str) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .write()
            .insert(subscriber_id.to_owned(), tx);
        debug!(bus = self.name, subscriber = subscriber_id, "subscribed");
        rx
    }

    /// Drop the subscriber's queue, closing its channel.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        if self.subscribers.write().remove(subscriber_id).is_some() {
            debug!(bus = self.name, subscriber = subscriber_id, "unsubscribed");
        }
    }

    /// Deliver `event` to every subscriber without blocking.
    ///
    /// Full queues drop the event for that subscriber; closed queues
    /// (receiver dropped without unsubscribe) are removed lazily here.
    pub fn publish(&self, event: &T) {
        let mut closed: Vec<String> = Vec::new();
        {
            let subs = self.subscribers.read();
            for (id, tx) in subs.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            bus = self.name,
                            subscriber = id.as_str(),
                            "subscriber queue full, event dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed.push(id.clone());
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut subs = self.subscribers.write();
            for id in closed {
                subs.remove(&id);
            }
        }
    }

    /// Total events dropped across all subscribers since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
