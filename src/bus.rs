//! Ordered fan-out of [`Event`]s to independent subscribers.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel. Every subscriber
//! reads through its own cursor into a ring of `capacity` events, which gives
//! the delivery guarantees the supervisor relies on:
//!
//! - publishing never blocks and never fails, even with no subscribers;
//! - each subscriber sees events in publish order;
//! - a subscriber that falls more than `capacity` events behind loses the
//!   *oldest* events it has not read yet, and only its own; the loss is
//!   counted and logged by [`Subscription`].
//!
//! When every [`EventBus`] clone is dropped, subscribers drain what is still
//! buffered for them and then see the end of the stream.

use crate::event::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Producer side of the event stream.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new bus holding at most `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Errors are ignored if there are no active subscribers.
    pub fn publish(&self, event: Event) {
        tracing::trace!(kind = %event.kind, "Publishing event");
        let _ = self.tx.send(event);
    }

    /// Registers a new subscriber. It only sees events published afterwards.
    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        Subscription {
            name: name.into(),
            rx: self.tx.subscribe(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Consumer side of the event stream for one subscriber.
pub struct Subscription {
    name: String,
    rx: broadcast::Receiver<Event>,
    dropped: AtomicU64,
}

impl Subscription {
    /// Receives the next event, or `None` once the bus is gone and drained.
    ///
    /// Events lost to backpressure are counted and skipped; this never
    /// reports them as an error.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let total = self.dropped.fetch_add(skipped, Ordering::Relaxed) + skipped;
                    tracing::warn!(
                        subscriber = %self.name,
                        skipped,
                        total_dropped = total,
                        "Subscriber fell behind, oldest events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of events dropped for this subscriber so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
