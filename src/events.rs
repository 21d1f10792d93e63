//! Failure events published by batch processors.
//!
//! Items that cannot be submitted never surface as errors to the caller that
//! enqueued them. Instead the worker publishes a [`FailureEvent`] on an
//! [`EventBus`], which fans out to:
//!
//! - callback subscribers, run inline on the publishing worker (panics are
//!   caught and logged)
//! - channel subscribers, which receive a shared `Arc` of the event
//!   (receivers that were dropped are pruned on the next publish)
//!
//! Publishing is fire-and-forget: nothing a subscriber does can fail the
//! worker.

use crate::error::ServiceError;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, trace};

/// An item that failed to submit.
#[derive(Debug, Clone)]
pub struct FailureEvent<T> {
    /// The payload handed to `enqueue`.
    pub payload: T,
    /// Guess from the entity's key fields. Diagnostic only.
    pub is_update: bool,
    /// The error that ended the last attempt.
    pub error: ServiceError,
    /// Service label of the processor that owned the item.
    pub service: String,
}

impl<T> FailureEvent<T> {
    /// `"update"` or `"create"`.
    pub fn operation_type(&self) -> &'static str {
        if self.is_update {
            "update"
        } else {
            "create"
        }
    }
}

/// Identifies a callback subscription for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<T> = Arc<dyn Fn(&FailureEvent<T>) + Send + Sync>;

/// Fan-out of failure events to subscribers.
pub struct EventBus<T> {
    callbacks: RwLock<Vec<(SubscriptionId, Callback<T>)>>,
    channels: Mutex<Vec<mpsc::UnboundedSender<Arc<FailureEvent<T>>>>>,
    next_id: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> std::fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("callbacks", &self.callbacks.read().len())
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}

impl<T: Send + Sync + 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It runs on the worker that publishes.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&FailureEvent<T>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    /// Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(sub, _)| *sub != id);
        callbacks.len() != before
    }

    /// Receive every future event on an unbounded channel.
    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<Arc<FailureEvent<T>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().push(tx);
        rx
    }

    /// Number of live subscribers of both kinds.
    pub fn subscriber_count(&self) -> usize {
        let channels = self.channels.lock().iter().filter(|tx| !tx.is_closed()).count();
        self.callbacks.read().len() + channels
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Drop every subscriber.
    pub fn clear(&self) {
        self.callbacks.write().clear();
        self.channels.lock().clear();
    }

    pub fn publish(&self, event: FailureEvent<T>) {
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback<T>> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(service = %event.service, "Failure event subscriber panicked");
            }
        }

        let mut channels = self.channels.lock();
        if channels.is_empty() {
            return;
        }
        let shared = Arc::new(event);
        channels.retain(|tx| tx.send(Arc::clone(&shared)).is_ok());
        trace!(subscribers = channels.len(), "Failure event delivered to channels");
    }
}
