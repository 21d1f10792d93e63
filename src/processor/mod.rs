// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! On-demand batch processors.
//!
//! Callers enqueue write items one at a time; a dedicated worker drains them
//! into groups of at most `throughput` items and submits each group through a
//! write invoker. A failed group is split and every item is resubmitted on its
//! own. Items that still fail are published as [`FailureEvent`]s and never
//! raised to the caller.
//!
//! # Design
//!
//! ```text
//! enqueue() ──▶ unbounded channel ──▶ worker ──▶ pending (FIFO)
//!                                        │
//!            flush() / dispose() ──▶ control
//!                                        │
//!                        take_group(throughput, force)
//!                                        │
//!                                        ▼
//!                         RetryPolicy ──▶ invoker.submit(group)
//!                                        │
//!                          failure? ──▶ per-item submit ──▶ EventBus
//! ```
//!
//! Two flavours share the grouping and bookkeeping here:
//!
//! - [`OnDemandProcessor`]: tokio task, async API
//! - [`BlockingOnDemandProcessor`]: OS thread, blocking API
//!
//! # Grouping
//!
//! With `allow_above_throughput = true` any non-empty buffer is submitted as
//! soon as the worker wakes. With `false` the worker only submits full groups
//! until a flush, a dispose, or cancellation forces the remainder out.

mod blocking;
mod worker;

pub use blocking::BlockingOnDemandProcessor;
pub use worker::{OnDemandProcessor, ProcessorBuilder};

use crate::error::ServiceError;
use crate::events::{EventBus, FailureEvent};
use crate::invoker::KeyedEntity;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::warn;

/// Snapshot of a processor's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub service: String,
    /// Submission attempts issued, groups and single items alike.
    pub request_count: u64,
    /// Items drained from the queue and submitted at least once.
    pub entities_sent: u64,
    /// Items whose submission eventually succeeded.
    pub entities_sent_successfully: u64,
    /// Items enqueued but not yet drained into a group.
    pub queue_len: usize,
}

impl ProcessorStats {
    /// Items that ended up as failure events.
    pub fn entities_failed(&self) -> u64 {
        self.entities_sent.saturating_sub(self.entities_sent_successfully)
    }
}

/// Outcome of submitting one drained group.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GroupResult {
    /// Items in the group.
    pub total: usize,
    /// Items that were accepted.
    pub succeeded: usize,
    /// Items published as failure events.
    pub failed: usize,
    /// Whether the group had to be split into single submissions.
    pub fell_back: bool,
}

impl GroupResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Counters shared between a processor handle and its worker.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    request_count: AtomicU64,
    entities_sent: AtomicU64,
    entities_sent_successfully: AtomicU64,
    queued: AtomicUsize,
}

impl Counters {
    pub(crate) fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueue_rejected(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    /// `n` items left the queue and are about to be submitted.
    pub(crate) fn record_drained(&self, n: usize) {
        self.queued.fetch_sub(n, Ordering::Relaxed);
        self.entities_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self, n: usize) {
        self.entities_sent_successfully
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub(crate) fn entities_sent(&self) -> u64 {
        self.entities_sent.load(Ordering::Relaxed)
    }

    pub(crate) fn entities_sent_successfully(&self) -> u64 {
        self.entities_sent_successfully.load(Ordering::Relaxed)
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self, service: &str) -> ProcessorStats {
        ProcessorStats {
            service: service.to_string(),
            request_count: self.request_count(),
            entities_sent: self.entities_sent(),
            entities_sent_successfully: self.entities_sent_successfully(),
            queue_len: self.queued(),
        }
    }
}

/// Take the next group from `pending`.
///
/// Returns a full group of `throughput` items when enough are buffered.
/// With `force`, a smaller non-empty remainder is returned as well.
pub fn take_group<T>(pending: &mut VecDeque<T>, throughput: usize, force: bool) -> Option<Vec<T>> {
    let throughput = throughput.max(1);
    if pending.len() >= throughput || (force && !pending.is_empty()) {
        let n = pending.len().min(throughput);
        Some(pending.drain(..n).collect())
    } else {
        None
    }
}

/// Publish `item` as a failure and count it.
pub(crate) fn publish_failure<T>(events: &EventBus<T>, service: &str, item: T, error: ServiceError)
where
    T: KeyedEntity + Send + Sync + 'static,
{
    let is_update = item.keys_populated();
    warn!(
        service = %service,
        kind = %error.kind,
        is_update,
        error = %error.message,
        "Item submission failed"
    );
    crate::metrics::record_item_failure(service, error.kind);
    events.publish(FailureEvent {
        payload: item,
        is_update,
        error,
        service: service.to_string(),
    });
}
