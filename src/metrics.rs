//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Group and per-item submissions
//! - Retries by error kind
//! - Page loads, paging failures and timeouts
//! - Live registry instances
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `request_engine_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! The crate never installs a recorder; without one every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use request_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_group_submission("Sales.save", 10, true, Duration::from_millis(40));
//! metrics::record_page_loaded("Partner.load", 150, Duration::from_millis(120));
//! ```

use crate::error::ErrorKind;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one submission attempt of a group (or a single fallback item).
pub fn record_group_submission(service: &str, size: usize, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("request_engine_submissions_total", "service" => service.to_string(), "status" => status)
        .increment(1);
    histogram!("request_engine_submission_size", "service" => service.to_string()).record(size as f64);
    histogram!("request_engine_submission_duration_seconds", "service" => service.to_string())
        .record(duration.as_secs_f64());
}

/// Record a group that failed and was split into per-item submissions.
pub fn record_group_fallback(service: &str, size: usize) {
    counter!("request_engine_group_fallbacks_total", "service" => service.to_string()).increment(1);
    counter!("request_engine_fallback_items_total", "service" => service.to_string())
        .increment(size as u64);
}

/// Record an item that ultimately failed and was published as an event.
pub fn record_item_failure(service: &str, kind: ErrorKind) {
    counter!("request_engine_item_failures_total", "service" => service.to_string(), "kind" => kind.as_str())
        .increment(1);
}

/// Record a retry granted by the policy.
pub fn record_retry(kind: ErrorKind) {
    counter!("request_engine_retries_total", "kind" => kind.as_str()).increment(1);
}

/// Record current queue depth of a processor.
pub fn set_queue_depth(service: &str, depth: usize) {
    gauge!("request_engine_queue_depth", "service" => service.to_string()).set(depth as f64);
}

/// Record a page fetched and decoded.
pub fn record_page_loaded(service: &str, items: usize, duration: Duration) {
    counter!("request_engine_pages_loaded_total", "service" => service.to_string()).increment(1);
    counter!("request_engine_page_items_total", "service" => service.to_string())
        .increment(items as u64);
    histogram!("request_engine_page_fetch_duration_seconds", "service" => service.to_string())
        .record(duration.as_secs_f64());
}

/// Record a paged fetch that failed at the loader.
pub fn record_paging_failure(service: &str, kind: ErrorKind) {
    counter!("request_engine_paging_failures_total", "service" => service.to_string(), "kind" => kind.as_str())
        .increment(1);
}

/// Record a paged fetch that exceeded its timeout.
pub fn record_paging_timeout(service: &str) {
    counter!("request_engine_paging_timeouts_total", "service" => service.to_string()).increment(1);
}

/// Record the number of instances tracked by a registry.
pub fn set_registry_instances(count: usize) {
    gauge!("request_engine_registry_instances").set(count as f64);
}
