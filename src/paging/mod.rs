// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paginated retrieval.
//!
//! A fetch runs a background loader that requests pages 1, 2, 3, ... in
//! order, decodes every record and pushes the entities onto a channel. The
//! caller consumes them lazily as a sequence, either async ([`PagedFetch`],
//! also a `Stream`) or blocking ([`BlockingPagedFetch`], an `Iterator`).
//!
//! # Design
//!
//! ```text
//!            ┌──────────── loader (task / thread) ────────────┐
//!            │ fetch_page(cursor) ─▶ map records ─▶ advance   │
//!            └───────┬────────────────────────────────────────┘
//!                    │ Loaded(event), Item(T)..., Processed(event)
//!                    │ or Failed(page, error)
//!                    ▼
//!            consumer (caller side)
//!              ├─ on_page_loaded / on_page_processed / on_page_error
//!              ├─ process(sub-batch of process_batch_size)
//!              └─ yields T, tracks timeout and max_results
//! ```
//!
//! # Termination
//!
//! The loader stops after a page when any of these holds:
//!
//! | Condition | Example |
//! |-----------|---------|
//! | `max_results` items loaded | `max_results = 200`, two pages of 150 |
//! | last known page reached | server reported 4 pages, page 4 loaded |
//! | short page | 87 records, full pages are 150 or 300 |
//!
//! Cancellation (timeout, `max_results`, consumer dropped, paginator
//! disposed) takes effect between pages. An in-flight request finishes first.

mod blocking;
mod stream;

pub use blocking::{BlockingPagedFetch, BlockingPaginator};
pub use stream::{PagedFetch, Paginator};

use crate::config::PagingConfig;
use crate::error::{EngineError, ServiceError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Progress record handed to paging callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct PageEvent {
    /// 1-based page number.
    pub page: u32,
    /// Items decoded from this page.
    pub items_in_page: usize,
    /// Items decoded so far, this page included.
    pub total_loaded: usize,
    /// Page count reported by the server, if any.
    pub total_pages: Option<u32>,
    pub error: Option<ServiceError>,
}

impl PageEvent {
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// True once the last known page has been reached.
    pub fn is_complete(&self) -> bool {
        self.total_pages.is_some_and(|total| self.page >= total)
    }

    /// Percent of known pages loaded. `None` without a usable page count.
    pub fn progress_percentage(&self) -> Option<f64> {
        match self.total_pages {
            Some(total) if total > 0 => Some(f64::from(self.page) / f64::from(total) * 100.0),
            _ => None,
        }
    }
}

impl std::fmt::Display for PageEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.error, self.total_pages) {
            (Some(e), _) => write!(f, "page {} failed: {}", self.page, e),
            (None, Some(total)) => write!(
                f,
                "page {}/{}: {} items ({} total)",
                self.page, total, self.items_in_page, self.total_loaded
            ),
            (None, None) => write!(
                f,
                "page {}: {} items ({} total)",
                self.page, self.items_in_page, self.total_loaded
            ),
        }
    }
}

pub type PageCallback = Box<dyn FnMut(&PageEvent) + Send>;
pub type ProcessSink<T> = Box<dyn FnMut(Vec<T>) + Send>;

/// Per-fetch options.
///
/// ```rust
/// use request_engine::paging::FetchOptions;
/// use std::time::Duration;
///
/// let options: FetchOptions<u32> = FetchOptions::new()
///     .timeout(Duration::from_secs(60))
///     .max_results(1_000)
///     .on_page_loaded(|e| println!("{e}"))
///     .process(|batch| println!("{} items", batch.len()));
/// ```
pub struct FetchOptions<T> {
    timeout: Option<Duration>,
    max_results: Option<usize>,
    on_page_loaded: Option<PageCallback>,
    on_page_processed: Option<PageCallback>,
    on_page_error: Option<PageCallback>,
    process: Option<ProcessSink<T>>,
}

impl<T> Default for FetchOptions<T> {
    fn default() -> Self {
        Self {
            timeout: None,
            max_results: None,
            on_page_loaded: None,
            on_page_processed: None,
            on_page_error: None,
            process: None,
        }
    }
}

impl<T> FetchOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `PagingConfig::default_timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Stop after this many items.
    pub fn max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn on_page_loaded(mut self, f: impl FnMut(&PageEvent) + Send + 'static) -> Self {
        self.on_page_loaded = Some(Box::new(f));
        self
    }

    pub fn on_page_processed(mut self, f: impl FnMut(&PageEvent) + Send + 'static) -> Self {
        self.on_page_processed = Some(Box::new(f));
        self
    }

    pub fn on_page_error(mut self, f: impl FnMut(&PageEvent) + Send + 'static) -> Self {
        self.on_page_error = Some(Box::new(f));
        self
    }

    /// Receive items in sub-batches as they are consumed.
    pub fn process(mut self, f: impl FnMut(Vec<T>) + Send + 'static) -> Self {
        self.process = Some(Box::new(f));
        self
    }

    pub(crate) fn max(&self) -> Option<usize> {
        self.max_results
    }
}

impl<T> std::fmt::Debug for FetchOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchOptions")
            .field("timeout", &self.timeout)
            .field("max_results", &self.max_results)
            .field("process", &self.process.is_some())
            .finish()
    }
}

/// Loader to consumer messages, in channel order.
pub(crate) enum LoaderMessage<T> {
    Loaded(PageEvent),
    Item(T),
    Processed(PageEvent),
    Failed(PageEvent),
}

/// What the loader does after a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageOutcome {
    More,
    MaxResults,
    LastPage,
    ShortPage,
}

/// Termination check run by the loader after each page.
pub(crate) fn after_page(
    config: &PagingConfig,
    max_results: Option<usize>,
    event: &PageEvent,
) -> PageOutcome {
    if max_results.is_some_and(|max| event.total_loaded >= max) {
        PageOutcome::MaxResults
    } else if event.is_complete() {
        PageOutcome::LastPage
    } else if !config.is_full_page(event.items_in_page) {
        PageOutcome::ShortPage
    } else {
        PageOutcome::More
    }
}

/// Result of feeding one message to the consumer.
pub(crate) enum Step<T> {
    Continue,
    Yield(T),
    Fail(EngineError),
}

/// Consumer-side bookkeeping shared by the async and blocking sequences.
pub(crate) struct FetchState<T> {
    service: String,
    options: FetchOptions<T>,
    batch: Vec<T>,
    batch_size: usize,
    yielded: usize,
    started: Instant,
    timeout: Duration,
    finished: bool,
}

impl<T: Clone> FetchState<T> {
    pub(crate) fn new(service: &str, options: FetchOptions<T>, default_timeout: Duration, batch_size: usize) -> Self {
        let timeout = options.timeout.unwrap_or(default_timeout);
        let finished = options.max_results == Some(0);
        Self {
            service: service.to_string(),
            options,
            batch: Vec::new(),
            batch_size: batch_size.max(1),
            yielded: 0,
            started: Instant::now(),
            timeout,
            finished,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left before the fetch times out.
    pub(crate) fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub(crate) fn handle(&mut self, message: LoaderMessage<T>) -> Step<T> {
        match message {
            LoaderMessage::Loaded(event) => {
                debug!(service = %self.service, page = event.page, items = event.items_in_page, "Page loaded");
                dispatch(&mut self.options.on_page_loaded, &event);
                Step::Continue
            }
            LoaderMessage::Processed(event) => {
                dispatch(&mut self.options.on_page_processed, &event);
                Step::Continue
            }
            LoaderMessage::Item(item) => {
                if self.options.process.is_some() {
                    self.batch.push(item.clone());
                    if self.batch.len() >= self.batch_size {
                        self.flush_batch();
                    }
                }
                self.yielded += 1;
                if self.options.max_results.is_some_and(|max| self.yielded >= max) {
                    self.finish();
                }
                Step::Yield(item)
            }
            LoaderMessage::Failed(event) => {
                dispatch(&mut self.options.on_page_error, &event);
                self.flush_batch();
                self.finished = true;
                let source = event
                    .error
                    .unwrap_or_else(|| ServiceError::unexpected("page failed without an error"));
                crate::metrics::record_paging_failure(&self.service, source.kind);
                error!(service = %self.service, page = event.page, error = %source, "Paged request failed");
                Step::Fail(EngineError::PagedRequest {
                    page: event.page,
                    source,
                })
            }
        }
    }

    /// The loader is gone and every message has been consumed.
    pub(crate) fn finish(&mut self) {
        if self.finished && self.batch.is_empty() {
            return;
        }
        self.flush_batch();
        self.finished = true;
        info!(service = %self.service, items = self.yielded, "Paged fetch complete");
    }

    pub(crate) fn timed_out(&mut self) -> EngineError {
        self.flush_batch();
        self.finished = true;
        crate::metrics::record_paging_timeout(&self.service);
        let elapsed = self.started.elapsed();
        error!(service = %self.service, elapsed_ms = elapsed.as_millis() as u64, "Paged fetch timed out");
        EngineError::Timeout {
            elapsed,
            limit: self.timeout,
        }
    }

    fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        if let Some(process) = self.options.process.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| process(batch))).is_err() {
                error!(service = %self.service, "Process sink panicked");
            }
        }
    }
}

fn dispatch(callback: &mut Option<PageCallback>, event: &PageEvent) {
    if let Some(cb) = callback.as_mut() {
        if catch_unwind(AssertUnwindSafe(|| cb(event))).is_err() {
            error!(page = event.page, "Page callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn event(page: u32, items: usize, total: usize, pages: Option<u32>) -> PageEvent {
        PageEvent {
            page,
            items_in_page: items,
            total_loaded: total,
            total_pages: pages,
            error: None,
        }
    }

    #[test]
    fn test_page_event_progress() {
        let e = event(2, 150, 300, Some(4));
        assert_eq!(e.progress_percentage(), Some(50.0));
        assert!(!e.is_complete());
        assert!(event(4, 10, 460, Some(4)).is_complete());
        assert_eq!(event(1, 150, 150, None).progress_percentage(), None);
        assert_eq!(event(1, 0, 0, Some(0)).progress_percentage(), None);
        assert!(!event(1, 150, 150, None).is_complete());
    }

    #[test]
    fn test_page_event_display() {
        assert_eq!(event(1, 150, 150, Some(3)).to_string(), "page 1/3: 150 items (150 total)");
        let mut failed = event(2, 0, 150, None);
        failed.error = Some(ServiceError::network("reset"));
        assert!(failed.has_error());
        assert!(failed.to_string().contains("page 2 failed"));
    }

    #[test]
    fn test_after_page_conditions() {
        let sizes = PagingConfig::default();
        assert_eq!(after_page(&sizes, None, &event(1, 150, 150, None)), PageOutcome::More);
        assert_eq!(after_page(&sizes, None, &event(1, 300, 300, None)), PageOutcome::More);
        assert_eq!(after_page(&sizes, None, &event(2, 87, 237, None)), PageOutcome::ShortPage);
        assert_eq!(after_page(&sizes, None, &event(3, 150, 450, Some(3))), PageOutcome::LastPage);
        assert_eq!(after_page(&sizes, Some(200), &event(2, 150, 300, None)), PageOutcome::MaxResults);
        assert_eq!(after_page(&sizes, None, &event(1, 0, 0, None)), PageOutcome::ShortPage);
    }

    #[test]
    fn test_state_batches_and_max_results() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let options = FetchOptions::new()
            .max_results(5)
            .process(move |b: Vec<u32>| sink.lock().push(b));
        let mut state = FetchState::new("svc", options, Duration::from_secs(1), 2);

        let mut yielded = Vec::new();
        for i in 0..10 {
            if state.is_finished() {
                break;
            }
            if let Step::Yield(v) = state.handle(LoaderMessage::Item(i)) {
                yielded.push(v);
            }
        }

        assert_eq!(yielded, vec![0, 1, 2, 3, 4]);
        assert_eq!(*batches.lock(), vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn test_state_failure_flushes_and_reports_page() {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let errs = Arc::clone(&errors);
        let options = FetchOptions::new()
            .process(move |b: Vec<u32>| sink.lock().push(b))
            .on_page_error(move |e| errs.lock().push(e.page));
        let mut state = FetchState::new("svc", options, Duration::from_secs(1), 50);

        let _ = state.handle(LoaderMessage::Item(1));
        let mut failed = event(2, 0, 1, None);
        failed.error = Some(ServiceError::authorization("expired"));

        match state.handle(LoaderMessage::Failed(failed)) {
            Step::Fail(EngineError::PagedRequest { page, source }) => {
                assert_eq!(page, 2);
                assert_eq!(source.kind, crate::error::ErrorKind::Authorization);
            }
            _ => panic!("expected a paged request failure"),
        }
        assert!(state.is_finished());
        assert_eq!(*batches.lock(), vec![vec![1]]);
        assert_eq!(*errors.lock(), vec![2]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let options: FetchOptions<u32> = FetchOptions::new().on_page_loaded(|_| panic!("boom"));
        let mut state = FetchState::new("svc", options, Duration::from_secs(1), 50);
        assert!(matches!(
            state.handle(LoaderMessage::Loaded(event(1, 150, 150, None))),
            Step::Continue
        ));
    }

    #[test]
    fn test_timeout_error_carries_limit() {
        let options: FetchOptions<u32> = FetchOptions::new().timeout(Duration::from_millis(10));
        let mut state = FetchState::new("svc", options, Duration::from_secs(60), 50);
        assert_eq!(state.timeout(), Duration::from_millis(10));
        match state.timed_out() {
            EngineError::Timeout { limit, .. } => assert_eq!(limit, Duration::from_millis(10)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(state.is_finished());
    }

    #[test]
    fn test_zero_max_results_finishes_immediately() {
        let options: FetchOptions<u32> = FetchOptions::new().max_results(0);
        let state = FetchState::new("svc", options, Duration::from_secs(1), 50);
        assert!(state.is_finished());
    }
}
