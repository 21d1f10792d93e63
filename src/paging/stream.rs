// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async paginator: loader task plus a lazily consumed sequence.

use super::{after_page, FetchOptions, FetchState, LoaderMessage, PageEvent, PageOutcome, Step};
use crate::config::PagingConfig;
use crate::error::{EngineError, Result};
use crate::invoker::{PageCursor, PageInvoker, RecordMapper, SessionId};
use futures::Stream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

/// Runs paged fetches against one service.
pub struct Paginator<I: PageInvoker, T> {
    service: String,
    config: PagingConfig,
    invoker: Arc<I>,
    mapper: Arc<dyn RecordMapper<I::Record, T>>,
    session: Option<SessionId>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    loaders: TaskTracker,
    /// Orders `fetch` against `dispose` so no loader escapes the tracker.
    intake: Mutex<()>,
}

impl<I, T> Paginator<I, T>
where
    I: PageInvoker,
    T: Clone + Send + 'static,
{
    pub fn new(
        service: impl Into<String>,
        config: PagingConfig,
        invoker: Arc<I>,
        mapper: impl RecordMapper<I::Record, T>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            service: service.into(),
            config,
            invoker,
            mapper: Arc::new(mapper),
            session: None,
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            loaders: TaskTracker::new(),
            intake: Mutex::new(()),
        })
    }

    /// Use this session for every page request.
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Start loading pages in the background and return the item sequence.
    ///
    /// Must be called inside a tokio runtime.
    pub fn fetch(&self, request: I::Request, options: FetchOptions<T>) -> Result<PagedFetch<T>> {
        let _intake = self.intake.lock();
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let loader = Loader {
            service: self.service.clone(),
            config: self.config.clone(),
            max_results: options.max(),
            invoker: Arc::clone(&self.invoker),
            mapper: Arc::clone(&self.mapper),
            session: self.session,
            cancel: cancel.clone(),
            tx,
        };
        let state = FetchState::new(
            &self.service,
            options,
            self.config.default_timeout_duration(),
            self.config.process_batch_size,
        );

        let deadline = tokio::time::Instant::now() + state.timeout();
        if !state.is_finished() {
            self.loaders.spawn(loader.run(request));
        }

        Ok(PagedFetch {
            rx,
            state,
            cancel,
            deadline,
        })
    }

    /// Reject new fetches, cancel the running ones and wait for their loaders.
    ///
    /// A loader finishes the page request it is in before it stops. If the
    /// loaders overrun `dispose_timeout` they are left to wind down on their
    /// own and `EngineError::Worker` is returned.
    pub async fn dispose(&self) -> Result<()> {
        {
            let _intake = self.intake.lock();
            if self.disposed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.cancel.cancel();
            self.loaders.close();
        }

        let limit = self.config.dispose_timeout_duration();
        if tokio::time::timeout(limit, self.loaders.wait()).await.is_err() {
            warn!(service = %self.service, running = self.loaders.len(), "Paginator disposed with loaders still running");
            return Err(EngineError::Worker(format!(
                "paginator loaders did not stop within {limit:?}"
            )));
        }
        debug!(service = %self.service, "Paginator disposed");
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &PagingConfig {
        &self.config
    }
}

impl<I: PageInvoker, T> std::fmt::Debug for Paginator<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("service", &self.service)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

struct Loader<I: PageInvoker, T> {
    service: String,
    config: PagingConfig,
    max_results: Option<usize>,
    invoker: Arc<I>,
    mapper: Arc<dyn RecordMapper<I::Record, T>>,
    session: Option<SessionId>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<LoaderMessage<T>>,
}

impl<I, T> Loader<I, T>
where
    I: PageInvoker,
    T: Send + 'static,
{
    #[instrument(skip_all, fields(service = %self.service))]
    async fn run(self, request: I::Request) {
        let mut cursor = PageCursor::first();
        let mut total_loaded = 0usize;

        while !self.cancel.is_cancelled() {
            let page = cursor.page;
            let started = Instant::now();

            let response = match self.invoker.fetch_page(self.session, &request, &cursor).await {
                Ok(response) => response,
                Err(error) => {
                    self.fail(page, total_loaded, cursor.total_pages, error);
                    return;
                }
            };
            cursor.advance(&response);

            let items = match response
                .records
                .into_iter()
                .map(|record| self.mapper.map(record))
                .collect::<std::result::Result<Vec<T>, _>>()
            {
                Ok(items) => items,
                Err(error) => {
                    self.fail(page, total_loaded, cursor.total_pages, error);
                    return;
                }
            };

            total_loaded += items.len();
            let event = PageEvent {
                page,
                items_in_page: items.len(),
                total_loaded,
                total_pages: cursor.total_pages,
                error: None,
            };
            crate::metrics::record_page_loaded(&self.service, items.len(), started.elapsed());

            if self.tx.send(LoaderMessage::Loaded(event.clone())).is_err() {
                return;
            }
            for item in items {
                if self.tx.send(LoaderMessage::Item(item)).is_err() {
                    return;
                }
            }
            let outcome = after_page(&self.config, self.max_results, &event);
            if self.tx.send(LoaderMessage::Processed(event)).is_err() {
                return;
            }

            if outcome != PageOutcome::More {
                debug!(service = %self.service, page, total_loaded, ?outcome, "Loader finished");
                return;
            }
        }
        debug!(service = %self.service, "Loader cancelled");
    }

    fn fail(&self, page: u32, total_loaded: usize, total_pages: Option<u32>, error: crate::error::ServiceError) {
        let _ = self.tx.send(LoaderMessage::Failed(PageEvent {
            page,
            items_in_page: 0,
            total_loaded,
            total_pages,
            error: Some(error),
        }));
    }
}

/// Lazy, cancellable item sequence of one paged fetch.
///
/// Dropping it cancels the loader.
pub struct PagedFetch<T> {
    rx: mpsc::UnboundedReceiver<LoaderMessage<T>>,
    state: FetchState<T>,
    cancel: CancellationToken,
    deadline: tokio::time::Instant,
}

impl<T: Clone + Send + 'static> PagedFetch<T> {
    /// Next item, `None` when the fetch is over.
    ///
    /// Errors (`PagedRequest`, `Timeout`) are returned once, after which the
    /// sequence ends.
    pub async fn next(&mut self) -> Option<Result<T>> {
        if self.state.is_finished() {
            return None;
        }
        loop {
            match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
                Err(_) => {
                    self.cancel.cancel();
                    return Some(Err(self.state.timed_out()));
                }
                Ok(None) => {
                    self.state.finish();
                    return None;
                }
                Ok(Some(message)) => match self.state.handle(message) {
                    Step::Continue => continue,
                    Step::Yield(item) => {
                        if self.state.is_finished() {
                            self.cancel.cancel();
                        }
                        return Some(Ok(item));
                    }
                    Step::Fail(error) => {
                        self.cancel.cancel();
                        return Some(Err(error));
                    }
                },
            }
        }
    }

    /// Drain the whole sequence, stopping at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send {
        futures::stream::unfold(self, |mut fetch| async move {
            fetch.next().await.map(|item| (item, fetch))
        })
    }

    /// Stop the loader after its current page.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T> Drop for PagedFetch<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
