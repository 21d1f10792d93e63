//! Blocking paginator: loader thread plus an `Iterator` of items.

use super::{after_page, FetchOptions, FetchState, LoaderMessage, PageEvent, PageOutcome, Step};
use crate::config::PagingConfig;
use crate::error::{EngineError, Result, ServiceError};
use crate::invoker::{BlockingPageInvoker, PageCursor, RecordMapper, ServiceResult, SessionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn};

struct LoaderHandle {
    thread: JoinHandle<()>,
    /// Disconnects when the loader thread returns.
    done: mpsc::Receiver<()>,
}

/// Thread-based twin of [`Paginator`](super::Paginator).
pub struct BlockingPaginator<I: BlockingPageInvoker, T> {
    service: String,
    config: PagingConfig,
    invoker: Arc<I>,
    mapper: Arc<dyn RecordMapper<I::Record, T>>,
    session: Option<SessionId>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    loaders: Mutex<Vec<LoaderHandle>>,
}

impl<I, T> BlockingPaginator<I, T>
where
    I: BlockingPageInvoker,
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
            loaders: Mutex::new(Vec::new()),
        })
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Start a loader thread and return the item iterator.
    pub fn fetch(&self, request: I::Request, options: FetchOptions<T>) -> Result<BlockingPagedFetch<T>> {
        // Held until the loader is tracked so dispose cannot miss it.
        let mut loaders = self.loaders.lock();
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        loaders.retain(|l| !l.thread.is_finished());

        let (tx, rx) = mpsc::channel();
        let cancel = self.cancel.child_token();
        let max_results = options.max();
        let state = FetchState::new(
            &self.service,
            options,
            self.config.default_timeout_duration(),
            self.config.process_batch_size,
        );

        if !state.is_finished() {
            let loader = ThreadLoader {
                service: self.service.clone(),
                config: self.config.clone(),
                max_results,
                invoker: Arc::clone(&self.invoker),
                mapper: Arc::clone(&self.mapper),
                session: self.session,
                cancel: cancel.clone(),
                tx,
            };
            let (done_tx, done) = mpsc::channel::<()>();
            let thread = thread::Builder::new()
                .name(format!("pager-{}", self.service))
                .spawn(move || {
                    let _done = done_tx;
                    loader.run(request);
                })
                .map_err(|e| EngineError::Worker(format!("failed to spawn loader thread: {e}")))?;
            loaders.push(LoaderHandle { thread, done });
        }

        Ok(BlockingPagedFetch { rx, state, cancel })
    }

    /// Reject new fetches, cancel running loaders and join them.
    ///
    /// A loader finishes the page request it is in before it stops. Loaders
    /// still running after `dispose_timeout` are left behind and an error is
    /// returned.
    pub fn dispose(&self) -> Result<()> {
        let loaders = {
            let mut loaders = self.loaders.lock();
            if self.disposed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.cancel.cancel();
            std::mem::take(&mut *loaders)
        };

        let limit = self.config.dispose_timeout_duration();
        let deadline = Instant::now() + limit;
        let mut overran = 0usize;
        for loader in loaders {
            match loader.done.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Err(RecvTimeoutError::Timeout) => overran += 1,
                _ => {
                    if loader.thread.join().is_err() {
                        warn!(service = %self.service, "Loader thread panicked");
                    }
                }
            }
        }

        if overran > 0 {
            warn!(service = %self.service, overran, "Paginator disposed with loaders still running");
            return Err(EngineError::Worker(format!(
                "{overran} loader thread(s) did not stop within {limit:?}"
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

impl<I: BlockingPageInvoker, T> std::fmt::Debug for BlockingPaginator<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPaginator")
            .field("service", &self.service)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

struct ThreadLoader<I: BlockingPageInvoker, T> {
    service: String,
    config: PagingConfig,
    max_results: Option<usize>,
    invoker: Arc<I>,
    mapper: Arc<dyn RecordMapper<I::Record, T>>,
    session: Option<SessionId>,
    cancel: CancellationToken,
    tx: mpsc::Sender<LoaderMessage<T>>,
}

impl<I, T> ThreadLoader<I, T>
where
    I: BlockingPageInvoker,
    T: Send + 'static,
{
    fn run(self, request: I::Request) {
        let _span = info_span!("pager", service = %self.service).entered();
        let mut cursor = PageCursor::first();
        let mut total_loaded = 0usize;

        while !self.cancel.is_cancelled() {
            let page = cursor.page;
            let started = Instant::now();

            let response = match self.invoker.fetch_page(self.session, &request, &cursor) {
                Ok(response) => response,
                Err(error) => return self.fail(page, total_loaded, cursor.total_pages, error),
            };
            cursor.advance(&response);

            let decoded = response
                .records
                .into_iter()
                .map(|r| self.mapper.map(r))
                .collect::<ServiceResult<Vec<T>>>();
            let items = match decoded {
                Ok(items) => items,
                Err(error) => return self.fail(page, total_loaded, cursor.total_pages, error),
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
            if self.tx.send(LoaderMessage::Processed(event)).is_err() || outcome != PageOutcome::More {
                debug!(page, total_loaded, ?outcome, "Loader finished");
                return;
            }
        }
        debug!("Loader cancelled");
    }

    fn fail(&self, page: u32, total_loaded: usize, total_pages: Option<u32>, error: ServiceError) {
        let _ = self.tx.send(LoaderMessage::Failed(PageEvent {
            page,
            items_in_page: 0,
            total_loaded,
            total_pages,
            error: Some(error),
        }));
    }
}

/// Blocking item iterator of one paged fetch.
///
/// Yields `Err` at most once (loader failure or timeout) and then ends.
/// Dropping it stops the loader after its current page.
pub struct BlockingPagedFetch<T> {
    rx: mpsc::Receiver<LoaderMessage<T>>,
    state: FetchState<T>,
    cancel: CancellationToken,
}

impl<T: Clone> BlockingPagedFetch<T> {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drain the iterator, stopping at the first error.
    pub fn collect_all(self) -> Result<Vec<T>> {
        self.collect()
    }
}

impl<T: Clone> Iterator for BlockingPagedFetch<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state.is_finished() {
            return None;
        }
        loop {
            let message = match self.rx.recv_timeout(self.state.remaining()) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    self.cancel.cancel();
                    return Some(Err(self.state.timed_out()));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.state.finish();
                    return None;
                }
            };
            match self.state.handle(message) {
                Step::Continue => {}
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
            }
        }
    }
}

impl<T> Drop for BlockingPagedFetch<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
