// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Blocking on-demand processor backed by an OS thread.
//!
//! Items, flush requests and the stop signal travel on one ordered channel, so
//! a flush always sees every item enqueued before it. The worker polls with
//! `recv_timeout(poll_interval)` and checks the cancellation token between
//! messages.

use super::{publish_failure, take_group, Counters, GroupResult, ProcessorStats};
use crate::config::ProcessorConfig;
use crate::error::{EngineError, Result, ServiceError};
use crate::events::EventBus;
use crate::invoker::{BlockingWriteInvoker, KeyedEntity, SessionId, SessionProvider};
use crate::resilience::RetryPolicy;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Message<T> {
    Item(T),
    Flush(mpsc::Sender<()>),
    Stop,
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    /// Disconnects when the worker thread returns.
    done: mpsc::Receiver<()>,
}

/// Thread-based twin of [`OnDemandProcessor`](super::OnDemandProcessor).
pub struct BlockingOnDemandProcessor<T, I> {
    config: ProcessorConfig,
    tx: mpsc::Sender<Message<T>>,
    /// `false` once the worker has started its final drain.
    intake: Arc<RwLock<bool>>,
    counters: Arc<Counters>,
    disposed: AtomicBool,
    worker: Mutex<Option<WorkerHandle>>,
    session: Mutex<Option<(SessionId, Arc<dyn SessionProvider>)>>,
    _invoker: PhantomData<fn() -> I>,
}

impl<T, I> BlockingOnDemandProcessor<T, I>
where
    T: KeyedEntity + Send + Sync + 'static,
    I: BlockingWriteInvoker<T>,
{
    pub fn spawn(config: ProcessorConfig, invoker: Arc<I>, events: Arc<EventBus<T>>) -> Result<Self> {
        Self::spawn_with(config, invoker, events, RetryPolicy::default(), None, None)
    }

    /// Spawn with every optional collaborator spelled out.
    pub fn spawn_with(
        config: ProcessorConfig,
        invoker: Arc<I>,
        events: Arc<EventBus<T>>,
        retry: RetryPolicy,
        cancel: Option<CancellationToken>,
        sessions: Option<Arc<dyn SessionProvider>>,
    ) -> Result<Self> {
        config.validate()?;

        let session = match &sessions {
            Some(provider) => Some(provider.acquire()?),
            None => None,
        };

        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let counters = Arc::new(Counters::default());
        let intake = Arc::new(RwLock::new(true));

        let worker = Worker {
            config: config.clone(),
            invoker,
            events,
            retry,
            counters: Arc::clone(&counters),
            session,
            rx,
            intake: Arc::clone(&intake),
            cancel: cancel.unwrap_or_else(CancellationToken::new),
            pending: VecDeque::new(),
            flush_waiters: Vec::new(),
        };

        let thread = std::thread::Builder::new()
            .name(format!("processor-{}", config.service))
            .spawn(move || {
                let _done = done_tx;
                worker.run();
            })
            .map_err(|e| EngineError::Worker(format!("failed to start processor thread: {e}")))?;

        debug!(service = %config.service, throughput = config.throughput, "Blocking processor started");

        Ok(Self {
            config,
            tx,
            intake,
            counters,
            disposed: AtomicBool::new(false),
            worker: Mutex::new(Some(WorkerHandle { thread, done: done_rx })),
            session: Mutex::new(session.zip(sessions)),
            _invoker: PhantomData,
        })
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        // The read guard spans the send, so the worker's final drain sees it.
        let open = self.intake.read();
        if !*open || self.disposed.load(Ordering::SeqCst) {
            return Err(EngineError::Disposed);
        }
        self.counters.record_enqueued();
        if self.tx.send(Message::Item(item)).is_err() {
            self.counters.record_enqueue_rejected();
            return Err(EngineError::Disposed);
        }
        Ok(())
    }

    /// Block until everything enqueued before this call has been submitted.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        {
            let open = self.intake.read();
            if !*open || self.disposed.load(Ordering::SeqCst) {
                return;
            }
            if self.tx.send(Message::Flush(ack_tx)).is_err() {
                return;
            }
        }
        let _ = ack_rx.recv();
    }

    /// Stop intake, submit what is left and join the worker.
    ///
    /// If the worker overruns `dispose_timeout` it is left to finish on its
    /// own and an error is returned.
    pub fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);

        let mut worker = self.worker.lock();
        let Some(handle) = worker.take() else {
            return Ok(());
        };
        let _ = self.tx.send(Message::Stop);

        let limit = self.config.dispose_timeout_duration();
        let outcome = match handle.done.recv_timeout(limit) {
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Worker(format!(
                "processor thread did not stop within {limit:?}"
            ))),
            _ => handle
                .thread
                .join()
                .map_err(|_| EngineError::Worker("processor thread panicked".into())),
        };
        drop(worker);

        if let Some((session, provider)) = self.session.lock().take() {
            provider.release(session);
        }

        let stats = self.stats();
        match &outcome {
            Ok(()) => info!(
                service = %stats.service,
                requests = stats.request_count,
                sent = stats.entities_sent,
                succeeded = stats.entities_sent_successfully,
                "Processor disposed"
            ),
            Err(e) => warn!(service = %stats.service, error = %e, "Processor disposed uncleanly"),
        }
        outcome
    }

    pub fn service(&self) -> &str {
        &self.config.service
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// True after `dispose` or once the worker stopped on cancellation.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst) || !*self.intake.read()
    }

    pub fn request_count(&self) -> u64 {
        self.counters.request_count()
    }

    pub fn entities_sent(&self) -> u64 {
        self.counters.entities_sent()
    }

    pub fn entities_sent_successfully(&self) -> u64 {
        self.counters.entities_sent_successfully()
    }

    pub fn queue_len(&self) -> usize {
        self.counters.queued()
    }

    pub fn stats(&self) -> ProcessorStats {
        self.counters.snapshot(&self.config.service)
    }
}

impl<T, I> std::fmt::Debug for BlockingOnDemandProcessor<T, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingOnDemandProcessor")
            .field("service", &self.config.service)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Worker<T, I> {
    config: ProcessorConfig,
    invoker: Arc<I>,
    events: Arc<EventBus<T>>,
    retry: RetryPolicy,
    counters: Arc<Counters>,
    session: Option<SessionId>,
    rx: mpsc::Receiver<Message<T>>,
    intake: Arc<RwLock<bool>>,
    cancel: CancellationToken,
    pending: VecDeque<T>,
    flush_waiters: Vec<mpsc::Sender<()>>,
}

impl<T, I> Worker<T, I>
where
    T: KeyedEntity + Send + Sync + 'static,
    I: BlockingWriteInvoker<T>,
{
    fn run(mut self) {
        let span = tracing::info_span!("processor_worker", service = %self.config.service);
        let _enter = span.enter();

        let poll = self.config.poll_interval_duration();
        let wake_interval = self.config.wake_interval_duration();
        let mut last_wake = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.rx.recv_timeout(poll) {
                Ok(message) => {
                    if self.handle(message) == Flow::Stop || self.drain_channel() == Flow::Stop {
                        break;
                    }
                    self.submit_ready(false);
                    last_wake = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_wake.elapsed() >= wake_interval {
                        self.submit_ready(false);
                        last_wake = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, message: Message<T>) -> Flow {
        match message {
            Message::Item(item) => {
                self.pending.push_back(item);
                Flow::Continue
            }
            Message::Flush(ack) => {
                self.submit_ready(true);
                let _ = ack.send(());
                Flow::Continue
            }
            Message::Stop => Flow::Stop,
        }
    }

    fn drain_channel(&mut self) -> Flow {
        loop {
            match self.rx.try_recv() {
                Ok(message) => {
                    if self.handle(message) == Flow::Stop {
                        return Flow::Stop;
                    }
                }
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => return Flow::Stop,
            }
        }
    }

    fn shutdown(&mut self) {
        // Close intake first; no send can land after the drain below.
        *self.intake.write() = false;

        // Keep reading past Stop: items that raced it are still submitted.
        while let Ok(message) = self.rx.try_recv() {
            match message {
                Message::Item(item) => self.pending.push_back(item),
                Message::Flush(ack) => self.flush_waiters.push(ack),
                Message::Stop => {}
            }
        }
        self.submit_ready(true);
        for ack in self.flush_waiters.drain(..) {
            let _ = ack.send(());
        }
        debug!(service = %self.config.service, "Processor worker stopped");
    }

    fn submit_ready(&mut self, force: bool) {
        let force = force || self.config.allow_above_throughput;
        while let Some(group) = take_group(&mut self.pending, self.config.throughput, force) {
            self.submit_group(group);
        }
        crate::metrics::set_queue_depth(&self.config.service, self.counters.queued());
    }

    fn submit_group(&self, group: Vec<T>) -> GroupResult {
        let service = self.config.service.as_str();
        let total = group.len();
        self.counters.record_drained(total);
        debug!(service = %service, group_size = total, "Submitting group");

        let mut result = GroupResult {
            total,
            ..Default::default()
        };

        match self.submit(&group) {
            Ok(()) => {
                self.counters.record_succeeded(total);
                result.succeeded = total;
            }
            Err(error) if total == 1 => {
                for item in group {
                    publish_failure(&self.events, service, item, error.clone());
                }
                result.failed = 1;
            }
            Err(error) => {
                warn!(
                    service = %service,
                    group_size = total,
                    kind = %error.kind,
                    error = %error.message,
                    "Group submission failed, falling back to single items"
                );
                crate::metrics::record_group_fallback(service, total);
                result.fell_back = true;

                for item in group {
                    match self.submit(std::slice::from_ref(&item)) {
                        Ok(()) => {
                            self.counters.record_succeeded(1);
                            result.succeeded += 1;
                        }
                        Err(error) => {
                            publish_failure(&self.events, service, item, error);
                            result.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            service = %service,
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            fell_back = result.fell_back,
            "Group submission complete"
        );
        result
    }

    fn submit(&self, items: &[T]) -> std::result::Result<(), ServiceError> {
        self.retry.run_blocking(self.config.operation, || {
            self.counters.record_request();
            let started = Instant::now();
            let outcome = self.invoker.submit(self.session, items);
            crate::metrics::record_group_submission(
                &self.config.service,
                items.len(),
                outcome.is_ok(),
                started.elapsed(),
            );
            outcome
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct Row(u32);

    impl KeyedEntity for Row {
        fn keys_populated(&self) -> bool {
            false
        }
    }

    /// Fails the first `flaky` calls with a network error, then accepts.
    #[derive(Default)]
    struct CountingInvoker {
        calls: parking_lot::Mutex<Vec<usize>>,
        flaky: AtomicU32,
        delay: Duration,
    }

    impl BlockingWriteInvoker<Row> for CountingInvoker {
        fn submit(&self, _session: Option<SessionId>, items: &[Row]) -> crate::invoker::ServiceResult<()> {
            self.calls.lock().push(items.len());
            std::thread::sleep(self.delay);
            let remaining = self.flaky.load(Ordering::SeqCst);
            if remaining > 0 {
                self.flaky.store(remaining - 1, Ordering::SeqCst);
                return Err(ServiceError::network("reset"));
            }
            Ok(())
        }
    }

    fn spawn(config: ProcessorConfig, invoker: Arc<CountingInvoker>) -> BlockingOnDemandProcessor<Row, CountingInvoker> {
        BlockingOnDemandProcessor::spawn_with(
            config,
            invoker,
            Arc::new(EventBus::new()),
            RetryPolicy::new(RetryConfig::testing()),
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_flush_submits_remainder() {
        let invoker = Arc::new(CountingInvoker::default());
        let config = ProcessorConfig {
            allow_above_throughput: false,
            ..ProcessorConfig::testing()
        };
        let processor = spawn(config, Arc::clone(&invoker));

        for i in 0..25 {
            processor.enqueue(Row(i)).unwrap();
        }
        processor.flush();

        assert_eq!(*invoker.calls.lock(), vec![10, 10, 5]);
        assert_eq!(processor.entities_sent(), 25);
        assert_eq!(processor.entities_sent_successfully(), 25);
        processor.dispose().unwrap();
    }

    #[test]
    fn test_partial_group_waits_for_flush() {
        let invoker = Arc::new(CountingInvoker::default());
        let config = ProcessorConfig {
            allow_above_throughput: false,
            ..ProcessorConfig::testing()
        };
        let processor = spawn(config, Arc::clone(&invoker));

        for i in 0..9 {
            processor.enqueue(Row(i)).unwrap();
        }
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(processor.request_count(), 0);
        assert_eq!(processor.queue_len(), 9);

        processor.enqueue(Row(9)).unwrap();
        processor.flush();
        assert_eq!(*invoker.calls.lock(), vec![10]);
        processor.dispose().unwrap();
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let invoker = Arc::new(CountingInvoker {
            flaky: AtomicU32::new(2),
            ..Default::default()
        });
        let config = ProcessorConfig {
            throughput: 2,
            allow_above_throughput: false,
            operation: crate::resilience::OperationKind::Idempotent,
            ..ProcessorConfig::testing()
        };
        let processor = spawn(config, Arc::clone(&invoker));

        processor.enqueue(Row(1)).unwrap();
        processor.enqueue(Row(2)).unwrap();
        processor.flush();

        // Two network failures retried, then the group goes through
        assert_eq!(*invoker.calls.lock(), vec![2, 2, 2]);
        assert_eq!(processor.request_count(), 3);
        assert_eq!(processor.entities_sent_successfully(), 2);
        processor.dispose().unwrap();
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let invoker = Arc::new(CountingInvoker::default());
        let processor = spawn(ProcessorConfig::testing(), Arc::clone(&invoker));

        processor.enqueue(Row(1)).unwrap();
        processor.dispose().unwrap();
        processor.dispose().unwrap();

        assert_eq!(processor.entities_sent(), 1);
        let err = processor.enqueue(Row(2)).unwrap_err();
        assert!(matches!(err, EngineError::Disposed));
    }

    #[test]
    fn test_cancellation_stops_worker_after_drain() {
        let invoker = Arc::new(CountingInvoker::default());
        let token = CancellationToken::new();
        let config = ProcessorConfig {
            allow_above_throughput: false,
            ..ProcessorConfig::testing()
        };
        let processor = BlockingOnDemandProcessor::spawn_with(
            config,
            Arc::clone(&invoker),
            Arc::new(EventBus::new()),
            RetryPolicy::new(RetryConfig::testing()),
            Some(token.clone()),
            None,
        )
        .unwrap();

        for i in 0..3 {
            processor.enqueue(Row(i)).unwrap();
        }
        token.cancel();
        processor.dispose().unwrap();

        assert_eq!(*invoker.calls.lock(), vec![3]);
    }

    #[test]
    fn test_enqueue_rejected_once_cancelled_worker_drains() {
        let invoker = Arc::new(CountingInvoker {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let token = CancellationToken::new();
        let events = Arc::new(EventBus::new());
        let mut failures = events.subscribe_channel();
        let config = ProcessorConfig {
            allow_above_throughput: false,
            ..ProcessorConfig::testing()
        };
        let processor = BlockingOnDemandProcessor::spawn_with(
            config,
            Arc::clone(&invoker),
            events,
            RetryPolicy::new(RetryConfig::testing()),
            Some(token.clone()),
            None,
        )
        .unwrap();

        processor.enqueue(Row(1)).unwrap();
        token.cancel();
        // The worker is now submitting Row(1) from its final drain
        std::thread::sleep(Duration::from_millis(100));

        assert!(processor.is_disposed());
        assert!(matches!(processor.enqueue(Row(2)), Err(EngineError::Disposed)));
        processor.flush();
        processor.dispose().unwrap();

        assert_eq!(*invoker.calls.lock(), vec![1]);
        assert_eq!(processor.entities_sent(), 1);
        assert_eq!(processor.queue_len(), 0);
        assert!(failures.try_recv().is_err());
    }
}
