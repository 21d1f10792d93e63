// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async on-demand processor backed by a tokio task.

use super::{publish_failure, take_group, Counters, GroupResult, ProcessorStats};
use crate::config::ProcessorConfig;
use crate::error::{EngineError, Result, ServiceError};
use crate::events::EventBus;
use crate::invoker::{KeyedEntity, SessionId, SessionProvider, WriteInvoker};
use crate::resilience::RetryPolicy;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

enum Control {
    Flush(oneshot::Sender<()>),
    Stop,
}

enum Wake<T> {
    Item(T),
    Tick,
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Configures and starts an [`OnDemandProcessor`].
pub struct ProcessorBuilder<T, I> {
    config: ProcessorConfig,
    invoker: Arc<I>,
    events: Arc<EventBus<T>>,
    retry: RetryPolicy,
    cancel: Option<CancellationToken>,
    sessions: Option<Arc<dyn SessionProvider>>,
}

impl<T, I> ProcessorBuilder<T, I>
where
    T: KeyedEntity + Send + Sync + 'static,
    I: WriteInvoker<T>,
{
    /// Stop the worker (after draining) when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Acquire a dedicated session now and release it on dispose.
    pub fn with_session(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(provider);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(self) -> Result<OnDemandProcessor<T, I>> {
        self.config.validate()?;

        let session = match &self.sessions {
            Some(provider) => Some(provider.acquire()?),
            None => None,
        };

        let (items_tx, items_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let cancel = self.cancel.unwrap_or_else(CancellationToken::new);

        let worker = Worker {
            config: self.config.clone(),
            invoker: self.invoker,
            events: self.events,
            retry: self.retry,
            counters: Arc::clone(&counters),
            session,
            items_rx,
            control_rx,
            cancel,
            pending: VecDeque::new(),
        };
        let handle = tokio::spawn(worker.run());

        debug!(service = %self.config.service, throughput = self.config.throughput, "Processor started");

        Ok(OnDemandProcessor {
            config: self.config,
            items_tx,
            control_tx,
            counters,
            disposed: AtomicBool::new(false),
            worker: Mutex::new(Some(handle)),
            session: parking_lot::Mutex::new(session.zip(self.sessions)),
            _invoker: PhantomData,
        })
    }
}

/// Batches enqueued items and submits them from a background task.
///
/// # Example
///
/// ```rust,no_run
/// # use request_engine::invoker::{BoxFuture, KeyedEntity, SessionId, WriteInvoker};
/// # struct Order { id: Option<u64> }
/// # impl KeyedEntity for Order { fn keys_populated(&self) -> bool { self.id.is_some() } }
/// # struct Api;
/// # impl WriteInvoker<Order> for Api {
/// #     fn submit<'a>(&'a self, _: Option<SessionId>, _: &'a [Order]) -> BoxFuture<'a, ()> {
/// #         Box::pin(async { Ok(()) })
/// #     }
/// # }
/// # async fn example() -> request_engine::Result<()> {
/// use request_engine::{EventBus, OnDemandProcessor, ProcessorConfig};
/// use std::sync::Arc;
///
/// let events = Arc::new(EventBus::<Order>::new());
/// events.subscribe(|e| eprintln!("failed {}: {}", e.operation_type(), e.error));
///
/// let processor = OnDemandProcessor::spawn(
///     ProcessorConfig::for_service("Order.save"),
///     Arc::new(Api),
///     events,
/// )?;
/// processor.enqueue(Order { id: None })?;
/// processor.flush().await;
/// processor.dispose().await?;
/// # Ok(())
/// # }
/// ```
pub struct OnDemandProcessor<T, I> {
    config: ProcessorConfig,
    items_tx: mpsc::UnboundedSender<T>,
    control_tx: mpsc::UnboundedSender<Control>,
    counters: Arc<Counters>,
    disposed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    session: parking_lot::Mutex<Option<(SessionId, Arc<dyn SessionProvider>)>>,
    _invoker: PhantomData<fn() -> I>,
}

impl<T, I> OnDemandProcessor<T, I>
where
    T: KeyedEntity + Send + Sync + 'static,
    I: WriteInvoker<T>,
{
    /// Start configuring a processor.
    pub fn builder(config: ProcessorConfig, invoker: Arc<I>, events: Arc<EventBus<T>>) -> ProcessorBuilder<T, I> {
        ProcessorBuilder {
            config,
            invoker,
            events,
            retry: RetryPolicy::default(),
            cancel: None,
            sessions: None,
        }
    }

    /// Spawn with default retry policy, no session and no external cancellation.
    pub fn spawn(config: ProcessorConfig, invoker: Arc<I>, events: Arc<EventBus<T>>) -> Result<Self> {
        Self::builder(config, invoker, events).spawn()
    }

    /// Queue an item. Never blocks.
    pub fn enqueue(&self, item: T) -> Result<()> {
        if self.is_disposed() {
            return Err(EngineError::Disposed);
        }
        self.counters.record_enqueued();
        if self.items_tx.send(item).is_err() {
            // Worker already gone (cancelled); the item never made it in.
            self.counters.record_enqueue_rejected();
            return Err(EngineError::Disposed);
        }
        Ok(())
    }

    /// Wait until everything enqueued before this call has been submitted.
    pub async fn flush(&self) {
        if self.is_disposed() {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control_tx.send(Control::Flush(ack_tx)).is_err() {
            return;
        }
        // A dropped ack means the worker exited, after draining.
        let _ = ack_rx.await;
    }

    /// Stop intake, submit what is left and wait for the worker.
    ///
    /// The wait is bounded by `dispose_timeout`; an overrunning worker is
    /// aborted. Calling this again is a no-op.
    #[instrument(skip(self), fields(service = %self.config.service))]
    pub async fn dispose(&self) -> Result<()> {
        self.disposed.store(true, Ordering::SeqCst);

        let mut worker = self.worker.lock().await;
        let Some(mut handle) = worker.take() else {
            return Ok(());
        };
        let _ = self.control_tx.send(Control::Stop);

        let limit = self.config.dispose_timeout_duration();
        let outcome = match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Worker(format!("processor worker failed: {e}"))),
            Err(_) => {
                handle.abort();
                Err(EngineError::Worker(format!(
                    "processor worker did not stop within {limit:?}"
                )))
            }
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

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
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

impl<T, I> std::fmt::Debug for OnDemandProcessor<T, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnDemandProcessor")
            .field("service", &self.config.service)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

struct Worker<T, I> {
    config: ProcessorConfig,
    invoker: Arc<I>,
    events: Arc<EventBus<T>>,
    retry: RetryPolicy,
    counters: Arc<Counters>,
    session: Option<SessionId>,
    items_rx: mpsc::UnboundedReceiver<T>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,
    pending: VecDeque<T>,
}

impl<T, I> Worker<T, I>
where
    T: KeyedEntity + Send + Sync + 'static,
    I: WriteInvoker<T>,
{
    #[instrument(skip_all, fields(service = %self.config.service))]
    async fn run(mut self) {
        let wake_interval = self.config.wake_interval_duration();

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Stop,
                control = self.control_rx.recv() => match control {
                    Some(Control::Flush(ack)) => Wake::Flush(ack),
                    Some(Control::Stop) | None => Wake::Stop,
                },
                item = self.items_rx.recv() => match item {
                    Some(item) => Wake::Item(item),
                    None => Wake::Stop,
                },
                _ = tokio::time::sleep(wake_interval) => Wake::Tick,
            };

            match wake {
                Wake::Item(item) => {
                    self.pending.push_back(item);
                    self.drain_channel();
                    self.submit_ready(false).await;
                }
                Wake::Tick => {
                    self.drain_channel();
                    self.submit_ready(false).await;
                }
                Wake::Flush(ack) => {
                    self.drain_channel();
                    self.submit_ready(true).await;
                    let _ = ack.send(());
                }
                Wake::Stop => break,
            }
        }

        self.shutdown().await;
    }

    /// Drain everything still reachable, submit it, then release waiters.
    async fn shutdown(&mut self) {
        self.items_rx.close();
        self.drain_channel();
        self.submit_ready(true).await;

        self.control_rx.close();
        while let Ok(control) = self.control_rx.try_recv() {
            if let Control::Flush(ack) = control {
                let _ = ack.send(());
            }
        }
        debug!(service = %self.config.service, "Processor worker stopped");
    }

    fn drain_channel(&mut self) {
        while let Ok(item) = self.items_rx.try_recv() {
            self.pending.push_back(item);
        }
    }

    async fn submit_ready(&mut self, force: bool) {
        let force = force || self.config.allow_above_throughput;
        while let Some(group) = take_group(&mut self.pending, self.config.throughput, force) {
            self.submit_group(group).await;
        }
        crate::metrics::set_queue_depth(&self.config.service, self.counters.queued());
    }

    async fn submit_group(&self, group: Vec<T>) -> GroupResult {
        let service = self.config.service.as_str();
        let total = group.len();
        self.counters.record_drained(total);
        debug!(service = %service, group_size = total, "Submitting group");

        let mut result = GroupResult {
            total,
            ..Default::default()
        };

        match self.submit(&group).await {
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
                    match self.submit(std::slice::from_ref(&item)).await {
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

    /// One logical submission, retried per policy.
    async fn submit(&self, items: &[T]) -> std::result::Result<(), ServiceError> {
        let invoker = &*self.invoker;
        let counters = &*self.counters;
        let service = self.config.service.as_str();
        let session = self.session;

        self.retry
            .run(self.config.operation, move || async move {
                counters.record_request();
                let started = Instant::now();
                let outcome = invoker.submit(session, items).await;
                crate::metrics::record_group_submission(service, items.len(), outcome.is_ok(), started.elapsed());
                outcome
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::invoker::BoxFuture;
    use std::collections::HashSet;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        id: u32,
        code: Option<u32>,
    }

    impl KeyedEntity for Item {
        fn keys_populated(&self) -> bool {
            self.code.is_some()
        }
    }

    /// Invoker that records every call and rejects groups containing bad ids.
    #[derive(Default)]
    struct TrackingInvoker {
        calls: parking_lot::Mutex<Vec<Vec<u32>>>,
        rejected: HashSet<u32>,
    }

    impl TrackingInvoker {
        fn rejecting(ids: &[u32]) -> Self {
            Self {
                calls: parking_lot::Mutex::new(Vec::new()),
                rejected: ids.iter().copied().collect(),
            }
        }

        fn group_sizes(&self) -> Vec<usize> {
            self.calls.lock().iter().map(Vec::len).collect()
        }
    }

    impl WriteInvoker<Item> for TrackingInvoker {
        fn submit<'a>(&'a self, _session: Option<SessionId>, items: &'a [Item]) -> BoxFuture<'a, ()> {
            let ids: Vec<u32> = items.iter().map(|i| i.id).collect();
            let bad = ids.iter().any(|id| self.rejected.contains(id));
            self.calls.lock().push(ids);
            Box::pin(async move {
                if bad {
                    Err(ServiceError::business_rule("rejected"))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn items(range: std::ops::Range<u32>) -> impl Iterator<Item = Item> {
        range.map(|id| Item { id, code: None })
    }

    fn spawn(
        config: ProcessorConfig,
        invoker: Arc<TrackingInvoker>,
    ) -> (OnDemandProcessor<Item, TrackingInvoker>, Arc<EventBus<Item>>) {
        let events = Arc::new(EventBus::new());
        let processor = OnDemandProcessor::builder(config, invoker, Arc::clone(&events))
            .with_retry(RetryPolicy::new(RetryConfig::testing()))
            .spawn()
            .unwrap();
        (processor, events)
    }

    async fn wait_for_requests(processor: &OnDemandProcessor<Item, TrackingInvoker>, n: u64) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while processor.request_count() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("requests never reached the expected count");
    }

    #[tokio::test]
    async fn test_full_groups_submit_without_flush() {
        let invoker = Arc::new(TrackingInvoker::default());
        let config = ProcessorConfig {
            allow_above_throughput: false,
            ..ProcessorConfig::testing()
        };
        let (processor, _events) = spawn(config, Arc::clone(&invoker));

        for item in items(0..25) {
            processor.enqueue(item).unwrap();
        }
        wait_for_requests(&processor, 2).await;

        // Remainder stays queued across several wake intervals
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(invoker.group_sizes(), vec![10, 10]);
        assert_eq!(processor.queue_len(), 5);

        processor.flush().await;
        assert_eq!(invoker.group_sizes(), vec![10, 10, 5]);
        assert_eq!(processor.entities_sent(), 25);
        assert_eq!(processor.entities_sent_successfully(), 25);
        assert_eq!(processor.queue_len(), 0);

        processor.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_group_failure_falls_back_per_item() {
        let invoker = Arc::new(TrackingInvoker::rejecting(&[3]));
        let config = ProcessorConfig {
            throughput: 5,
            allow_above_throughput: false,
            ..ProcessorConfig::testing()
        };
        let (processor, events) = spawn(config, Arc::clone(&invoker));
        let mut failures = events.subscribe_channel();

        for item in items(0..5) {
            processor.enqueue(item).unwrap();
        }
        processor.flush().await;

        // One group attempt, then five single submissions
        assert_eq!(invoker.group_sizes(), vec![5, 1, 1, 1, 1, 1]);
        assert_eq!(processor.request_count(), 6);
        assert_eq!(processor.entities_sent(), 5);
        assert_eq!(processor.entities_sent_successfully(), 4);

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.payload.id, 3);
        assert!(!failure.is_update);
        assert_eq!(failure.service, "test.service");
        assert!(failures.try_recv().is_err());

        processor.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_item_group_not_resubmitted() {
        let invoker = Arc::new(TrackingInvoker::rejecting(&[1]));
        let (processor, events) = spawn(ProcessorConfig::testing(), Arc::clone(&invoker));
        let mut failures = events.subscribe_channel();

        processor.enqueue(Item { id: 1, code: Some(10) }).unwrap();
        processor.flush().await;

        assert_eq!(invoker.group_sizes(), vec![1]);
        let failure = failures.recv().await.unwrap();
        assert!(failure.is_update);

        processor.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_on_empty_queue_is_noop() {
        let invoker = Arc::new(TrackingInvoker::default());
        let (processor, _events) = spawn(ProcessorConfig::testing(), Arc::clone(&invoker));

        processor.flush().await;
        processor.flush().await;
        assert_eq!(processor.request_count(), 0);

        processor.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_drains_and_rejects_new_work() {
        let invoker = Arc::new(TrackingInvoker::default());
        let config = ProcessorConfig {
            allow_above_throughput: false,
            ..ProcessorConfig::testing()
        };
        let (processor, _events) = spawn(config, Arc::clone(&invoker));

        for item in items(0..3) {
            processor.enqueue(item).unwrap();
        }
        processor.dispose().await.unwrap();

        assert_eq!(invoker.group_sizes(), vec![3]);
        assert!(processor.is_disposed());
        assert!(matches!(
            processor.enqueue(Item { id: 9, code: None }),
            Err(EngineError::Disposed)
        ));

        // Second dispose changes nothing
        processor.dispose().await.unwrap();
        processor.flush().await;
        assert_eq!(processor.stats().entities_sent, 3);
    }

    #[tokio::test]
    async fn test_external_cancellation_drains() {
        let invoker = Arc::new(TrackingInvoker::default());
        let token = CancellationToken::new();
        let config = ProcessorConfig {
            allow_above_throughput: false,
            ..ProcessorConfig::testing()
        };
        let processor = OnDemandProcessor::builder(config, Arc::clone(&invoker), Arc::new(EventBus::new()))
            .with_cancellation(token.clone())
            .spawn()
            .unwrap();

        for item in items(0..4) {
            processor.enqueue(item).unwrap();
        }
        token.cancel();
        wait_for_requests(&processor, 1).await;

        assert_eq!(invoker.group_sizes(), vec![4]);
        processor.dispose().await.unwrap();
    }
}
