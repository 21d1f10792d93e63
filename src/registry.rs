// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Instance registry and factory.
//!
//! Tracks live processors and paginators behind opaque [`InstanceHandle`]s so
//! callers can look them up, flush them and tear them down as a group.
//!
//! ```text
//! create_processor / create_paginator / register
//!                  │
//!                  ▼
//!      Mutex<Vec<(handle, entry)>>   ◀── get::<P>(handle), find(service)
//!                  │
//!     snapshot ────┴──── lock released
//!                  │
//!                  ▼
//!      flush / dispose each instance
//! ```
//!
//! Two registries exist, [`Registry`] for async instances and
//! [`BlockingRegistry`] for thread-backed ones. Both share one handle map.
//! The map lock is held only to mutate or snapshot entries, never while an
//! instance flushes or disposes.

use crate::config::{EngineConfig, PagingConfig, ProcessorConfig};
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::invoker::{
    BlockingPageInvoker, BlockingWriteInvoker, KeyedEntity, PageInvoker, RecordMapper, SessionProvider,
    WriteInvoker,
};
use crate::paging::{BlockingPaginator, Paginator};
use crate::processor::{BlockingOnDemandProcessor, OnDemandProcessor};
use crate::resilience::RetryPolicy;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque token for a registry-tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(Uuid);

impl InstanceHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An async instance the [`Registry`] can flush and dispose.
pub trait ManagedInstance: Send + Sync + 'static {
    fn service(&self) -> &str;
    fn flush(&self) -> BoxFuture<'_, Result<()>>;
    fn dispose(&self) -> BoxFuture<'_, Result<()>>;
}

/// A thread-backed instance the [`BlockingRegistry`] can flush and dispose.
pub trait BlockingManagedInstance: Send + Sync + 'static {
    fn service(&self) -> &str;
    fn flush(&self) -> Result<()>;
    fn dispose(&self) -> Result<()>;
}

impl<T, I> ManagedInstance for OnDemandProcessor<T, I>
where
    T: KeyedEntity + Send + Sync + 'static,
    I: WriteInvoker<T>,
{
    fn service(&self) -> &str {
        OnDemandProcessor::service(self)
    }

    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            OnDemandProcessor::flush(self).await;
            Ok(())
        })
    }

    fn dispose(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(OnDemandProcessor::dispose(self))
    }
}

impl<I, T> ManagedInstance for Paginator<I, T>
where
    I: PageInvoker,
    T: Clone + Send + 'static,
{
    fn service(&self) -> &str {
        Paginator::service(self)
    }

    /// Paginators hold no queued work.
    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(futures::future::ready(Ok(())))
    }

    fn dispose(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Paginator::dispose(self))
    }
}

impl<T, I> BlockingManagedInstance for BlockingOnDemandProcessor<T, I>
where
    T: KeyedEntity + Send + Sync + 'static,
    I: BlockingWriteInvoker<T>,
{
    fn service(&self) -> &str {
        BlockingOnDemandProcessor::service(self)
    }

    fn flush(&self) -> Result<()> {
        BlockingOnDemandProcessor::flush(self);
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        BlockingOnDemandProcessor::dispose(self)
    }
}

impl<I, T> BlockingManagedInstance for BlockingPaginator<I, T>
where
    I: BlockingPageInvoker,
    T: Clone + Send + 'static,
{
    fn service(&self) -> &str {
        BlockingPaginator::service(self)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        BlockingPaginator::dispose(self)
    }
}

struct Entry<D: ?Sized> {
    service: String,
    instance: Arc<D>,
    /// Same allocation as `instance`, kept for typed lookups.
    any: Arc<dyn Any + Send + Sync>,
}

impl<D: ?Sized> Clone for Entry<D> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            instance: Arc::clone(&self.instance),
            any: Arc::clone(&self.any),
        }
    }
}

/// Handle map shared by both registries. Insertion order is kept so
/// `find` returns the first instance registered for a service.
struct HandleMap<D: ?Sized> {
    entries: Mutex<Vec<(InstanceHandle, Entry<D>)>>,
}

impl<D: ?Sized> HandleMap<D> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn insert(&self, service: &str, instance: Arc<D>, any: Arc<dyn Any + Send + Sync>) -> InstanceHandle {
        let handle = InstanceHandle::new();
        let mut entries = self.entries.lock();
        entries.push((
            handle,
            Entry {
                service: service.to_string(),
                instance,
                any,
            },
        ));
        crate::metrics::set_registry_instances(entries.len());
        debug!(%handle, service, "Instance registered");
        handle
    }

    fn get<P: Any + Send + Sync>(&self, handle: InstanceHandle) -> Result<Arc<P>> {
        let any = self
            .entries
            .lock()
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, entry)| Arc::clone(&entry.any))
            .ok_or(EngineError::NotFound(handle.0))?;
        any.downcast::<P>().map_err(|_| EngineError::NotFound(handle.0))
    }

    fn instance(&self, handle: InstanceHandle) -> Result<Arc<D>> {
        self.entries
            .lock()
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, entry)| Arc::clone(&entry.instance))
            .ok_or(EngineError::NotFound(handle.0))
    }

    fn find(&self, service: &str) -> Option<InstanceHandle> {
        self.entries
            .lock()
            .iter()
            .find(|(_, entry)| entry.service == service)
            .map(|(h, _)| *h)
    }

    fn remove(&self, handle: InstanceHandle) -> Result<Entry<D>> {
        let mut entries = self.entries.lock();
        let index = entries
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(EngineError::NotFound(handle.0))?;
        let (_, entry) = entries.remove(index);
        crate::metrics::set_registry_instances(entries.len());
        Ok(entry)
    }

    fn snapshot(&self) -> Vec<(InstanceHandle, Entry<D>)> {
        self.entries.lock().clone()
    }

    fn drain(&self) -> Vec<(InstanceHandle, Entry<D>)> {
        let drained = std::mem::take(&mut *self.entries.lock());
        crate::metrics::set_registry_instances(0);
        drained
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn handles(&self) -> Vec<InstanceHandle> {
        self.entries.lock().iter().map(|(h, _)| *h).collect()
    }
}

/// Registry of async processors and paginators.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> request_engine::Result<()> {
/// use request_engine::registry::Registry;
/// use request_engine::EngineConfig;
///
/// let registry = Registry::from_config(&EngineConfig::default());
/// // let handle = registry.create_processor(config, invoker, events)?;
/// registry.flush_all().await;
/// registry.dispose_all().await;
/// # Ok(())
/// # }
/// ```
pub struct Registry {
    map: HandleMap<dyn ManagedInstance>,
    paging: PagingConfig,
    retry: RetryPolicy,
    sessions: Option<Arc<dyn SessionProvider>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    /// Paginators and processor retries take their settings from `config`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            map: HandleMap::new(),
            paging: config.paging.clone(),
            retry: RetryPolicy::new(config.retry.clone()),
            sessions: None,
        }
    }

    /// Processors created from now on acquire a dedicated session here.
    pub fn with_session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(provider);
        self
    }

    /// Spawn an [`OnDemandProcessor`] and track it.
    pub fn create_processor<T, I>(
        &self,
        config: ProcessorConfig,
        invoker: Arc<I>,
        events: Arc<EventBus<T>>,
    ) -> Result<InstanceHandle>
    where
        T: KeyedEntity + Send + Sync + 'static,
        I: WriteInvoker<T>,
    {
        let mut builder = OnDemandProcessor::builder(config, invoker, events).with_retry(self.retry.clone());
        if let Some(provider) = &self.sessions {
            builder = builder.with_session(Arc::clone(provider));
        }
        let processor = builder.spawn()?;
        let service = processor.service().to_string();
        Ok(self.register(&service, Arc::new(processor)))
    }

    /// Build a [`Paginator`] with the registry's paging config and track it.
    pub fn create_paginator<I, T>(
        &self,
        service: &str,
        invoker: Arc<I>,
        mapper: impl RecordMapper<I::Record, T>,
    ) -> Result<InstanceHandle>
    where
        I: PageInvoker,
        T: Clone + Send + 'static,
    {
        let paginator = Paginator::new(service, self.paging.clone(), invoker, mapper)?;
        Ok(self.register(service, Arc::new(paginator)))
    }

    /// Track an instance built elsewhere.
    pub fn register<P: ManagedInstance>(&self, service: &str, instance: Arc<P>) -> InstanceHandle {
        let any: Arc<dyn Any + Send + Sync> = instance.clone();
        self.map.insert(service, instance, any)
    }

    /// Typed lookup. A handle that is unknown or points at another type is
    /// `NotFound`.
    pub fn get<P: ManagedInstance>(&self, handle: InstanceHandle) -> Result<Arc<P>> {
        self.map.get(handle)
    }

    /// First live instance registered for `service`.
    pub fn find(&self, service: &str) -> Option<InstanceHandle> {
        self.map.find(service)
    }

    pub async fn flush(&self, handle: InstanceHandle) -> Result<()> {
        let instance = self.map.instance(handle)?;
        instance.flush().await
    }

    /// Flush every instance, logging and skipping failures.
    pub async fn flush_all(&self) {
        for (handle, entry) in self.map.snapshot() {
            if let Err(e) = entry.instance.flush().await {
                warn!(%handle, service = %entry.service, error = %e, "Flush failed");
            }
        }
    }

    /// Remove and dispose one instance.
    pub async fn dispose(&self, handle: InstanceHandle) -> Result<()> {
        let entry = self.map.remove(handle)?;
        entry.instance.dispose().await
    }

    /// Dispose every instance and leave the registry empty.
    pub async fn dispose_all(&self) {
        let entries = self.map.drain();
        let count = entries.len();
        for (handle, entry) in entries {
            if let Err(e) = entry.instance.dispose().await {
                warn!(%handle, service = %entry.service, error = %e, "Dispose failed");
            }
        }
        info!(count, "Registry disposed");
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<InstanceHandle> {
        self.map.handles()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("instances", &self.len()).finish()
    }
}

/// Registry of thread-backed processors and paginators.
pub struct BlockingRegistry {
    map: HandleMap<dyn BlockingManagedInstance>,
    paging: PagingConfig,
    retry: RetryPolicy,
    sessions: Option<Arc<dyn SessionProvider>>,
}

impl Default for BlockingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockingRegistry {
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            map: HandleMap::new(),
            paging: config.paging.clone(),
            retry: RetryPolicy::new(config.retry.clone()),
            sessions: None,
        }
    }

    pub fn with_session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(provider);
        self
    }

    pub fn create_processor<T, I>(
        &self,
        config: ProcessorConfig,
        invoker: Arc<I>,
        events: Arc<EventBus<T>>,
    ) -> Result<InstanceHandle>
    where
        T: KeyedEntity + Send + Sync + 'static,
        I: BlockingWriteInvoker<T>,
    {
        let processor = BlockingOnDemandProcessor::spawn_with(
            config,
            invoker,
            events,
            self.retry.clone(),
            None,
            self.sessions.clone(),
        )?;
        let service = processor.service().to_string();
        Ok(self.register(&service, Arc::new(processor)))
    }

    pub fn create_paginator<I, T>(
        &self,
        service: &str,
        invoker: Arc<I>,
        mapper: impl RecordMapper<I::Record, T>,
    ) -> Result<InstanceHandle>
    where
        I: BlockingPageInvoker,
        T: Clone + Send + 'static,
    {
        let paginator = BlockingPaginator::new(service, self.paging.clone(), invoker, mapper)?;
        Ok(self.register(service, Arc::new(paginator)))
    }

    pub fn register<P: BlockingManagedInstance>(&self, service: &str, instance: Arc<P>) -> InstanceHandle {
        let any: Arc<dyn Any + Send + Sync> = instance.clone();
        self.map.insert(service, instance, any)
    }

    pub fn get<P: BlockingManagedInstance>(&self, handle: InstanceHandle) -> Result<Arc<P>> {
        self.map.get(handle)
    }

    pub fn find(&self, service: &str) -> Option<InstanceHandle> {
        self.map.find(service)
    }

    pub fn flush(&self, handle: InstanceHandle) -> Result<()> {
        self.map.instance(handle)?.flush()
    }

    pub fn flush_all(&self) {
        for (handle, entry) in self.map.snapshot() {
            if let Err(e) = entry.instance.flush() {
                warn!(%handle, service = %entry.service, error = %e, "Flush failed");
            }
        }
    }

    pub fn dispose(&self, handle: InstanceHandle) -> Result<()> {
        self.map.remove(handle)?.instance.dispose()
    }

    pub fn dispose_all(&self) {
        let entries = self.map.drain();
        let count = entries.len();
        for (handle, entry) in entries {
            if let Err(e) = entry.instance.dispose() {
                warn!(%handle, service = %entry.service, error = %e, "Dispose failed");
            }
        }
        info!(count, "Registry disposed");
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<InstanceHandle> {
        self.map.handles()
    }
}

impl std::fmt::Debug for BlockingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingRegistry").field("instances", &self.len()).finish()
    }
}
