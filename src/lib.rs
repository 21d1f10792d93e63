//! # Request Engine
//!
//! Concurrency core of a client SDK for a remote business-application API:
//! batched on-demand writes, paginated reads and the retry policy both rely on.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             request-engine                                │
//! │                                                                           │
//! │  enqueue(item)                                                            │
//! │      │         ┌─────────────────────┐    ┌─────────────┐                 │
//! │      └────────►│ OnDemandProcessor   │───►│ RetryPolicy │──► WriteInvoker │
//! │                │ (group by throughput│    └─────────────┘        │        │
//! │                │  per-item fallback) │◄──────────────────────────┘        │
//! │                └─────────┬───────────┘                                    │
//! │                          ▼                                                │
//! │                     EventBus (failure events)                             │
//! │                                                                           │
//! │  fetch(request)  ┌─────────────┐   pages   ┌─────────────┐                │
//! │      ◄───────────│ PagedFetch  │◄──────────│ loader      │──► PageInvoker │
//! │   items (lazy)   │ (Stream)    │  channel  │ (task)      │                │
//! │                  └─────────────┘           └─────────────┘                │
//! │                                                                           │
//! │  Registry: handle ──► processor / paginator (flush_all, dispose_all)      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every async component has a thread-backed twin (`Blocking*`) with the same
//! semantics for callers outside a tokio runtime.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use request_engine::invoker::{BoxFuture, KeyedEntity, SessionId, WriteInvoker};
//! use request_engine::{EventBus, OnDemandProcessor, ProcessorConfig};
//! use std::sync::Arc;
//!
//! struct Partner {
//!     code: Option<u32>,
//! }
//!
//! impl KeyedEntity for Partner {
//!     fn keys_populated(&self) -> bool {
//!         self.code.is_some()
//!     }
//! }
//!
//! struct Api;
//!
//! impl WriteInvoker<Partner> for Api {
//!     fn submit<'a>(&'a self, _session: Option<SessionId>, _items: &'a [Partner]) -> BoxFuture<'a, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> request_engine::Result<()> {
//!     let events = Arc::new(EventBus::<Partner>::new());
//!     events.subscribe(|e| eprintln!("{} failed: {}", e.operation_type(), e.error));
//!
//!     let processor = OnDemandProcessor::spawn(ProcessorConfig::for_service("partners"), Arc::new(Api), events)?;
//!     processor.enqueue(Partner { code: None })?;
//!     processor.flush().await;
//!     processor.dispose().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod invoker;
pub mod metrics;
pub mod paging;
pub mod processor;
pub mod registry;
pub mod resilience;

// Re-exports for convenience
pub use config::{EngineConfig, PagingConfig, ProcessorConfig, RetryConfig};
pub use error::{EngineError, ErrorKind, Result, ServiceError};
pub use events::{EventBus, FailureEvent, SubscriptionId};
pub use invoker::{
    BlockingPageInvoker, BlockingWriteInvoker, KeyedEntity, PageCursor, PageInvoker, PageResponse, RecordMapper,
    SessionId, SessionProvider, WriteInvoker,
};
pub use paging::{BlockingPagedFetch, BlockingPaginator, FetchOptions, PageEvent, PagedFetch, Paginator};
pub use processor::{BlockingOnDemandProcessor, OnDemandProcessor, ProcessorBuilder, ProcessorStats};
pub use registry::{BlockingRegistry, InstanceHandle, Registry};
pub use resilience::{OperationKind, RetryDecision, RetryPolicy, RetryState};
