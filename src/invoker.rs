// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service invoker integration traits.
//!
//! The engine never speaks the wire protocol. Callers plug in the remote
//! service through these traits:
//!
//! - [`WriteInvoker`] / [`BlockingWriteInvoker`]: submit a group of items
//! - [`PageInvoker`] / [`BlockingPageInvoker`]: fetch one page of records
//! - [`RecordMapper`]: decode one record into a typed entity
//! - [`KeyedEntity`]: report whether an entity's key fields are populated
//! - [`SessionProvider`]: hand out and take back session identities
//!
//! Every failure crosses this boundary as a [`ServiceError`] whose
//! [`ErrorKind`](crate::error::ErrorKind) has already been decided.
//!
//! # Example
//!
//! ```rust,no_run
//! use request_engine::invoker::{BoxFuture, SessionId, WriteInvoker};
//!
//! struct Partner { code: Option<u32>, name: String }
//!
//! struct PartnerSaver { /* http client, ... */ }
//!
//! impl WriteInvoker<Partner> for PartnerSaver {
//!     fn submit<'a>(
//!         &'a self,
//!         _session: Option<SessionId>,
//!         items: &'a [Partner],
//!     ) -> BoxFuture<'a, ()> {
//!         Box::pin(async move {
//!             let _names: Vec<&str> = items.iter().map(|p| p.name.as_str()).collect();
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::error::ServiceError;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Result type for invoker calls.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ServiceResult<T>> + Send + 'a>>;

/// Opaque identity used for submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supplies dedicated sessions to processors that want their own.
pub trait SessionProvider: Send + Sync + 'static {
    fn acquire(&self) -> ServiceResult<SessionId>;

    /// Give the session back. Failures are the provider's to log.
    fn release(&self, session: SessionId);
}

/// Async group submission.
///
/// A group either succeeds as a whole or fails as a whole; on failure the
/// processor resubmits each item on its own.
pub trait WriteInvoker<T>: Send + Sync + 'static {
    fn submit<'a>(&'a self, session: Option<SessionId>, items: &'a [T]) -> BoxFuture<'a, ()>;
}

/// Blocking group submission.
pub trait BlockingWriteInvoker<T>: Send + Sync + 'static {
    fn submit(&self, session: Option<SessionId>, items: &[T]) -> ServiceResult<()>;
}

/// Position of a paged fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    /// 1-based page number to fetch next.
    pub page: u32,
    /// Server-side pager token carried across requests.
    pub pager_id: Option<String>,
    pub total_pages: Option<u32>,
    pub total_records: Option<u64>,
}

impl PageCursor {
    /// Cursor positioned at page 1.
    pub fn first() -> Self {
        Self {
            page: 1,
            pager_id: None,
            total_pages: None,
            total_records: None,
        }
    }

    /// Fold a response's pager info in and move to the next page.
    ///
    /// Known values are never replaced by `None`.
    pub fn advance<R>(&mut self, response: &PageResponse<R>) {
        if response.pager_id.is_some() {
            self.pager_id = response.pager_id.clone();
        }
        if response.total_pages.is_some() {
            self.total_pages = response.total_pages;
        }
        if response.total_records.is_some() {
            self.total_records = response.total_records;
        }
        self.page += 1;
    }
}

impl Default for PageCursor {
    fn default() -> Self {
        Self::first()
    }
}

/// One page as returned by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResponse<R> {
    pub records: Vec<R>,
    pub pager_id: Option<String>,
    pub total_pages: Option<u32>,
    pub total_records: Option<u64>,
}

impl<R> PageResponse<R> {
    /// A page with no pager information.
    pub fn new(records: Vec<R>) -> Self {
        Self {
            records,
            pager_id: None,
            total_pages: None,
            total_records: None,
        }
    }

    pub fn with_pager_id(mut self, pager_id: impl Into<String>) -> Self {
        self.pager_id = Some(pager_id.into());
        self
    }

    pub fn with_totals(mut self, total_pages: u32, total_records: u64) -> Self {
        self.total_pages = Some(total_pages);
        self.total_records = Some(total_records);
        self
    }
}

/// Async page fetcher.
pub trait PageInvoker: Send + Sync + 'static {
    /// Query description (entity, criteria, fields, ...).
    type Request: Send + Sync + 'static;
    /// Raw server record, decoded later by a [`RecordMapper`].
    type Record: Send + 'static;

    fn fetch_page<'a>(
        &'a self,
        session: Option<SessionId>,
        request: &'a Self::Request,
        cursor: &'a PageCursor,
    ) -> BoxFuture<'a, PageResponse<Self::Record>>;
}

/// Blocking page fetcher.
pub trait BlockingPageInvoker: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Record: Send + 'static;

    fn fetch_page(
        &self,
        session: Option<SessionId>,
        request: &Self::Request,
        cursor: &PageCursor,
    ) -> ServiceResult<PageResponse<Self::Record>>;
}

/// Decodes one server record.
pub trait RecordMapper<R, T>: Send + Sync + 'static {
    fn map(&self, record: R) -> ServiceResult<T>;
}

impl<R, T, F> RecordMapper<R, T> for F
where
    F: Fn(R) -> ServiceResult<T> + Send + Sync + 'static,
{
    fn map(&self, record: R) -> ServiceResult<T> {
        self(record)
    }
}

/// Entities that know their primary-key fields.
pub trait KeyedEntity {
    /// True when every declared key field holds a value.
    ///
    /// Used only to label failure events as probable updates.
    fn keys_populated(&self) -> bool;
}
