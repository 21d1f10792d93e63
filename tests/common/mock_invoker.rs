//! Recording write invoker and session provider.
//!
//! Every `submit()` call is recorded as the list of ids it carried. Ids
//! registered with `reject()` make any submission containing them fail with
//! the configured error kind, group and single alike.

use parking_lot::Mutex;
use request_engine::invoker::{
    BlockingWriteInvoker, BoxFuture, KeyedEntity, ServiceResult, SessionId, SessionProvider, WriteInvoker,
};
use request_engine::{ErrorKind, ServiceError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Payload used by the processor tests.
#[derive(Debug, Clone, PartialEq)]
pub struct TestEntity {
    pub id: u32,
    /// Primary key; `Some` means the entity already exists remotely.
    pub code: Option<u32>,
}

impl TestEntity {
    pub fn new(id: u32) -> Self {
        Self { id, code: None }
    }

    pub fn existing(id: u32) -> Self {
        Self { id, code: Some(id) }
    }
}

impl KeyedEntity for TestEntity {
    fn keys_populated(&self) -> bool {
        self.code.is_some()
    }
}

pub fn entities(range: std::ops::Range<u32>) -> Vec<TestEntity> {
    range.map(TestEntity::new).collect()
}

/// Write invoker that records calls.
///
/// # Example
/// ```rust,ignore
/// let invoker = RecordingInvoker::new();
/// invoker.reject(3, ErrorKind::BusinessRule);
///
/// // Use in tests...
///
/// assert_eq!(invoker.group_sizes(), vec![5, 1, 1, 1, 1, 1]);
/// ```
#[derive(Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<Vec<u32>>>,
    sessions: Mutex<Vec<Option<SessionId>>>,
    rejected: Mutex<HashMap<u32, ErrorKind>>,
    delay: Duration,
}

impl RecordingInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn reject(&self, id: u32, kind: ErrorKind) {
        self.rejected.lock().insert(id, kind);
    }

    pub fn calls(&self) -> Vec<Vec<u32>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn group_sizes(&self) -> Vec<usize> {
        self.calls.lock().iter().map(Vec::len).collect()
    }

    /// Items carried across all calls, resubmissions included.
    pub fn submitted_total(&self) -> usize {
        self.calls.lock().iter().map(Vec::len).sum()
    }

    /// Session passed with each call, in call order.
    pub fn sessions(&self) -> Vec<Option<SessionId>> {
        self.sessions.lock().clone()
    }

    fn record(&self, session: Option<SessionId>, items: &[TestEntity]) -> ServiceResult<()> {
        let ids: Vec<u32> = items.iter().map(|e| e.id).collect();
        self.calls.lock().push(ids.clone());
        self.sessions.lock().push(session);

        let rejected = self.rejected.lock();
        match ids.iter().find_map(|id| rejected.get(id).map(|kind| (*id, *kind))) {
            Some((id, kind)) => Err(ServiceError::new(kind, format!("entity {id} rejected"))),
            None => Ok(()),
        }
    }
}

impl WriteInvoker<TestEntity> for RecordingInvoker {
    fn submit<'a>(&'a self, session: Option<SessionId>, items: &'a [TestEntity]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.record(session, items)
        })
    }
}

impl BlockingWriteInvoker<TestEntity> for RecordingInvoker {
    fn submit(&self, session: Option<SessionId>, items: &[TestEntity]) -> ServiceResult<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.record(session, items)
    }
}

/// Session provider that hands out fresh ids and counts returns.
#[derive(Default)]
pub struct CountingSessions {
    acquired: AtomicUsize,
    released: AtomicUsize,
    last: Mutex<Option<SessionId>>,
}

impl CountingSessions {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<SessionId> {
        *self.last.lock()
    }
}

impl SessionProvider for CountingSessions {
    fn acquire(&self) -> ServiceResult<SessionId> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let session = SessionId::new();
        *self.last.lock() = Some(session);
        Ok(session)
    }

    fn release(&self, _session: SessionId) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
