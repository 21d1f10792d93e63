//! Scripted page invoker.
//!
//! Serves `full_pages` pages of `page_size` sequential ids, then one page of
//! `last_page_len` ids, then empty pages. Can fail at a given page, delay each
//! answer and report page/record totals like servers that know them.

use parking_lot::Mutex;
use request_engine::invoker::{BlockingPageInvoker, BoxFuture, PageCursor, PageInvoker, PageResponse, ServiceResult, SessionId};
use request_engine::ServiceError;
use std::time::Duration;

/// Query description carried to the pager; only recorded.
#[derive(Debug, Clone, Default)]
pub struct TestQuery {
    pub entity: String,
}

impl TestQuery {
    pub fn entity(name: &str) -> Self {
        Self { entity: name.to_string() }
    }
}

pub struct ScriptedPager {
    page_size: u32,
    full_pages: u32,
    last_page_len: u32,
    fail_at: Option<(u32, ServiceError)>,
    delay: Duration,
    report_totals: bool,
    requested: Mutex<Vec<u32>>,
    sessions: Mutex<Vec<Option<SessionId>>>,
}

impl ScriptedPager {
    pub fn new(page_size: u32, full_pages: u32, last_page_len: u32) -> Self {
        Self {
            page_size,
            full_pages,
            last_page_len,
            fail_at: None,
            delay: Duration::ZERO,
            report_totals: false,
            requested: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_at(mut self, page: u32, error: ServiceError) -> Self {
        self.fail_at = Some((page, error));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_totals(mut self) -> Self {
        self.report_totals = true;
        self
    }

    pub fn total_items(&self) -> u32 {
        self.page_size * self.full_pages + self.last_page_len
    }

    /// Page numbers requested so far, in order.
    pub fn requested(&self) -> Vec<u32> {
        self.requested.lock().clone()
    }

    pub fn sessions(&self) -> Vec<Option<SessionId>> {
        self.sessions.lock().clone()
    }

    fn page(&self, session: Option<SessionId>, cursor: &PageCursor) -> ServiceResult<PageResponse<u32>> {
        self.requested.lock().push(cursor.page);
        self.sessions.lock().push(session);

        if let Some((page, error)) = &self.fail_at {
            if *page == cursor.page {
                return Err(error.clone());
            }
        }

        let start = (cursor.page - 1) * self.page_size;
        let len = if cursor.page <= self.full_pages {
            self.page_size
        } else if cursor.page == self.full_pages + 1 {
            self.last_page_len
        } else {
            0
        };

        let mut response = PageResponse::new((start..start + len).collect()).with_pager_id("pager-1");
        if self.report_totals {
            let pages = self.full_pages + u32::from(self.last_page_len > 0);
            response = response.with_totals(pages, u64::from(self.total_items()));
        }
        Ok(response)
    }
}

impl PageInvoker for ScriptedPager {
    type Request = TestQuery;
    type Record = u32;

    fn fetch_page<'a>(
        &'a self,
        session: Option<SessionId>,
        _request: &'a TestQuery,
        cursor: &'a PageCursor,
    ) -> BoxFuture<'a, PageResponse<u32>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.page(session, cursor)
        })
    }
}

impl BlockingPageInvoker for ScriptedPager {
    type Request = TestQuery;
    type Record = u32;

    fn fetch_page(
        &self,
        session: Option<SessionId>,
        _request: &TestQuery,
        cursor: &PageCursor,
    ) -> ServiceResult<PageResponse<u32>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.page(session, cursor)
    }
}

/// Record decoder used with the scripted pager.
pub fn decode_id(record: u32) -> ServiceResult<u64> {
    Ok(u64::from(record))
}
