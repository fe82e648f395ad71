//! Paged query execution on top of a [`Connection`](crate::network::Connection).
//!
//! [`ContinuousResultStream`](continuous::ContinuousResultStream) holds the paging state
//! machine. [`AsyncContinuousResultSet`](result_set::AsyncContinuousResultSet) and
//! [`ContinuousResultSet`](result_set::ContinuousResultSet) are page-at-a-time and
//! row-at-a-time views of it.

use std::time::Duration;

use crate::errors::BadPagingConfig;

pub mod continuous;
pub mod result_set;

/// Whether to use continuous paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PagingMode {
    /// Continuous paging, falling back to classic paging with a warning when the
    /// protocol version has no continuous paging with client credit.
    Enabled,
    /// Continuous paging when the protocol version allows it, classic paging otherwise.
    #[default]
    Auto,
    /// A single QUERY without a page size.
    Disabled,
}

/// Settings of one paged query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuousPagingConfig {
    /// Rows per page, or bytes per page with [`page_size_in_bytes`](Self::page_size_in_bytes).
    pub page_size: i32,
    /// Whether [`page_size`](Self::page_size) counts bytes.
    pub page_size_in_bytes: bool,
    /// The most pages to fetch in total. 0 means no limit.
    pub max_pages: i32,
    /// The most pages the server may send per second. 0 means no limit.
    pub max_pages_per_second: i32,
    /// The flow-control window: pages buffered or requested ahead of consumption.
    pub max_enqueued_pages: usize,
    /// The deadline of the whole query, measured from dispatch.
    pub timeout: Option<Duration>,
    /// Bounds the wait for the first page.
    pub first_page_timeout: Option<Duration>,
    /// Bounds each wait for a later page.
    pub other_pages_timeout: Option<Duration>,
    /// Whether to use continuous paging.
    pub mode: PagingMode,
}

impl Default for ContinuousPagingConfig {
    fn default() -> Self {
        Self {
            page_size: 5000,
            page_size_in_bytes: false,
            max_pages: 0,
            max_pages_per_second: 0,
            max_enqueued_pages: 4,
            timeout: None,
            first_page_timeout: None,
            other_pages_timeout: None,
            mode: PagingMode::Auto,
        }
    }
}

impl ContinuousPagingConfig {
    /// Sets the page size in rows.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size;
        self.page_size_in_bytes = false;
        self
    }

    /// Sets the page size in bytes.
    pub fn with_page_size_in_bytes(mut self, page_size: i32) -> Self {
        self.page_size = page_size;
        self.page_size_in_bytes = true;
        self
    }

    /// Caps the total number of pages.
    pub fn with_max_pages(mut self, max_pages: i32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Caps the page rate.
    pub fn with_max_pages_per_second(mut self, max_pages_per_second: i32) -> Self {
        self.max_pages_per_second = max_pages_per_second;
        self
    }

    /// Sets the flow-control window.
    pub fn with_max_enqueued_pages(mut self, max_enqueued_pages: usize) -> Self {
        self.max_enqueued_pages = max_enqueued_pages;
        self
    }

    /// Sets the global deadline.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the per-fetch deadlines.
    pub fn with_page_timeouts(
        mut self,
        first_page_timeout: Option<Duration>,
        other_pages_timeout: Option<Duration>,
    ) -> Self {
        self.first_page_timeout = first_page_timeout;
        self.other_pages_timeout = other_pages_timeout;
        self
    }

    /// Sets the paging mode.
    pub fn with_mode(mut self, mode: PagingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Checks the settings that can be checked without knowing the statement.
    pub fn validate(&self) -> Result<(), BadPagingConfig> {
        if self.page_size <= 0 {
            return Err(BadPagingConfig::NonPositivePageSize(self.page_size));
        }
        if self.max_enqueued_pages == 0 {
            return Err(BadPagingConfig::ZeroWindow);
        }
        if self.max_pages < 0 {
            return Err(BadPagingConfig::NegativeMaxPages(self.max_pages));
        }
        if self.max_pages_per_second < 0 {
            return Err(BadPagingConfig::NegativeMaxPagesPerSecond(
                self.max_pages_per_second,
            ));
        }
        Ok(())
    }
}
