//! Query results served by a [`MockNode`](crate::MockNode).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sluice_cql::frame::request::query::{PagingState, PagingStateResponse};
use sluice_cql::frame::response::error::DbError;
use sluice_cql::frame::response::result::{
    ColumnSpec, ColumnType, ContinuousPageInfo, ResultMetadata, Row, Rows, TableSpec,
};

/// The rows a query returns, with knobs for how the node serves them.
#[derive(Debug, Clone)]
pub struct Table {
    metadata: Arc<ResultMetadata>,
    rows: Vec<Row>,
    warnings: Vec<String>,
    first_page_delay: Option<Duration>,
    other_pages_delay: Option<Duration>,
    failure: Option<PageFailure>,
}

#[derive(Debug, Clone)]
struct PageFailure {
    after_pages: usize,
    error: DbError,
    reason: String,
}

impl Table {
    pub fn new(metadata: ResultMetadata, rows: Vec<Row>) -> Self {
        Self {
            metadata: Arc::new(metadata),
            rows,
            warnings: Vec::new(),
            first_page_delay: None,
            other_pages_delay: None,
            failure: None,
        }
    }

    /// A single `int` column holding `0..count`.
    pub fn with_int_rows(keyspace: &str, table: &str, column: &str, count: i32) -> Self {
        let metadata = ResultMetadata::new(vec![ColumnSpec::new(
            column,
            ColumnType::Int,
            TableSpec::new(keyspace, table),
        )]);
        let rows = (0..count)
            .map(|value| Row {
                columns: vec![Some(Bytes::copy_from_slice(&value.to_be_bytes()))],
            })
            .collect();
        Self::new(metadata, rows)
    }

    /// Holds back the first page for `delay`.
    pub fn with_first_page_delay(mut self, delay: Duration) -> Self {
        self.first_page_delay = Some(delay);
        self
    }

    /// Holds back every page but the first for `delay`.
    pub fn with_other_pages_delay(mut self, delay: Duration) -> Self {
        self.other_pages_delay = Some(delay);
        self
    }

    /// Attaches a warning to every page.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Answers with `error` instead of the page following the first `after_pages` pages.
    pub fn failing_after(mut self, after_pages: usize, error: DbError, reason: impl Into<String>) -> Self {
        self.failure = Some(PageFailure {
            after_pages,
            error,
            reason: reason.into(),
        });
        self
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub(crate) fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn page_delay(&self, page_index: usize) -> Option<Duration> {
        if page_index == 0 {
            self.first_page_delay
        } else {
            self.other_pages_delay
        }
    }

    /// The error replacing the page at `page_index`, if the table fails there.
    pub(crate) fn failure_at(&self, page_index: usize) -> Option<(DbError, &str)> {
        self.failure
            .as_ref()
            .filter(|failure| failure.after_pages == page_index)
            .map(|failure| (failure.error.clone(), failure.reason.as_str()))
    }

    /// The end of the page starting at row `start`. Pages hold at least one row.
    pub(crate) fn page_end(&self, start: usize, page_size: Option<i32>, in_bytes: bool) -> usize {
        let len = self.rows.len();
        let Some(page_size) = page_size.and_then(|size| usize::try_from(size).ok()).filter(|&s| s > 0)
        else {
            return len;
        };
        if !in_bytes {
            return start.saturating_add(page_size).min(len);
        }
        let mut end = start;
        let mut size = 0;
        while end < len {
            size += row_size(&self.rows[end]);
            if size > page_size && end > start {
                break;
            }
            end += 1;
        }
        end
    }

    /// The index of the page starting at row `start`.
    pub(crate) fn page_index(&self, start: usize, page_size: Option<i32>, in_bytes: bool) -> usize {
        let mut index = 0;
        let mut offset = 0;
        while offset < start {
            let end = self.page_end(offset, page_size, in_bytes);
            if end == offset {
                break;
            }
            offset = end;
            index += 1;
        }
        index
    }

    /// A classic page, with the offset of the next page as its paging state.
    pub(crate) fn classic_page(&self, start: usize, end: usize) -> Rows {
        let paging_state_response = if end < self.rows.len() {
            PagingStateResponse::HasMorePages {
                state: encode_offset(end),
            }
        } else {
            PagingStateResponse::NoMorePages
        };
        self.rows_between(start, end, paging_state_response, None)
    }

    /// A page of a continuous paging stream.
    pub(crate) fn continuous_page(&self, start: usize, end: usize, page: ContinuousPageInfo) -> Rows {
        self.rows_between(start, end, PagingStateResponse::NoMorePages, Some(page))
    }

    fn rows_between(
        &self,
        start: usize,
        end: usize,
        paging_state_response: PagingStateResponse,
        continuous_page: Option<ContinuousPageInfo>,
    ) -> Rows {
        let rows = self.rows.get(start..end).unwrap_or_default().to_vec();
        Rows {
            metadata: Arc::clone(&self.metadata),
            paging_state_response,
            continuous_page,
            rows_count: rows.len(),
            serialized_size: rows.iter().map(row_size).sum(),
            rows,
        }
    }
}

fn row_size(row: &Row) -> usize {
    row.columns
        .iter()
        .map(|cell| 4 + cell.as_ref().map_or(0, Bytes::len))
        .sum()
}

fn encode_offset(offset: usize) -> PagingState {
    let offset = i32::try_from(offset).unwrap_or(i32::MAX);
    PagingState::new_from_raw_bytes(offset.to_be_bytes().to_vec())
}

/// Reads back a paging state made by the node. `None` when it was not made by the node.
pub(crate) fn decode_offset(paging_state: &PagingState) -> Option<usize> {
    match paging_state.as_bytes_slice() {
        None => Some(0),
        Some(raw) => {
            let raw: [u8; 4] = raw.as_ref().try_into().ok()?;
            usize::try_from(i32::from_be_bytes(raw)).ok()
        }
    }
}
