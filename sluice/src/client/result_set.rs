//! Page-at-a-time and row-at-a-time views of a [`ContinuousResultStream`].

use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::timeout_at;
use tracing::warn;

use super::continuous::ContinuousResultStream;
use super::ContinuousPagingConfig;
use crate::errors::{NextPageError, RequestError};
use crate::frame::response::result::{ResultMetadata, Row};
use crate::network::Connection;
use crate::response::{ExecutionInfo, Page, QueryResponse};
use crate::statement::Statement;

/// One page of a paged query, with a way to fetch the next one.
#[derive(Debug)]
pub struct AsyncContinuousResultSet {
    stream: ContinuousResultStream,
    metadata: Arc<ResultMetadata>,
    execution_info: Arc<ExecutionInfo>,
    rows: std::vec::IntoIter<Row>,
}

impl AsyncContinuousResultSet {
    pub(crate) async fn first(mut stream: ContinuousResultStream) -> Result<Self, NextPageError> {
        match stream.next_page().await? {
            Some(page) => Ok(Self::from_page(stream, page)),
            None => Err(NextPageError::NoMorePages),
        }
    }

    fn from_page(stream: ContinuousResultStream, page: Page) -> Self {
        let Page {
            rows,
            metadata,
            execution_info,
            ..
        } = page;
        Self {
            stream,
            metadata,
            execution_info,
            rows: rows.into_iter(),
        }
    }

    /// Rows of this page not read yet.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Reads the next row of this page.
    pub fn one(&mut self) -> Option<Row> {
        self.rows.next()
    }

    /// Reads the rest of this page.
    pub fn rows(&mut self) -> impl Iterator<Item = Row> + '_ {
        self.rows.by_ref()
    }

    /// Column specifications of the rows.
    pub fn metadata(&self) -> &Arc<ResultMetadata> {
        &self.metadata
    }

    /// The number of this page, starting at 1.
    pub fn page_number(&self) -> i32 {
        self.execution_info.page_number
    }

    /// Whether [`fetch_next_page`](Self::fetch_next_page) can return a page.
    pub fn has_more_pages(&self) -> bool {
        self.stream.has_more_pages()
    }

    /// Metadata of this page.
    pub fn execution_info(&self) -> &Arc<ExecutionInfo> {
        &self.execution_info
    }

    /// Metadata of every page received so far.
    pub fn execution_infos(&self) -> &[Arc<ExecutionInfo>] {
        self.stream.execution_infos()
    }

    /// Stops fetching pages. Pages that already arrived can still be fetched.
    pub fn cancel(&mut self) {
        self.stream.cancel();
    }

    /// Whether the query was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.stream.is_cancelled()
    }

    /// Fetches the next page.
    ///
    /// Fails with [`NextPageError::NoMorePages`] when the query is complete and with
    /// [`NextPageError::Cancelled`] when it was cancelled and no page is left.
    pub async fn fetch_next_page(self) -> Result<Self, NextPageError> {
        let Self { mut stream, .. } = self;
        if !stream.is_cancelled() && !stream.has_more_pages() {
            return Err(NextPageError::NoMorePages);
        }
        match stream.next_page().await? {
            Some(page) => Ok(Self::from_page(stream, page)),
            None => Err(NextPageError::NoMorePages),
        }
    }

    /// Gives back the underlying stream.
    pub fn into_stream(self) -> ContinuousResultStream {
        self.stream
    }
}

/// The rows of a paged query, read by blocking the calling thread.
///
/// The first page is fetched when the result set is created. Each later fetch
/// blocks on the runtime until a page arrives or a deadline of the query
/// elapses. After an error the iterator ends.
#[derive(Debug)]
pub struct ContinuousResultSet {
    stream: ContinuousResultStream,
    runtime: Handle,
    current: std::vec::IntoIter<Row>,
    done: bool,
}

impl ContinuousResultSet {
    pub(crate) fn start(
        stream: ContinuousResultStream,
        runtime: Handle,
    ) -> Result<Self, NextPageError> {
        let mut result_set = Self {
            stream,
            runtime,
            current: Vec::new().into_iter(),
            done: false,
        };
        match result_set.fetch_page()? {
            Some(page) => result_set.current = page.into_rows().into_iter(),
            None => result_set.done = true,
        }
        Ok(result_set)
    }

    fn fetch_page(&mut self) -> Result<Option<Page>, NextPageError> {
        let Some(deadline) = self.stream.active_deadline() else {
            return self.runtime.block_on(self.stream.next_page());
        };
        let outcome = self
            .runtime
            .block_on(timeout_at(deadline.at, self.stream.next_page()));
        match outcome {
            Ok(page) => page,
            Err(_) => Err(self.stream.time_out(deadline.timeout)),
        }
    }

    /// Rows of the current page not read yet.
    pub fn remaining(&self) -> usize {
        self.current.len()
    }

    /// Reads the next row, fetching a page if needed.
    pub fn one(&mut self) -> Option<Result<Row, NextPageError>> {
        self.next()
    }

    /// Stops fetching pages. Rows that already arrived stay readable.
    pub fn cancel(&mut self) {
        self.stream.cancel();
    }

    /// Whether the query was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.stream.is_cancelled()
    }

    /// Metadata of the most recently received page.
    pub fn execution_info(&self) -> Option<&Arc<ExecutionInfo>> {
        self.stream.execution_info()
    }

    /// Metadata of every page received so far.
    pub fn execution_infos(&self) -> &[Arc<ExecutionInfo>] {
        self.stream.execution_infos()
    }

    /// Reads every remaining row.
    pub fn collect_rows(self) -> Result<Vec<Row>, NextPageError> {
        self.collect()
    }
}

impl Iterator for ContinuousResultSet {
    type Item = Result<Row, NextPageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.current.next() {
                return Some(Ok(row));
            }
            if self.done {
                return None;
            }
            match self.fetch_page() {
                Ok(Some(page)) => self.current = page.into_rows().into_iter(),
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

/// A connection driven from synchronous code.
///
/// Every method blocks the calling thread on the runtime the connection runs on,
/// so it must not be called from within that runtime's tasks.
///
/// The runtime must be a multi-thread one. Blocking through a [`Handle`] does not
/// drive the IO and timer drivers of a current-thread runtime, so calls would
/// never complete there. The same holds for the [`ContinuousResultSet`]s it returns.
#[derive(Debug, Clone)]
pub struct BlockingConnection {
    connection: Arc<Connection>,
    runtime: Handle,
}

impl BlockingConnection {
    /// Wraps a connection running on `runtime`, which must be a multi-thread runtime.
    pub fn new(connection: Arc<Connection>, runtime: Handle) -> Self {
        if runtime.runtime_flavor() == RuntimeFlavor::CurrentThread {
            warn!(
                address = %connection.address(),
                "Blocking connection on a current-thread runtime, its calls will not make progress"
            );
        }
        Self {
            connection,
            runtime,
        }
    }

    /// The wrapped connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Starts a paged query and waits for its first page.
    pub fn execute(
        &self,
        statement: Statement,
        paging_config: ContinuousPagingConfig,
    ) -> Result<ContinuousResultSet, NextPageError> {
        let stream = self
            .runtime
            .block_on(self.connection.execute_continuous(statement, paging_config))?;
        ContinuousResultSet::start(stream, self.runtime.clone())
    }

    /// Runs a statement unpaged.
    pub fn query(&self, statement: &Statement) -> Result<QueryResponse, RequestError> {
        self.runtime.block_on(self.connection.query(statement))
    }

    /// Closes the connection.
    pub fn close(&self) {
        self.runtime.block_on(self.connection.close());
    }
}
