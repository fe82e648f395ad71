//! The paging state machine behind the result façades.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Stream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, trace, warn};

use super::{ContinuousPagingConfig, PagingMode};
use crate::errors::{BadPagingConfig, NextPageError, ProtocolAnomaly, RequestError};
use crate::frame::request::query::{ContinuousPagingOptions, PagingState, PagingStateResponse};
use crate::frame::request::Revise;
use crate::frame::response::result::{self, ResultMetadata, Row, Rows};
use crate::frame::response::Response;
use crate::frame::{is_final_continuous_frame, Compression};
use crate::network::in_flight::Deadline;
use crate::network::{Connection, RequestId, ResponseResult, TaskResponse};
use crate::response::{parse_response, ExecutionInfo, Page};
use crate::statement::{QueryPaging, Statement};

/// Where a [`ContinuousResultStream`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Pages may still arrive.
    Active,
    /// [`ContinuousResultStream::cancel`] was called.
    Cancelled,
    /// The global or a per-fetch deadline elapsed.
    TimedOut,
    /// Every page was delivered.
    Exhausted,
    /// A page could not be fetched.
    Failed,
}

impl StreamState {
    /// Whether no page will be fetched anymore.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StreamState::Active)
    }
}

/// A snapshot of the flow-control window of a stream.
///
/// `buffered + holding + outstanding` never exceeds `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    /// Pages received and not yet handed out.
    pub buffered: usize,
    /// Whether the caller holds the page handed out last.
    pub holding: bool,
    /// Pages the server has credit for but has not sent.
    pub outstanding: usize,
    /// The configured window.
    pub window: usize,
}

impl FlowControl {
    /// Pages counted against the window.
    pub fn in_use(&self) -> usize {
        self.buffered + usize::from(self.holding) + self.outstanding
    }
}

enum PageSource {
    // All pages arrive on one stream id, as long as the server has credit.
    Continuous {
        stream_id: i16,
        request_id: RequestId,
        receiver: mpsc::UnboundedReceiver<ResponseResult>,
    },
    // One QUERY per page, resumed from the last paging state.
    Classic {
        page_size: Option<i32>,
        paging_state: PagingState,
    },
}

/// Credit the server was granted but never got, since sending the REVISE failed.
#[derive(Debug)]
struct LostGrant {
    pages: usize,
    error: RequestError,
}

/// Spaces out credit grants when the page rate is capped.
#[derive(Debug)]
struct GrantPacer {
    interval: Duration,
    next: Instant,
}

impl GrantPacer {
    fn new(max_pages_per_second: i32, now: Instant) -> Option<Self> {
        let per_second = u32::try_from(max_pages_per_second).ok().filter(|&n| n > 0)?;
        Some(Self {
            interval: Duration::from_secs(1) / per_second,
            next: now,
        })
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next = now + self.interval;
        true
    }

    fn next_grant(&self) -> Instant {
        self.next
    }
}

/// The pages of one query, fetched ahead of consumption within a bounded window.
///
/// With continuous paging all pages arrive on the stream id of the original QUERY,
/// and the stream grants the server credit for more pages as the caller consumes
/// them. Otherwise pages are fetched one QUERY at a time.
///
/// Dropping an active stream cancels it.
pub struct ContinuousResultStream {
    connection: Weak<Connection>,
    runtime: Handle,
    coordinator: SocketAddr,
    compression: Option<Compression>,
    statement: Statement,
    config: ContinuousPagingConfig,
    source: PageSource,

    state: StreamState,
    terminal_error: Option<NextPageError>,

    buffered: VecDeque<Page>,
    // The caller holds the page handed out last. It counts against the window
    // until the caller asks for the next one.
    holding_page: bool,
    outstanding: usize,
    pages_received: usize,
    last_page_number: i32,
    // The server sent its final frame; the stream id is no longer ours.
    last_received: bool,
    abandoned: bool,

    global_deadline: Option<Deadline>,
    pacer: Option<GrantPacer>,
    execution_infos: Vec<Arc<ExecutionInfo>>,

    lost_grant_sender: mpsc::UnboundedSender<LostGrant>,
    lost_grants: mpsc::UnboundedReceiver<LostGrant>,
}

impl std::fmt::Debug for ContinuousResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousResultStream")
            .field("coordinator", &self.coordinator)
            .field("stream_id", &self.stream_id())
            .field("state", &self.state)
            .field("flow_control", &self.flow_control())
            .field("pages_received", &self.pages_received)
            .finish_non_exhaustive()
    }
}

impl ContinuousResultStream {
    pub(crate) async fn start(
        connection: &Arc<Connection>,
        statement: Statement,
        config: ContinuousPagingConfig,
    ) -> Result<Self, NextPageError> {
        config.validate()?;
        connection.ensure_ready()?;

        let protocol_version = connection.protocol_version();
        let continuous = match config.mode {
            PagingMode::Disabled => false,
            PagingMode::Auto => protocol_version.supports_page_credits(),
            PagingMode::Enabled => {
                if !protocol_version.supports_page_credits() {
                    warn!(
                        ?protocol_version,
                        "Continuous paging is not available, falling back to classic paging"
                    );
                }
                protocol_version.supports_page_credits()
            }
        };
        if config.page_size_in_bytes {
            if statement.is_graph() {
                return Err(BadPagingConfig::PageSizeInBytesUnsupported("for graph statements").into());
            }
            if !continuous && config.mode != PagingMode::Disabled {
                return Err(
                    BadPagingConfig::PageSizeInBytesUnsupported("without continuous paging").into(),
                );
            }
        }

        let now = Instant::now();
        let global_deadline = statement.timeout.or(config.timeout).map(Deadline::after);
        let mut pacer = GrantPacer::new(config.max_pages_per_second, now);
        let mut outstanding = 0;

        let source = if continuous {
            let mut grant = config.max_enqueued_pages;
            if let Some(pacer) = &mut pacer {
                pacer.try_acquire(now);
                grant = 1;
            }
            if config.max_pages > 0 {
                grant = grant.min(config.max_pages as usize);
            }
            let query = statement.to_query(QueryPaging {
                page_size: Some(config.page_size),
                page_size_in_bytes: config.page_size_in_bytes,
                paging_state: PagingState::start(),
                continuous: Some(ContinuousPagingOptions {
                    max_pages: config.max_pages,
                    max_pages_per_second: config.max_pages_per_second,
                    next_pages: i32::try_from(grant).unwrap_or(i32::MAX),
                }),
            });
            let registration = connection
                .router_handle()
                .send_stream_request(&query, statement.tracing)
                .await?;
            debug!(
                stream_id = registration.stream_id,
                grant, "Started continuous paging"
            );
            outstanding = grant;
            PageSource::Continuous {
                stream_id: registration.stream_id,
                request_id: registration.request_id,
                receiver: registration.receiver,
            }
        } else {
            PageSource::Classic {
                page_size: (config.mode != PagingMode::Disabled).then_some(config.page_size),
                paging_state: PagingState::start(),
            }
        };

        let (lost_grant_sender, lost_grants) = mpsc::unbounded_channel();
        Ok(Self {
            connection: Arc::downgrade(connection),
            runtime: Handle::current(),
            coordinator: connection.address(),
            compression: connection.compression(),
            statement,
            config,
            source,
            state: StreamState::Active,
            terminal_error: None,
            buffered: VecDeque::new(),
            holding_page: false,
            outstanding,
            pages_received: 0,
            last_page_number: 0,
            last_received: false,
            abandoned: false,
            global_deadline,
            pacer,
            execution_infos: Vec::new(),
            lost_grant_sender,
            lost_grants,
        })
    }

    /// Returns the next page, or `None` once every page was delivered.
    ///
    /// Pages received before [`cancel`](Self::cancel) stay readable; after them
    /// this fails with [`NextPageError::Cancelled`]. After a timeout or a failure
    /// every call returns the error that ended the stream.
    pub async fn next_page(&mut self) -> Result<Option<Page>, NextPageError> {
        self.holding_page = false;
        loop {
            if let Some(page) = self.buffered.pop_front() {
                self.holding_page = true;
                self.grant_credits();
                return Ok(Some(page));
            }
            match self.state {
                StreamState::Active if self.last_received => {
                    self.state = StreamState::Exhausted;
                    return Ok(None);
                }
                StreamState::Active => self.fetch().await?,
                StreamState::Exhausted => return Ok(None),
                StreamState::Cancelled => return Err(NextPageError::Cancelled),
                StreamState::TimedOut | StreamState::Failed => {
                    return Err(self
                        .terminal_error
                        .clone()
                        .unwrap_or(NextPageError::Cancelled))
                }
            }
        }
    }

    /// Stops fetching pages.
    ///
    /// Pages that already arrived stay readable. The server is asked to stop
    /// producing pages, and the stream id is released once it confirms.
    pub fn cancel(&mut self) {
        if self.state != StreamState::Active {
            return;
        }
        self.drain_received();
        if self.state != StreamState::Active {
            // A drained frame ended the stream already.
            return;
        }
        self.state = StreamState::Cancelled;
        self.abandon();
        debug!(stream_id = ?self.stream_id(), "Continuous result stream cancelled");
    }

    /// Whether [`cancel`](Self::cancel) was called on an active stream.
    pub fn is_cancelled(&self) -> bool {
        self.state == StreamState::Cancelled
    }

    /// The current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The stream id pages arrive on, with continuous paging.
    pub fn stream_id(&self) -> Option<i16> {
        match &self.source {
            PageSource::Continuous { stream_id, .. } => Some(*stream_id),
            PageSource::Classic { .. } => None,
        }
    }

    /// Whether the query runs with continuous paging.
    pub fn is_continuous(&self) -> bool {
        matches!(self.source, PageSource::Continuous { .. })
    }

    /// Whether [`next_page`](Self::next_page) may still return a page.
    pub fn has_more_pages(&self) -> bool {
        !self.buffered.is_empty() || (self.state == StreamState::Active && !self.last_received)
    }

    /// Metadata of the most recently received page.
    pub fn execution_info(&self) -> Option<&Arc<ExecutionInfo>> {
        self.execution_infos.last()
    }

    /// Metadata of every received page, in arrival order.
    pub fn execution_infos(&self) -> &[Arc<ExecutionInfo>] {
        &self.execution_infos
    }

    /// The current flow-control window.
    pub fn flow_control(&self) -> FlowControl {
        FlowControl {
            buffered: self.buffered.len(),
            holding: self.holding_page,
            outstanding: self.outstanding,
            window: self.config.max_enqueued_pages,
        }
    }

    /// Turns the stream into a stream of rows.
    pub fn into_row_stream(self) -> impl Stream<Item = Result<Row, NextPageError>> {
        futures::stream::unfold(
            (self, Vec::new().into_iter(), false),
            |(mut stream, mut rows, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(row) = rows.next() {
                        return Some((Ok(row), (stream, rows, false)));
                    }
                    match stream.next_page().await {
                        Ok(Some(page)) => rows = page.into_rows().into_iter(),
                        Ok(None) => return None,
                        Err(err) => return Some((Err(err), (stream, rows, true))),
                    }
                }
            },
        )
    }

    /// The deadline a blocked caller must wake up at.
    pub(crate) fn active_deadline(&self) -> Option<Deadline> {
        self.fetch_deadline(Instant::now())
    }

    /// Ends the stream with a timeout error carrying `timeout`.
    pub(crate) fn time_out(&mut self, timeout: Duration) -> NextPageError {
        let err = NextPageError::Timeout(timeout);
        if self.state == StreamState::Active {
            debug!(stream_id = ?self.stream_id(), ?timeout, "Continuous result stream timed out");
            self.state = StreamState::TimedOut;
            self.buffered.clear();
            self.terminal_error = Some(err.clone());
            self.abandon();
        }
        err
    }

    fn fail(&mut self, err: NextPageError) -> NextPageError {
        if self.state == StreamState::Active {
            debug!(stream_id = ?self.stream_id(), error = %err, "Continuous result stream failed");
            self.state = StreamState::Failed;
            self.terminal_error = Some(err.clone());
            self.abandon();
        }
        err
    }

    fn fetch_deadline(&self, now: Instant) -> Option<Deadline> {
        let global = self.global_deadline.filter(|_| !self.last_received);
        let per_fetch = if self.pages_received == 0 {
            self.config.first_page_timeout
        } else {
            self.config.other_pages_timeout
        }
        .map(|timeout| Deadline {
            at: now + timeout,
            timeout,
        });
        match (global, per_fetch) {
            (Some(global), Some(per_fetch)) if per_fetch.at < global.at => Some(per_fetch),
            (Some(global), _) => Some(global),
            (None, per_fetch) => per_fetch,
        }
    }

    async fn fetch(&mut self) -> Result<(), NextPageError> {
        let received = match self.fetch_deadline(Instant::now()) {
            Some(deadline) => {
                let outcome = timeout_at(deadline.at, self.receive()).await;
                match outcome {
                    Ok(received) => received,
                    Err(_) => return Err(self.time_out(deadline.timeout)),
                }
            }
            None => self.receive().await,
        };
        let task = received.map_err(|err| self.fail(err))?;
        self.check_and_accept(task)
    }

    fn check_and_accept(&mut self, task: TaskResponse) -> Result<(), NextPageError> {
        let was_waiting_for_last = !self.last_received;
        if self.is_continuous()
            && is_final_continuous_frame(
                task.opcode,
                task.params,
                self.compression,
                task.body.clone(),
            )
        {
            self.last_received = true;
        }
        if let Some(global) = self.global_deadline {
            if was_waiting_for_last && task.received_at > global.at {
                return Err(self.time_out(global.timeout));
            }
        }
        self.accept(task).map_err(|err| self.fail(err))
    }

    async fn receive(&mut self) -> Result<TaskResponse, NextPageError> {
        self.await_credit().await;
        match &mut self.source {
            PageSource::Continuous { receiver, .. } => {
                let lost_grants = &mut self.lost_grants;
                let received = tokio::select! {
                    biased;
                    received = receiver.recv() => received,
                    Some(lost) = lost_grants.recv() => {
                        self.outstanding = self.outstanding.saturating_sub(lost.pages);
                        return Err(lost.error.into());
                    }
                };
                match received {
                    Some(Ok(task)) => Ok(task),
                    Some(Err(err)) => {
                        self.last_received = true;
                        Err(err.into())
                    }
                    None => {
                        self.last_received = true;
                        Err(RequestError::ConnectionClosed.into())
                    }
                }
            }
            PageSource::Classic {
                page_size,
                paging_state,
            } => {
                let connection = self
                    .connection
                    .upgrade()
                    .ok_or(RequestError::ConnectionClosed)?;
                connection.ensure_ready()?;
                let query = self.statement.to_query(QueryPaging {
                    page_size: *page_size,
                    page_size_in_bytes: false,
                    paging_state: paging_state.clone(),
                    continuous: None,
                });
                let deadline = connection.config().request_timeout.map(Deadline::after);
                Ok(connection
                    .router_handle()
                    .send_request(&query, self.statement.tracing, deadline)
                    .await?)
            }
        }
    }

    // Waits until the server has credit for at least one page.
    async fn await_credit(&mut self) {
        self.grant_credits();
        while self.is_continuous() && self.outstanding == 0 {
            let Some(pacer) = &self.pacer else {
                break;
            };
            sleep_until(pacer.next_grant()).await;
            self.grant_credits();
        }
    }

    fn accept(&mut self, task: TaskResponse) -> Result<(), NextPageError> {
        let stream_id = task.params.stream;
        let received_at = task.received_at;
        let response = parse_response(task, self.compression)?;

        let rows = match response.response {
            Response::Error(err) => {
                self.last_received = true;
                return Err(NextPageError::DbError(err.error, err.reason));
            }
            Response::Result(result::Result::Rows(rows)) => Some(rows),
            Response::Result(_) => None,
            other => {
                self.last_received = true;
                return Err(NextPageError::UnexpectedResponse(other.to_response_kind()));
            }
        };

        let (rows, metadata, page_number, mut has_more_pages) = match rows {
            Some(rows) => {
                let (page_number, has_more_pages) = self.sequence(&rows)?;
                (rows.rows, rows.metadata, page_number, has_more_pages)
            }
            None => {
                self.outstanding = 0;
                self.last_received = true;
                (
                    Vec::new(),
                    Arc::new(ResultMetadata::new(Vec::new())),
                    self.last_page_number + 1,
                    false,
                )
            }
        };

        self.last_page_number = page_number;
        self.pages_received += 1;
        if has_more_pages
            && self.config.max_pages > 0
            && self.pages_received >= self.config.max_pages as usize
        {
            trace!(page_number, "Reached max pages");
            self.abandon();
            self.last_received = true;
            has_more_pages = false;
        }

        let execution_info = Arc::new(ExecutionInfo {
            coordinator: self.coordinator,
            stream_id,
            page_number,
            tracing_id: response.tracing_id,
            warnings: response.warnings,
            custom_payload: response.custom_payload,
            received_at,
        });
        self.execution_infos.push(Arc::clone(&execution_info));
        self.buffered.push_back(Page {
            rows,
            metadata,
            has_more_pages,
            execution_info,
        });
        trace!(
            page_number,
            buffered = self.buffered.len(),
            outstanding = self.outstanding,
            "Page received"
        );
        Ok(())
    }

    // Returns the number of the page and whether more pages follow it.
    fn sequence(&mut self, rows: &Rows) -> Result<(i32, bool), NextPageError> {
        let expected = self.last_page_number + 1;
        if let PageSource::Classic { paging_state, .. } = &mut self.source {
            return Ok(match &rows.paging_state_response {
                PagingStateResponse::HasMorePages { state } => {
                    *paging_state = state.clone();
                    (expected, true)
                }
                PagingStateResponse::NoMorePages => {
                    self.last_received = true;
                    (expected, false)
                }
            });
        }

        let Some(page) = rows.continuous_page else {
            self.outstanding = 0;
            self.last_received = true;
            return Ok((expected, false));
        };
        if page.page_number < expected {
            return Err(self.anomaly(ProtocolAnomaly::DuplicatePage(page.page_number)));
        }
        if page.page_number > expected {
            return Err(self.anomaly(ProtocolAnomaly::OutOfOrderPage {
                expected,
                received: page.page_number,
            }));
        }
        if page.last {
            self.outstanding = 0;
            self.last_received = true;
        } else if self.outstanding == 0 {
            return Err(self.anomaly(ProtocolAnomaly::UncreditedPage));
        } else {
            self.outstanding -= 1;
        }
        Ok((page.page_number, !page.last))
    }

    fn anomaly(&self, anomaly: ProtocolAnomaly) -> NextPageError {
        match self.connection.upgrade() {
            Some(connection) => connection.diagnostics().record_anomaly(&anomaly),
            None => warn!(%anomaly, "Protocol anomaly on a closed connection"),
        }
        anomaly.into()
    }

    // Tops the server's credit up to the window.
    fn grant_credits(&mut self) {
        let PageSource::Continuous { stream_id, .. } = &self.source else {
            return;
        };
        let stream_id = *stream_id;
        if self.state != StreamState::Active || self.last_received || self.abandoned {
            return;
        }

        let mut grant = self
            .config
            .max_enqueued_pages
            .saturating_sub(self.flow_control().in_use());
        if self.config.max_pages > 0 {
            let left = (self.config.max_pages as usize)
                .saturating_sub(self.pages_received + self.outstanding);
            grant = grant.min(left);
        }
        if grant == 0 {
            return;
        }
        if let Some(pacer) = &mut self.pacer {
            if !pacer.try_acquire(Instant::now()) {
                return;
            }
            grant = 1;
        }

        self.outstanding += grant;
        trace!(stream_id, grant, "Granting continuous paging credit");
        self.send_revise(
            Revise::MoreContinuousPages {
                target_stream: stream_id,
                next_pages: i32::try_from(grant).unwrap_or(i32::MAX),
            },
            grant,
        );
    }

    // Moves frames that already arrived into the buffer, without waiting.
    fn drain_received(&mut self) {
        while !self.last_received {
            let PageSource::Continuous { receiver, .. } = &mut self.source else {
                return;
            };
            let Ok(received) = receiver.try_recv() else {
                return;
            };
            let accepted = match received {
                Ok(task) => self.check_and_accept(task),
                Err(err) => {
                    self.last_received = true;
                    Err(err.into())
                }
            };
            if accepted.is_err() {
                return;
            }
        }
    }

    // Stops the server and forgets the stream id, unless the server finished already.
    fn abandon(&mut self) {
        if self.abandoned || self.last_received {
            return;
        }
        self.abandoned = true;
        let PageSource::Continuous {
            stream_id,
            request_id,
            ..
        } = &self.source
        else {
            return;
        };
        let (stream_id, request_id) = (*stream_id, *request_id);
        if let Some(connection) = self.connection.upgrade() {
            connection.router_handle().notify_orphaned(request_id);
        }
        self.send_revise(
            Revise::CancelContinuousPaging {
                target_stream: stream_id,
            },
            0,
        );
    }

    // Sends `revise` in the background. If it grants `granted_pages` and fails,
    // the grant is handed back to the stream.
    fn send_revise(&self, revise: Revise, granted_pages: usize) {
        let Some(connection) = self.connection.upgrade() else {
            return;
        };
        let router = Arc::clone(connection.router_handle());
        let deadline = connection.config().request_timeout.map(Deadline::after);
        let lost_grant_sender = self.lost_grant_sender.clone();
        self.runtime.spawn(async move {
            match router.send_request(&revise, false, deadline).await {
                Ok(_) => trace!(?revise, "Revision acknowledged"),
                Err(error) => {
                    debug!(?revise, %error, "Failed to send a revision");
                    if granted_pages > 0 {
                        let _ = lost_grant_sender.send(LostGrant {
                            pages: granted_pages,
                            error,
                        });
                    }
                }
            }
        });
    }
}

impl Drop for ContinuousResultStream {
    fn drop(&mut self) {
        if self.state == StreamState::Active {
            self.abandon();
        }
    }
}
