use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use sluice_cql::frame::request::options;
use sluice_cql::frame::request::query::QueryParameters;
use sluice_cql::frame::request::{Query, Request, Revise, Startup};
use sluice_cql::frame::response::authenticate::{AuthChallenge, AuthSuccess, Authenticate};
use sluice_cql::frame::response::error::{DbError, Error};
use sluice_cql::frame::response::result::{ContinuousPageInfo, Result as CqlResult, SetKeyspace};
use sluice_cql::frame::response::Response;
use sluice_cql::frame::protocol_version::unsupported_version_message;
use sluice_cql::frame::{Compression, FrameParams, ProtocolVersion, FLAG_COMPRESSION, FLAG_TRACING};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::actions::{EvaluationContext, RequestReaction, RequestRule};
use crate::errors::{MockError, WorkerError};
use crate::frame::{
    read_request_frame, write_response_frame, RequestFrame, RequestOpcode, ResponseFrame,
};
use crate::table::{decode_offset, Table};

/// The authenticator the node announces when it requires credentials.
pub const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// The token sent in every authentication challenge. A challenge is answered
/// by sending the token back.
pub const CHALLENGE_NONCE: &[u8] = b"nonce";

const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: String,
    challenges: usize,
}

impl Credentials {
    fn token(&self) -> Vec<u8> {
        let mut token = Vec::with_capacity(2 + self.username.len() + self.password.len());
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        token
    }
}

/// Builds a [`MockNode`].
#[derive(Debug, Clone)]
pub struct MockNodeBuilder {
    supported_versions: Vec<ProtocolVersion>,
    compression: Vec<Compression>,
    credentials: Option<Credentials>,
    tables: HashMap<String, Arc<Table>>,
}

impl Default for MockNodeBuilder {
    fn default() -> Self {
        Self {
            supported_versions: ProtocolVersion::ALL.to_vec(),
            compression: vec![Compression::Lz4, Compression::Snappy],
            credentials: None,
            tables: HashMap::new(),
        }
    }
}

impl MockNodeBuilder {
    /// Protocol versions the node accepts. All known versions by default.
    pub fn supported_versions(mut self, versions: &[ProtocolVersion]) -> Self {
        self.supported_versions = versions.to_vec();
        self
    }

    /// Compression algorithms listed in SUPPORTED. Both by default.
    pub fn compression(mut self, compression: &[Compression]) -> Self {
        self.compression = compression.to_vec();
        self
    }

    /// Requires the driver to log in with the given credentials.
    pub fn password_auth(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials {
            username: username.to_owned(),
            password: password.to_owned(),
            challenges: 0,
        });
        self
    }

    /// Sends `challenges` challenges after the credentials are accepted.
    pub fn auth_challenges(mut self, challenges: usize) -> Self {
        if let Some(credentials) = &mut self.credentials {
            credentials.challenges = challenges;
        }
        self
    }

    /// Serves `table` for queries whose text is exactly `query`.
    pub fn table(mut self, query: impl Into<String>, table: Table) -> Self {
        self.tables.insert(query.into(), Arc::new(table));
        self
    }

    pub fn build(self) -> MockNode {
        MockNode {
            inner: Arc::new(NodeInner {
                supported_versions: self.supported_versions,
                compression: self.compression,
                credentials: self.credentials,
                tables: self.tables,
                rules: Mutex::new(Vec::new()),
                connection_seq: AtomicUsize::new(0),
                log: RequestLog::default(),
            }),
        }
    }
}

struct NodeInner {
    supported_versions: Vec<ProtocolVersion>,
    compression: Vec<Compression>,
    credentials: Option<Credentials>,
    tables: HashMap<String, Arc<Table>>,
    rules: Mutex<Vec<RequestRule>>,
    connection_seq: AtomicUsize,
    log: RequestLog,
}

/// An in-memory node speaking the CQL protocol, for tests of the driver.
///
/// The node negotiates versions, compression and authentication like a real one,
/// answers `USE` with SET_KEYSPACE and serves configured [`Table`]s with classic
/// or continuous paging. Every request is recorded in its [`RequestLog`], and
/// [`RequestRule`]s can delay, drop or replace requests.
#[derive(Clone)]
pub struct MockNode {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for MockNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNode")
            .field("supported_versions", &self.inner.supported_versions)
            .field("compression", &self.inner.compression)
            .field("tables", &self.inner.tables.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MockNode {
    pub fn builder() -> MockNodeBuilder {
        MockNodeBuilder::default()
    }

    /// Replaces the request rules. `None` removes all of them.
    pub fn change_request_rules(&self, rules: Option<Vec<RequestRule>>) {
        *self.inner.rules.lock().unwrap() = rules.unwrap_or_default();
    }

    /// Requests received so far, across all connections.
    pub fn log(&self) -> &RequestLog {
        &self.inner.log
    }

    /// How many connections the node accepted.
    pub fn connections_accepted(&self) -> usize {
        self.inner.connection_seq.load(Ordering::Relaxed)
    }

    /// Opens an in-memory connection to the node and returns the driver's end.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect(&self) -> DuplexStream {
        let (driver_end, node_end) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);
        let node = self.clone();
        tokio::spawn(async move {
            if let Err(err) = node.serve(node_end).await {
                debug!(error = %err, "Mock connection finished");
            }
        });
        driver_end
    }

    /// Accepts TCP connections on `address` until the runtime shuts down.
    /// Returns the address actually bound.
    pub async fn listen(&self, address: SocketAddr) -> Result<SocketAddr, MockError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| MockError::Listen(address, err))?;
        let bound = listener
            .local_addr()
            .map_err(|err| MockError::Listen(address, err))?;
        info!(address = %bound, "Mock node listening");

        let node = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        trace!(%peer, "Accepted driver connection");
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(err) = node.serve(socket).await {
                                debug!(%peer, error = %err, "Mock connection finished");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %MockError::Accept(bound, err), "Mock node stops listening");
                        return;
                    }
                }
            }
        });
        Ok(bound)
    }

    /// Serves one driver connection until either side closes it.
    pub async fn serve(
        &self,
        transport: impl AsyncRead + AsyncWrite + Send + 'static,
    ) -> Result<(), WorkerError> {
        let seq_no = self.inner.connection_seq.fetch_add(1, Ordering::Relaxed);
        let (mut reader, mut writer) = tokio::io::split(transport);
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                match message {
                    Outgoing::Frame(frame, compression) => {
                        write_response_frame(&frame, compression, &mut writer)
                            .await
                            .map_err(WorkerError::Write)?;
                    }
                    Outgoing::Close => break,
                }
            }
            let _ = writer.shutdown().await;
            Ok::<_, WorkerError>(())
        });

        let ctx = Arc::new(ConnectionContext {
            node: Arc::clone(&self.inner),
            seq_no,
            outgoing,
            closing: Notify::new(),
            state: Mutex::new(ConnectionState::default()),
        });

        let result = loop {
            let compression = ctx.state.lock().unwrap().compression;
            let frame = tokio::select! {
                biased;
                _ = ctx.closing.notified() => break Ok(()),
                frame = read_request_frame(&mut reader, compression) => frame,
            };
            match frame {
                Ok(frame) => ctx.on_frame(frame),
                Err(err) => break Err(WorkerError::DriverDisconnected(err)),
            }
        };

        ctx.close();
        match writer_task.await {
            Ok(Err(err)) => return Err(err),
            Ok(Ok(())) | Err(_) => {}
        }
        result
    }
}

/// A request as received by a [`MockNode`].
#[derive(Debug, Clone)]
pub struct LoggedRequest {
    /// The sequence number of the connection, counted from 0.
    pub connection: usize,
    pub params: FrameParams,
    pub opcode: RequestOpcode,
    /// The parsed request, if the node speaks its version and could parse it.
    pub request: Option<Request<'static>>,
    pub custom_payload: Option<HashMap<String, Bytes>>,
    pub received_at: Instant,
}

/// Requests received by a [`MockNode`], in arrival order.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    entries: Arc<Mutex<Vec<LoggedRequest>>>,
}

impl RequestLog {
    fn push(&self, request: LoggedRequest) {
        self.entries.lock().unwrap().push(request);
    }

    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.entries.lock().unwrap().clone()
    }

    /// How many requests with `opcode` arrived.
    pub fn count(&self, opcode: RequestOpcode) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.opcode == opcode)
            .count()
    }

    /// Every REVISE_REQUEST received.
    pub fn revisions(&self) -> Vec<Revise> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|entry| match &entry.request {
                Some(Request::Revise(revise)) => Some(*revise),
                _ => None,
            })
            .collect()
    }

    /// Every QUERY received.
    pub fn queries(&self) -> Vec<Query<'static>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|entry| match &entry.request {
                Some(Request::Query(query)) => Some(query.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

enum Outgoing {
    Frame(ResponseFrame, Option<Compression>),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AuthState {
    #[default]
    NotStarted,
    AwaitingCredentials,
    Challenging {
        remaining: usize,
    },
    Ready,
}

#[derive(Default)]
struct ConnectionState {
    compression: Option<Compression>,
    auth: AuthState,
    sessions: HashMap<i16, mpsc::UnboundedSender<SessionControl>>,
}

enum SessionControl {
    Credit(usize),
    Cancel,
}

struct ConnectionContext {
    node: Arc<NodeInner>,
    seq_no: usize,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closing: Notify,
    state: Mutex<ConnectionState>,
}

impl ConnectionContext {
    fn on_frame(self: &Arc<Self>, frame: RequestFrame) {
        let version = frame
            .protocol_version()
            .filter(|version| self.node.supported_versions.contains(version));
        let request = version.and_then(|version| frame.deserialize(version).ok());
        trace!(
            connection = self.seq_no,
            stream = frame.params.stream,
            opcode = ?frame.opcode,
            "Received request"
        );
        self.node.log.push(LoggedRequest {
            connection: self.seq_no,
            params: frame.params,
            opcode: frame.opcode,
            request,
            custom_payload: frame.custom_payload.clone(),
            received_at: Instant::now(),
        });

        let Some(version) = version else {
            self.refuse_version(frame.params);
            return;
        };

        let ctx = EvaluationContext {
            connection_seq_no: self.seq_no,
            opcode: frame.opcode,
            frame_body: frame.body.clone(),
        };
        let reaction = self
            .node
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|RequestRule(condition, _)| condition.eval(&ctx))
            .map(|RequestRule(_, reaction)| reaction.clone())
            .unwrap_or_else(RequestReaction::noop);
        self.react(frame, version, reaction);
    }

    fn react(self: &Arc<Self>, frame: RequestFrame, version: ProtocolVersion, reaction: RequestReaction) {
        if let Some(action) = reaction.to_sender {
            let ctx = Arc::clone(self);
            let frame = frame.clone();
            self.run_after(action.delay, move || {
                if let Some(forge) = action.msg_processor {
                    ctx.send(forge(frame));
                }
            });
        }
        if let Some(action) = reaction.to_node {
            let ctx = Arc::clone(self);
            let frame = frame.clone();
            self.run_after(action.delay, move || {
                let frame = match action.msg_processor {
                    Some(process) => process(frame),
                    None => frame,
                };
                ctx.handle(frame, version);
            });
        }
        if let Some(delay) = reaction.drop_connection {
            let ctx = Arc::clone(self);
            self.run_after(delay, move || ctx.close());
        }
    }

    fn run_after(&self, delay: Option<Duration>, f: impl FnOnce() + Send + 'static) {
        match delay {
            None => f(),
            Some(delay) => {
                tokio::spawn(async move {
                    sleep(delay).await;
                    f();
                });
            }
        }
    }

    fn close(&self) {
        let sessions = std::mem::take(&mut self.state.lock().unwrap().sessions);
        drop(sessions);
        let _ = self.outgoing.send(Outgoing::Close);
        self.closing.notify_one();
    }

    // Returns false once the connection is closed.
    fn send(&self, mut frame: ResponseFrame) -> bool {
        let compression = self.state.lock().unwrap().compression;
        if compression.is_some() {
            frame.params.flags |= FLAG_COMPRESSION;
        }
        self.outgoing.send(Outgoing::Frame(frame, compression)).is_ok()
    }

    fn respond(&self, request_params: FrameParams, response: Response, warnings: &[String]) -> bool {
        let tracing_id = (request_params.flags & FLAG_TRACING != 0).then(|| {
            Uuid::from_u128(((self.seq_no as u128) << 16) | u128::from(request_params.stream as u16))
        });
        let frame = ResponseFrame::forged(request_params, &response)
            .and_then(|frame| frame.with_extensions(tracing_id, warnings));
        match frame {
            Ok(frame) => self.send(frame),
            Err(err) => {
                warn!(error = %err, "Failed to serialize a response");
                false
            }
        }
    }

    fn respond_error(&self, request_params: FrameParams, error: DbError, reason: impl Into<String>) {
        self.respond(request_params, Response::Error(Error::new(error, reason)), &[]);
    }

    fn refuse_version(&self, request_params: FrameParams) {
        let requested = request_params.version & 0x7F;
        let reason = unsupported_version_message(requested, &self.node.supported_versions);
        debug!(connection = self.seq_no, requested, "Refusing protocol version");
        let highest = self
            .node
            .supported_versions
            .iter()
            .max()
            .copied()
            .unwrap_or(ProtocolVersion::V4);
        let params = FrameParams {
            version: highest.code(),
            ..request_params
        };
        self.respond_error(params, DbError::ProtocolError, reason);
        self.close();
    }

    fn handle(self: &Arc<Self>, frame: RequestFrame, version: ProtocolVersion) {
        let params = frame.params;
        let request = match frame.deserialize(version) {
            Ok(request) => request,
            Err(err) => {
                self.respond_error(params, DbError::ProtocolError, format!("Malformed request: {err}"));
                return;
            }
        };
        match request {
            Request::Options => self.on_options(params),
            Request::Startup(startup) => self.on_startup(params, startup),
            Request::AuthResponse(auth) => self.on_auth_response(params, auth.response),
            Request::Query(query) => self.on_query(params, query, version),
            Request::Revise(revise) => self.on_revise(params, revise),
            _ => self.respond_error(params, DbError::ProtocolError, "Unsupported request"),
        }
    }

    fn on_options(&self, params: FrameParams) {
        let mut supported = HashMap::new();
        supported.insert(
            options::COMPRESSION.to_owned(),
            self.node
                .compression
                .iter()
                .map(|compression| compression.as_str().to_owned())
                .collect(),
        );
        supported.insert(options::CQL_VERSION.to_owned(), vec!["3.4.5".to_owned()]);
        supported.insert(
            options::PROTOCOL_VERSIONS.to_owned(),
            self.node
                .supported_versions
                .iter()
                .map(|version| format!("{}/{}", version.code(), version))
                .collect(),
        );
        match ResponseFrame::forged_supported(params, &supported) {
            Ok(frame) => {
                self.send(frame);
            }
            Err(err) => warn!(error = %err, "Failed to serialize SUPPORTED"),
        }
    }

    fn on_startup(&self, params: FrameParams, startup: Startup<'_>) {
        if self.state.lock().unwrap().auth != AuthState::NotStarted {
            self.respond_error(params, DbError::ProtocolError, "Unexpected message STARTUP");
            return;
        }
        let compression = match startup.options.get(options::COMPRESSION) {
            None => None,
            Some(name) => match Compression::from_name(name)
                .filter(|compression| self.node.compression.contains(compression))
            {
                Some(compression) => Some(compression),
                None => {
                    self.respond_error(
                        params,
                        DbError::ProtocolError,
                        format!("Unknown compression algorithm: {name}"),
                    );
                    return;
                }
            },
        };

        let auth = match &self.node.credentials {
            Some(_) => {
                let authenticate = Response::Authenticate(Authenticate {
                    authenticator_name: PASSWORD_AUTHENTICATOR.to_owned(),
                });
                self.respond(params, authenticate, &[]);
                AuthState::AwaitingCredentials
            }
            None => {
                self.send(ResponseFrame::forged_ready(params));
                AuthState::Ready
            }
        };
        // Set after answering, as the answer to STARTUP is never compressed.
        let mut state = self.state.lock().unwrap();
        state.compression = compression;
        state.auth = auth;
    }

    fn on_auth_response(&self, params: FrameParams, token: Option<Vec<u8>>) {
        let Some(credentials) = &self.node.credentials else {
            self.respond_error(params, DbError::ProtocolError, "Unexpected message AUTH_RESPONSE");
            return;
        };
        let auth = self.state.lock().unwrap().auth;
        let (next, response) = match auth {
            AuthState::AwaitingCredentials if token.as_deref() == Some(&credentials.token()[..]) => {
                Self::after_round(credentials.challenges)
            }
            AuthState::AwaitingCredentials => {
                let reason = format!(
                    "Provided username {} and/or password are incorrect",
                    username_of(token.as_deref())
                );
                (
                    AuthState::AwaitingCredentials,
                    Response::Error(Error::new(DbError::AuthenticationError, reason)),
                )
            }
            AuthState::Challenging { remaining } if token.as_deref() == Some(CHALLENGE_NONCE) => {
                Self::after_round(remaining)
            }
            AuthState::Challenging { remaining } => (
                AuthState::Challenging { remaining },
                Response::Error(Error::new(
                    DbError::AuthenticationError,
                    "Wrong answer to the authentication challenge",
                )),
            ),
            AuthState::NotStarted | AuthState::Ready => {
                self.respond_error(params, DbError::ProtocolError, "Unexpected message AUTH_RESPONSE");
                return;
            }
        };
        self.respond(params, response, &[]);
        self.state.lock().unwrap().auth = next;
    }

    // The next state and answer after a round of authentication succeeded,
    // with `challenges` challenges still to send.
    fn after_round(challenges: usize) -> (AuthState, Response) {
        match challenges {
            0 => (
                AuthState::Ready,
                Response::AuthSuccess(AuthSuccess {
                    success_message: None,
                }),
            ),
            remaining => (
                AuthState::Challenging {
                    remaining: remaining - 1,
                },
                Response::AuthChallenge(AuthChallenge {
                    authenticate_message: Some(CHALLENGE_NONCE.to_vec()),
                }),
            ),
        }
    }

    fn on_query(self: &Arc<Self>, params: FrameParams, query: Query<'_>, version: ProtocolVersion) {
        if self.state.lock().unwrap().auth != AuthState::Ready {
            self.respond_error(
                params,
                DbError::ProtocolError,
                "Query received before the connection was ready",
            );
            return;
        }
        let contents = query.contents.trim();
        if let Some(keyspace) = parse_use(contents) {
            let set_keyspace = CqlResult::SetKeyspace(SetKeyspace {
                keyspace_name: keyspace,
            });
            self.respond(params, Response::Result(set_keyspace), &[]);
            return;
        }
        let Some(table) = self.node.tables.get(contents).cloned() else {
            if starts_with_ignore_case(contents, "SELECT") {
                self.respond_error(params, DbError::Invalid, format!("unconfigured table for query: {contents}"));
            } else {
                self.respond(params, Response::Result(CqlResult::Void), &[]);
            }
            return;
        };

        if query.parameters.continuous_paging.is_some() && version.supports_continuous_paging() {
            self.start_continuous(params, table, query.parameters, version);
        } else {
            self.serve_classic(params, table, &query.parameters);
        }
    }

    fn serve_classic(self: &Arc<Self>, params: FrameParams, table: Arc<Table>, parameters: &QueryParameters) {
        let Some(start) = decode_offset(&parameters.paging_state) else {
            self.respond_error(params, DbError::ProtocolError, "Invalid value for the paging state");
            return;
        };
        let page_size = parameters.page_size;
        let page_index = table.page_index(start, page_size, false);
        let response = match table.failure_at(page_index) {
            Some((error, reason)) => Response::Error(Error::new(error, reason)),
            None => {
                let end = table.page_end(start, page_size, false);
                Response::Result(CqlResult::Rows(table.classic_page(start, end)))
            }
        };
        let ctx = Arc::clone(self);
        self.run_after(table.page_delay(page_index), move || {
            ctx.respond(params, response, table.warnings());
        });
    }

    fn start_continuous(
        self: &Arc<Self>,
        params: FrameParams,
        table: Arc<Table>,
        parameters: QueryParameters,
        version: ProtocolVersion,
    ) {
        let (control, control_rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(params.stream, control);
        debug!(
            connection = self.seq_no,
            stream = params.stream,
            "Starting continuous paging session"
        );
        let ctx = Arc::clone(self);
        tokio::spawn(ctx.stream_pages(params, table, parameters, version, control_rx));
    }

    fn on_revise(&self, params: FrameParams, revise: Revise) {
        let target = revise.target_stream();
        let control = match revise {
            Revise::CancelContinuousPaging { .. } => SessionControl::Cancel,
            Revise::MoreContinuousPages { next_pages, .. } => {
                SessionControl::Credit(usize::try_from(next_pages).unwrap_or(0))
            }
        };
        let delivered = self
            .state
            .lock()
            .unwrap()
            .sessions
            .get(&target)
            .is_some_and(|session| session.send(control).is_ok());
        trace!(target_stream = target, delivered, ?revise, "Revision received");
        self.respond(params, Response::Result(CqlResult::Void), &[]);
    }

    fn end_session(&self, stream: i16) {
        self.state.lock().unwrap().sessions.remove(&stream);
    }

    async fn stream_pages(
        self: Arc<Self>,
        params: FrameParams,
        table: Arc<Table>,
        parameters: QueryParameters,
        version: ProtocolVersion,
        mut control: mpsc::UnboundedReceiver<SessionControl>,
    ) {
        let options = parameters.continuous_paging.unwrap_or_default();
        let mut credit = PageCredit {
            limited: version.supports_page_credits() && options.next_pages > 0,
            available: usize::try_from(options.next_pages).unwrap_or(0),
        };
        let max_pages = usize::try_from(options.max_pages).ok().filter(|&max| max > 0);
        let interval = u32::try_from(options.max_pages_per_second)
            .ok()
            .filter(|&rate| rate > 0)
            .map(|rate| Duration::from_secs(1) / rate);
        let page_size = parameters.page_size;
        let in_bytes = parameters.page_size_in_bytes;

        let mut start = 0;
        let mut page_index = 0;
        let mut next_send = Instant::now();
        loop {
            let page_number = i32::try_from(page_index + 1).unwrap_or(i32::MAX);
            let cancelled = !credit.wait(&mut control, None).await
                || !credit
                    .wait(
                        &mut control,
                        table
                            .page_delay(page_index)
                            .map(|delay| Instant::now() + delay)
                            .max(Some(next_send)),
                    )
                    .await;
            if cancelled {
                debug!(stream = params.stream, page_number, "Continuous paging cancelled");
                self.end_session(params.stream);
                let confirmation = table.continuous_page(
                    start,
                    start,
                    ContinuousPageInfo {
                        page_number,
                        last: true,
                    },
                );
                self.respond(params, Response::Result(CqlResult::Rows(confirmation)), &[]);
                return;
            }

            if let Some((error, reason)) = table.failure_at(page_index) {
                self.end_session(params.stream);
                self.respond_error(params, error, reason);
                return;
            }

            let end = table.page_end(start, page_size, in_bytes);
            let last = end >= table.rows().len() || max_pages.is_some_and(|max| page_index + 1 >= max);
            if last {
                self.end_session(params.stream);
            }
            let page = table.continuous_page(start, end, ContinuousPageInfo { page_number, last });
            trace!(stream = params.stream, page_number, last, "Sending continuous page");
            if !self.respond(params, Response::Result(CqlResult::Rows(page)), table.warnings()) || last {
                return;
            }

            credit.consume();
            start = end;
            page_index += 1;
            if let Some(interval) = interval {
                next_send = Instant::now() + interval;
            }
        }
    }
}

struct PageCredit {
    limited: bool,
    available: usize,
}

impl PageCredit {
    fn consume(&mut self) {
        self.available = self.available.saturating_sub(1);
    }

    // Returns false once the stream is cancelled.
    fn absorb(&mut self, control: SessionControl) -> bool {
        match control {
            SessionControl::Credit(pages) => {
                self.available = self.available.saturating_add(pages);
                true
            }
            SessionControl::Cancel => false,
        }
    }

    // Waits until a page may be sent: there is credit for it, and `not_before` passed.
    // Returns false if the stream was cancelled in the meantime.
    async fn wait(
        &mut self,
        control: &mut mpsc::UnboundedReceiver<SessionControl>,
        not_before: Option<Instant>,
    ) -> bool {
        loop {
            while let Ok(message) = control.try_recv() {
                if !self.absorb(message) {
                    return false;
                }
            }
            let has_credit = !self.limited || self.available > 0;
            let wait_until = not_before.filter(|&at| at > Instant::now());
            if has_credit && wait_until.is_none() {
                return true;
            }
            tokio::select! {
                message = control.recv() => match message {
                    Some(message) => {
                        if !self.absorb(message) {
                            return false;
                        }
                    }
                    None => return false,
                },
                _ = sleep_until(wait_until.unwrap_or_else(Instant::now)), if has_credit => {}
            }
        }
    }
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .is_some_and(|start| start.eq_ignore_ascii_case(prefix))
}

/// The keyspace named by a `USE` statement, lowercased unless quoted.
fn parse_use(query: &str) -> Option<String> {
    if !starts_with_ignore_case(query, "USE ") {
        return None;
    }
    let name = query[4..].trim().trim_end_matches(';').trim();
    Some(
        match name.strip_prefix('"').and_then(|name| name.strip_suffix('"')) {
            Some(quoted) => quoted.replace("\"\"", "\""),
            None => name.to_lowercase(),
        },
    )
}

fn username_of(token: Option<&[u8]>) -> String {
    token
        .and_then(|token| token.split(|&byte| byte == 0).nth(1))
        .map(|username| String::from_utf8_lossy(username).into_owned())
        .unwrap_or_default()
}
