use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error, trace, warn};

use super::handshake::{
    ConnectionState, HandshakeAction, HandshakeController, HandshakeOptions, HandshakeRequest,
    HandshakeStep,
};
use super::in_flight::{
    ConnectionDiagnostics, Deadline, FrameDisposition, InFlightRegistry, RequestId,
    ResponseHandler, ResponseResult, TaskResponse, WriteDecision, OLD_AGE_ORPHAN_THRESHOLD,
};
use super::transport::{BoxedTransport, Connector, PipelineInstaller, PlainPipeline, TcpConnector};
use crate::authentication::{AuthError, AuthenticatorProvider, AuthenticatorSession};
use crate::client::continuous::ContinuousResultStream;
use crate::client::result_set::AsyncContinuousResultSet;
use crate::client::ContinuousPagingConfig;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    ConnectionInitError, ConnectionInitErrorKind, CqlEventHandlingError, NextPageError,
    RequestError,
};
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{AuthResponse, Options, Query, SerializableRequest, Startup};
use crate::frame::response::event::Event;
use crate::frame::response::Response;
use crate::frame::{
    self, is_final_continuous_frame, Compression, ProtocolVersion, SerializedRequest,
};
use crate::response::{parse_response, QueryResponse};
use crate::statement::{QueryPaging, Statement};

/// Settings of a single connection, shared by all the connections opened with it.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// The version proposed in the handshake. A lower one may be negotiated.
    pub protocol_version: ProtocolVersion,
    /// Bounds establishing the transport and installing the pipeline.
    pub connect_timeout: Duration,
    /// Bounds each handshake step, apart from setting the keyspace.
    pub init_query_timeout: Duration,
    /// Bounds setting the keyspace during the handshake.
    pub set_keyspace_timeout: Duration,
    /// The number of stream ids, i.e. concurrent requests, of one connection.
    pub max_requests_per_connection: usize,
    /// The default deadline of requests sent after the handshake.
    pub request_timeout: Option<Duration>,
    /// The preferred compression, used only if the server supports it.
    pub compression: Option<Compression>,
    /// The keyspace to set during the handshake.
    pub keyspace: Option<String>,
    /// Whether [`keyspace`](Self::keyspace) is quoted, i.e. case sensitive.
    pub keyspace_case_sensitive: bool,
    /// Creates authenticator sessions when the server asks for authentication.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// How often to send keepalive requests. `None` disables them.
    pub keepalive_interval: Option<Duration>,
    /// How long a keepalive request may stay unanswered before the connection is
    /// considered broken. `None` waits forever.
    pub keepalive_timeout: Option<Duration>,
    /// Receives the events the server pushes on stream id -1.
    pub event_sender: Option<mpsc::Sender<Event>>,
    /// Sets `TCP_NODELAY` on connections opened with [`connect`].
    pub tcp_nodelay: bool,
    /// Enables TCP keepalive on connections opened with [`connect`].
    pub tcp_keepalive_interval: Option<Duration>,
    /// Sent as `DRIVER_NAME` in STARTUP.
    pub driver_name: String,
    /// Sent as `DRIVER_VERSION` in STARTUP.
    pub driver_version: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::DseV2,
            connect_timeout: Duration::from_secs(5),
            init_query_timeout: Duration::from_secs(5),
            set_keyspace_timeout: Duration::from_secs(2),
            max_requests_per_connection: 1024,
            request_timeout: Some(Duration::from_secs(12)),
            compression: None,
            keyspace: None,
            keyspace_case_sensitive: false,
            authenticator: None,
            keepalive_interval: None,
            keepalive_timeout: None,
            event_sender: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            driver_name: frame::request::options::DEFAULT_DRIVER_NAME.to_owned(),
            driver_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("protocol_version", &self.protocol_version)
            .field("connect_timeout", &self.connect_timeout)
            .field("init_query_timeout", &self.init_query_timeout)
            .field("set_keyspace_timeout", &self.set_keyspace_timeout)
            .field(
                "max_requests_per_connection",
                &self.max_requests_per_connection,
            )
            .field("request_timeout", &self.request_timeout)
            .field("compression", &self.compression)
            .field("keyspace", &self.keyspace)
            .field("keyspace_case_sensitive", &self.keyspace_case_sensitive)
            .field("authenticator", &self.authenticator.is_some())
            .field("keepalive_interval", &self.keepalive_interval)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("event_sender", &self.event_sender.is_some())
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("driver_name", &self.driver_name)
            .field("driver_version", &self.driver_version)
            .finish()
    }
}

impl ConnectionConfig {
    /// Sets the protocol version proposed in the handshake.
    pub fn with_protocol_version(mut self, protocol_version: ProtocolVersion) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the timeout of each handshake step.
    pub fn with_init_query_timeout(mut self, timeout: Duration) -> Self {
        self.init_query_timeout = timeout;
        self
    }

    /// Sets the timeout of setting the keyspace.
    pub fn with_set_keyspace_timeout(mut self, timeout: Duration) -> Self {
        self.set_keyspace_timeout = timeout;
        self
    }

    /// Sets the number of stream ids.
    pub fn with_max_requests_per_connection(mut self, max_requests: usize) -> Self {
        self.max_requests_per_connection = max_requests;
        self
    }

    /// Sets the default request deadline.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the preferred compression.
    pub fn with_compression(mut self, compression: Option<Compression>) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the keyspace to use.
    pub fn with_keyspace(mut self, keyspace: impl Into<String>, case_sensitive: bool) -> Self {
        self.keyspace = Some(keyspace.into());
        self.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Sets the authenticator provider.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn AuthenticatorProvider>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Sets the keepalive interval and timeout.
    pub fn with_keepalive(mut self, interval: Option<Duration>, timeout: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    /// Sets the channel receiving server events.
    pub fn with_event_sender(mut self, event_sender: mpsc::Sender<Event>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    /// Builds the handshake options for an attempt with `protocol_version`.
    pub fn handshake_options(
        &self,
        protocol_version: ProtocolVersion,
    ) -> Result<HandshakeOptions, BadKeyspaceName> {
        let keyspace = self
            .keyspace
            .clone()
            .map(|keyspace| VerifiedKeyspaceName::new(keyspace, self.keyspace_case_sensitive))
            .transpose()?;
        Ok(HandshakeOptions {
            protocol_version,
            compression: self.compression,
            keyspace,
            driver_name: self.driver_name.clone(),
            driver_version: self.driver_version.clone(),
        })
    }
}

// Used to listen for fatal error in connection
struct Task {
    serialized_request: SerializedRequest,
    stream_id: i16,
    request_id: RequestId,
}

/// The receiving end of a continuous request, registered with the connection.
pub(crate) struct StreamRegistration {
    pub(crate) stream_id: i16,
    pub(crate) request_id: RequestId,
    pub(crate) receiver: mpsc::UnboundedReceiver<ResponseResult>,
}

/// The part of a connection shared between its callers and its router task.
pub(crate) struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request send by `Connection::send_request` needs a unique request id.
    // This field is a monotonic generator of such ids.
    request_id_generator: AtomicU64,
    // If a `Connection::send_request` caller is dropped before its response
    // arrives, the caller sends its request id here so that the router can
    // forget its stream id.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,

    registry: StdMutex<InFlightRegistry>,
    // Woken whenever a request with a deadline is registered.
    deadline_notify: Notify,
    protocol_version: ProtocolVersion,
    // Set once STARTUP has been accepted.
    compression: OnceLock<Compression>,
    state: watch::Sender<ConnectionState>,
    address: SocketAddr,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    pub(crate) fn compression(&self) -> Option<Compression> {
        self.compression.get().copied()
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn register(
        &self,
        request: &impl SerializableRequest,
        tracing: bool,
        handler: ResponseHandler,
        deadline: Option<Deadline>,
    ) -> Result<(SerializedRequest, i16, RequestId), RequestError> {
        let mut serialized_request =
            SerializedRequest::make(request, self.protocol_version, self.compression(), tracing)?;
        let request_id = self.allocate_request_id();
        let stream_id = self
            .registry
            .lock()
            .unwrap()
            .register(request_id, handler, deadline)?;
        if deadline.is_some() {
            self.deadline_notify.notify_one();
        }
        serialized_request.set_stream(stream_id);
        Ok((serialized_request, stream_id, request_id))
    }

    /// Sends a request answered by a single frame.
    pub(crate) async fn send_request(
        &self,
        request: &impl SerializableRequest,
        tracing: bool,
        deadline: Option<Deadline>,
    ) -> Result<TaskResponse, RequestError> {
        let (response_sender, receiver) = oneshot::channel();
        let (serialized_request, stream_id, request_id) = self.register(
            request,
            tracing,
            ResponseHandler::Single(response_sender),
            deadline,
        )?;

        // If this future is dropped after the request is submitted, the notifier
        // tells the router to forget the request.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                stream_id,
                request_id,
            })
            .await
            .map_err(|_| -> RequestError {
                BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelError).into()
            })?;

        let task_response = receiver.await.map_err(|_| -> RequestError {
            BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelError).into()
        })?;

        // Response was successfully received, so it's time to disable
        // notification about orphaning.
        notifier.disable();

        task_response
    }

    /// Sends a continuous request, answered by frames until a final one.
    ///
    /// The caller owns the registration: it must call [`Self::notify_orphaned`]
    /// if it stops listening before the final frame.
    pub(crate) async fn send_stream_request(
        &self,
        request: &impl SerializableRequest,
        tracing: bool,
    ) -> Result<StreamRegistration, RequestError> {
        let (response_sender, receiver) = mpsc::unbounded_channel();
        let (serialized_request, stream_id, request_id) = self.register(
            request,
            tracing,
            ResponseHandler::Stream(response_sender),
            None,
        )?;

        let submitted = self
            .submit_channel
            .send(Task {
                serialized_request,
                stream_id,
                request_id,
            })
            .await;
        if submitted.is_err() {
            self.notify_orphaned(request_id);
            return Err(
                BrokenConnectionError::from(BrokenConnectionErrorKind::ChannelError).into(),
            );
        }

        Ok(StreamRegistration {
            stream_id,
            request_id,
            receiver,
        })
    }

    /// Tells the router that nobody listens for the responses to `request_id` anymore.
    pub(crate) fn notify_orphaned(&self, request_id: RequestId) {
        let _ = self.orphan_notification_sender.send(request_id);
    }
}

/// Sends the request id of a request to the router on drop, unless disabled.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

/// A connection to one node, multiplexing concurrent requests over one transport.
///
/// A connection is usable once [`open_connection`] has taken it through the
/// handshake. All the I/O happens on a router task spawned on the current tokio
/// runtime; dropping the connection stops the task and fails whatever is pending.
pub struct Connection {
    _worker_handle: RemoteHandle<()>,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,
    close_sender: StdMutex<Option<oneshot::Sender<()>>>,
    diagnostics: Arc<ConnectionDiagnostics>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address())
            .field("state", &self.state())
            .field("protocol_version", &self.protocol_version())
            .field("compression", &self.compression())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Starts the router over an established transport. The connection is left in
    /// the `Connecting` state; requests are refused until a handshake completes.
    fn new(
        address: SocketAddr,
        transport: BoxedTransport,
        config: ConnectionConfig,
        protocol_version: ProtocolVersion,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(1024);
        let (orphan_notification_sender, orphan_notification_receiver) =
            mpsc::unbounded_channel();
        let (close_sender, close_receiver) = oneshot::channel();
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let diagnostics = Arc::new(ConnectionDiagnostics::default());

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
            registry: StdMutex::new(InFlightRegistry::new(
                config.max_requests_per_connection,
                diagnostics.clone(),
            )),
            deadline_notify: Notify::new(),
            protocol_version,
            compression: OnceLock::new(),
            state,
            address,
        });

        let (task, worker_handle) = Self::router(
            transport,
            receiver,
            orphan_notification_receiver,
            close_receiver,
            router_handle.clone(),
            RouterSettings {
                event_sender: config.event_sender.clone(),
                keepalive_interval: config.keepalive_interval,
                keepalive_timeout: config.keepalive_timeout,
            },
        )
        .remote_handle();
        tokio::task::spawn(task);

        Self {
            _worker_handle: worker_handle,
            config,
            router_handle,
            close_sender: StdMutex::new(Some(close_sender)),
            diagnostics,
        }
    }

    /// The lifecycle state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.router_handle.state()
    }

    /// A receiver observing every state change of the connection.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.router_handle.state.subscribe()
    }

    /// The address of the node.
    pub fn address(&self) -> SocketAddr {
        self.router_handle.address
    }

    /// The protocol version negotiated in the handshake.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.router_handle.protocol_version
    }

    /// The compression negotiated in the handshake.
    pub fn compression(&self) -> Option<Compression> {
        self.router_handle.compression()
    }

    /// The configuration the connection was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Counters of the things that went wrong on the connection without breaking it.
    pub fn diagnostics(&self) -> &ConnectionDiagnostics {
        &self.diagnostics
    }

    /// Requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.router_handle.registry.lock().unwrap().pending_count()
    }

    /// Stream ids currently allocated, including those of abandoned requests
    /// whose response has not arrived yet.
    pub fn stream_ids_in_use(&self) -> usize {
        self.router_handle.registry.lock().unwrap().stream_ids_in_use()
    }

    pub(crate) fn router_handle(&self) -> &Arc<RouterHandle> {
        &self.router_handle
    }

    pub(crate) fn ensure_ready(&self) -> Result<(), RequestError> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(RequestError::NotConnected(state)),
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// `timeout` bounds the wait; `None` falls back to
    /// [`ConnectionConfig::request_timeout`]. Fails at once with
    /// [`RequestError::NotConnected`] unless the connection is `Ready`, and with
    /// [`RequestError::StreamExhausted`] when all stream ids are in use.
    pub async fn send_request(
        &self,
        request: &impl SerializableRequest,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestError> {
        self.ensure_ready()?;
        let timeout = timeout.or(self.config.request_timeout);
        self.send_request_unchecked(request, false, timeout).await
    }

    async fn send_request_unchecked(
        &self,
        request: &impl SerializableRequest,
        tracing: bool,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestError> {
        let task_response = self
            .router_handle
            .send_request(request, tracing, timeout.map(Deadline::after))
            .await?;
        Ok(parse_response(task_response, self.compression())?)
    }

    /// Runs a statement unpaged and returns its single response.
    ///
    /// Database errors are returned as [`RequestError::DbError`].
    pub async fn query(&self, statement: &Statement) -> Result<QueryResponse, RequestError> {
        self.ensure_ready()?;
        let query = statement.to_query(QueryPaging::default());
        let timeout = statement.timeout.or(self.config.request_timeout);
        self.send_request_unchecked(&query, statement.tracing, timeout)
            .await?
            .into_non_error()
    }

    /// Starts a paged query, with continuous paging where the protocol supports it.
    ///
    /// Returns once the query is dispatched; pages are read from the returned stream.
    pub async fn execute_continuous(
        self: &Arc<Self>,
        statement: Statement,
        paging_config: ContinuousPagingConfig,
    ) -> Result<ContinuousResultStream, NextPageError> {
        ContinuousResultStream::start(self, statement, paging_config).await
    }

    /// Starts a paged query and waits for its first page.
    pub async fn execute_async(
        self: &Arc<Self>,
        statement: Statement,
        paging_config: ContinuousPagingConfig,
    ) -> Result<AsyncContinuousResultSet, NextPageError> {
        let stream = self.execute_continuous(statement, paging_config).await?;
        AsyncContinuousResultSet::first(stream).await
    }

    /// Closes the connection: pending requests fail with
    /// [`RequestError::ConnectionClosed`] and the transport is released.
    ///
    /// Returns once the connection is `Closed`, or `Failed` if it broke first.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        let close_sender = self.close_sender.lock().unwrap().take();
        if let Some(close_sender) = close_sender {
            self.router_handle.state.send_if_modified(|state| {
                if state.is_terminal() {
                    false
                } else {
                    *state = ConnectionState::Closing;
                    true
                }
            });
            if close_sender.send(()).is_err() {
                // The router is gone already.
                self.finish(RequestError::ConnectionClosed, ConnectionState::Closed);
            }
        }
        let mut state = self.subscribe_state();
        let _ = state.wait_for(|state| state.is_terminal()).await;
    }

    fn finish(&self, error: RequestError, state: ConnectionState) {
        self.router_handle.registry.lock().unwrap().drain(error);
        self.router_handle.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn publish_state(&self, state: ConnectionState) {
        self.router_handle.state.send_if_modified(|current| {
            if current.is_terminal() || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn enable_compression(&self, compression: Option<Compression>) {
        if let Some(compression) = compression {
            let _ = self.router_handle.compression.set(compression);
        }
    }

    async fn perform_handshake(
        &self,
        mut controller: HandshakeController,
    ) -> Result<(), ConnectionInitError> {
        let result = self.drive_handshake(&mut controller).await;
        self.publish_state(controller.state());
        result
    }

    async fn drive_handshake(
        &self,
        controller: &mut HandshakeController,
    ) -> Result<(), ConnectionInitError> {
        let mut session: Option<Box<dyn AuthenticatorSession>> = None;
        let mut action = controller.start()?;
        loop {
            self.publish_state(controller.state());
            action = match action {
                HandshakeAction::Send(request) => {
                    let step = controller.current_step();
                    let step_timeout = match step {
                        HandshakeStep::UseKeyspace => self.config.set_keyspace_timeout,
                        _ => self.config.init_query_timeout,
                    };
                    let response = match self.send_handshake_request(request, step_timeout).await {
                        Ok(response) => response,
                        Err(RequestError::Timeout(timeout)) => {
                            return Err(
                                controller.fail(ConnectionInitErrorKind::StepTimeout(timeout))
                            );
                        }
                        Err(err) => {
                            return Err(controller.fail(ConnectionInitErrorKind::RequestError(err)))
                        }
                    };
                    let next = controller.on_response(response)?;
                    if step == HandshakeStep::Startup {
                        // Frames after the one accepting STARTUP are compressed.
                        self.enable_compression(controller.negotiated_compression());
                    }
                    next
                }
                HandshakeAction::StartAuthentication { authenticator_name } => {
                    let Some(provider) = self.config.authenticator.clone() else {
                        return Err(controller.fail(ConnectionInitErrorKind::MissingAuthentication));
                    };
                    let started = self
                        .authentication_step(
                            provider.start_authentication_session(&authenticator_name),
                        )
                        .await;
                    let (initial_response, new_session) =
                        started.map_err(|kind| controller.fail(kind))?;
                    session = Some(new_session);
                    controller.on_authenticator_token(initial_response)?
                }
                HandshakeAction::EvaluateChallenge(challenge) => {
                    let Some(session) = session.as_mut() else {
                        return Err(controller.fail(ConnectionInitErrorKind::MissingAuthentication));
                    };
                    let answer = self
                        .authentication_step(session.evaluate_challenge(challenge.as_deref()))
                        .await
                        .map_err(|kind| controller.fail(kind))?;
                    controller.on_authenticator_token(answer)?
                }
                HandshakeAction::FinishAuthentication(token) => {
                    let Some(session) = session.as_mut() else {
                        return Err(controller.fail(ConnectionInitErrorKind::MissingAuthentication));
                    };
                    self.authentication_step(session.success(token.as_deref()))
                        .await
                        .map_err(|kind| controller.fail(kind))?;
                    controller.on_authentication_finished()?
                }
                HandshakeAction::Complete { compression } => {
                    self.enable_compression(compression);
                    return Ok(());
                }
            };
        }
    }

    async fn authentication_step<T>(
        &self,
        step: impl Future<Output = Result<T, AuthError>>,
    ) -> Result<T, ConnectionInitErrorKind> {
        let timeout = self.config.init_query_timeout;
        match tokio::time::timeout(timeout, step).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(ConnectionInitErrorKind::AuthenticatorFailure(err)),
            Err(_) => Err(ConnectionInitErrorKind::StepTimeout(timeout)),
        }
    }

    async fn send_handshake_request(
        &self,
        request: HandshakeRequest,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        let timeout = Some(timeout);
        let response = match request {
            HandshakeRequest::Options => {
                self.send_request_unchecked(&Options, false, timeout).await?
            }
            HandshakeRequest::Startup(options) => {
                let startup = Startup {
                    options: options
                        .into_iter()
                        .map(|(key, value)| (Cow::Owned(key), Cow::Owned(value)))
                        .collect(),
                };
                self.send_request_unchecked(&startup, false, timeout).await?
            }
            HandshakeRequest::AuthResponse(response) => {
                self.send_request_unchecked(&AuthResponse { response }, false, timeout)
                    .await?
            }
            HandshakeRequest::UseKeyspace(keyspace) => {
                let query = Query {
                    contents: Cow::Owned(keyspace.use_statement()),
                    parameters: QueryParameters::default(),
                    custom_payload: None,
                };
                self.send_request_unchecked(&query, false, timeout).await?
            }
        };
        Ok(response.response)
    }

    async fn router(
        transport: BoxedTransport,
        task_receiver: mpsc::Receiver<Task>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        close_receiver: oneshot::Receiver<()>,
        router_handle: Arc<RouterHandle>,
        settings: RouterSettings,
    ) {
        let address = router_handle.address;
        let (read_half, write_half) = split(transport);

        // Why are we using a mutex here?
        //
        // The reader, the sweeper and the orphaner run on the router task, but stream
        // ids are allocated by the callers, on whatever thread they run. Locks are
        // held for short, non-awaiting sections only.
        let registry = &router_handle.registry;

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &router_handle,
            settings.event_sender,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            registry,
            task_receiver,
        );
        let s = Self::sweeper(registry, &router_handle.deadline_notify);
        let o = Self::orphaner(registry, orphan_notification_receiver);
        let k = Self::keepaliver(
            &router_handle,
            settings.keepalive_interval,
            settings.keepalive_timeout,
        );

        let workers = async { futures::try_join!(r, w, s, o, k).map(|_| ()) };

        let outcome = tokio::select! {
            result = workers => result,
            _ = close_receiver => Ok(()),
        };

        match outcome {
            Ok(()) => {
                debug!("[{}] Connection closed", address);
                router_handle
                    .registry
                    .lock()
                    .unwrap()
                    .drain(RequestError::ConnectionClosed);
                router_handle.state.send_replace(ConnectionState::Closed);
            }
            Err(err) => {
                error!("[{}] Connection broken: {}", address, err);
                router_handle
                    .registry
                    .lock()
                    .unwrap()
                    .drain(RequestError::BrokenConnection(err));
                router_handle.state.send_replace(ConnectionState::Failed);
            }
        }
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        router_handle: &RouterHandle,
        event_sender: Option<mpsc::Sender<Event>>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameHeaderParseError)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
                received_at: tokio::time::Instant::now(),
            };

            match params.stream.cmp(&-1) {
                std::cmp::Ordering::Less => {
                    // The protocol reserves negative-numbered streams for server-generated
                    // events. As of writing this driver, there are no other negative
                    // streams used apart from -1, so ignore it.
                    continue;
                }
                std::cmp::Ordering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, router_handle.compression(), event_sender)
                            .await?;
                    }
                    continue;
                }
                _ => {}
            }

            // Pages are classified outside the lock, as that may need decompressing them.
            let compression = router_handle.compression();
            let expects_pages = router_handle
                .registry
                .lock()
                .unwrap()
                .expects_pages(params.stream);
            let final_page = expects_pages.then(|| {
                is_final_continuous_frame(
                    response.opcode,
                    response.params,
                    compression,
                    response.body.clone(),
                )
            });
            let disposition = router_handle
                .registry
                .lock()
                .unwrap()
                .complete(response, final_page, compression);
            if disposition == FrameDisposition::Unknown {
                trace!(
                    stream_id = params.stream,
                    "Dropped frame with unknown stream id"
                );
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        registry: &StdMutex<InFlightRegistry>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half
        // of the channel will be dropped, this task will return an error
        // and the whole worker will be stopped
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                let decision = registry
                    .lock()
                    .unwrap()
                    .prepare_write(task.stream_id, task.request_id);
                if decision == WriteDecision::Write {
                    let data = task.serialized_request.get_data();
                    write_half
                        .write_all(data)
                        .await
                        .map_err(BrokenConnectionErrorKind::WriteError)?;
                    num_requests += 1;
                    total_sent += data.len();
                } else {
                    trace!(
                        stream_id = task.stream_id,
                        request_id = task.request_id,
                        "Skipping write of an abandoned request"
                    );
                }
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                }
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    // Fails requests whose deadline has passed.
    async fn sweeper(
        registry: &StdMutex<InFlightRegistry>,
        deadline_notify: &Notify,
    ) -> Result<(), BrokenConnectionError> {
        let mut timer = crate::utils::timer::DeadlineTimer::new();
        loop {
            let next_deadline = registry
                .lock()
                .unwrap()
                .sweep_expired(tokio::time::Instant::now());
            match next_deadline {
                Some(deadline) => timer.arm_if_earlier(deadline),
                None => timer.disarm(),
            }
            tokio::select! {
                _ = &mut timer => {}
                _ = deadline_notify.notified() => {}
            }
        }
    }

    // This task receives notifications from `OrphanhoodNotifier`s and tries to
    // orphan the corresponding stream ids.
    async fn orphaner(
        registry: &StdMutex<InFlightRegistry>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let overload = registry.lock().unwrap().orphan_overload();
                    if let Some(reason) = overload {
                        warn!("Giving up on orphaned stream ids: {}", reason);
                        return Err(reason.into());
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    registry.lock().unwrap().orphan(request_id);
                }
                else => { break }
            }
        }
        Ok(())
    }

    async fn keepaliver(
        router_handle: &RouterHandle,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
    ) -> Result<(), BrokenConnectionError> {
        async fn issue_keepalive_query(router_handle: &RouterHandle) -> Result<(), RequestError> {
            router_handle
                .send_request(&Options, false, None)
                .await
                .map(|_| ())
        }

        let Some(keepalive_interval) = keepalive_interval else {
            // No keepalives are to be sent.
            return futures::future::pending().await;
        };
        let address = router_handle.address;

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Use up the first, instant tick.

        // Default behaviour (Burst) is not suitable for sending keepalives.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive_query = issue_keepalive_query(router_handle);
            let query_result = if let Some(timeout) = keepalive_timeout {
                match tokio::time::timeout(timeout, keepalive_query).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to keepalive request on connection to node {}",
                            address
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout(address).into());
                    }
                }
            } else {
                keepalive_query.await
            };

            if let Err(err) = query_result {
                warn!(
                    "Failed to execute keepalive request on connection to node {} - {}",
                    address, err
                );
                return Err(BrokenConnectionErrorKind::KeepaliveRequestError(err).into());
            }

            trace!(
                "Keepalive request successful on connection to node {}",
                address
            );
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        let response = parse_response(task_response, compression)
            .map_err(CqlEventHandlingError::ResponseParseError)?
            .response;
        let event = match response {
            Response::Event(event) => event,
            _ => {
                error!("Expected to receive Event response, got {:?}", response);
                return Err(CqlEventHandlingError::UnexpectedResponse(
                    response.to_response_kind(),
                )
                .into());
            }
        };

        event_sender
            .send(event)
            .await
            .map_err(|_| CqlEventHandlingError::SendError.into())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The router stops with the worker handle; nothing may wait for it anymore.
        self.finish(RequestError::ConnectionClosed, ConnectionState::Closed);
    }
}

struct RouterSettings {
    event_sender: Option<mpsc::Sender<Event>>,
    keepalive_interval: Option<Duration>,
    keepalive_timeout: Option<Duration>,
}

/// Opens a connection and takes it through the handshake.
///
/// If the server refuses the configured protocol version, the attempt is repeated
/// once, over a fresh transport, with the highest version both sides support.
pub async fn open_connection(
    connector: &dyn Connector,
    installer: &dyn PipelineInstaller,
    config: &ConnectionConfig,
) -> Result<Arc<Connection>, ConnectionError> {
    let address = connector.address();
    let first_attempt =
        open_connection_with_version(connector, installer, config, config.protocol_version).await;

    let err = match first_attempt {
        Err(ConnectionError::ConnectionInitError(err)) => err,
        other => return other,
    };
    let ConnectionInitErrorKind::UnsupportedProtocolVersion {
        attempted,
        supported,
    } = &err.kind
    else {
        return Err(err.into());
    };
    let Some(lower) = attempted.negotiate_down(supported) else {
        return Err(err.into());
    };

    debug!(
        "[{}] Protocol version {} refused, retrying with {}",
        address, attempted, lower
    );
    open_connection_with_version(connector, installer, config, lower).await
}

async fn open_connection_with_version(
    connector: &dyn Connector,
    installer: &dyn PipelineInstaller,
    config: &ConnectionConfig,
    protocol_version: ProtocolVersion,
) -> Result<Arc<Connection>, ConnectionError> {
    let handshake_options = config.handshake_options(protocol_version)?;

    let establish = async {
        let transport = connector.connect().await?;
        installer
            .install(transport)
            .await
            .map_err(|err| ConnectionError::PipelineInstall(Arc::new(err)))
    };
    let transport = tokio::time::timeout(config.connect_timeout, establish)
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)??;

    let connection = Connection::new(
        connector.address(),
        transport,
        config.clone(),
        protocol_version,
    );
    connection
        .perform_handshake(HandshakeController::new(handshake_options))
        .await?;

    debug!(
        "[{}] Connection ready, protocol version {}, compression {:?}",
        connection.address(),
        protocol_version,
        connection.compression()
    );
    Ok(Arc::new(connection))
}

/// Opens a TCP connection to `address`, without TLS.
pub async fn connect(
    address: SocketAddr,
    config: &ConnectionConfig,
) -> Result<Arc<Connection>, ConnectionError> {
    let connector = TcpConnector::new(address)
        .with_tcp_nodelay(config.tcp_nodelay)
        .with_tcp_keepalive_interval(config.tcp_keepalive_interval);
    open_connection(&connector, &PlainPipeline, config).await
}

/// This type can only hold a valid keyspace name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VerifiedKeyspaceName {
    name: Arc<String>,
    is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    /// Checks the name: 1 to 48 characters, alphanumeric or `_`.
    pub fn new(keyspace_name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    /// The name, as given.
    pub fn as_str(&self) -> &str {
        self.name.as_str()
    }

    /// Whether the name is quoted in `USE`.
    pub fn is_case_sensitive(&self) -> bool {
        self.is_case_sensitive
    }

    pub(crate) fn use_statement(&self) -> String {
        // Trying to pass keyspace as bound value in "USE ?" doesn't work
        // So we have to create a string for query: "USE " + new_keyspace
        // To avoid any possible CQL injections it's good to verify that the name is valid
        if self.is_case_sensitive {
            format!("USE \"{}\"", self.as_str())
        } else {
            format!("USE {}", self.as_str())
        }
    }

    // "Keyspace names can have up to 48 alphanumeric characters and contain underscores;
    // only letters and numbers are supported as the first character."
    // Despite that the server accepts underscore as first character so we do too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        // Verify that length <= 48
        let keyspace_name_len: usize = keyspace_name.chars().count(); // Only ascii allowed so it's equal to .len()
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        // Verify all chars are alphanumeric or underscore
        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}
