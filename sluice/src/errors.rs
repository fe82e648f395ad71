//! This module contains various errors which can be returned by the driver.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

use crate::authentication::AuthError;
use crate::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameBodyExtensionsParseError,
    FrameHeaderParseError,
};
use crate::frame::response::CqlResponseKind;
use crate::frame::ProtocolVersion;
use crate::network::{ConnectionState, HandshakeStep};

pub use crate::frame::response::error::DbError;

/// An error that occurred when opening a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Establishing the transport did not finish within the connect timeout.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error occurred while establishing the transport.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// The pipeline installer (TLS or similar) failed on the fresh transport.
    #[error("Failed to install the transport pipeline: {0}")]
    PipelineInstall(Arc<std::io::Error>),

    /// The configured keyspace name is not a valid keyspace name.
    #[error("Invalid keyspace name: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The handshake failed.
    #[error(transparent)]
    ConnectionInitError(#[from] ConnectionInitError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

/// Invalid keyspace name given to the connection configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    /// Keyspace name is empty.
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// A handshake failure, tagged with the step that failed.
///
/// Fatal for the connection being set up.
#[derive(Error, Debug, Clone)]
#[error("Connection setup failed at step {step}: {kind}")]
pub struct ConnectionInitError {
    /// The handshake step during which the failure happened.
    pub step: HandshakeStep,
    /// The cause of the failure.
    pub kind: ConnectionInitErrorKind,
}

impl ConnectionInitError {
    pub(crate) fn new(step: HandshakeStep, kind: ConnectionInitErrorKind) -> Self {
        Self { step, kind }
    }
}

/// The cause of a [`ConnectionInitError`].
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionInitErrorKind {
    /// The step did not complete within its timeout.
    #[error("Timed out after {0:?}")]
    StepTimeout(Duration),

    /// The server refused the proposed protocol version.
    #[error(
        "Protocol version {attempted} is not supported by the server (it supports: {})",
        .supported.iter().join(", ")
    )]
    UnsupportedProtocolVersion {
        /// The version that was proposed.
        attempted: ProtocolVersion,
        /// The versions the server announced in its refusal, those known to the driver.
        supported: Vec<ProtocolVersion>,
    },

    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The server answered with a response that makes no sense at this step.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),

    /// The server asked for authentication, but no authenticator was configured.
    #[error("Server requires authentication, but no authenticator provider was set")]
    MissingAuthentication,

    /// The authenticator refused to continue.
    #[error("Authenticator failed: {0}")]
    AuthenticatorFailure(AuthError),

    /// The server confirmed a different keyspace than the one requested.
    #[error(
        "Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}"
    )]
    KeyspaceNameMismatch {
        /// The requested keyspace, lowercased.
        expected_keyspace_name_lowercase: String,
        /// The keyspace named by the server, lowercased.
        result_keyspace_name_lowercase: String,
    },

    /// Sending the request or receiving its response failed.
    #[error(transparent)]
    RequestError(#[from] RequestError),

    /// The handshake controller was driven out of order.
    #[error("Invalid handshake transition in state {0}")]
    InvalidTransition(ConnectionState),
}

/// An error that occurred while executing a single request on a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// The connection is not in the `Ready` state.
    #[error("Connection is not ready to accept requests (state: {0})")]
    NotConnected(ConnectionState),

    /// All stream ids of the connection are in use.
    #[error("Unable to allocate stream id: all stream ids of the connection are in use")]
    StreamExhausted,

    /// The connection was closed with [`Connection::close`](crate::network::Connection::close).
    #[error("Connection was closed")]
    ConnectionClosed,

    /// The connection broke while the request was pending.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The request deadline elapsed before the response arrived.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to serialize the request.
    #[error("Failed to serialize request: {0}")]
    CqlRequestSerialization(#[from] CqlRequestSerializationError),

    /// Failed to parse the response.
    #[error(transparent)]
    ResponseParseError(#[from] ResponseParseError),

    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The server answered with an unexpected response kind.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),
}

/// An error that occurred while parsing a response frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResponseParseError {
    /// Failed to parse the compression envelope or the body extensions.
    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    /// Failed to parse the response body.
    #[error(transparent)]
    CqlResponseParseError(#[from] CqlResponseParseError),
}

/// The connection's router stopped working. All pending requests fail with this error.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    /// The reason why the connection broke.
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

/// The reason why a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Reading a response frame failed.
    #[error("Failed to deserialize frame: {0}")]
    FrameHeaderParseError(FrameHeaderParseError),

    /// Writing a request frame failed.
    #[error("Failed sending request: {0}")]
    WriteError(std::io::Error),

    /// No response to a keepalive request arrived in time.
    #[error("Timed out while waiting for response to keepalive request on connection to node {0}")]
    KeepaliveTimeout(SocketAddr),

    /// A keepalive request failed.
    #[error("Failed to execute keepalive request: {0}")]
    KeepaliveRequestError(RequestError),

    /// Too many stream ids stayed orphaned for too long.
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    /// An orphaned stream id was not answered for too long.
    #[error("Stream id {stream_id} stayed orphaned for {age:?}")]
    StaleOrphanedStreamId {
        /// The orphaned stream id.
        stream_id: i16,
        /// How long ago it was orphaned.
        age: Duration,
    },

    /// A server event could not be handled.
    #[error("Failed to handle server event: {0}")]
    CqlEventHandlingError(#[from] CqlEventHandlingError),

    /// The router task is gone.
    #[error("The router task of the connection is no longer running")]
    ChannelError,
}

impl From<CqlEventHandlingError> for BrokenConnectionError {
    fn from(value: CqlEventHandlingError) -> Self {
        BrokenConnectionErrorKind::CqlEventHandlingError(value).into()
    }
}

/// Failed to handle a server EVENT frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlEventHandlingError {
    /// Failed to parse the event.
    #[error("Failed to parse the event response: {0}")]
    ResponseParseError(#[from] ResponseParseError),

    /// The frame on the event stream was not an EVENT.
    #[error("Received unexpected response on the event stream: {0}")]
    UnexpectedResponse(CqlResponseKind),

    /// The event receiver is gone.
    #[error("Failed to send event info via channel")]
    SendError,
}

/// A response that breaks the protocol's rules, detected by the client.
///
/// The offending frame is dropped and counted in
/// [`ConnectionDiagnostics`](crate::network::ConnectionDiagnostics).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolAnomaly {
    /// A frame arrived on a stream id with no registered request.
    #[error("Received response with unexpected stream id {0}")]
    UnknownStreamId(i16),

    /// A continuous page skipped ahead of the expected sequence number.
    #[error("Received continuous page {received}, expected page {expected}")]
    OutOfOrderPage {
        /// The sequence number the client expected.
        expected: i32,
        /// The sequence number the server sent.
        received: i32,
    },

    /// A continuous page with a sequence number already seen.
    #[error("Received continuous page {0} twice")]
    DuplicatePage(i32),

    /// The server sent more continuous pages than it had credit for.
    #[error("Received a continuous page without granting credit for it")]
    UncreditedPage,
}

/// Paging configuration that cannot be honoured.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadPagingConfig {
    /// Page size must be positive.
    #[error("Page size must be positive, got {0}")]
    NonPositivePageSize(i32),

    /// The flow-control window must let at least one page in.
    #[error("Max enqueued pages must be at least 1")]
    ZeroWindow,

    /// `max_pages` must not be negative.
    #[error("Max pages must not be negative, got {0}")]
    NegativeMaxPages(i32),

    /// `max_pages_per_second` must not be negative.
    #[error("Max pages per second must not be negative, got {0}")]
    NegativeMaxPagesPerSecond(i32),

    /// Page size in bytes was requested where it cannot be expressed.
    #[error("Page size in bytes is not supported {0}")]
    PageSizeInBytesUnsupported(&'static str),
}

/// An error returned when fetching the next page of a continuous result stream.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NextPageError {
    /// The global or the per-fetch deadline elapsed.
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    /// The stream was cancelled and its buffered pages were consumed.
    #[error("stream cancelled")]
    Cancelled,

    /// Sending a request or receiving a response failed.
    #[error(transparent)]
    RequestFailure(#[from] RequestError),

    /// The server broke the continuous paging protocol.
    #[error("Protocol anomaly: {0}")]
    ProtocolAnomaly(#[from] ProtocolAnomaly),

    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Failed to parse a page.
    #[error("Failed to parse the page: {0}")]
    ResultParse(#[from] ResponseParseError),

    /// The server answered with something other than a page.
    #[error("Received unexpected response from the server: {0}. Expected RESULT:Rows response.")]
    UnexpectedResponse(CqlResponseKind),

    /// The paging configuration was rejected before anything was sent.
    #[error("Bad paging configuration: {0}")]
    BadPagingConfig(#[from] BadPagingConfig),

    /// There is no page left to fetch.
    #[error("No more pages to fetch")]
    NoMorePages,
}
