//! Connection-level plumbing: stream ids, the in-flight registry, the handshake,
//! transports, and the connection with its router task.

mod connection;
pub mod handshake;
pub(crate) mod in_flight;
pub mod stream_id;
pub mod transport;

pub use connection::{
    connect, open_connection, Connection, ConnectionConfig, VerifiedKeyspaceName,
};
pub use handshake::{
    ConnectionState, HandshakeAction, HandshakeController, HandshakeOptions, HandshakeRequest,
    HandshakeStep,
};
pub use in_flight::ConnectionDiagnostics;
pub(crate) use in_flight::{RequestId, ResponseResult, TaskResponse};
pub use stream_id::{StreamIdGenerator, UnallocatedStreamId};
pub use transport::{
    BoxedTransport, Connector, PipelineInstaller, PlainPipeline, TcpConnector, Transport,
};
#[cfg(feature = "rustls-023")]
pub use transport::RustlsPipeline;
