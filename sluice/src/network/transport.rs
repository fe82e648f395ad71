//! Transports that connections run over.
//!
//! Opening a connection happens in two stages: a [`Connector`] establishes a raw
//! byte stream, and a [`PipelineInstaller`] wraps it into whatever the connection
//! should talk through (e.g. TLS). Tests plug in in-memory pipes at either stage.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// A type-erased [`Transport`].
pub type BoxedTransport = Box<dyn Transport>;

/// Establishes raw transports to one node.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new transport. Called once per connection attempt.
    async fn connect(&self) -> io::Result<BoxedTransport>;

    /// The address of the node, used in logs and errors.
    fn address(&self) -> SocketAddr;
}

/// Wraps a freshly established transport before the handshake starts.
#[async_trait]
pub trait PipelineInstaller: Send + Sync {
    /// Returns the transport the connection should use instead of `transport`.
    async fn install(&self, transport: BoxedTransport) -> io::Result<BoxedTransport>;
}

/// Uses the transport as it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainPipeline;

#[async_trait]
impl PipelineInstaller for PlainPipeline {
    async fn install(&self, transport: BoxedTransport) -> io::Result<BoxedTransport> {
        Ok(transport)
    }
}

/// Connects over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: SocketAddr,
    tcp_nodelay: bool,
    tcp_keepalive_interval: Option<Duration>,
}

impl TcpConnector {
    /// A connector to `address`, with `TCP_NODELAY` set and no TCP keepalive.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
        }
    }

    /// Sets `TCP_NODELAY` on the sockets.
    pub fn with_tcp_nodelay(mut self, tcp_nodelay: bool) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    /// Enables TCP keepalive, probing once the socket is idle for `interval`.
    pub fn with_tcp_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.tcp_keepalive_interval = interval;
        self
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before keepalives start (socket2 calls it "time"),
        // their interval is the time between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // These cfg values are taken from socket2 library, which uses the same constraints.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        let stream = TcpStream::connect(self.address).await?;
        stream.set_nodelay(self.tcp_nodelay)?;
        if let Some(interval) = self.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, interval)?;
        }
        Ok(Box::new(stream))
    }

    fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Wraps the transport in a TLS session, using rustls.
#[cfg(feature = "rustls-023")]
#[derive(Clone)]
pub struct RustlsPipeline {
    connector: tokio_rustls::TlsConnector,
    server_name: rustls::pki_types::ServerName<'static>,
}

#[cfg(feature = "rustls-023")]
impl RustlsPipeline {
    /// A pipeline verifying the server against `server_name`.
    pub fn new(
        config: std::sync::Arc<rustls::ClientConfig>,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Self {
        Self {
            connector: tokio_rustls::TlsConnector::from(config),
            server_name,
        }
    }

    /// A pipeline verifying the server against its IP address.
    pub fn for_address(config: std::sync::Arc<rustls::ClientConfig>, address: SocketAddr) -> Self {
        Self::new(
            config,
            rustls::pki_types::ServerName::IpAddress(address.ip().into()),
        )
    }
}

#[cfg(feature = "rustls-023")]
#[async_trait]
impl PipelineInstaller for RustlsPipeline {
    async fn install(&self, transport: BoxedTransport) -> io::Result<BoxedTransport> {
        let stream = self
            .connector
            .connect(self.server_name.clone(), transport)
            .await?;
        Ok(Box::new(stream))
    }
}
