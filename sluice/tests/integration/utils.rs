use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sluice::frame::response::result::Row;
use sluice::network::{BoxedTransport, Connector, PlainPipeline};
use sluice::{open_connection, Connection, ConnectionConfig};
use sluice_mock::{MockNode, Table};

pub(crate) const QUERY: &str = "SELECT v FROM ks.t";

#[cfg(test)]
pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// Connects to a [`MockNode`] through in-memory pipes, one per connection attempt.
pub(crate) struct MockConnector {
    node: MockNode,
    address: SocketAddr,
}

impl MockConnector {
    pub(crate) fn new(node: MockNode) -> Self {
        Self {
            node,
            address: SocketAddr::from(([127, 0, 0, 1], 9042)),
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> io::Result<BoxedTransport> {
        Ok(Box::new(self.node.connect()))
    }

    fn address(&self) -> SocketAddr {
        self.address
    }
}

pub(crate) async fn connect_to(
    node: &MockNode,
    config: &ConnectionConfig,
) -> Result<Arc<Connection>, sluice::errors::ConnectionError> {
    open_connection(&MockConnector::new(node.clone()), &PlainPipeline, config).await
}

/// A node serving [`QUERY`] from a table of `count` int rows.
pub(crate) fn node_with_rows(count: i32) -> MockNode {
    MockNode::builder()
        .table(QUERY, Table::with_int_rows("ks", "t", "v", count))
        .build()
}

pub(crate) fn int_values(rows: &[Row]) -> Vec<i32> {
    rows.iter()
        .map(|row| {
            let cell = row.columns[0].as_ref().unwrap();
            i32::from_be_bytes(cell[..].try_into().unwrap())
        })
        .collect()
}

/// Polls `condition` until it holds, giving up after a few seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
