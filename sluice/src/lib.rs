//! Driver-side connection for the CQL binary protocol, with DSE continuous paging.
//!
//! A [`Connection`] multiplexes many requests over one transport, each tagged with
//! a stream id. It is brought to the `Ready` state by a handshake (protocol
//! version negotiation, compression, authentication and keyspace selection) and
//! from then on accepts requests from any number of tasks.
//!
//! # Connecting
//!
//! ```rust,no_run
//! use sluice::{connect, ConnectionConfig};
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let config = ConnectionConfig::default().with_keyspace("ks", false);
//!     let connection = connect("127.0.0.1:9042".parse()?, &config).await?;
//!     connection.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Paged queries
//!
//! [`Connection::execute_continuous`] starts a query whose pages are fetched ahead of
//! consumption, within the window set by
//! [`ContinuousPagingConfig::max_enqueued_pages`]. With the DSE v2 protocol all
//! pages arrive on one stream id and the client grants the server credit for more
//! pages as it consumes them; with other versions pages are fetched one QUERY at a
//! time.
//!
//! ```rust,no_run
//! # use sluice::{Connection, ContinuousPagingConfig, Statement};
//! # use std::error::Error;
//! # use std::sync::Arc;
//! # async fn check_only_compiles(connection: &Arc<Connection>) -> Result<(), Box<dyn Error>> {
//! let config = ContinuousPagingConfig::default()
//!     .with_page_size(100)
//!     .with_max_enqueued_pages(2);
//! let mut stream = connection
//!     .execute_continuous(Statement::new("SELECT * FROM ks.t"), config)
//!     .await?;
//! while let Some(page) = stream.next_page().await? {
//!     println!("page {} has {} rows", page.page_number(), page.rows().len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`AsyncContinuousResultSet`] and the blocking [`ContinuousResultSet`] offer the
//! same stream one page or one row at a time.

pub use sluice_cql::frame;

pub mod authentication;
pub mod client;
pub mod errors;
pub mod network;
pub mod response;
pub mod statement;

pub(crate) mod utils;

pub use client::continuous::{ContinuousResultStream, FlowControl, StreamState};
pub use client::result_set::{AsyncContinuousResultSet, BlockingConnection, ContinuousResultSet};
pub use client::{ContinuousPagingConfig, PagingMode};
pub use network::{connect, open_connection, Connection, ConnectionConfig, ConnectionState};
pub use response::{ExecutionInfo, Page, QueryResponse};
pub use statement::{GraphOptions, Statement, StatementKind};
