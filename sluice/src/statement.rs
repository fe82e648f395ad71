//! Statements sent with QUERY.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::frame::request::query::{ContinuousPagingOptions, PagingState, QueryParameters};
use crate::frame::request::Query;
use crate::frame::types::{Consistency, SerialConsistency};

/// Options of a graph statement, sent to the server as custom payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphOptions {
    /// The graph query language.
    pub language: String,
    /// The traversal source.
    pub source: String,
    /// The graph to run against. Graph system queries have none.
    pub name: Option<String>,
    /// How the server should encode results.
    pub results: Option<String>,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            language: "gremlin-groovy".to_owned(),
            source: "g".to_owned(),
            name: None,
            results: None,
        }
    }
}

impl GraphOptions {
    /// Options running against `graph_name` with the default language and source.
    pub fn for_graph(graph_name: impl Into<String>) -> Self {
        Self {
            name: Some(graph_name.into()),
            ..Default::default()
        }
    }

    /// Sets the traversal source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    fn to_custom_payload(&self) -> HashMap<String, Bytes> {
        let mut payload = HashMap::new();
        payload.insert(
            "graph-language".to_owned(),
            Bytes::copy_from_slice(self.language.as_bytes()),
        );
        payload.insert(
            "graph-source".to_owned(),
            Bytes::copy_from_slice(self.source.as_bytes()),
        );
        if let Some(name) = &self.name {
            payload.insert(
                "graph-name".to_owned(),
                Bytes::copy_from_slice(name.as_bytes()),
            );
        }
        if let Some(results) = &self.results {
            payload.insert(
                "graph-results".to_owned(),
                Bytes::copy_from_slice(results.as_bytes()),
            );
        }
        payload
    }
}

/// What kind of query a statement holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StatementKind {
    /// A CQL query.
    #[default]
    Cql,
    /// A graph query.
    Graph(GraphOptions),
}

/// A query with its execution options.
#[derive(Debug, Clone)]
pub struct Statement {
    /// The query text.
    pub contents: String,
    /// Positional values, already serialized. `None` stands for null.
    pub values: Vec<Option<Bytes>>,
    /// Consistency of the query.
    pub consistency: Consistency,
    /// Serial consistency, for conditional updates.
    pub serial_consistency: Option<SerialConsistency>,
    /// Default timestamp, in microseconds since the epoch.
    pub timestamp: Option<i64>,
    /// Whether the server should trace the query.
    pub tracing: bool,
    /// Overrides the timeout configured for the request or the continuous query.
    pub timeout: Option<Duration>,
    /// CQL or graph.
    pub kind: StatementKind,
}

impl Statement {
    /// Creates a CQL statement with default options.
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            values: Vec::new(),
            consistency: Consistency::default(),
            serial_consistency: None,
            timestamp: None,
            tracing: false,
            timeout: None,
            kind: StatementKind::Cql,
        }
    }

    /// Creates a graph statement.
    pub fn graph(contents: impl Into<String>, options: GraphOptions) -> Self {
        Self {
            kind: StatementKind::Graph(options),
            ..Self::new(contents)
        }
    }

    /// Sets the positional values.
    pub fn with_values(mut self, values: Vec<Option<Bytes>>) -> Self {
        self.values = values;
        self
    }

    /// Sets the consistency.
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Sets the serial consistency.
    pub fn with_serial_consistency(mut self, serial_consistency: Option<SerialConsistency>) -> Self {
        self.serial_consistency = serial_consistency;
        self
    }

    /// Sets the default timestamp.
    pub fn with_timestamp(mut self, timestamp: Option<i64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Enables or disables tracing.
    pub fn with_tracing(mut self, tracing: bool) -> Self {
        self.tracing = tracing;
        self
    }

    /// Sets the timeout, overriding the configured one.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether this is a graph statement.
    pub fn is_graph(&self) -> bool {
        matches!(self.kind, StatementKind::Graph(_))
    }

    pub(crate) fn to_query(&self, paging: QueryPaging) -> Query<'_> {
        let custom_payload = match &self.kind {
            StatementKind::Cql => None,
            StatementKind::Graph(options) => Some(options.to_custom_payload()),
        };
        Query {
            contents: Cow::Borrowed(&self.contents),
            parameters: QueryParameters {
                consistency: self.consistency,
                serial_consistency: self.serial_consistency,
                timestamp: self.timestamp,
                page_size: paging.page_size,
                page_size_in_bytes: paging.page_size_in_bytes,
                paging_state: paging.paging_state,
                values: self.values.clone(),
                continuous_paging: paging.continuous,
            },
            custom_payload,
        }
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Self {
        Statement::new(contents)
    }
}

impl From<String> for Statement {
    fn from(contents: String) -> Self {
        Statement::new(contents)
    }
}

/// The paging part of a QUERY.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryPaging {
    pub(crate) page_size: Option<i32>,
    pub(crate) page_size_in_bytes: bool,
    pub(crate) paging_state: PagingState,
    pub(crate) continuous: Option<ContinuousPagingOptions>,
}
