//! What comes back from the server: whole responses, and the pages and execution
//! metadata of continuous queries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{RequestError, ResponseParseError};
use crate::frame::response::result::{ResultMetadata, Row};
use crate::frame::response::Response;
use crate::frame::{parse_response_body_extensions, Compression};
use crate::network::TaskResponse;

/// A parsed response, together with its frame extensions.
#[derive(Debug)]
pub struct QueryResponse {
    /// The response itself.
    pub response: Response,
    /// The tracing session id, if tracing was requested.
    pub tracing_id: Option<Uuid>,
    /// Warnings the server attached to the response.
    pub warnings: Vec<String>,
    /// The custom payload the server attached to the response.
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

impl QueryResponse {
    /// Turns an ERROR response into [`RequestError::DbError`].
    pub fn into_non_error(self) -> Result<Self, RequestError> {
        match self.response {
            Response::Error(err) => Err(RequestError::DbError(err.error, err.reason)),
            _ => Ok(self),
        }
    }
}

pub(crate) fn parse_response(
    task_response: TaskResponse,
    compression: Option<Compression>,
) -> Result<QueryResponse, ResponseParseError> {
    let body_with_ext = parse_response_body_extensions(
        task_response.params.flags,
        compression,
        task_response.body,
    )?;

    for warn_description in &body_with_ext.warnings {
        warn!(
            warning = warn_description.as_str(),
            "Response from the database contains a warning",
        );
    }

    let response = Response::deserialize(task_response.opcode, body_with_ext.body)?;

    Ok(QueryResponse {
        response,
        warnings: body_with_ext.warnings,
        tracing_id: body_with_ext.trace_id,
        custom_payload: body_with_ext.custom_payload,
    })
}

/// Metadata of one received page.
#[derive(Debug, Clone)]
pub struct ExecutionInfo {
    /// The node that served the page.
    pub coordinator: SocketAddr,
    /// The stream id the page arrived on.
    pub stream_id: i16,
    /// The page number, starting at 1.
    pub page_number: i32,
    /// The tracing session id, if tracing was requested.
    pub tracing_id: Option<Uuid>,
    /// Warnings attached to the page.
    pub warnings: Vec<String>,
    /// Custom payload attached to the page.
    pub custom_payload: Option<HashMap<String, Bytes>>,
    /// When the connection read the page off the wire.
    pub received_at: Instant,
}

/// One page of rows.
#[derive(Debug, Clone)]
pub struct Page {
    pub(crate) rows: Vec<Row>,
    pub(crate) metadata: Arc<ResultMetadata>,
    pub(crate) has_more_pages: bool,
    pub(crate) execution_info: Arc<ExecutionInfo>,
}

impl Page {
    /// The rows, in the order the server sent them.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Takes the rows out of the page.
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Column specifications of the rows.
    pub fn metadata(&self) -> &Arc<ResultMetadata> {
        &self.metadata
    }

    /// The page number, starting at 1.
    pub fn page_number(&self) -> i32 {
        self.execution_info.page_number
    }

    /// Whether the server announced more pages after this one.
    pub fn has_more_pages(&self) -> bool {
        self.has_more_pages
    }

    /// Metadata of the page.
    pub fn execution_info(&self) -> &Arc<ExecutionInfo> {
        &self.execution_info
    }
}
