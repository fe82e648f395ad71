//! CQL requests sent by the client.

pub mod auth_response;
pub mod options;
pub mod query;
pub mod revise;
pub mod startup;

use std::collections::HashMap;

use bytes::Bytes;

pub use auth_response::AuthResponse;
pub use options::Options;
pub use query::Query;
pub use revise::Revise;
pub use startup::Startup;

use super::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use super::protocol_version::ProtocolVersion;
use super::TryFromPrimitiveError;

/// Possible requests sent by the client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CqlRequestKind {
    /// Initialize the connection. The server will respond by either a READY message
    /// (in which case the connection is ready for queries) or an AUTHENTICATE message
    /// (in which case credentials will need to be provided using AUTH_RESPONSE).
    Startup,

    /// Answers a server authentication challenge.
    AuthResponse,

    /// Asks the server to return which STARTUP options are supported.
    Options,

    /// Performs a CQL query, i.e., executes an unprepared statement.
    Query,

    /// Changes an ongoing continuous paging request (DSE only):
    /// cancels it or grants the server credit for more pages.
    Revise,
}

impl std::fmt::Display for CqlRequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            CqlRequestKind::Startup => "STARTUP",
            CqlRequestKind::AuthResponse => "AUTH_RESPONSE",
            CqlRequestKind::Options => "OPTIONS",
            CqlRequestKind::Query => "QUERY",
            CqlRequestKind::Revise => "REVISE_REQUEST",
        };

        f.write_str(kind_str)
    }
}

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RequestOpcode {
    /// See [CqlRequestKind::Startup].
    Startup = 0x01,
    /// See [CqlRequestKind::Options].
    Options = 0x05,
    /// See [CqlRequestKind::Query].
    Query = 0x07,
    /// See [CqlRequestKind::AuthResponse].
    AuthResponse = 0x0F,
    /// See [CqlRequestKind::Revise].
    Revise = 0xFF,
}

impl RequestOpcode {
    pub fn kind(self) -> CqlRequestKind {
        match self {
            RequestOpcode::Startup => CqlRequestKind::Startup,
            RequestOpcode::Options => CqlRequestKind::Options,
            RequestOpcode::Query => CqlRequestKind::Query,
            RequestOpcode::AuthResponse => CqlRequestKind::AuthResponse,
            RequestOpcode::Revise => CqlRequestKind::Revise,
        }
    }
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x0F => Ok(Self::AuthResponse),
            0xFF => Ok(Self::Revise),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

/// Requests that can be serialized into a CQL frame.
pub trait SerializableRequest {
    /// Opcode of the request, used to identify the request type in the CQL frame.
    const OPCODE: RequestOpcode;

    /// Serializes the request body into the provided buffer.
    ///
    /// The body layout may depend on the protocol version the frame is sent with.
    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        version: ProtocolVersion,
    ) -> Result<(), CqlRequestSerializationError>;

    /// Custom payload sent along with the request, if any.
    fn custom_payload(&self) -> Option<&HashMap<String, Bytes>> {
        None
    }

    /// Serializes the request into a heap-allocated `Bytes` object.
    fn to_bytes(&self, version: ProtocolVersion) -> Result<Bytes, CqlRequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(&mut v, version)?;
        Ok(v.into())
    }
}

/// Requests that can be deserialized from a CQL frame.
///
/// Not intended for driver's direct usage (as driver has no interest in deserialising CQL requests),
/// but very useful for testing (e.g. asserting that the sent requests have proper parameters set).
pub trait DeserializableRequest: SerializableRequest + Sized {
    /// Deserializes the request from the provided buffer.
    fn deserialize(
        buf: &mut &[u8],
        version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError>;
}

/// A CQL request received by a server, as seen by test servers.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Request<'r> {
    Startup(Startup<'r>),
    Options,
    AuthResponse(AuthResponse),
    Query(Query<'r>),
    Revise(Revise),
}

impl Request<'_> {
    /// Deserializes the request from the provided buffer.
    ///
    /// The custom payload, if flagged in the frame header, must have been stripped already.
    pub fn deserialize(
        buf: &mut &[u8],
        opcode: RequestOpcode,
        version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        match opcode {
            RequestOpcode::Startup => Startup::deserialize(buf, version).map(Self::Startup),
            RequestOpcode::Options => Ok(Self::Options),
            RequestOpcode::AuthResponse => {
                AuthResponse::deserialize(buf, version).map(Self::AuthResponse)
            }
            RequestOpcode::Query => Query::deserialize(buf, version).map(Self::Query),
            RequestOpcode::Revise => Revise::deserialize(buf, version).map(Self::Revise),
        }
    }

    pub fn opcode(&self) -> RequestOpcode {
        match self {
            Request::Startup(_) => RequestOpcode::Startup,
            Request::Options => RequestOpcode::Options,
            Request::AuthResponse(_) => RequestOpcode::AuthResponse,
            Request::Query(_) => RequestOpcode::Query,
            Request::Revise(_) => RequestOpcode::Revise,
        }
    }
}
