//! Errors raised while encoding and decoding frames.

use std::num::TryFromIntError;
use std::sync::Arc;

use thiserror::Error;

use super::request::RequestOpcode;
use super::TryFromPrimitiveError;

/// An error that occurred while reading a frame header (or the body it announces)
/// from the transport.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FrameHeaderParseError {
    /// Failed to read the 9 header bytes.
    #[error("Failed to read the frame header: {0}")]
    HeaderIoError(std::io::Error),

    /// A response was expected, but the direction bit says the frame comes from a client.
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,

    /// A request was expected, but the direction bit says the frame comes from a server.
    #[error("Received frame marked as coming from the server")]
    FrameFromServer,

    /// Protocol versions below 3 use a different header layout.
    #[error("Received a frame from version {0}, but only versions 3 and above are supported")]
    VersionNotSupported(u8),

    /// The opcode byte does not name any known response.
    #[error("Unrecognized response opcode: {0}")]
    UnknownResponseOpcode(TryFromPrimitiveError<u8>),

    /// The opcode byte does not name any known request.
    #[error("Unrecognized request opcode: {0}")]
    UnknownRequestOpcode(TryFromPrimitiveError<u8>),

    /// The announced body length exceeds the frame size limit.
    #[error("Frame body of {0} bytes exceeds the limit of {1} bytes")]
    FrameTooLarge(usize, usize),

    /// Reading the body failed.
    #[error("Failed to read a chunk of response body. Expected {0} more bytes, error: {1}")]
    BodyChunkIoError(usize, std::io::Error),

    /// The transport hit EOF in the middle of a body.
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
}

/// An error that occurred while parsing the compression envelope
/// and the optional extensions (tracing id, warnings, custom payload) of a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameBodyExtensionsParseError {
    #[error("Frame is compressed, but no compression was negotiated for the connection.")]
    NoCompressionNegotiated,

    #[error("Malformed tracing id: {0}")]
    TraceIdParse(LowLevelDeserializationError),

    #[error("Malformed warnings list: {0}")]
    WarningsListParse(LowLevelDeserializationError),

    #[error("Malformed custom payload map: {0}")]
    CustomPayloadMapParse(LowLevelDeserializationError),

    #[error("Compressed lz4 frame is shorter than its length prefix")]
    Lz4LengthPrefixMissing,

    #[error("Error decompressing lz4 data: {0}")]
    Lz4DecompressError(Arc<lz4_flex::block::DecompressError>),

    #[error("Error decompressing snappy data: {0}")]
    SnapDecompressError(Arc<snap::Error>),
}

/// An error that occurred while serializing a request into a frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    #[error("Failed to serialize STARTUP options: {0}")]
    StartupSerialization(TryFromIntError),

    #[error("Failed to serialize AUTH_RESPONSE token: {0}")]
    AuthResponseSerialization(TryFromIntError),

    #[error("Failed to serialize QUERY request: {0}")]
    QuerySerialization(#[from] QuerySerializationError),

    #[error("Failed to serialize the custom payload: {0}")]
    CustomPayloadSerialization(TryFromIntError),

    #[error("Request body of {0} bytes exceeds the frame size limit")]
    RequestTooLarge(usize),

    #[error("Error compressing data with snappy: {0}")]
    SnapCompressError(Arc<snap::Error>),
}

/// An error that occurred while serializing a QUERY request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum QuerySerializationError {
    #[error("Query text of {0} bytes is too long")]
    ContentsTooLong(usize),

    #[error("Too many bound values: {0}")]
    TooManyValues(usize),

    #[error("Bound value of {0} bytes is too long")]
    ValueTooLong(usize),

    #[error("Paging state of {0} bytes is too long")]
    PagingStateTooLong(usize),

    #[error("Continuous paging is not available in protocol {0}")]
    ContinuousPagingUnsupported(super::ProtocolVersion),

    #[error("Page size in bytes is not available in protocol {0}")]
    PageSizeInBytesUnsupported(super::ProtocolVersion),
}

/// A low level deserialization error, raised by the primitives in [`super::types`].
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    TryFromSliceError(#[from] std::array::TryFromSliceError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// An error that occurred while deserializing a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(#[from] CqlErrorParseError),
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    CqlAuthenticateParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize AUTH_CHALLENGE response: {0}")]
    CqlAuthChallengeParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize AUTH_SUCCESS response: {0}")]
    CqlAuthSuccessParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    CqlSupportedParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlEventParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize RESULT response: {0}")]
    CqlResultParseError(#[from] CqlResultParseError),
}

/// An error type returned when deserialization of ERROR response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlErrorParseError {
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),
    #[error("Malformed error field {field} of DB error {db_error}: {err}")]
    MalformedErrorField {
        db_error: &'static str,
        field: &'static str,
        err: LowLevelDeserializationError,
    },
}

/// An error type returned when deserialization of RESULT response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResultParseError {
    #[error("Malformed RESULT response id: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    #[error("Unknown RESULT response id: {0}")]
    UnknownResultId(i32),
    #[error("RESULT:Prepared responses are not supported")]
    PreparedUnsupported,
    #[error("RESULT:Set_keyspace response deserialization failed: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),
    #[error("RESULT:Schema_change response deserialization failed: {0}")]
    SchemaChangeParseError(LowLevelDeserializationError),
    #[error("RESULT:Rows response deserialization failed: {0}")]
    RowsParseError(#[from] RowsParseError),
}

/// An error type returned when deserialization of `RESULT::Rows` fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RowsParseError {
    #[error("Invalid result metadata: {0}")]
    ResultMetadataParseError(#[from] ResultMetadataParseError),
    #[error("Malformed rows count: {0}")]
    RowsCountParseError(LowLevelDeserializationError),
    #[error("Malformed cell in row {row_index}, column {column_index}: {err}")]
    CellParseError {
        row_index: usize,
        column_index: usize,
        err: LowLevelDeserializationError,
    },
}

/// An error type returned when deserialization of `[Result/Prepared]Metadata` fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResultMetadataParseError {
    #[error("Malformed metadata flags: {0}")]
    FlagsParseError(LowLevelDeserializationError),
    #[error("Malformed column count: {0}")]
    ColumnCountParseError(LowLevelDeserializationError),
    #[error("Malformed paging state: {0}")]
    PagingStateParseError(LowLevelDeserializationError),
    #[error("Malformed continuous page number: {0}")]
    ContinuousPageNumberParseError(LowLevelDeserializationError),
    #[error("Malformed global table spec: {0}")]
    GlobalTableSpecParseError(LowLevelDeserializationError),
    #[error("Column spec parsing failed, column index: {column_index}, error: {kind}")]
    ColumnSpecParseError {
        column_index: usize,
        kind: ColumnSpecParseErrorKind,
    },
}

/// The reason why a single column spec could not be parsed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ColumnSpecParseErrorKind {
    #[error("Malformed table spec: {0}")]
    TableSpecParseError(LowLevelDeserializationError),
    #[error("Malformed column name: {0}")]
    ColumnNameParseError(LowLevelDeserializationError),
    #[error(transparent)]
    ColumnTypeParseError(#[from] CqlTypeParseError),
}

/// An error type returned when deserialization of a column type fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlTypeParseError {
    #[error("Malformed type id: {0}")]
    TypeIdParseError(LowLevelDeserializationError),
    #[error("Malformed custom type name: {0}")]
    CustomTypeNameParseError(LowLevelDeserializationError),
    #[error("Malformed name of UDT keyspace or type: {0}")]
    UdtNameParseError(LowLevelDeserializationError),
    #[error("Malformed UDT field: {0}")]
    UdtFieldParseError(LowLevelDeserializationError),
    #[error("Malformed tuple length: {0}")]
    TupleLengthParseError(LowLevelDeserializationError),
    #[error("Type not yet implemented, id: {0}")]
    TypeNotImplemented(u16),
}

/// An error type returned when a request frame body cannot be deserialized.
///
/// The driver never deserializes requests; this is used by test servers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestDeserializationError {
    #[error("Low level deser error: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error("Io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Specified flags are not recognised: {:08x}", flags)]
    UnknownFlags { flags: u32 },
    #[error("Expected SerialConsistency, got regular Consistency: {0}")]
    ExpectedSerialConsistency(crate::Consistency),
    #[error("Unknown revision type: {0}")]
    UnknownRevisionType(i32),
    #[error("Deserialization of {0:?} requests is not supported")]
    UnsupportedOpcode(RequestOpcode),
}
