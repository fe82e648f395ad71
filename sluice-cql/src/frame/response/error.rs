use crate::frame::frame_errors::{CqlErrorParseError, LowLevelDeserializationError};
use crate::frame::protocol_version::UNSUPPORTED_VERSION_MESSAGE;
use crate::frame::types;
use crate::Consistency;
use byteorder::ReadBytesExt;
use bytes::BufMut;
use thiserror::Error;

/// The body of an `ERROR` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

/// Reads the code-specific fields that follow the reason of some errors.
struct ErrorFields<'a, 'b> {
    buf: &'a mut &'b [u8],
    db_error: &'static str,
}

impl ErrorFields<'_, '_> {
    fn malformed(
        &self,
        field: &'static str,
    ) -> impl FnOnce(LowLevelDeserializationError) -> CqlErrorParseError {
        let db_error = self.db_error;
        move |err| CqlErrorParseError::MalformedErrorField {
            db_error,
            field,
            err,
        }
    }

    fn consistency(&mut self, field: &'static str) -> Result<Consistency, CqlErrorParseError> {
        types::read_consistency(self.buf).map_err(self.malformed(field))
    }

    fn int(&mut self, field: &'static str) -> Result<i32, CqlErrorParseError> {
        types::read_int(self.buf)
            .map_err(LowLevelDeserializationError::from)
            .map_err(self.malformed(field))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CqlErrorParseError> {
        types::read_string(self.buf)
            .map(str::to_owned)
            .map_err(self.malformed(field))
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, CqlErrorParseError> {
        self.buf
            .read_u8()
            .map(|byte| byte != 0)
            .map_err(LowLevelDeserializationError::from)
            .map_err(self.malformed(field))
    }
}

impl Error {
    pub fn new(error: DbError, reason: impl Into<String>) -> Self {
        Self {
            error,
            reason: reason.into(),
        }
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlErrorParseError> {
        let code = types::read_int(buf)
            .map_err(|err| CqlErrorParseError::ErrorCodeParseError(err.into()))?;
        let reason = types::read_string(buf)
            .map_err(CqlErrorParseError::ReasonParseError)?
            .to_owned();

        let error = match code {
            0x1000 => {
                let mut fields = ErrorFields {
                    buf,
                    db_error: "UNAVAILABLE",
                };
                DbError::Unavailable {
                    consistency: fields.consistency("CONSISTENCY")?,
                    required: fields.int("REQUIRED")?,
                    alive: fields.int("ALIVE")?,
                }
            }
            0x1100 => {
                let mut fields = ErrorFields {
                    buf,
                    db_error: "WRITE_TIMEOUT",
                };
                DbError::WriteTimeout {
                    consistency: fields.consistency("CONSISTENCY")?,
                    received: fields.int("RECEIVED")?,
                    required: fields.int("REQUIRED")?,
                    write_type: WriteType::from(fields.string("WRITE_TYPE")?.as_str()),
                }
            }
            0x1200 => {
                let mut fields = ErrorFields {
                    buf,
                    db_error: "READ_TIMEOUT",
                };
                DbError::ReadTimeout {
                    consistency: fields.consistency("CONSISTENCY")?,
                    received: fields.int("RECEIVED")?,
                    required: fields.int("REQUIRED")?,
                    data_present: fields.flag("DATA_PRESENT")?,
                }
            }
            0x2400 => {
                let mut fields = ErrorFields {
                    buf,
                    db_error: "ALREADY_EXISTS",
                };
                DbError::AlreadyExists {
                    keyspace: fields.string("KEYSPACE")?,
                    table: fields.string("TABLE")?,
                }
            }
            code => DbError::without_fields(code),
        };

        Ok(Error { error, reason })
    }

    /// Writes the error in its wire form. Used by test servers.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        types::write_int(self.error.code(), buf);
        types::write_string(&self.reason, buf)?;
        match &self.error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*required, buf);
                types::write_int(*alive, buf);
            }
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                buf.put_u8(u8::from(*data_present));
            }
            DbError::AlreadyExists { keyspace, table } => {
                types::write_string(keyspace, buf)?;
                types::write_string(table, buf)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether this is the server refusing the protocol version of the frame.
    pub fn is_unsupported_protocol_version(&self) -> bool {
        self.error == DbError::ProtocolError && self.reason.contains(UNSUPPORTED_VERSION_MESSAGE)
    }
}

/// The error code of an `ERROR` response, with the fields some codes carry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    #[error("Server error: the coordinator hit an internal bug")]
    ServerError,

    #[error("Protocol error: the server could not make sense of the frame")]
    ProtocolError,

    #[error("Authentication failed: bad credentials")]
    AuthenticationError,

    /// Fewer live replicas than the consistency level needs.
    #[error(
        "Cannot achieve consistency {consistency}: {required} replicas required, {alive} alive"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("The coordinator is overloaded")]
    Overloaded,

    #[error("The coordinator is still bootstrapping")]
    IsBootstrapping,

    #[error("Truncate failed")]
    TruncateError,

    /// Too few replicas acknowledged a write in time.
    #[error(
        "Write timed out at consistency {consistency}: {received} of {required} \
        acknowledgements ({write_type} write)"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    /// Too few replicas answered a read in time.
    #[error(
        "Read timed out at consistency {consistency}: {received} of {required} responses \
        (data present: {data_present})"
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        /// Whether the replica asked for the data itself answered.
        data_present: bool,
    },

    #[error("Syntax error in the query")]
    SyntaxError,

    #[error("The user is not allowed to run the query")]
    Unauthorized,

    /// Syntactically valid but refused, e.g. an unknown table.
    #[error("Invalid query")]
    Invalid,

    #[error("Configuration error")]
    ConfigError,

    /// `keyspace` is set for both kinds; `table` is empty for a keyspace.
    #[error("Already exists: {keyspace}.{table}")]
    AlreadyExists { keyspace: String, table: String },

    /// A code this crate does not know.
    #[error("Unknown error code {0:#06x}")]
    Other(i32),
}

impl DbError {
    const WITHOUT_FIELDS: [DbError; 10] = [
        DbError::ServerError,
        DbError::ProtocolError,
        DbError::AuthenticationError,
        DbError::Overloaded,
        DbError::IsBootstrapping,
        DbError::TruncateError,
        DbError::SyntaxError,
        DbError::Unauthorized,
        DbError::Invalid,
        DbError::ConfigError,
    ];

    fn without_fields(code: i32) -> DbError {
        Self::WITHOUT_FIELDS
            .into_iter()
            .find(|error| error.code() == code)
            .unwrap_or(DbError::Other(code))
    }

    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Other(code) => *code,
        }
    }
}

/// Kind of write reported by a write timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl WriteType {
    const KNOWN: [(WriteType, &'static str); 8] = [
        (WriteType::Simple, "SIMPLE"),
        (WriteType::Batch, "BATCH"),
        (WriteType::UnloggedBatch, "UNLOGGED_BATCH"),
        (WriteType::Counter, "COUNTER"),
        (WriteType::BatchLog, "BATCH_LOG"),
        (WriteType::Cas, "CAS"),
        (WriteType::View, "VIEW"),
        (WriteType::Cdc, "CDC"),
    ];

    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Other(name) => name,
            known => Self::KNOWN
                .iter()
                .find(|(write_type, _)| write_type == known)
                .map_or("", |(_, name)| *name),
        }
    }
}

impl From<&str> for WriteType {
    fn from(name: &str) -> WriteType {
        Self::KNOWN
            .into_iter()
            .find(|(_, known)| *known == name)
            .map_or_else(|| WriteType::Other(name.to_owned()), |(write_type, _)| write_type)
    }
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
