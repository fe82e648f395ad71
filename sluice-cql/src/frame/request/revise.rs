//! CQL protocol-level representation of the DSE `REVISE_REQUEST` request.

use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

const REVISION_CANCEL_CONTINUOUS_PAGING: i32 = 1;
const REVISION_MORE_CONTINUOUS_PAGES: i32 = 2;

/// Revises a continuous paging request that is being served on `target_stream`.
///
/// The server answers a revision on the revision's own stream id; pages of the
/// revised request keep flowing on `target_stream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revise {
    /// Stops the server from producing further pages.
    CancelContinuousPaging { target_stream: i16 },

    /// Grants the server credit for `next_pages` more pages.
    MoreContinuousPages { target_stream: i16, next_pages: i32 },
}

impl Revise {
    pub fn target_stream(&self) -> i16 {
        match self {
            Revise::CancelContinuousPaging { target_stream }
            | Revise::MoreContinuousPages { target_stream, .. } => *target_stream,
        }
    }
}

impl SerializableRequest for Revise {
    const OPCODE: RequestOpcode = RequestOpcode::Revise;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        _version: ProtocolVersion,
    ) -> Result<(), CqlRequestSerializationError> {
        match *self {
            Revise::CancelContinuousPaging { target_stream } => {
                types::write_int(REVISION_CANCEL_CONTINUOUS_PAGING, buf);
                types::write_int(target_stream.into(), buf);
            }
            Revise::MoreContinuousPages {
                target_stream,
                next_pages,
            } => {
                types::write_int(REVISION_MORE_CONTINUOUS_PAGES, buf);
                types::write_int(target_stream.into(), buf);
                types::write_int(next_pages, buf);
            }
        }
        Ok(())
    }
}

impl DeserializableRequest for Revise {
    fn deserialize(
        buf: &mut &[u8],
        _version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        let revision = types::read_int(buf)?;
        let target_stream = types::read_int(buf)?;
        let target_stream = i16::try_from(target_stream).map_err(|err| {
            RequestDeserializationError::LowLevelDeserialization(err.into())
        })?;
        match revision {
            REVISION_CANCEL_CONTINUOUS_PAGING => Ok(Revise::CancelContinuousPaging { target_stream }),
            REVISION_MORE_CONTINUOUS_PAGES => Ok(Revise::MoreContinuousPages {
                target_stream,
                next_pages: types::read_int(buf)?,
            }),
            other => Err(RequestDeserializationError::UnknownRevisionType(other)),
        }
    }
}
