use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::protocol_version::ProtocolVersion;

use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types::{read_bytes_opt, write_bytes_opt};

/// The CQL protocol-level representation of an `AUTH_RESPONSE` request,
/// carrying the client's answer to an authentication challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(
        &self,
        buf: &mut Vec<u8>,
        _version: ProtocolVersion,
    ) -> Result<(), CqlRequestSerializationError> {
        write_bytes_opt(self.response.as_ref(), buf)
            .map_err(CqlRequestSerializationError::AuthResponseSerialization)
    }
}

impl DeserializableRequest for AuthResponse {
    fn deserialize(
        buf: &mut &[u8],
        _version: ProtocolVersion,
    ) -> Result<Self, RequestDeserializationError> {
        let response = read_bytes_opt(buf)?.map(ToOwned::to_owned);
        Ok(Self { response })
    }
}
