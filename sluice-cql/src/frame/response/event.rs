//! CQL protocol-level representation of an `EVENT` response.
//!
//! Events are pushed by the server on stream id -1. Only their type is decoded;
//! the payload is handed over as is.

use crate::frame::frame_errors::LowLevelDeserializationError;
use crate::frame::types;
use bytes::Bytes;

/// Event that the server notified the client about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event type, e.g. `TOPOLOGY_CHANGE`, `STATUS_CHANGE` or `SCHEMA_CHANGE`.
    pub event_type: String,
    /// The rest of the event body.
    pub body: Bytes,
}

impl Event {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let event_type = types::read_string(buf)?.to_owned();
        let body = Bytes::copy_from_slice(std::mem::take(buf));
        Ok(Event { event_type, body })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        types::write_string(&self.event_type, buf)?;
        buf.extend_from_slice(&self.body);
        Ok(())
    }
}
