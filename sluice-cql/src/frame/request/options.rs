use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::protocol_version::ProtocolVersion;

use crate::frame::request::{RequestOpcode, SerializableRequest};

/// The CQL protocol-level representation of an `OPTIONS` request,
/// used to ask the server which STARTUP options it supports.
#[derive(Debug, Clone, Copy)]
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(
        &self,
        _buf: &mut Vec<u8>,
        _version: ProtocolVersion,
    ) -> Result<(), CqlRequestSerializationError> {
        Ok(())
    }
}

/* Key names for options in SUPPORTED/STARTUP */
pub const COMPRESSION: &str = "COMPRESSION";
pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DRIVER_NAME: &str = "DRIVER_NAME";
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";
pub const PROTOCOL_VERSIONS: &str = "PROTOCOL_VERSIONS";

/* Value names for options in SUPPORTED/STARTUP */
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";
pub const DEFAULT_DRIVER_NAME: &str = "sluice";
pub const DEFAULT_DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
