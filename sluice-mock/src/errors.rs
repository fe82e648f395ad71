use std::net::SocketAddr;

use sluice_cql::frame::frame_errors::{
    FrameBodyExtensionsParseError, FrameHeaderParseError, LowLevelDeserializationError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadFrameError {
    #[error("Failed to read frame: {0}")]
    Header(#[from] FrameHeaderParseError),
    #[error("Failed to decompress frame body: {0}")]
    Decompression(#[from] FrameBodyExtensionsParseError),
    #[error("Malformed custom payload: {0}")]
    CustomPayload(LowLevelDeserializationError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Driver disconnected: {0}")]
    DriverDisconnected(ReadFrameError),
    #[error("Failed to write a frame to the driver: {0}")]
    Write(std::io::Error),
    #[error("Failed to serialize a response: {0}")]
    Serialize(#[from] std::num::TryFromIntError),
}

#[derive(Debug, Error)]
pub enum MockError {
    #[error("Listen on {0} failed with {1}")]
    Listen(SocketAddr, std::io::Error),
    #[error("Accepting a connection on {0} failed with {1}")]
    Accept(SocketAddr, std::io::Error),
}
