use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
pub use sluice_cql::frame::request::RequestOpcode;
use sluice_cql::frame::request::Request;
pub use sluice_cql::frame::response::ResponseOpcode;
use sluice_cql::frame::frame_errors::{
    FrameBodyExtensionsParseError, FrameHeaderParseError, RequestDeserializationError,
};
use sluice_cql::frame::response::error::{DbError, Error};
use sluice_cql::frame::response::Response;
use sluice_cql::frame::{
    compress_append, decompress, read_body, types, Compression, FrameParams, ProtocolVersion,
    FLAG_COMPRESSION, FLAG_CUSTOM_PAYLOAD, FLAG_TRACING, FLAG_WARNING, HEADER_SIZE,
    RESPONSE_DIRECTION_BIT,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::errors::ReadFrameError;

/// Turns the header of a request into the header of its response.
pub(crate) fn response_params(request_params: FrameParams) -> FrameParams {
    FrameParams {
        version: RESPONSE_DIRECTION_BIT | (request_params.version & 0x7F),
        flags: 0,
        stream: request_params.stream,
    }
}

/// A request as received from the driver, with the compression envelope
/// and the custom payload already removed from its body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    pub params: FrameParams,
    pub opcode: RequestOpcode,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

impl RequestFrame {
    /// The protocol version the driver sent the request with, if the mock knows it.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.params.protocol_version()
    }

    pub fn deserialize(
        &self,
        version: ProtocolVersion,
    ) -> Result<Request<'static>, RequestDeserializationError> {
        Request::deserialize(&mut &self.body[..], self.opcode, version)
    }
}

/// A response about to be sent to the driver. The body is kept uncompressed;
/// compression is applied when the frame is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    pub params: FrameParams,
    pub opcode: ResponseOpcode,
    pub body: Bytes,
}

impl ResponseFrame {
    /// Creates a response frame carrying `response`.
    pub fn forged(
        request_params: FrameParams,
        response: &Response,
    ) -> Result<Self, std::num::TryFromIntError> {
        let mut body = Vec::new();
        response.serialize(&mut body)?;
        Ok(ResponseFrame {
            params: response_params(request_params),
            opcode: response.opcode(),
            body: body.into(),
        })
    }

    /// Creates a response frame that signifies the given DbError type.
    /// Useful for testing server-side error handling in drivers.
    pub fn forged_error(
        request_params: FrameParams,
        error: DbError,
        msg: Option<&str>,
    ) -> Result<Self, std::num::TryFromIntError> {
        let msg = msg.unwrap_or("Mock-triggered error.");
        Self::forged(request_params, &Response::Error(Error::new(error, msg)))
    }

    /// Creates a Supported response frame with given supported options.
    pub fn forged_supported(
        request_params: FrameParams,
        options: &HashMap<String, Vec<String>>,
    ) -> Result<Self, std::num::TryFromIntError> {
        let mut buf = BytesMut::new();
        types::write_string_multimap(options, &mut buf)?;

        Ok(ResponseFrame {
            params: response_params(request_params),
            opcode: ResponseOpcode::Supported,
            body: buf.freeze(),
        })
    }

    pub fn forged_ready(request_params: FrameParams) -> Self {
        ResponseFrame {
            params: response_params(request_params),
            opcode: ResponseOpcode::Ready,
            body: Bytes::new(),
        }
    }

    /// Prepends a tracing id and warnings to the body, setting the matching flags.
    pub fn with_extensions(
        mut self,
        tracing_id: Option<Uuid>,
        warnings: &[String],
    ) -> Result<Self, std::num::TryFromIntError> {
        if tracing_id.is_none() && warnings.is_empty() {
            return Ok(self);
        }
        let mut buf = BytesMut::new();
        if let Some(tracing_id) = tracing_id {
            types::write_uuid(&tracing_id, &mut buf);
            self.params.flags |= FLAG_TRACING;
        }
        if !warnings.is_empty() {
            types::write_string_list(warnings, &mut buf)?;
            self.params.flags |= FLAG_WARNING;
        }
        buf.put_slice(&self.body);
        self.body = buf.freeze();
        Ok(self)
    }
}

pub(crate) async fn write_response_frame(
    frame: &ResponseFrame,
    compression: Option<Compression>,
    writer: &mut (impl AsyncWrite + Unpin),
) -> Result<(), tokio::io::Error> {
    let mut flags = frame.params.flags;
    let mut data = vec![0; HEADER_SIZE];
    match compression.filter(|_| flags & FLAG_COMPRESSION != 0) {
        Some(compression) => {
            compress_append(&frame.body, compression, &mut data).map_err(tokio::io::Error::other)?
        }
        None => {
            flags &= !FLAG_COMPRESSION;
            data.extend_from_slice(&frame.body);
        }
    }
    let body_len = data.len() - HEADER_SIZE;

    data[0] = frame.params.version;
    data[1] = flags;
    data[2..4].copy_from_slice(&frame.params.stream.to_be_bytes());
    data[4] = frame.opcode as u8;
    data[5..9].copy_from_slice(&(body_len as u32).to_be_bytes());

    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a request, decompressing it if it is flagged as compressed
/// and a compression was negotiated.
pub(crate) async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
    compression: Option<Compression>,
) -> Result<RequestFrame, ReadFrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut raw_header[..])
        .await
        .map_err(FrameHeaderParseError::HeaderIoError)?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & RESPONSE_DIRECTION_BIT != 0 {
        return Err(FrameHeaderParseError::FrameFromServer.into());
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();
    let params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = RequestOpcode::try_from(buf.get_u8())
        .map_err(FrameHeaderParseError::UnknownRequestOpcode)?;

    let length = buf.get_u32() as usize;
    let mut body = read_body(reader, length).await?;

    if flags & FLAG_COMPRESSION != 0 {
        let Some(compression) = compression else {
            return Err(FrameBodyExtensionsParseError::NoCompressionNegotiated.into());
        };
        body = decompress(&body, compression)?.into();
    }

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload = types::read_bytes_map(buf).map_err(ReadFrameError::CustomPayload)?;
        let consumed = body_len - buf.len();
        body.advance(consumed);
        Some(payload)
    } else {
        None
    };

    Ok(RequestFrame {
        params,
        opcode,
        body,
        custom_payload,
    })
}
