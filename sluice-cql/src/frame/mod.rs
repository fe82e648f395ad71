pub mod frame_errors;
pub mod protocol_version;
pub mod request;
pub mod response;
pub mod types;

use crate::frame::frame_errors::{
    CqlRequestSerializationError, FrameBodyExtensionsParseError, FrameHeaderParseError,
};
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::fmt::Display;
use std::sync::Arc;
use std::{collections::HashMap, convert::TryFrom};

pub use protocol_version::ProtocolVersion;
use request::SerializableRequest;
use response::ResponseOpcode;

pub const HEADER_SIZE: usize = 9;

/// Frames announcing a longer body are refused instead of buffered.
pub const MAX_FRAME_BODY_SIZE: usize = 256 * 1024 * 1024;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

/// Bit of the version byte set on frames sent by the server.
pub const RESPONSE_DIRECTION_BIT: u8 = 0x80;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// The name used for this algorithm in SUPPORTED and STARTUP.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lz4" => Some(Compression::Lz4),
            "snappy" => Some(Compression::Snappy),
            _ => None,
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request frame ready to be written, apart from its stream id,
/// which is filled in with [`SerializedRequest::set_stream`] once it is known.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if req.custom_payload().is_some() {
            flags |= FLAG_CUSTOM_PAYLOAD;
        }

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let mut body = Vec::new();
            serialize_body(req, version, &mut body)?;
            compress_append(&body, compression, &mut data)?;
        } else {
            serialize_body(req, version, &mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        let body_len = data.len() - HEADER_SIZE;
        if body_len > MAX_FRAME_BODY_SIZE {
            return Err(CqlRequestSerializationError::RequestTooLarge(body_len));
        }

        data[0] = version.code();
        data[1] = flags;
        // Leave space for the stream number
        data[4] = R::OPCODE as u8;
        data[5..9].copy_from_slice(&(body_len as u32).to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

fn serialize_body<R: SerializableRequest>(
    req: &R,
    version: ProtocolVersion,
    buf: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    if let Some(payload) = req.custom_payload() {
        types::write_bytes_map(payload, buf)
            .map_err(CqlRequestSerializationError::CustomPayloadSerialization)?;
    }
    req.serialize(buf, version)
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl FrameParams {
    /// The protocol version of the frame, if it is one the driver knows.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        ProtocolVersion::from_code(self.version)
    }
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V4.code(),
            flags: 0x00,
            stream: 0,
        }
    }
}

pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut raw_header[..])
        .await
        .map_err(FrameHeaderParseError::HeaderIoError)?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & RESPONSE_DIRECTION_BIT != RESPONSE_DIRECTION_BIT {
        return Err(FrameHeaderParseError::FrameFromClient);
    }
    // Servers may answer with any version they speak (e.g. when refusing ours),
    // and all versions from 3 on share the header layout.
    if version & 0x7F < ProtocolVersion::V3.code() {
        return Err(FrameHeaderParseError::VersionNotSupported(version & 0x7F));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())
        .map_err(FrameHeaderParseError::UnknownResponseOpcode)?;

    let length = buf.get_u32() as usize;
    let body = read_body(reader, length).await?;

    Ok((frame_params, opcode, body))
}

/// Reads exactly `length` bytes of a frame body.
pub async fn read_body(
    reader: &mut (impl AsyncRead + Unpin),
    length: usize,
) -> Result<Bytes, FrameHeaderParseError> {
    if length > MAX_FRAME_BODY_SIZE {
        return Err(FrameHeaderParseError::FrameTooLarge(
            length,
            MAX_FRAME_BODY_SIZE,
        ));
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await.map_err(|err| {
            FrameHeaderParseError::BodyChunkIoError(raw_body.remaining_mut(), err)
        })?;
        if n == 0 {
            // EOF, too early
            return Err(FrameHeaderParseError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok(raw_body.into_inner().into())
}

pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameBodyExtensionsParseError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id =
            types::read_uuid(buf).map_err(FrameBodyExtensionsParseError::TraceIdParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)
            .map_err(FrameBodyExtensionsParseError::WarningsListParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)
            .map_err(FrameBodyExtensionsParseError::CustomPayloadMapParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

/// Tells whether a raw response frame ends a continuous paging stream: any error,
/// any result which is not a continuous page, or a page flagged as the last one.
///
/// Frames that cannot be parsed are treated as final, since nothing sensible can follow them.
pub fn is_final_continuous_frame(
    opcode: ResponseOpcode,
    params: FrameParams,
    compression: Option<Compression>,
    body: Bytes,
) -> bool {
    if opcode != ResponseOpcode::Result {
        return true;
    }
    let Ok(extensions) = parse_response_body_extensions(params.flags, compression, body) else {
        return true;
    };
    match response::result::peek_continuous_page(&extensions.body) {
        Ok(Some(page)) => page.last,
        Ok(None) | Err(_) => true,
    }
}

pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|err| CqlRequestSerializationError::SnapCompressError(Arc::new(err)))?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

pub fn decompress(
    mut comp_body: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, FrameBodyExtensionsParseError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameBodyExtensionsParseError::Lz4LengthPrefixMissing);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|err| FrameBodyExtensionsParseError::Lz4DecompressError(Arc::new(err)))?;
            Ok(uncomp_body)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|err| FrameBodyExtensionsParseError::SnapDecompressError(Arc::new(err))),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}
