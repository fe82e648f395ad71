//! CQL responses sent by the server.

pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

use bytes::Bytes;

use crate::frame::frame_errors::CqlResponseParseError;

pub use error::Error;
pub use supported::Supported;

use super::TryFromPrimitiveError;

/// Possible CQL responses received from the server
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CqlResponseKind {
    Error,
    Ready,
    Authenticate,
    Supported,
    Result,
    Event,
    AuthChallenge,
    AuthSuccess,
}

impl std::fmt::Display for CqlResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            CqlResponseKind::Error => "ERROR",
            CqlResponseKind::Ready => "READY",
            CqlResponseKind::Authenticate => "AUTHENTICATE",
            CqlResponseKind::Supported => "SUPPORTED",
            CqlResponseKind::Result => "RESULT",
            CqlResponseKind::Event => "EVENT",
            CqlResponseKind::AuthChallenge => "AUTH_CHALLENGE",
            CqlResponseKind::AuthSuccess => "AUTH_SUCCESS",
        };

        f.write_str(kind_str)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    AuthChallenge(authenticate::AuthChallenge),
    Supported(Supported),
    Event(event::Event),
}

impl Response {
    pub fn to_response_kind(&self) -> CqlResponseKind {
        match self {
            Response::Error(_) => CqlResponseKind::Error,
            Response::Ready => CqlResponseKind::Ready,
            Response::Result(_) => CqlResponseKind::Result,
            Response::Authenticate(_) => CqlResponseKind::Authenticate,
            Response::AuthSuccess(_) => CqlResponseKind::AuthSuccess,
            Response::AuthChallenge(_) => CqlResponseKind::AuthChallenge,
            Response::Supported(_) => CqlResponseKind::Supported,
            Response::Event(_) => CqlResponseKind::Event,
        }
    }

    pub fn opcode(&self) -> ResponseOpcode {
        match self {
            Response::Error(_) => ResponseOpcode::Error,
            Response::Ready => ResponseOpcode::Ready,
            Response::Result(_) => ResponseOpcode::Result,
            Response::Authenticate(_) => ResponseOpcode::Authenticate,
            Response::AuthSuccess(_) => ResponseOpcode::AuthSuccess,
            Response::AuthChallenge(_) => ResponseOpcode::AuthChallenge,
            Response::Supported(_) => ResponseOpcode::Supported,
            Response::Event(_) => ResponseOpcode::Event,
        }
    }

    /// Deserializes a response body, with frame extensions already stripped.
    pub fn deserialize(opcode: ResponseOpcode, body: Bytes) -> Result<Response, CqlResponseParseError> {
        let buf = &mut &*body;
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => Response::Authenticate(
                authenticate::Authenticate::deserialize(buf)
                    .map_err(CqlResponseParseError::CqlAuthenticateParseError)?,
            ),
            ResponseOpcode::Supported => Response::Supported(
                Supported::deserialize(buf).map_err(CqlResponseParseError::CqlSupportedParseError)?,
            ),
            ResponseOpcode::Result => Response::Result(result::deserialize(body.clone())?),
            ResponseOpcode::Event => Response::Event(
                event::Event::deserialize(buf).map_err(CqlResponseParseError::CqlEventParseError)?,
            ),
            ResponseOpcode::AuthChallenge => Response::AuthChallenge(
                authenticate::AuthChallenge::deserialize(buf)
                    .map_err(CqlResponseParseError::CqlAuthChallengeParseError)?,
            ),
            ResponseOpcode::AuthSuccess => Response::AuthSuccess(
                authenticate::AuthSuccess::deserialize(buf)
                    .map_err(CqlResponseParseError::CqlAuthSuccessParseError)?,
            ),
        };

        Ok(response)
    }

    /// Writes the response body. Used by test servers.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        match self {
            Response::Error(err) => err.serialize(buf),
            Response::Ready => Ok(()),
            Response::Result(result) => result.serialize(buf),
            Response::Authenticate(auth) => auth.serialize(buf),
            Response::AuthSuccess(success) => success.serialize(buf),
            Response::AuthChallenge(challenge) => challenge.serialize(buf),
            Response::Supported(supported) => supported.serialize(buf),
            Response::Event(event) => event.serialize(buf),
        }
    }
}
