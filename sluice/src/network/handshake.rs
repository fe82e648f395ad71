//! The state machine bringing a fresh connection to the `Ready` state.
//!
//! [`HandshakeController`] performs no I/O. It is fed the server's responses and the
//! outcomes of authenticator calls, and answers each with the next [`HandshakeAction`].
//! The connection drives it, applying the step timeouts, which keeps every transition
//! testable without a network.

use std::collections::HashMap;
use std::fmt::Display;

use tracing::{debug, warn};

use super::connection::VerifiedKeyspaceName;
use crate::errors::{ConnectionInitError, ConnectionInitErrorKind};
use crate::frame::protocol_version::parse_supported_versions;
use crate::frame::request::options;
use crate::frame::response::result::Result as CqlResult;
use crate::frame::response::Response;
use crate::frame::{Compression, ProtocolVersion};

/// The lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionState {
    /// The transport is being established.
    Connecting,
    /// OPTIONS and STARTUP are being exchanged.
    Negotiating,
    /// The server asked for authentication.
    Authenticating,
    /// The requested keyspace is being set.
    SettingKeyspace,
    /// The connection accepts requests.
    Ready,
    /// [`Connection::close`](super::Connection::close) was called and pending requests are being failed.
    Closing,
    /// The connection was closed on request.
    Closed,
    /// The handshake or the connection itself failed.
    Failed,
}

impl ConnectionState {
    /// Whether the connection will never accept requests again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Negotiating => "Negotiating",
            ConnectionState::Authenticating => "Authenticating",
            ConnectionState::SettingKeyspace => "SettingKeyspace",
            ConnectionState::Ready => "Ready",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(state)
    }
}

/// A step of the handshake, each bounded by its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum HandshakeStep {
    /// Asking the server for its supported options.
    Options,
    /// Proposing the protocol version and the startup options.
    Startup,
    /// Exchanging credentials with the server.
    Authentication,
    /// Setting the requested keyspace.
    UseKeyspace,
}

impl Display for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = match self {
            HandshakeStep::Options => "OPTIONS",
            HandshakeStep::Startup => "STARTUP",
            HandshakeStep::Authentication => "AUTHENTICATION",
            HandshakeStep::UseKeyspace => "USE KEYSPACE",
        };
        f.write_str(step)
    }
}

/// What the handshake needs from the server at the start of a connection.
#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// The version proposed in every frame of the handshake.
    pub protocol_version: ProtocolVersion,
    /// The preferred compression, used only if the server supports it.
    pub compression: Option<Compression>,
    /// The keyspace to set once the connection is authenticated.
    pub keyspace: Option<VerifiedKeyspaceName>,
    /// Sent as `DRIVER_NAME` in STARTUP.
    pub driver_name: String,
    /// Sent as `DRIVER_VERSION` in STARTUP.
    pub driver_version: String,
}

/// A request the connection has to send on behalf of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRequest {
    /// OPTIONS.
    Options,
    /// STARTUP with the given options.
    Startup(HashMap<String, String>),
    /// AUTH_RESPONSE with the authenticator's token.
    AuthResponse(Option<Vec<u8>>),
    /// `USE <keyspace>`.
    UseKeyspace(VerifiedKeyspaceName),
}

/// The next thing to do, as decided by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Send the request and pass its response to [`HandshakeController::on_response`].
    Send(HandshakeRequest),
    /// Start an authenticator session and pass its initial token to
    /// [`HandshakeController::on_authenticator_token`].
    StartAuthentication {
        /// The authenticator the server announced.
        authenticator_name: String,
    },
    /// Let the session evaluate the challenge and pass its answer to
    /// [`HandshakeController::on_authenticator_token`].
    EvaluateChallenge(Option<Vec<u8>>),
    /// Let the session see the success token, then call
    /// [`HandshakeController::on_authentication_finished`].
    FinishAuthentication(Option<Vec<u8>>),
    /// The connection is ready.
    Complete {
        /// The compression the server accepted.
        compression: Option<Compression>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    AwaitingSupported,
    AwaitingStartup,
    AwaitingAuthenticatorStart,
    AwaitingAuthResult,
    AwaitingChallengeEvaluation,
    AwaitingAuthFinish,
    AwaitingSetKeyspace,
    Done,
}

/// Drives one connection through `Connecting -> Negotiating -> [Authenticating] ->
/// [SettingKeyspace] -> Ready`.
///
/// The controller is single-use: once it reaches `Ready` or `Failed`, every further
/// call fails with [`ConnectionInitErrorKind::InvalidTransition`].
#[derive(Debug)]
pub struct HandshakeController {
    options: HandshakeOptions,
    state: ConnectionState,
    phase: Phase,
    step: HandshakeStep,
    negotiated_compression: Option<Compression>,
}

impl HandshakeController {
    /// Creates a controller in the `Connecting` state.
    pub fn new(options: HandshakeOptions) -> Self {
        Self {
            options,
            state: ConnectionState::Connecting,
            phase: Phase::NotStarted,
            step: HandshakeStep::Options,
            negotiated_compression: None,
        }
    }

    /// The connection state the handshake has reached.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The step in progress, or the last one once the handshake is over.
    pub fn current_step(&self) -> HandshakeStep {
        self.step
    }

    /// The version proposed by this controller.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.options.protocol_version
    }

    /// The compression that was asked for.
    pub fn request_compression(&self) -> Option<Compression> {
        self.options.compression
    }

    /// The compression put into STARTUP, known once SUPPORTED arrived.
    pub fn negotiated_compression(&self) -> Option<Compression> {
        self.negotiated_compression
    }

    /// Starts the handshake, once the transport is established.
    pub fn start(&mut self) -> Result<HandshakeAction, ConnectionInitError> {
        if self.phase != Phase::NotStarted {
            return Err(self.invalid_transition());
        }
        self.transition(ConnectionState::Negotiating);
        self.phase = Phase::AwaitingSupported;
        self.step = HandshakeStep::Options;
        Ok(HandshakeAction::Send(HandshakeRequest::Options))
    }

    /// Feeds the server's response to the last request sent.
    pub fn on_response(
        &mut self,
        response: Response,
    ) -> Result<HandshakeAction, ConnectionInitError> {
        match (self.phase, response) {
            (Phase::AwaitingSupported, Response::Supported(supported)) => {
                let compression = self.options.compression.filter(|compression| {
                    let supported_by_server = supported
                        .values(options::COMPRESSION)
                        .iter()
                        .any(|name| name == compression.as_str());
                    if !supported_by_server {
                        warn!(
                            "Requested compression <{}> is not supported by the server. Falling back to no compression",
                            compression
                        );
                    }
                    supported_by_server
                });
                self.negotiated_compression = compression;
                self.phase = Phase::AwaitingStartup;
                self.step = HandshakeStep::Startup;
                Ok(HandshakeAction::Send(HandshakeRequest::Startup(
                    self.startup_options(),
                )))
            }
            (Phase::AwaitingStartup, Response::Ready) => Ok(self.authenticated()),
            (Phase::AwaitingStartup, Response::Authenticate(authenticate)) => {
                self.transition(ConnectionState::Authenticating);
                self.phase = Phase::AwaitingAuthenticatorStart;
                self.step = HandshakeStep::Authentication;
                Ok(HandshakeAction::StartAuthentication {
                    authenticator_name: authenticate.authenticator_name,
                })
            }
            (Phase::AwaitingAuthResult, Response::AuthChallenge(challenge)) => {
                self.phase = Phase::AwaitingChallengeEvaluation;
                Ok(HandshakeAction::EvaluateChallenge(
                    challenge.authenticate_message,
                ))
            }
            (Phase::AwaitingAuthResult, Response::AuthSuccess(success)) => {
                self.phase = Phase::AwaitingAuthFinish;
                Ok(HandshakeAction::FinishAuthentication(
                    success.success_message,
                ))
            }
            (Phase::AwaitingSetKeyspace, Response::Result(CqlResult::SetKeyspace(set_keyspace))) => {
                let expected = self
                    .options
                    .keyspace
                    .as_ref()
                    .map(|keyspace| keyspace.as_str().to_lowercase())
                    .unwrap_or_default();
                let received = set_keyspace.keyspace_name.to_lowercase();
                if expected != received {
                    return Err(self.fail(ConnectionInitErrorKind::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase: expected,
                        result_keyspace_name_lowercase: received,
                    }));
                }
                Ok(self.complete())
            }
            (
                Phase::AwaitingSupported
                | Phase::AwaitingStartup
                | Phase::AwaitingAuthResult
                | Phase::AwaitingSetKeyspace,
                Response::Error(error),
            ) => {
                let kind = if error.is_unsupported_protocol_version() {
                    ConnectionInitErrorKind::UnsupportedProtocolVersion {
                        attempted: self.options.protocol_version,
                        supported: parse_supported_versions(&error.reason),
                    }
                } else {
                    ConnectionInitErrorKind::DbError(error.error, error.reason)
                };
                Err(self.fail(kind))
            }
            (
                Phase::AwaitingSupported
                | Phase::AwaitingStartup
                | Phase::AwaitingAuthResult
                | Phase::AwaitingSetKeyspace,
                other,
            ) => Err(self.fail(ConnectionInitErrorKind::UnexpectedResponse(
                other.to_response_kind(),
            ))),
            _ => Err(self.invalid_transition()),
        }
    }

    /// Feeds the token produced by the authenticator, initial or in answer to a challenge.
    pub fn on_authenticator_token(
        &mut self,
        token: Option<Vec<u8>>,
    ) -> Result<HandshakeAction, ConnectionInitError> {
        match self.phase {
            Phase::AwaitingAuthenticatorStart | Phase::AwaitingChallengeEvaluation => {
                self.phase = Phase::AwaitingAuthResult;
                Ok(HandshakeAction::Send(HandshakeRequest::AuthResponse(token)))
            }
            _ => Err(self.invalid_transition()),
        }
    }

    /// Reports that the authenticator accepted the server's success message.
    pub fn on_authentication_finished(&mut self) -> Result<HandshakeAction, ConnectionInitError> {
        match self.phase {
            Phase::AwaitingAuthFinish => Ok(self.authenticated()),
            _ => Err(self.invalid_transition()),
        }
    }

    /// Fails the handshake at the current step, e.g. because the step timed out.
    pub fn fail(&mut self, kind: ConnectionInitErrorKind) -> ConnectionInitError {
        if self.state != ConnectionState::Failed {
            self.transition(ConnectionState::Failed);
        }
        self.phase = Phase::Done;
        ConnectionInitError::new(self.step, kind)
    }

    fn authenticated(&mut self) -> HandshakeAction {
        match self.options.keyspace.clone() {
            Some(keyspace) => {
                self.transition(ConnectionState::SettingKeyspace);
                self.phase = Phase::AwaitingSetKeyspace;
                self.step = HandshakeStep::UseKeyspace;
                HandshakeAction::Send(HandshakeRequest::UseKeyspace(keyspace))
            }
            None => self.complete(),
        }
    }

    fn complete(&mut self) -> HandshakeAction {
        self.transition(ConnectionState::Ready);
        self.phase = Phase::Done;
        HandshakeAction::Complete {
            compression: self.negotiated_compression,
        }
    }

    // A ready connection stays ready; the call is only refused.
    fn invalid_transition(&mut self) -> ConnectionInitError {
        let state = self.state;
        if state == ConnectionState::Ready {
            return ConnectionInitError::new(
                self.step,
                ConnectionInitErrorKind::InvalidTransition(state),
            );
        }
        self.fail(ConnectionInitErrorKind::InvalidTransition(state))
    }

    fn transition(&mut self, to: ConnectionState) {
        debug!(
            protocol_version = %self.options.protocol_version,
            "Handshake transition: {} -> {}", self.state, to
        );
        self.state = to;
    }

    fn startup_options(&self) -> HashMap<String, String> {
        let mut startup = HashMap::new();
        startup.insert(
            options::CQL_VERSION.to_owned(),
            options::DEFAULT_CQL_VERSION.to_owned(),
        );
        startup.insert(
            options::DRIVER_NAME.to_owned(),
            self.options.driver_name.clone(),
        );
        startup.insert(
            options::DRIVER_VERSION.to_owned(),
            self.options.driver_version.clone(),
        );
        if let Some(compression) = self.negotiated_compression {
            startup.insert(
                options::COMPRESSION.to_owned(),
                compression.as_str().to_owned(),
            );
        }
        startup
    }
}
