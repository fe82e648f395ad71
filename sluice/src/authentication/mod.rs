//! Authentication performed during the connection handshake.
//!
//! When the server answers STARTUP with AUTHENTICATE, the connection asks the configured
//! [`AuthenticatorProvider`] for a session and relays the challenge/response exchange
//! until the server reports success.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Reason an authentication exchange was abandoned; reported to the server as is.
pub type AuthError = String;

/// One connection's side of a SASL-style exchange.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers an AUTH_CHALLENGE. The token format belongs to the server's
    /// authenticator and may be null.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Called with the token of AUTH_SUCCESS once the server accepted the exchange.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Creates an [`AuthenticatorSession`] for every connection the server challenges.
///
/// The provider is set in [`ConnectionConfig::authenticator`](crate::network::ConnectionConfig::authenticator).
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the token of the first AUTH_RESPONSE together with the session that
    /// handles the rest of the exchange. `authenticator_name` is the class named in
    /// AUTHENTICATE.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Password authentication does not expect challenges".to_owned())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Authenticator provider for servers using password authentication.
///
/// The initial response carries `\0username\0password`; further challenges are refused.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    /// Authenticates as `username`.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }

    fn initial_response(&self) -> Vec<u8> {
        let mut response = BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());
        response.to_vec()
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        Ok((
            Some(self.initial_response()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}
