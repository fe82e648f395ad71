use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use sluice::authentication::{
    AuthError, AuthenticatorProvider, AuthenticatorSession, PlainTextAuthenticator,
};
use sluice::errors::{ConnectionError, ConnectionInitErrorKind, DbError};
use sluice::frame::response::result::{Result as CqlResult, SetKeyspace};
use sluice::frame::response::Response;
use sluice::frame::{Compression, ProtocolVersion};
use sluice::network::HandshakeStep;
use sluice::{ConnectionConfig, ConnectionState, ContinuousPagingConfig, Statement};
use sluice_mock::{
    Condition, MockNode, RequestFrame, RequestOpcode, RequestReaction, RequestRule, ResponseFrame,
    Table, CHALLENGE_NONCE, PASSWORD_AUTHENTICATOR,
};

use crate::utils::{connect_to, int_values, setup_tracing, QUERY};

#[tokio::test]
#[ntest::timeout(20000)]
async fn refused_version_is_retried_with_the_highest_common_one() {
    setup_tracing();
    let node = MockNode::builder()
        .supported_versions(&[ProtocolVersion::V3, ProtocolVersion::V4])
        .table(QUERY, Table::with_int_rows("ks", "t", "v", 25))
        .build();

    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();
    assert_eq!(connection.protocol_version(), ProtocolVersion::V4);
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(node.connections_accepted(), 2);

    let requests = node.log().requests();
    assert_eq!(requests[0].connection, 0);
    assert_eq!(requests[0].params.version, ProtocolVersion::DseV2.code());
    assert!(requests
        .iter()
        .filter(|request| request.connection == 1)
        .all(|request| request.params.version == ProtocolVersion::V4.code()));

    // Without page credits the query is paged classically.
    let stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default().with_page_size(10),
        )
        .await
        .unwrap();
    assert!(!stream.is_continuous());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn refusal_without_a_lower_version_is_reported() {
    setup_tracing();
    let node = MockNode::builder()
        .supported_versions(&[ProtocolVersion::V4])
        .build();
    let config = ConnectionConfig::default().with_protocol_version(ProtocolVersion::V3);

    let err = connect_to(&node, &config).await.unwrap_err();
    assert_matches!(err, ConnectionError::ConnectionInitError(err) => {
        assert_eq!(err.step, HandshakeStep::Options);
        assert_matches!(
            err.kind,
            ConnectionInitErrorKind::UnsupportedProtocolVersion { attempted: ProtocolVersion::V3, ref supported }
                if supported == &[ProtocolVersion::V4]
        );
        assert_eq!(
            err.kind.to_string(),
            "Protocol version v3 is not supported by the server (it supports: v4)"
        );
    });
    assert_eq!(node.connections_accepted(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn password_authentication_succeeds() {
    setup_tracing();
    let node = MockNode::builder()
        .password_auth("cassandra", "secret")
        .build();
    let config = ConnectionConfig::default()
        .with_authenticator(Arc::new(PlainTextAuthenticator::new("cassandra", "secret")));

    let connection = connect_to(&node, &config).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(node.log().count(RequestOpcode::AuthResponse), 1);
    connection
        .query(&Statement::new("INSERT INTO ks.t (v) VALUES (1)"))
        .await
        .unwrap();
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn wrong_credentials_fail_the_authentication_step() {
    setup_tracing();
    let node = MockNode::builder()
        .password_auth("cassandra", "secret")
        .build();
    let config = ConnectionConfig::default()
        .with_authenticator(Arc::new(PlainTextAuthenticator::new("cassandra", "guess")));

    let err = connect_to(&node, &config).await.unwrap_err();
    assert_matches!(err, ConnectionError::ConnectionInitError(err) => {
        assert_eq!(err.step, HandshakeStep::Authentication);
        assert_matches!(
            err.kind,
            ConnectionInitErrorKind::DbError(DbError::AuthenticationError, ref reason)
                if reason.contains("cassandra")
        );
    });
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn authentication_request_without_authenticator_fails() {
    setup_tracing();
    let node = MockNode::builder()
        .password_auth("cassandra", "secret")
        .build();

    let err = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap_err();
    assert_matches!(err, ConnectionError::ConnectionInitError(err) => {
        assert_eq!(err.step, HandshakeStep::Authentication);
        assert_matches!(err.kind, ConnectionInitErrorKind::MissingAuthentication);
    });
}

// Sends the password token, then answers every challenge with the challenge itself.
struct EchoingAuthenticator {
    challenges: Arc<AtomicUsize>,
    successes: Arc<AtomicUsize>,
}

struct EchoingSession {
    challenges: Arc<AtomicUsize>,
    successes: Arc<AtomicUsize>,
}

#[async_trait]
impl AuthenticatorSession for EchoingSession {
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        self.challenges.fetch_add(1, Ordering::Relaxed);
        Ok(token.map(<[u8]>::to_vec))
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        self.successes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl AuthenticatorProvider for EchoingAuthenticator {
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        assert_eq!(authenticator_name, PASSWORD_AUTHENTICATOR);
        Ok((
            Some(b"\0cassandra\0secret".to_vec()),
            Box::new(EchoingSession {
                challenges: self.challenges.clone(),
                successes: self.successes.clone(),
            }),
        ))
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn authentication_challenges_are_relayed_to_the_session() {
    setup_tracing();
    let node = MockNode::builder()
        .password_auth("cassandra", "secret")
        .auth_challenges(2)
        .build();
    let challenges = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));
    let config = ConnectionConfig::default().with_authenticator(Arc::new(EchoingAuthenticator {
        challenges: challenges.clone(),
        successes: successes.clone(),
    }));

    let connection = connect_to(&node, &config).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert_eq!(challenges.load(Ordering::Relaxed), 2);
    assert_eq!(successes.load(Ordering::Relaxed), 1);
    assert_eq!(node.log().count(RequestOpcode::AuthResponse), 3);
    assert_eq!(CHALLENGE_NONCE, b"nonce");
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn plain_text_authenticator_refuses_challenges() {
    setup_tracing();
    let node = MockNode::builder()
        .password_auth("cassandra", "secret")
        .auth_challenges(1)
        .build();
    let config = ConnectionConfig::default()
        .with_authenticator(Arc::new(PlainTextAuthenticator::new("cassandra", "secret")));

    let err = connect_to(&node, &config).await.unwrap_err();
    assert_matches!(err, ConnectionError::ConnectionInitError(err) => {
        assert_eq!(err.step, HandshakeStep::Authentication);
        assert_matches!(err.kind, ConnectionInitErrorKind::AuthenticatorFailure(_));
    });
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn keyspace_is_set_during_the_handshake() {
    setup_tracing();
    let node = MockNode::builder().build();

    let connection = connect_to(&node, &ConnectionConfig::default().with_keyspace("Ks", false))
        .await
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);

    let quoted = connect_to(&node, &ConnectionConfig::default().with_keyspace("MyKs", true))
        .await
        .unwrap();
    assert_eq!(quoted.state(), ConnectionState::Ready);

    let contents: Vec<_> = node
        .log()
        .queries()
        .into_iter()
        .map(|query| query.contents.into_owned())
        .collect();
    assert_eq!(contents, vec!["USE Ks".to_owned(), "USE \"MyKs\"".to_owned()]);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn invalid_keyspace_name_is_refused_before_connecting() {
    setup_tracing();
    let node = MockNode::builder().build();
    let err = connect_to(&node, &ConnectionConfig::default().with_keyspace("ks; DROP", false))
        .await
        .unwrap_err();
    assert_matches!(err, ConnectionError::BadKeyspaceName(_));
    assert_eq!(node.connections_accepted(), 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn confirmation_of_another_keyspace_fails_the_handshake() {
    setup_tracing();
    let node = MockNode::builder().build();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Query)
            .and(Condition::BodyContainsCaseSensitive(Box::new(*b"USE "))),
        RequestReaction::forge_response(Arc::new(|frame: RequestFrame| {
            let other = Response::Result(CqlResult::SetKeyspace(SetKeyspace {
                keyspace_name: "other".to_owned(),
            }));
            ResponseFrame::forged(frame.params, &other).unwrap()
        })),
    )]));

    let err = connect_to(&node, &ConnectionConfig::default().with_keyspace("ks", false))
        .await
        .unwrap_err();
    assert_matches!(err, ConnectionError::ConnectionInitError(err) => {
        assert_eq!(err.step, HandshakeStep::UseKeyspace);
        assert_matches!(
            err.kind,
            ConnectionInitErrorKind::KeyspaceNameMismatch { ref expected_keyspace_name_lowercase, ref result_keyspace_name_lowercase }
                if expected_keyspace_name_lowercase == "ks" && result_keyspace_name_lowercase == "other"
        );
    });
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn server_error_during_startup_is_reported_with_its_step() {
    setup_tracing();
    let node = MockNode::builder().build();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Startup),
        RequestReaction::forge_with_error(DbError::Overloaded),
    )]));

    let err = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap_err();
    assert_matches!(err, ConnectionError::ConnectionInitError(err) => {
        assert_eq!(err.step, HandshakeStep::Startup);
        assert_matches!(err.kind, ConnectionInitErrorKind::DbError(DbError::Overloaded, _));
    });
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn compressed_connections_page_through_results() {
    setup_tracing();
    for compression in [Compression::Lz4, Compression::Snappy] {
        let node = MockNode::builder()
            .password_auth("cassandra", "secret")
            .table(QUERY, Table::with_int_rows("ks", "t", "v", 30))
            .build();
        let config = ConnectionConfig::default()
            .with_compression(Some(compression))
            .with_keyspace("ks", false)
            .with_authenticator(Arc::new(PlainTextAuthenticator::new("cassandra", "secret")));

        let connection = connect_to(&node, &config).await.unwrap();
        assert_eq!(connection.compression(), Some(compression));

        let mut stream = connection
            .execute_continuous(
                Statement::new(QUERY),
                ContinuousPagingConfig::default()
                    .with_page_size(7)
                    .with_max_enqueued_pages(2),
            )
            .await
            .unwrap();
        let mut values = Vec::new();
        while let Some(page) = stream.next_page().await.unwrap() {
            values.extend(int_values(page.rows()));
        }
        assert_eq!(values, (0..30).collect::<Vec<_>>());
        assert!(!node.log().revisions().is_empty());
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn compression_unknown_to_the_server_is_not_used() {
    setup_tracing();
    let node = MockNode::builder()
        .compression(&[Compression::Snappy])
        .build();
    let config = ConnectionConfig::default().with_compression(Some(Compression::Lz4));

    let connection = connect_to(&node, &config).await.unwrap();
    assert_eq!(connection.compression(), None);
    connection
        .query(&Statement::new("INSERT INTO ks.t (v) VALUES (1)"))
        .await
        .unwrap();
}
