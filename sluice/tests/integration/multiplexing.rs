use std::collections::HashSet;
use std::time::Duration;

use assert_matches::assert_matches;
use futures::future::join_all;
use sluice::errors::{BrokenConnectionErrorKind, NextPageError, RequestError};
use sluice::frame::request::Options;
use sluice::frame::response::Response;
use sluice::{ConnectionConfig, ConnectionState, ContinuousPagingConfig, Statement};
use sluice_mock::{Condition, MockNode, RequestOpcode, RequestReaction, RequestRule};

use crate::utils::{connect_to, eventually, int_values, node_with_rows, setup_tracing, QUERY};

fn insert(value: usize) -> Statement {
    Statement::new(format!("INSERT INTO ks.t (v) VALUES ({value})"))
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn concurrent_requests_get_distinct_stream_ids() {
    setup_tracing();
    let node = MockNode::builder().build();
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();
    // Hold every answer back so that all the requests are in flight together.
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Query),
        RequestReaction::delay(Duration::from_millis(100)),
    )]));
    node.log().clear();

    let statements: Vec<_> = (0..50).map(insert).collect();
    let results = join_all(
        statements
            .iter()
            .map(|statement| connection.query(statement)),
    )
    .await;
    for result in results {
        assert_matches!(result.unwrap().response, Response::Result(_));
    }

    let stream_ids: HashSet<i16> = node
        .log()
        .requests()
        .iter()
        .map(|request| request.params.stream)
        .collect();
    assert_eq!(stream_ids.len(), 50);
    assert!(stream_ids.iter().all(|&id| id >= 0));
    assert_eq!(connection.stream_ids_in_use(), 0);
    assert_eq!(connection.pending_requests(), 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn exhausted_stream_ids_fail_the_request_at_once() {
    setup_tracing();
    let node = MockNode::builder().build();
    let config = ConnectionConfig::default().with_max_requests_per_connection(4);
    let connection = connect_to(&node, &config).await.unwrap();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Query),
        RequestReaction::delay(Duration::from_millis(200)),
    )]));

    let statements: Vec<_> = (0..5).map(insert).collect();
    let results = join_all(
        statements
            .iter()
            .map(|statement| connection.query(statement)),
    )
    .await;
    let exhausted = results
        .iter()
        .filter(|result| matches!(result, Err(RequestError::StreamExhausted)))
        .count();
    assert_eq!(exhausted, 1);
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 4);

    // The ids are free again once the answers arrived.
    connection.query(&insert(5)).await.unwrap();
    assert_eq!(connection.stream_ids_in_use(), 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn stream_ids_are_reused_after_streams_end() {
    setup_tracing();
    let node = node_with_rows(20);
    let config = ConnectionConfig::default().with_max_requests_per_connection(2);
    let connection = connect_to(&node, &config).await.unwrap();

    // More queries than ids, run one after another.
    for _ in 0..5 {
        let mut stream = connection
            .execute_continuous(
                Statement::new(QUERY),
                ContinuousPagingConfig::default().with_page_size(10),
            )
            .await
            .unwrap();
        let mut values = Vec::new();
        while let Some(page) = stream.next_page().await.unwrap() {
            values.extend(int_values(page.rows()));
        }
        assert_eq!(values, (0..20).collect::<Vec<_>>());
        assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
    }
    assert_eq!(node.log().queries().len(), 5);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn close_is_idempotent_and_refuses_later_requests() {
    setup_tracing();
    let node = node_with_rows(20);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();
    let mut states = connection.subscribe_state();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Ready);

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(states.has_changed().unwrap());

    assert_matches!(
        connection.send_request(&Options, None).await,
        Err(RequestError::NotConnected(ConnectionState::Closed))
    );
    assert_matches!(
        connection.query(&insert(1)).await,
        Err(RequestError::NotConnected(ConnectionState::Closed))
    );
    assert_matches!(
        connection
            .execute_continuous(Statement::new(QUERY), ContinuousPagingConfig::default())
            .await,
        Err(NextPageError::RequestFailure(RequestError::NotConnected(ConnectionState::Closed)))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn closing_fails_a_waiting_stream() {
    setup_tracing();
    let node = node_with_rows(100);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();
    // Pages after the first are never sent.
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Revise),
        RequestReaction::drop_frame(),
    )]));

    let mut stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default()
                .with_page_size(10)
                .with_max_enqueued_pages(1),
        )
        .await
        .unwrap();
    stream.next_page().await.unwrap().unwrap();

    let (next, ()) = tokio::join!(stream.next_page(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        connection.close().await;
    });
    assert_matches!(
        next,
        Err(NextPageError::RequestFailure(RequestError::ConnectionClosed))
    );
    assert_eq!(connection.stream_ids_in_use(), 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn dropped_transport_fails_pending_requests() {
    setup_tracing();
    let node = MockNode::builder().build();
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Query),
        RequestReaction::drop_connection_after(Duration::from_millis(20)),
    )]));

    let err = connection.query(&insert(1)).await.unwrap_err();
    assert_matches!(err, RequestError::BrokenConnection(_));
    assert_eq!(connection.state(), ConnectionState::Failed);
    assert_matches!(
        connection.query(&insert(2)).await,
        Err(RequestError::NotConnected(ConnectionState::Failed))
    );
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn unanswered_keepalive_breaks_the_connection() {
    setup_tracing();
    let node = MockNode::builder().build();
    let config = ConnectionConfig::default().with_keepalive(
        Some(Duration::from_millis(500)),
        Some(Duration::from_secs(1)),
    );
    let connection = connect_to(&node, &config).await.unwrap();
    // The handshake used OPTIONS too, so the rule goes in only now.
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Options),
        RequestReaction::drop_frame(),
    )]));

    let mut states = connection.subscribe_state();
    let state = *states.wait_for(|state| state.is_terminal()).await.unwrap();
    assert_eq!(state, ConnectionState::Failed);
    assert_matches!(
        connection.query(&insert(1)).await,
        Err(RequestError::NotConnected(ConnectionState::Failed))
    );
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn answered_keepalives_keep_the_connection_ready() {
    setup_tracing();
    let node = MockNode::builder().build();
    let config = ConnectionConfig::default().with_keepalive(
        Some(Duration::from_millis(500)),
        Some(Duration::from_secs(1)),
    );
    let connection = connect_to(&node, &config).await.unwrap();
    let options_after_handshake = node.log().count(RequestOpcode::Options);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(connection.state(), ConnectionState::Ready);
    assert!(node.log().count(RequestOpcode::Options) >= options_after_handshake + 4);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn keepalive_failure_is_reported_to_waiting_requests() {
    setup_tracing();
    let node = MockNode::builder().build();
    let config = ConnectionConfig::default().with_keepalive(
        Some(Duration::from_millis(50)),
        Some(Duration::from_millis(100)),
    );
    let connection = connect_to(&node, &config).await.unwrap();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Options).or(Condition::RequestOpcode(RequestOpcode::Query)),
        RequestReaction::drop_frame(),
    )]));

    let err = connection
        .query(&insert(1).with_timeout(Some(Duration::from_secs(10))))
        .await
        .unwrap_err();
    assert_matches!(err, RequestError::BrokenConnection(broken) => {
        assert_matches!(broken.kind(), BrokenConnectionErrorKind::KeepaliveTimeout(_));
    });
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn unanswered_requests_on_a_small_pool_break_the_connection() {
    setup_tracing();
    let node = MockNode::builder().build();
    let config = ConnectionConfig::default().with_max_requests_per_connection(2);
    let connection = connect_to(&node, &config).await.unwrap();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Query),
        RequestReaction::drop_frame(),
    )]));

    for value in 0..2 {
        let statement = insert(value).with_timeout(Some(Duration::from_millis(50)));
        assert_matches!(connection.query(&statement).await, Err(RequestError::Timeout(_)));
    }
    assert_eq!(connection.stream_ids_in_use(), 2);
    assert_matches!(
        connection.query(&insert(2)).await,
        Err(RequestError::StreamExhausted)
    );

    // The quarantined ids are never answered, so the connection gives up on them.
    let mut states = connection.subscribe_state();
    let state = *states.wait_for(|state| state.is_terminal()).await.unwrap();
    assert_eq!(state, ConnectionState::Failed);
    assert_eq!(connection.stream_ids_in_use(), 0);
    assert_matches!(
        connection.query(&insert(3)).await,
        Err(RequestError::NotConnected(ConnectionState::Failed))
    );
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn unconfirmed_cancel_on_a_single_id_pool_breaks_the_connection() {
    setup_tracing();
    let node = node_with_rows(100);
    let config = ConnectionConfig::default().with_max_requests_per_connection(1);
    let connection = connect_to(&node, &config).await.unwrap();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Revise),
        RequestReaction::drop_frame(),
    )]));

    let mut stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default()
                .with_page_size(10)
                .with_max_enqueued_pages(1),
        )
        .await
        .unwrap();
    stream.next_page().await.unwrap().unwrap();
    // The server never learns about the cancellation and keeps the session open.
    stream.cancel();
    assert_eq!(connection.stream_ids_in_use(), 1);

    let mut states = connection.subscribe_state();
    let state = *states.wait_for(|state| state.is_terminal()).await.unwrap();
    assert_eq!(state, ConnectionState::Failed);
    assert_eq!(connection.stream_ids_in_use(), 0);
}
