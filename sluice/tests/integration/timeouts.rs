use std::time::Duration;

use assert_matches::assert_matches;
use sluice::errors::{ConnectionError, ConnectionInitErrorKind, NextPageError, RequestError};
use sluice::network::HandshakeStep;
use sluice::{ConnectionConfig, ContinuousPagingConfig, Statement, StreamState};
use sluice_mock::{Condition, MockNode, RequestOpcode, RequestReaction, RequestRule, Table};

use crate::utils::{connect_to, eventually, int_values, setup_tracing, QUERY};

fn node_with_delays(first_page: Option<Duration>, other_pages: Option<Duration>) -> MockNode {
    let mut table = Table::with_int_rows("ks", "t", "v", 50);
    if let Some(delay) = first_page {
        table = table.with_first_page_delay(delay);
    }
    if let Some(delay) = other_pages {
        table = table.with_other_pages_delay(delay);
    }
    MockNode::builder().table(QUERY, table).build()
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn global_timeout_fails_a_late_page() {
    setup_tracing();
    let node = node_with_delays(None, Some(Duration::from_millis(500)));
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let config = ContinuousPagingConfig::default()
        .with_page_size(10)
        .with_timeout(Some(Duration::from_millis(100)));
    let mut stream = connection
        .execute_continuous(Statement::new(QUERY), config)
        .await
        .unwrap();
    let first = stream.next_page().await.unwrap().unwrap();
    assert_eq!(int_values(first.rows()), (0..10).collect::<Vec<_>>());

    let err = stream.next_page().await.unwrap_err();
    assert_matches!(err, NextPageError::Timeout(timeout) if timeout == Duration::from_millis(100));
    assert_eq!(err.to_string(), "Query timed out after 100ms");
    assert_eq!(stream.state(), StreamState::TimedOut);
    assert_matches!(stream.next_page().await, Err(NextPageError::Timeout(_)));

    // The server is told to stop and confirms; only then is the id free again.
    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn statement_timeout_overrides_the_paging_timeout() {
    setup_tracing();
    let node = node_with_delays(Some(Duration::from_secs(1)), None);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let config = ContinuousPagingConfig::default().with_timeout(Some(Duration::from_secs(10)));
    let statement = Statement::new(QUERY).with_timeout(Some(Duration::from_millis(150)));
    let mut stream = connection
        .execute_continuous(statement, config)
        .await
        .unwrap();
    assert_matches!(
        stream.next_page().await,
        Err(NextPageError::Timeout(timeout)) if timeout == Duration::from_millis(150)
    );
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn first_page_timeout_bounds_the_first_fetch() {
    setup_tracing();
    let node = node_with_delays(Some(Duration::from_millis(200)), None);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let config = ContinuousPagingConfig::default()
        .with_page_timeouts(Some(Duration::from_millis(50)), None);
    let err = connection
        .execute_async(Statement::new(QUERY), config)
        .await
        .unwrap_err();
    assert_matches!(err, NextPageError::Timeout(timeout) if timeout == Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn other_pages_timeout_bounds_each_later_fetch() {
    setup_tracing();
    let node = node_with_delays(None, Some(Duration::from_millis(200)));
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let config = ContinuousPagingConfig::default()
        .with_page_size(10)
        .with_page_timeouts(None, Some(Duration::from_millis(50)));
    let mut stream = connection
        .execute_continuous(Statement::new(QUERY), config)
        .await
        .unwrap();
    stream.next_page().await.unwrap().unwrap();
    assert_matches!(
        stream.next_page().await,
        Err(NextPageError::Timeout(timeout)) if timeout == Duration::from_millis(50)
    );
    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn per_fetch_timeout_is_measured_per_page() {
    setup_tracing();
    let node = node_with_delays(None, Some(Duration::from_millis(30)));
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    // The whole query takes longer than the per-fetch timeout, but no single page does.
    let config = ContinuousPagingConfig::default()
        .with_page_size(10)
        .with_max_enqueued_pages(1)
        .with_page_timeouts(None, Some(Duration::from_millis(50)));
    let mut stream = connection
        .execute_continuous(Statement::new(QUERY), config)
        .await
        .unwrap();
    let mut pages = 0;
    while stream.next_page().await.unwrap().is_some() {
        pages += 1;
    }
    assert_eq!(pages, 5);
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn unanswered_request_times_out_and_its_late_response_is_dropped() {
    setup_tracing();
    let node = MockNode::builder().build();
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Query),
        RequestReaction::delay(Duration::from_millis(300)),
    )]));

    let statement =
        Statement::new("INSERT INTO ks.t (v) VALUES (1)").with_timeout(Some(Duration::from_millis(100)));
    let err = connection.query(&statement).await.unwrap_err();
    assert_matches!(err, RequestError::Timeout(timeout) if timeout == Duration::from_millis(100));
    assert_eq!(err.to_string(), "Request timed out after 100ms");
    // The id is quarantined until the response shows up.
    assert_eq!(connection.stream_ids_in_use(), 1);
    assert_eq!(connection.pending_requests(), 0);

    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
    assert_eq!(connection.diagnostics().late_frames_dropped(), 1);
    assert_eq!(connection.diagnostics().protocol_anomalies(), 0);
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn slow_use_statement_times_out_the_keyspace_step() {
    setup_tracing();
    let node = MockNode::builder().build();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Query)
            .and(Condition::BodyContainsCaseInsensitive(Box::new(*b"USE "))),
        RequestReaction::delay(Duration::from_secs(1)),
    )]));

    let config = ConnectionConfig::default()
        .with_keyspace("ks", false)
        .with_set_keyspace_timeout(Duration::from_millis(200));
    let err = connect_to(&node, &config).await.unwrap_err();
    assert_matches!(err, ConnectionError::ConnectionInitError(err) => {
        assert_eq!(err.step, HandshakeStep::UseKeyspace);
        assert_matches!(err.kind, ConnectionInitErrorKind::StepTimeout(timeout) if timeout == Duration::from_millis(200));
    });
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn unanswered_startup_times_out_the_startup_step() {
    setup_tracing();
    let node = MockNode::builder().build();
    node.change_request_rules(Some(vec![RequestRule(
        Condition::RequestOpcode(RequestOpcode::Startup),
        RequestReaction::drop_frame(),
    )]));

    let config = ConnectionConfig::default().with_init_query_timeout(Duration::from_millis(300));
    let err = connect_to(&node, &config).await.unwrap_err();
    assert_matches!(err, ConnectionError::ConnectionInitError(err) => {
        assert_eq!(err.step, HandshakeStep::Startup);
        assert_matches!(err.kind, ConnectionInitErrorKind::StepTimeout(_));
    });
    assert_eq!(node.connections_accepted(), 1);
}
