use std::time::Duration;

use assert_matches::assert_matches;
use sluice::errors::{NextPageError, RequestError};
use sluice::{BlockingConnection, ConnectionConfig, ConnectionState, ContinuousPagingConfig, Statement};
use sluice_mock::{MockNode, Table};
use tokio::runtime::Runtime;

use crate::utils::{connect_to, int_values, node_with_rows, setup_tracing, QUERY};

fn blocking_connection(runtime: &Runtime, node: &MockNode) -> BlockingConnection {
    let connection = runtime
        .block_on(connect_to(node, &ConnectionConfig::default()))
        .unwrap();
    BlockingConnection::new(connection, runtime.handle().clone())
}

#[test]
#[ntest::timeout(20000)]
fn rows_are_read_across_pages() {
    setup_tracing();
    let runtime = Runtime::new().unwrap();
    let node = node_with_rows(25);
    let connection = blocking_connection(&runtime, &node);

    let mut result_set = connection
        .execute(
            Statement::new(QUERY),
            ContinuousPagingConfig::default()
                .with_page_size(10)
                .with_max_enqueued_pages(1),
        )
        .unwrap();
    assert_eq!(result_set.remaining(), 10);
    let first = result_set.one().unwrap().unwrap();
    assert_eq!(int_values(&[first]), vec![0]);
    assert_eq!(result_set.remaining(), 9);

    let rest = result_set.collect_rows().unwrap();
    assert_eq!(int_values(&rest), (1..25).collect::<Vec<_>>());

    connection.close();
    assert_eq!(connection.connection().state(), ConnectionState::Closed);
    assert_matches!(
        connection.query(&Statement::new(QUERY)),
        Err(RequestError::NotConnected(ConnectionState::Closed))
    );
}

#[test]
#[ntest::timeout(20000)]
fn blocked_reader_wakes_up_at_the_deadline() {
    setup_tracing();
    let runtime = Runtime::new().unwrap();
    let node = MockNode::builder()
        .table(
            QUERY,
            Table::with_int_rows("ks", "t", "v", 30).with_other_pages_delay(Duration::from_secs(5)),
        )
        .build();
    let connection = blocking_connection(&runtime, &node);

    let result_set = connection
        .execute(
            Statement::new(QUERY),
            ContinuousPagingConfig::default()
                .with_page_size(10)
                .with_timeout(Some(Duration::from_millis(100))),
        )
        .unwrap();
    let results: Vec<_> = result_set.collect();
    assert_eq!(results.len(), 11);
    assert!(results[..10].iter().all(Result::is_ok));
    assert_matches!(
        &results[10],
        Err(NextPageError::Timeout(timeout)) if *timeout == Duration::from_millis(100)
    );
}

#[test]
#[ntest::timeout(20000)]
fn cancelled_result_set_ends_with_cancellation() {
    setup_tracing();
    let runtime = Runtime::new().unwrap();
    let node = node_with_rows(100);
    let connection = blocking_connection(&runtime, &node);

    let mut result_set = connection
        .execute(
            Statement::new(QUERY),
            ContinuousPagingConfig::default()
                .with_page_size(10)
                .with_max_enqueued_pages(1),
        )
        .unwrap();
    result_set.cancel();
    assert!(result_set.is_cancelled());

    // The rows of the page already received stay readable.
    let mut values = Vec::new();
    let mut error = None;
    for row in result_set.by_ref() {
        match row {
            Ok(row) => values.extend(int_values(&[row])),
            Err(err) => error = Some(err),
        }
    }
    assert_eq!(values, (0..10).collect::<Vec<_>>());
    assert_matches!(error, Some(NextPageError::Cancelled));
    assert!(result_set.next().is_none());
    assert_eq!(result_set.execution_infos().len(), 1);
}

#[test]
#[ntest::timeout(20000)]
fn unpaged_query_blocks_for_its_response() {
    setup_tracing();
    let runtime = Runtime::new().unwrap();
    let node = node_with_rows(3);
    let connection = blocking_connection(&runtime, &node);

    let response = connection.query(&Statement::new(QUERY)).unwrap();
    assert!(response.warnings.is_empty());
    assert_matches!(
        connection.query(&Statement::new("SELECT v FROM ks.missing")),
        Err(RequestError::DbError(_, _))
    );
}

#[test]
#[ntest::timeout(20000)]
fn one_worker_thread_is_enough_to_drive_blocking_calls() {
    setup_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let node = MockNode::builder()
        .table(
            QUERY,
            Table::with_int_rows("ks", "t", "v", 20).with_other_pages_delay(Duration::from_millis(20)),
        )
        .build();
    let connection = blocking_connection(&runtime, &node);

    // Waiting for the delayed page needs both the timer and the IO driver.
    let result_set = connection
        .execute(
            Statement::new(QUERY),
            ContinuousPagingConfig::default()
                .with_page_size(10)
                .with_max_enqueued_pages(1),
        )
        .unwrap();
    let rows = result_set.collect_rows().unwrap();
    assert_eq!(int_values(&rows), (0..20).collect::<Vec<_>>());
}
