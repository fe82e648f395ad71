use std::time::Duration;

use assert_matches::assert_matches;
use futures::TryStreamExt;
use sluice::errors::{BadPagingConfig, NextPageError, RequestError};
use sluice::frame::request::Revise;
use sluice::frame::response::error::DbError;
use sluice::frame::ProtocolVersion;
use sluice::{
    ConnectionConfig, ContinuousPagingConfig, GraphOptions, PagingMode, Statement, StreamState,
};
use sluice_mock::{MockNode, Table};
use tokio::time::Instant;

use crate::utils::{connect_to, eventually, int_values, node_with_rows, setup_tracing, QUERY};

#[tokio::test]
#[ntest::timeout(20000)]
async fn pages_arrive_in_order_and_credit_follows_consumption() {
    setup_tracing();
    let node = node_with_rows(100);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();
    assert_eq!(connection.protocol_version(), ProtocolVersion::DseV2);

    let config = ContinuousPagingConfig::default()
        .with_page_size(10)
        .with_max_pages(10)
        .with_max_enqueued_pages(1);
    let mut stream = connection
        .execute_continuous(Statement::new(QUERY), config)
        .await
        .unwrap();
    assert!(stream.is_continuous());
    let stream_id = stream.stream_id().unwrap();

    let first = stream.next_page().await.unwrap().unwrap();
    assert_eq!(first.page_number(), 1);
    assert!(first.has_more_pages());

    // The page held by the caller fills the window, so no credit is granted yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node.log().revisions().is_empty());
    assert_eq!(stream.flow_control().in_use(), 1);

    let mut values = int_values(first.rows());
    let mut page_numbers = vec![first.page_number()];
    while let Some(page) = stream.next_page().await.unwrap() {
        assert!(stream.flow_control().in_use() <= 1);
        assert_eq!(page.execution_info().stream_id, stream_id);
        page_numbers.push(page.page_number());
        values.extend(int_values(page.rows()));
    }
    assert_eq!(page_numbers, (1..=10).collect::<Vec<_>>());
    assert_eq!(values, (0..100).collect::<Vec<_>>());
    assert_eq!(stream.state(), StreamState::Exhausted);
    assert_eq!(stream.execution_infos().len(), 10);

    let queries = node.log().queries();
    assert_eq!(queries.len(), 1);
    let options = queries[0].parameters.continuous_paging.unwrap();
    assert_eq!((options.max_pages, options.next_pages), (10, 1));
    assert_eq!(queries[0].parameters.page_size, Some(10));

    let revisions = node.log().revisions();
    assert_eq!(revisions.len(), 9);
    for revision in revisions {
        assert_eq!(
            revision,
            Revise::MoreContinuousPages {
                target_stream: stream_id,
                next_pages: 1
            }
        );
    }
    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn max_pages_ends_the_stream_early() {
    setup_tracing();
    let node = node_with_rows(100);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let config = ContinuousPagingConfig::default()
        .with_page_size(10)
        .with_max_pages(3);
    let mut stream = connection
        .execute_continuous(Statement::new(QUERY), config)
        .await
        .unwrap();

    let mut pages = Vec::new();
    while let Some(page) = stream.next_page().await.unwrap() {
        pages.push(page);
    }
    assert_eq!(pages.len(), 3);
    assert!(!pages[2].has_more_pages());
    assert_eq!(int_values(pages[2].rows()), (20..30).collect::<Vec<_>>());
    assert_eq!(stream.state(), StreamState::Exhausted);
    assert!(node
        .log()
        .revisions()
        .iter()
        .all(|revision| matches!(revision, Revise::MoreContinuousPages { .. })));
    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn cancelled_stream_keeps_received_pages_and_frees_its_stream_id() {
    setup_tracing();
    let node = node_with_rows(100);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let config = ContinuousPagingConfig::default()
        .with_page_size(10)
        .with_max_enqueued_pages(2);
    let mut stream = connection
        .execute_continuous(Statement::new(QUERY), config)
        .await
        .unwrap();
    let stream_id = stream.stream_id().unwrap();

    let first = stream.next_page().await.unwrap().unwrap();
    assert_eq!(int_values(first.rows()), (0..10).collect::<Vec<_>>());
    // Let the second page, for which the server had credit, arrive.
    tokio::time::sleep(Duration::from_millis(50)).await;

    stream.cancel();
    assert!(stream.is_cancelled());
    assert_eq!(stream.state(), StreamState::Cancelled);

    let second = stream.next_page().await.unwrap().unwrap();
    assert_eq!(int_values(second.rows()), (10..20).collect::<Vec<_>>());
    assert_matches!(stream.next_page().await, Err(NextPageError::Cancelled));
    assert_matches!(stream.next_page().await, Err(NextPageError::Cancelled));

    assert!(
        eventually(|| node
            .log()
            .revisions()
            .contains(&Revise::CancelContinuousPaging {
                target_stream: stream_id
            }))
        .await
    );
    // The id stays taken until the server confirms the cancellation.
    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
    assert!(connection.diagnostics().late_frames_dropped() >= 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn dropping_an_active_stream_cancels_it() {
    setup_tracing();
    let node = node_with_rows(100);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let mut stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default().with_page_size(5),
        )
        .await
        .unwrap();
    stream.next_page().await.unwrap().unwrap();
    drop(stream);

    assert!(
        eventually(|| node
            .log()
            .revisions()
            .iter()
            .any(|revision| matches!(revision, Revise::CancelContinuousPaging { .. })))
        .await
    );
    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn server_error_fails_the_stream_after_delivered_pages() {
    setup_tracing();
    let node = MockNode::builder()
        .table(
            QUERY,
            Table::with_int_rows("ks", "t", "v", 50).failing_after(
                2,
                DbError::ServerError,
                "disk failure",
            ),
        )
        .build();
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let mut stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default().with_page_size(10),
        )
        .await
        .unwrap();
    assert_eq!(stream.next_page().await.unwrap().unwrap().page_number(), 1);
    assert_eq!(stream.next_page().await.unwrap().unwrap().page_number(), 2);

    let err = stream.next_page().await.unwrap_err();
    assert_matches!(&err, NextPageError::DbError(DbError::ServerError, reason) if reason == "disk failure");
    assert_eq!(stream.state(), StreamState::Failed);
    // The error ending the stream is returned again.
    assert_matches!(stream.next_page().await, Err(NextPageError::DbError(DbError::ServerError, _)));
    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn page_size_in_bytes_splits_pages_by_size() {
    setup_tracing();
    let node = node_with_rows(10);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    // Each row takes 8 bytes, so pages hold two rows.
    let stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default().with_page_size_in_bytes(20),
        )
        .await
        .unwrap();
    let rows: Vec<_> = stream.into_row_stream().try_collect().await.unwrap();
    assert_eq!(int_values(&rows), (0..10).collect::<Vec<_>>());

    let queries = node.log().queries();
    assert!(queries[0].parameters.page_size_in_bytes);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn page_size_in_bytes_is_refused_where_it_cannot_be_honoured() {
    setup_tracing();
    let node = node_with_rows(10);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();
    let in_bytes = ContinuousPagingConfig::default().with_page_size_in_bytes(1000);

    let graph = Statement::graph("g.V()", GraphOptions::for_graph("social"));
    assert!(graph.is_graph());
    let err = connection
        .execute_continuous(graph, in_bytes.clone())
        .await
        .unwrap_err();
    assert_matches!(
        err,
        NextPageError::BadPagingConfig(BadPagingConfig::PageSizeInBytesUnsupported(_))
    );

    let v4 = connect_to(
        &node,
        &ConnectionConfig::default().with_protocol_version(ProtocolVersion::V4),
    )
    .await
    .unwrap();
    let err = v4
        .execute_continuous(Statement::new(QUERY), in_bytes)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        NextPageError::BadPagingConfig(BadPagingConfig::PageSizeInBytesUnsupported(_))
    );

    // Nothing was sent for either query.
    assert!(node.log().queries().is_empty());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn invalid_paging_config_is_refused_before_sending() {
    setup_tracing();
    let node = node_with_rows(10);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let err = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default().with_max_enqueued_pages(0),
        )
        .await
        .unwrap_err();
    assert_matches!(err, NextPageError::BadPagingConfig(BadPagingConfig::ZeroWindow));
    let err = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default().with_page_size(0),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        NextPageError::BadPagingConfig(BadPagingConfig::NonPositivePageSize(0))
    );
    assert!(node.log().queries().is_empty());
    assert_eq!(connection.stream_ids_in_use(), 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn versions_without_page_credits_fall_back_to_classic_paging() {
    setup_tracing();
    let node = node_with_rows(25);
    let config = ConnectionConfig::default().with_protocol_version(ProtocolVersion::DseV1);
    let connection = connect_to(&node, &config).await.unwrap();
    assert_eq!(connection.protocol_version(), ProtocolVersion::DseV1);

    let mut stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default()
                .with_page_size(10)
                .with_mode(PagingMode::Enabled),
        )
        .await
        .unwrap();
    assert!(!stream.is_continuous());
    assert_eq!(stream.stream_id(), None);

    let mut sizes = Vec::new();
    let mut values = Vec::new();
    while let Some(page) = stream.next_page().await.unwrap() {
        sizes.push(page.rows().len());
        values.extend(int_values(page.rows()));
    }
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(values, (0..25).collect::<Vec<_>>());

    let queries = node.log().queries();
    assert_eq!(queries.len(), 3);
    assert!(queries
        .iter()
        .all(|query| query.parameters.continuous_paging.is_none()));
    assert!(queries[1].parameters.paging_state.as_bytes_slice().is_some());
    assert!(node.log().revisions().is_empty());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn disabled_paging_fetches_everything_at_once() {
    setup_tracing();
    let node = node_with_rows(25);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let mut stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default().with_mode(PagingMode::Disabled),
        )
        .await
        .unwrap();
    let page = stream.next_page().await.unwrap().unwrap();
    assert_eq!(page.rows().len(), 25);
    assert!(!page.has_more_pages());
    assert_matches!(stream.next_page().await, Ok(None));
    assert_eq!(node.log().queries()[0].parameters.page_size, None);
}

#[tokio::test(start_paused = true)]
#[ntest::timeout(20000)]
async fn capped_page_rate_spaces_out_pages() {
    setup_tracing();
    let node = node_with_rows(5);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let start = Instant::now();
    let config = ContinuousPagingConfig::default()
        .with_page_size(1)
        .with_max_pages_per_second(10);
    let mut stream = connection
        .execute_continuous(Statement::new(QUERY), config)
        .await
        .unwrap();
    let mut pages = 0;
    while stream.next_page().await.unwrap().is_some() {
        pages += 1;
        assert!(stream.flow_control().outstanding <= 1);
    }
    assert_eq!(pages, 5);
    assert!(start.elapsed() >= Duration::from_millis(400));
    assert_eq!(
        node.log().queries()[0]
            .parameters
            .continuous_paging
            .unwrap()
            .next_pages,
        1
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn async_result_set_walks_pages() {
    setup_tracing();
    let node = node_with_rows(25);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let mut result_set = connection
        .execute_async(
            Statement::new(QUERY),
            ContinuousPagingConfig::default().with_page_size(10),
        )
        .await
        .unwrap();
    assert_eq!(result_set.metadata().col_specs().len(), 1);
    assert_eq!(result_set.remaining(), 10);
    assert_eq!(result_set.one().map(|row| int_values(&[row])), Some(vec![0]));

    let mut values = vec![0];
    loop {
        let rows: Vec<_> = result_set.rows().collect();
        values.extend(int_values(&rows));
        assert_eq!(result_set.remaining(), 0);
        if !result_set.has_more_pages() {
            break;
        }
        result_set = result_set.fetch_next_page().await.unwrap();
    }
    assert_eq!(values, (0..25).collect::<Vec<_>>());
    assert_eq!(result_set.page_number(), 3);
    assert_matches!(
        result_set.fetch_next_page().await,
        Err(NextPageError::NoMorePages)
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unknown_table_fails_the_first_page() {
    setup_tracing();
    let node = node_with_rows(5);
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let err = connection
        .execute_async(
            Statement::new("SELECT v FROM ks.missing"),
            ContinuousPagingConfig::default(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, NextPageError::DbError(DbError::Invalid, _));
    assert!(eventually(|| connection.stream_ids_in_use() == 0).await);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn credit_that_cannot_be_granted_fails_the_stream() {
    setup_tracing();
    let node = node_with_rows(100);
    // The stream holds the only stream id, so no REVISE can be sent.
    let config = ConnectionConfig::default().with_max_requests_per_connection(1);
    let connection = connect_to(&node, &config).await.unwrap();

    let mut stream = connection
        .execute_continuous(
            Statement::new(QUERY),
            ContinuousPagingConfig::default()
                .with_page_size(10)
                .with_max_enqueued_pages(1),
        )
        .await
        .unwrap();
    let first = stream.next_page().await.unwrap().unwrap();
    assert_eq!(int_values(first.rows()), (0..10).collect::<Vec<_>>());

    assert_matches!(
        stream.next_page().await,
        Err(NextPageError::RequestFailure(RequestError::StreamExhausted))
    );
    assert_eq!(stream.state(), StreamState::Failed);
    assert_eq!(stream.flow_control().outstanding, 0);
    assert!(node.log().revisions().is_empty());
}
