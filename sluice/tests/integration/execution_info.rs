use std::net::SocketAddr;

use sluice::frame::request::query::Query;
use sluice::frame::FLAG_TRACING;
use sluice::{ConnectionConfig, ContinuousPagingConfig, Statement};
use sluice_mock::{MockNode, Table};
use uuid::Uuid;

use crate::utils::{connect_to, setup_tracing, QUERY};

const WARNING: &str = "Aggregation query used without partition key";

fn tracing_id(connection: usize, stream_id: i16) -> Uuid {
    Uuid::from_u128(((connection as u128) << 16) | stream_id as u16 as u128)
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn pages_carry_tracing_ids_and_warnings() {
    setup_tracing();
    let node = MockNode::builder()
        .table(
            QUERY,
            Table::with_int_rows("ks", "t", "v", 30).with_warning(WARNING),
        )
        .build();
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let mut stream = connection
        .execute_continuous(
            Statement::new(QUERY).with_tracing(true),
            ContinuousPagingConfig::default().with_page_size(10),
        )
        .await
        .unwrap();
    let stream_id = stream.stream_id().unwrap();
    let mut infos = Vec::new();
    while let Some(page) = stream.next_page().await.unwrap() {
        infos.push(page.execution_info().clone());
    }

    assert_eq!(infos.len(), 3);
    for (index, info) in infos.iter().enumerate() {
        assert_eq!(info.page_number, index as i32 + 1);
        assert_eq!(info.stream_id, stream_id);
        assert_eq!(info.coordinator, SocketAddr::from(([127, 0, 0, 1], 9042)));
        assert_eq!(info.tracing_id, Some(tracing_id(0, stream_id)));
        assert_eq!(info.warnings, vec![WARNING.to_owned()]);
    }
    assert!(infos
        .windows(2)
        .all(|pair| pair[0].received_at <= pair[1].received_at));
    assert_eq!(stream.execution_infos().len(), 3);

    let query = node.log().requests().into_iter().find(|request| {
        matches!(&request.request, Some(sluice::frame::request::Request::Query(Query { contents, .. })) if contents == QUERY)
    });
    assert!(query.unwrap().params.flags & FLAG_TRACING != 0);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn untraced_pages_have_no_tracing_id() {
    setup_tracing();
    let node = MockNode::builder()
        .table(QUERY, Table::with_int_rows("ks", "t", "v", 5))
        .build();
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let result_set = connection
        .execute_async(Statement::new(QUERY), ContinuousPagingConfig::default())
        .await
        .unwrap();
    let info = result_set.execution_info();
    assert_eq!(info.tracing_id, None);
    assert!(info.warnings.is_empty());
    assert_eq!(info.page_number, 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unpaged_query_reports_tracing_id_and_warnings() {
    setup_tracing();
    let node = MockNode::builder()
        .table(
            QUERY,
            Table::with_int_rows("ks", "t", "v", 5).with_warning(WARNING),
        )
        .build();
    let connection = connect_to(&node, &ConnectionConfig::default())
        .await
        .unwrap();

    let response = connection
        .query(&Statement::new(QUERY).with_tracing(true))
        .await
        .unwrap();
    let query = node.log().requests().pop().unwrap();
    assert_eq!(
        response.tracing_id,
        Some(tracing_id(query.connection, query.params.stream))
    );
    assert_eq!(response.warnings, vec![WARNING.to_owned()]);
}
