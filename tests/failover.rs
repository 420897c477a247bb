//! End-to-end failover through the full storage surface: a sticky session
//! opened against `[A, B]` retargets to B when A reports itself offline,
//! with no caller involvement.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{spawn_scripted_node, Reply};
use riftdb_client::error::ERR_NODE_OFFLINE;
use riftdb_client::protocol::response::QueryResponse;
use riftdb_client::{protocol, ClientConfig, MsgpackSerializer, Record, RecordId, RemoteStorage, ServerError};
use serde_json::json;

async fn page_from(node: &str) -> Vec<u8> {
    QueryResponse {
        cursor_id: format!("cursor-{node}"),
        records: vec![Record {
            id: RecordId::new(1, 0),
            version: 1,
            kind: b'd',
            body: json!({ "node": node }),
        }],
        has_next_page: false,
    }
    .encode(&MsgpackSerializer)
    .await
    .unwrap()
}

fn quick_config() -> ClientConfig {
    let mut config = ClientConfig::default().with_retries(3, Duration::from_millis(10));
    config.request_timeout = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn test_sticky_session_retargets_when_node_goes_offline() {
    let (listener_a, url_a) = common::bind_node().await;
    let (listener_b, url_b) = common::bind_node().await;
    let page_a = page_from("a").await;
    let page_b = page_from("b").await;

    let a_queries = Arc::new(AtomicU32::new(0));
    let a_counter = Arc::clone(&a_queries);
    spawn_scripted_node(
        listener_a,
        Arc::new(move |frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(1),
            protocol::CMD_SUBSCRIBE => Reply::Ok(vec![frame.payload[0]]),
            protocol::CMD_QUERY => {
                if a_counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::Ok(page_a.clone())
                } else {
                    Reply::Err(ServerError::new(ERR_NODE_OFFLINE, "offline", "shutting down"))
                }
            }
            _ => Reply::Ok(Vec::new()),
        }),
    );
    let page_b_clone = page_b.clone();
    spawn_scripted_node(
        listener_b,
        Arc::new(move |frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(2),
            protocol::CMD_SUBSCRIBE => Reply::Ok(vec![frame.payload[0]]),
            protocol::CMD_QUERY => Reply::Ok(page_b_clone.clone()),
            _ => Reply::Ok(Vec::new()),
        }),
    );

    let storage = RemoteStorage::open(&[&url_a, &url_b], "crm", quick_config())
        .await
        .unwrap();
    let session = storage.open_session("admin", "secret").await.unwrap();
    assert_eq!(session.server_url(), Some(url_a.clone()));

    // First query lands on A.
    let records = storage
        .query(&session, "select from users", None)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(records[0].body, json!({ "node": "a" }));

    // A reports offline mid-sequence; the session retargets on its own.
    let records = storage
        .query(&session, "select from users", None)
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(records[0].body, json!({ "node": "b" }));
    assert_eq!(storage.addresses().urls(), vec![url_b.clone()]);
    assert_eq!(session.server_url(), Some(url_b));

    storage.close().await;
    assert!(storage.is_closed());
    assert!(storage
        .query(&session, "select from users", None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_paged_results_pin_the_session_until_drained() {
    let (listener, url) = common::bind_node().await;

    let first_page = QueryResponse {
        cursor_id: "c1".to_string(),
        records: vec![Record {
            id: RecordId::new(1, 0),
            version: 1,
            kind: b'd',
            body: json!({ "n": 1 }),
        }],
        has_next_page: true,
    }
    .encode(&MsgpackSerializer)
    .await
    .unwrap();
    let last_page = QueryResponse {
        cursor_id: "c1".to_string(),
        records: vec![Record {
            id: RecordId::new(1, 1),
            version: 1,
            kind: b'd',
            body: json!({ "n": 2 }),
        }],
        has_next_page: false,
    }
    .encode(&MsgpackSerializer)
    .await
    .unwrap();

    spawn_scripted_node(
        listener,
        Arc::new(move |frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(1),
            protocol::CMD_SUBSCRIBE => Reply::Ok(vec![frame.payload[0]]),
            protocol::CMD_QUERY => Reply::Ok(first_page.clone()),
            protocol::CMD_QUERY_NEXT_PAGE => Reply::Ok(last_page.clone()),
            _ => Reply::Ok(Vec::new()),
        }),
    );

    let storage = RemoteStorage::open(&[&url], "crm", quick_config())
        .await
        .unwrap();
    let session = storage.open_session("admin", "secret").await.unwrap();

    let mut results = storage
        .query(&session, "select from users", None)
        .await
        .unwrap();
    // An open cursor pins the session to its node.
    assert!(session.is_sticky());

    let mut seen = Vec::new();
    while let Some(record) = results.next().await.unwrap() {
        seen.push(record.body["n"].as_i64().unwrap());
    }
    assert_eq!(seen, vec![1, 2]);
    // Draining the cursor released the pin.
    assert!(!session.is_sticky());

    storage.close().await;
}
