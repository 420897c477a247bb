//! Retry, redirect and reopen behavior of the request executor against
//! scripted servers.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{spawn_scripted_node as spawn_node, Reply};
use tokio::io::AsyncWriteExt;
use riftdb_client::error::{
    ERR_APP_BASE, ERR_DB_FROZEN, ERR_NODE_OFFLINE, ERR_REDIRECT, ERR_TOKEN_EXPIRED,
};
use riftdb_client::{
    AddressList, ClientConfig, ClientSession, ConnectionPool, DriverError, Request,
    RequestExecutor, ServerError, ServerErrorKind, SessionRegistry,
};
use riftdb_client::protocol;

fn quick_config(retries: u32) -> ClientConfig {
    ClientConfig::default().with_retries(retries, Duration::from_millis(5))
}

fn build<S: AsRef<str>>(
    urls: &[S],
    mut config: ClientConfig,
) -> (RequestExecutor, Arc<ClientSession>, Arc<AddressList>) {
    config.freeze_backoff = Duration::from_millis(5);
    config.acquire_timeout = Duration::from_secs(1);
    config.request_timeout = Duration::from_secs(2);
    let addresses = Arc::new(AddressList::new(urls, false).unwrap());
    let pool = Arc::new(ConnectionPool::new(4));
    let sessions = Arc::new(SessionRegistry::new());
    let executor = RequestExecutor::new(
        Arc::clone(&addresses),
        pool,
        Arc::clone(&sessions),
        config,
        Some("crm".to_string()),
        "msgpack-v1".to_string(),
        Arc::new(AtomicBool::new(false)),
    );
    let session = sessions.new_session("admin", "secret");
    (executor, session, addresses)
}

#[tokio::test]
async fn test_redirect_retargets_without_spending_budget() {
    let (listener_a, url_a) = common::bind_node().await;
    let (listener_b, url_b) = common::bind_node().await;

    let redirect_to = url_b.clone();
    spawn_node(
        listener_a,
        Arc::new(move |frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(1),
            _ => Reply::Err(ServerError::new(ERR_REDIRECT, redirect_to.clone(), "moved")),
        }),
    );
    spawn_node(
        listener_b,
        Arc::new(|frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(2),
            _ => Reply::Ok(b"cfg".to_vec()),
        }),
    );

    // A budget of one means any budgeted retry would fail the call, so
    // success proves the redirect was free.
    let (executor, session, addresses) = build(&[&url_a], quick_config(1));
    let payload = executor.execute(&session, &Request::Reload).await.unwrap();
    assert_eq!(payload, b"cfg");
    assert_eq!(session.server_url(), Some(url_b.clone()));
    assert!(addresses.urls().contains(&url_b));
}

#[tokio::test]
async fn test_node_offline_removes_url_and_retargets() {
    let (listener_a, url_a) = common::bind_node().await;
    let (listener_b, url_b) = common::bind_node().await;

    spawn_node(
        listener_a,
        Arc::new(|frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(1),
            _ => Reply::Err(ServerError::new(ERR_NODE_OFFLINE, "offline", "shutting down")),
        }),
    );
    spawn_node(
        listener_b,
        Arc::new(|frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(2),
            _ => Reply::Ok(b"cfg".to_vec()),
        }),
    );

    let (executor, session, addresses) = build(&[&url_a, &url_b], quick_config(1));
    let payload = executor.execute(&session, &Request::Reload).await.unwrap();
    assert_eq!(payload, b"cfg");
    assert_eq!(addresses.urls(), vec![url_b.clone()]);
    assert_eq!(session.server_url(), Some(url_b));
}

#[tokio::test]
async fn test_io_failures_exhaust_the_budget() {
    let (listener, url) = common::bind_node().await;
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            drop(stream);
        }
    });

    let (executor, session, _) = build(&[&url], quick_config(2));
    let err = executor
        .execute(&session, &Request::Reload)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::RetriesExhausted { .. }));
}

#[tokio::test]
async fn test_io_failures_within_budget_recover() {
    let (listener, url) = common::bind_node().await;
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                drop(stream);
                continue;
            }
            tokio::spawn(async move {
                loop {
                    let Ok(frame) = common::read_frame(&mut stream).await else {
                        return;
                    };
                    match frame.command {
                        protocol::CMD_OPEN => common::respond_open(&mut stream, 5).await,
                        _ => common::respond_ok(&mut stream, frame.session_id, b"cfg").await,
                    }
                }
            });
        }
    });

    let (executor, session, _) = build(&[&url], quick_config(5));
    let payload = executor.execute(&session, &Request::Reload).await.unwrap();
    assert_eq!(payload, b"cfg");
    assert!(accepted.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_lost_connection_revalidates_with_reopen() {
    let (listener, url) = common::bind_node().await;
    let opens = Arc::new(AtomicU32::new(0));
    let reopens = Arc::new(AtomicU32::new(0));
    let reopen_had_token = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicBool::new(false));
    let opens_counter = Arc::clone(&opens);
    let reopens_counter = Arc::clone(&reopens);
    let token_flag = Arc::clone(&reopen_had_token);
    let dropped_flag = Arc::clone(&dropped);
    spawn_node(
        listener,
        Arc::new(move |frame| match frame.command {
            protocol::CMD_OPEN => {
                opens_counter.fetch_add(1, Ordering::SeqCst);
                Reply::Open(1)
            }
            protocol::CMD_REOPEN => {
                reopens_counter.fetch_add(1, Ordering::SeqCst);
                token_flag.store(frame.token.is_some(), Ordering::SeqCst);
                Reply::Open(2)
            }
            _ => {
                if !dropped_flag.swap(true, Ordering::SeqCst) {
                    Reply::Drop
                } else {
                    Reply::Ok(b"cfg".to_vec())
                }
            }
        }),
    );

    let (executor, session, _) = build(&[&url], quick_config(3));
    let payload = executor.execute(&session, &Request::Reload).await.unwrap();
    assert_eq!(payload, b"cfg");
    // The token survived the dropped connection, so revalidation used the
    // lightweight reopen handshake instead of a second credentialed open.
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(reopens.load(Ordering::SeqCst), 1);
    assert!(reopen_had_token.load(Ordering::SeqCst));
    assert_eq!(session.session_id(), 2);
}

#[tokio::test]
async fn test_write_failure_on_reused_connection_is_free() {
    let (listener, url) = common::bind_node().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                loop {
                    let Ok(frame) = common::read_frame(&mut stream).await else {
                        // Hold the socket open after the client's half-close
                        // so no FIN comes back and the pooled connection
                        // still looks alive on the client side.
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        return;
                    };
                    match frame.command {
                        protocol::CMD_OPEN => common::respond_open(&mut stream, 1).await,
                        _ => common::respond_ok(&mut stream, frame.session_id, b"cfg").await,
                    }
                }
            });
        }
    });

    let (executor, session, _) = build(&[&url], quick_config(1));
    let payload = executor.execute(&session, &Request::Reload).await.unwrap();
    assert_eq!(payload, b"cfg");

    // Stale the pooled socket: closing its write half leaves a connection
    // that still looks alive but fails the next write, which is what a
    // silently dropped peer leaves behind in the pool.
    let mut conn = executor.pool().acquire(&url, executor.config()).await.unwrap();
    conn.stream_mut().shutdown().await.unwrap();
    executor.pool().release(conn);

    // A budget of one means any budgeted retry would fail the call, so
    // success proves the stale-socket retry was free.
    let payload = executor.execute(&session, &Request::Reload).await.unwrap();
    assert_eq!(payload, b"cfg");
}

#[tokio::test]
async fn test_frozen_database_backs_off_and_retries() {
    let (listener, url) = common::bind_node().await;
    let reloads = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&reloads);
    spawn_node(
        listener,
        Arc::new(move |frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(1),
            _ => {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::Err(ServerError::new(ERR_DB_FROZEN, "frozen", "db is frozen"))
                } else {
                    Reply::Ok(b"cfg".to_vec())
                }
            }
        }),
    );

    // Frozen retries are free; a budget of one must still succeed.
    let (executor, session, _) = build(&[&url], quick_config(1));
    let payload = executor.execute(&session, &Request::Reload).await.unwrap();
    assert_eq!(payload, b"cfg");
    assert_eq!(reloads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_expired_token_fails_sticky_sessions_after_budget() {
    let (listener, url) = common::bind_node().await;
    spawn_node(
        listener,
        Arc::new(|frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(1),
            _ => Reply::Err(ServerError::new(ERR_TOKEN_EXPIRED, "token", "expired")),
        }),
    );

    let (executor, session, _) = build(&[&url], quick_config(2));
    session.stick();
    let err = executor
        .execute(&session, &Request::Reload)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::RetriesExhausted { .. }));
}

#[tokio::test]
async fn test_expired_token_reopens_non_sticky_sessions() {
    let (listener, url) = common::bind_node().await;
    let opens = Arc::new(AtomicU32::new(0));
    let failures = Arc::new(AtomicU32::new(0));
    let opens_counter = Arc::clone(&opens);
    let failure_counter = Arc::clone(&failures);
    spawn_node(
        listener,
        Arc::new(move |frame| match frame.command {
            protocol::CMD_OPEN => {
                Reply::Open(1 + opens_counter.fetch_add(1, Ordering::SeqCst) as i32)
            }
            _ => {
                if failure_counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::Err(ServerError::new(ERR_TOKEN_EXPIRED, "token", "expired"))
                } else {
                    Reply::Ok(b"cfg".to_vec())
                }
            }
        }),
    );

    let (executor, session, _) = build(&[&url], quick_config(1));
    let payload = executor.execute(&session, &Request::Reload).await.unwrap();
    assert_eq!(payload, b"cfg");
    // The node session was dropped and reopened transparently.
    assert_eq!(opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_application_errors_surface_without_retry() {
    let (listener, url) = common::bind_node().await;
    let reloads = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&reloads);
    spawn_node(
        listener,
        Arc::new(move |frame| match frame.command {
            protocol::CMD_OPEN => Reply::Open(1),
            _ => {
                counter.fetch_add(1, Ordering::SeqCst);
                Reply::Err(ServerError::new(
                    ERR_APP_BASE + 1,
                    "ConstraintViolation",
                    "duplicate key",
                ))
            }
        }),
    );

    let (executor, session, _) = build(&[&url], quick_config(5));
    let err = executor
        .execute(&session, &Request::Reload)
        .await
        .unwrap_err();
    match err {
        DriverError::Server(server) => {
            assert_eq!(server.kind(), ServerErrorKind::Application);
            assert_eq!(server.identifier, "ConstraintViolation");
        }
        other => panic!("expected a server error, got {other}"),
    }
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_call_on_a_busy_session_is_rejected() {
    let (executor, session, _) = build(&["127.0.0.1:1"], quick_config(1));
    let _guard = session.begin_command().unwrap();
    let err = executor
        .execute(&session, &Request::Reload)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::SessionBusy));
}
