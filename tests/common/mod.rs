#![allow(dead_code)]

//! Scripted-server helpers shared by the integration tests.

use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use riftdb_client::error::{DriverError, ServerError};
use riftdb_client::protocol::response::HandshakeResponse;
use riftdb_client::{protocol, wire};
use tokio::net::{TcpListener, TcpStream};

/// One decoded request frame as seen by a mock server.
#[derive(Debug)]
pub struct FrameIn {
    pub command: u8,
    pub session_id: i32,
    pub token: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<FrameIn, DriverError> {
    let command = wire::read_u8(stream).await?;
    let session_id = wire::read_i32(stream).await?;
    let token = wire::read_opt_bytes(stream).await?;
    let payload = wire::read_bytes(stream).await?;
    Ok(FrameIn {
        command,
        session_id,
        token,
        payload,
    })
}

pub async fn respond_ok(stream: &mut TcpStream, session_id: i32, payload: &[u8]) {
    protocol::write_ok_response(stream, session_id, None, payload)
        .await
        .expect("mock server failed to write an OK response");
}

pub async fn respond_error(stream: &mut TcpStream, session_id: i32, error: &ServerError) {
    protocol::write_error_response(stream, session_id, error)
        .await
        .expect("mock server failed to write an error response");
}

/// Answer an open/connect/reopen handshake with the given session id and a
/// token valid for one minute.
pub async fn respond_open(stream: &mut TcpStream, session_id: i32) {
    let handshake = HandshakeResponse {
        session_id,
        token: Some(valid_token()),
    };
    let payload = handshake.encode().await.unwrap();
    respond_ok(stream, session_id, &payload).await;
}

/// Raw token bytes with the embedded expiry window set one minute ahead.
pub fn valid_token() -> Vec<u8> {
    token_expiring_in_millis(60_000)
}

pub fn token_expiring_in_millis(delta: i64) -> Vec<u8> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let expiry = now + delta;
    let mut raw = expiry.to_be_bytes().to_vec();
    raw.extend_from_slice(b"opaque");
    raw
}

static TRACING: Once = Once::new();

/// Route driver logs through the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Bind a listener on an ephemeral port and return it with its `host:port`.
pub async fn bind_node() -> (TcpListener, String) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = listener.local_addr().unwrap().to_string();
    (listener, url)
}

/// What a scripted node answers to one frame.
pub enum Reply {
    /// Handshake acknowledgment with this session id and a fresh token.
    Open(i32),
    Ok(Vec<u8>),
    Err(ServerError),
    /// Close the connection without answering.
    Drop,
}

/// Serve every connection on `listener` by feeding each frame through the
/// supplied script.
pub fn spawn_scripted_node(
    listener: TcpListener,
    script: std::sync::Arc<dyn Fn(&FrameIn) -> Reply + Send + Sync>,
) {
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let script = std::sync::Arc::clone(&script);
            tokio::spawn(async move {
                loop {
                    let Ok(frame) = read_frame(&mut stream).await else {
                        return;
                    };
                    match script(&frame) {
                        Reply::Open(session_id) => respond_open(&mut stream, session_id).await,
                        Reply::Ok(payload) => {
                            respond_ok(&mut stream, frame.session_id, &payload).await
                        }
                        Reply::Err(error) => {
                            respond_error(&mut stream, frame.session_id, &error).await
                        }
                        Reply::Drop => return,
                    }
                }
            });
        }
    });
}
