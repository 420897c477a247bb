//! Wire protocol: command codes, framing envelopes, and message shapes.
//!
//! Every framed request carries a one-byte command id, the node session id,
//! and the current auth token, followed by a length-prefixed payload. Every
//! response begins with a status byte: `OK` precedes a payload, `ERROR`
//! precedes a structured server error, `PUSH` marks an unsolicited frame on
//! the push socket. Requests on the push socket are additionally tagged as
//! subscribes so the server answers them on that socket.

pub mod push;
pub mod request;
pub mod response;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{DriverError, ServerError};
use crate::session::SessionToken;
use crate::wire;

pub use push::{PushKind, PushMessage};
pub use request::{QueryKind, Request, SubscribeRequest};

/// Protocol revision negotiated in the open/connect handshake.
pub const PROTOCOL_VERSION: i16 = 38;

pub const DRIVER_NAME: &str = "riftdb-client-rust";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

// Response status bytes.
pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;
pub const STATUS_PUSH: u8 = 3;

// Command ids.
pub const CMD_CONNECT: u8 = 1;
pub const CMD_OPEN: u8 = 2;
pub const CMD_CLOSE: u8 = 3;
pub const CMD_REOPEN: u8 = 4;
pub const CMD_QUERY: u8 = 11;
pub const CMD_QUERY_NEXT_PAGE: u8 = 12;
pub const CMD_QUERY_CLOSE: u8 = 13;
pub const CMD_TX_BEGIN: u8 = 20;
pub const CMD_TX_COMMIT: u8 = 21;
pub const CMD_TX_ROLLBACK: u8 = 22;
pub const CMD_TX_FETCH: u8 = 23;
pub const CMD_DB_CREATE: u8 = 30;
pub const CMD_DB_DROP: u8 = 31;
pub const CMD_DB_EXISTS: u8 = 32;
pub const CMD_DB_LIST: u8 = 33;
pub const CMD_DB_FREEZE: u8 = 34;
pub const CMD_DB_RELEASE: u8 = 35;
pub const CMD_CONFIG_GET: u8 = 40;
pub const CMD_CONFIG_SET: u8 = 41;
pub const CMD_CONFIG_LIST: u8 = 42;
pub const CMD_SUBSCRIBE: u8 = 50;
pub const CMD_UNSUBSCRIBE: u8 = 51;
pub const CMD_RELOAD: u8 = 60;

/// Write one framed request: command, session header, payload.
pub async fn write_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    command: u8,
    session_id: i32,
    token: Option<&SessionToken>,
    payload: &[u8],
) -> Result<(), DriverError> {
    let mut frame = Vec::with_capacity(payload.len() + 16);
    wire::write_u8(&mut frame, command).await?;
    wire::write_i32(&mut frame, session_id).await?;
    wire::write_opt_bytes(&mut frame, token.map(SessionToken::raw)).await?;
    wire::write_bytes(&mut frame, payload).await?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Decoded `OK` response envelope.
#[derive(Debug)]
pub struct ResponseEnvelope {
    pub session_id: i32,
    /// Token refresh pushed by the server alongside the response.
    pub token_refresh: Option<SessionToken>,
    pub payload: Vec<u8>,
}

/// Read one response envelope after the status byte was consumed and found
/// to be `OK`.
pub async fn read_ok_envelope<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ResponseEnvelope, DriverError> {
    let session_id = wire::read_i32(r).await?;
    let token_refresh = wire::read_opt_bytes(r)
        .await?
        .filter(|raw| !raw.is_empty())
        .map(SessionToken::new);
    let payload = wire::read_bytes(r).await?;
    Ok(ResponseEnvelope {
        session_id,
        token_refresh,
        payload,
    })
}

/// Read one response envelope after an `ERROR` status byte.
pub async fn read_error_envelope<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<ServerError, DriverError> {
    let _session_id = wire::read_i32(r).await?;
    ServerError::read(r).await
}

/// Server-side helper for tests and tooling: frame an `OK` response.
pub async fn write_ok_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    session_id: i32,
    token_refresh: Option<&[u8]>,
    payload: &[u8],
) -> Result<(), DriverError> {
    wire::write_u8(w, STATUS_OK).await?;
    wire::write_i32(w, session_id).await?;
    wire::write_opt_bytes(w, token_refresh).await?;
    wire::write_bytes(w, payload).await?;
    w.flush().await?;
    Ok(())
}

/// Server-side helper for tests and tooling: frame an `ERROR` response.
pub async fn write_error_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    session_id: i32,
    error: &ServerError,
) -> Result<(), DriverError> {
    wire::write_u8(w, STATUS_ERROR).await?;
    wire::write_i32(w, session_id).await?;
    error.write(w).await?;
    w.flush().await?;
    Ok(())
}
