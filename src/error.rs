//! Error types for the RiftDB remote client.
//!
//! Server-side failures arrive on the wire as a structured [`ServerError`]
//! (code, identifier, message list, optional verbose detail). A handful of
//! reserved codes describe topology conditions (redirect, node offline,
//! database frozen, token expired) that the request executor consumes as
//! retry policy inputs rather than surfacing to the caller.

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::wire;

/// Server told us to reissue the request against another node. The
/// `identifier` field carries the `host:port` to retarget.
pub const ERR_REDIRECT: i32 = 1;
/// The addressed node reports itself offline.
pub const ERR_NODE_OFFLINE: i32 = 2;
/// The database is frozen; operations are prohibited until it is released.
pub const ERR_DB_FROZEN: i32 = 3;
/// The auth token is invalid or expired.
pub const ERR_TOKEN_EXPIRED: i32 = 4;
/// First code available for application-level errors.
pub const ERR_APP_BASE: i32 = 100;

/// Classification of a [`ServerError`], consumed by the executor's retry
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    Redirect,
    NodeOffline,
    DatabaseFrozen,
    TokenExpired,
    Application,
}

/// Structured error decoded from an `ERROR` status frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: i32,
    pub identifier: String,
    pub messages: Vec<String>,
    pub verbose: Option<String>,
}

impl ServerError {
    pub fn new(code: i32, identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            identifier: identifier.into(),
            messages: vec![message.into()],
            verbose: None,
        }
    }

    pub fn kind(&self) -> ServerErrorKind {
        match self.code {
            ERR_REDIRECT => ServerErrorKind::Redirect,
            ERR_NODE_OFFLINE => ServerErrorKind::NodeOffline,
            ERR_DB_FROZEN => ServerErrorKind::DatabaseFrozen,
            ERR_TOKEN_EXPIRED => ServerErrorKind::TokenExpired,
            _ => ServerErrorKind::Application,
        }
    }

    /// For a redirect error, the `host:port` the server suggested.
    pub fn redirect_target(&self) -> Option<&str> {
        if self.code == ERR_REDIRECT && !self.identifier.is_empty() {
            Some(&self.identifier)
        } else {
            None
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, DriverError> {
        let code = wire::read_i32(r).await?;
        let identifier = wire::read_string(r).await?;
        let count = wire::read_i32(r).await?;
        if !(0..=1024).contains(&count) {
            return Err(DriverError::Protocol(format!(
                "invalid server error message count: {count}"
            )));
        }
        let mut messages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            messages.push(wire::read_string(r).await?);
        }
        let verbose = wire::read_opt_string(r).await?;
        Ok(Self {
            code,
            identifier,
            messages,
            verbose,
        })
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), DriverError> {
        wire::write_i32(w, self.code).await?;
        wire::write_string(w, &self.identifier).await?;
        wire::write_i32(w, self.messages.len() as i32).await?;
        for msg in &self.messages {
            wire::write_string(w, msg).await?;
        }
        wire::write_opt_string(w, self.verbose.as_deref()).await?;
        Ok(())
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.identifier)?;
        for msg in &self.messages {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// Errors surfaced by the remote client.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(ServerError),

    #[error("cannot create a connection to remote server address(es): {0:?}")]
    NoReachableServer(Vec<String>),

    #[error("timed out acquiring a connection to '{0}' from the pool")]
    PoolTimeout(String),

    #[error("cannot execute the request because an operation is in progress on this session")]
    SessionBusy,

    #[error("session is closed")]
    SessionClosed,

    #[error("storage is closed")]
    StorageClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{message}")]
    RetriesExhausted {
        message: String,
        #[source]
        source: Box<DriverError>,
    },
}

impl DriverError {
    pub(crate) fn retries_exhausted(context: &str, source: DriverError) -> Self {
        DriverError::RetriesExhausted {
            message: format!("{context}: retries exhausted"),
            source: Box::new(source),
        }
    }

    /// True when the failure is transient and a later retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_)
                | DriverError::PoolTimeout(_)
                | DriverError::NoReachableServer(_)
                | DriverError::RetriesExhausted { .. }
        )
    }
}
