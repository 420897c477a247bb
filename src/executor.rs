//! The request executor: write-then-read framing plus the retry, redirect
//! and reopen state machine.
//!
//! Every failure observed while running a request is classified into one
//! policy:
//!
//! * write failed on a freshly created connection: drop it, spend one retry
//!   from the budget, try again; on a pooled connection the socket was
//!   simply stale, so the retry is free
//! * server redirect: retarget to the suggested node, free retry
//! * database frozen: back off and try again, free retry
//! * token invalid: drop the node session; sticky sessions spend budget
//!   because they must not silently hop nodes, non-sticky sessions reopen
//!   wherever the address list points next
//! * node offline: remove the URL from the working set, free retry the
//!   first time a URL goes away, budgeted afterwards so a flapping cluster
//!   cannot loop us forever
//! * read failure: drop the connection and the node's session id (the token
//!   survives, so the next attempt revalidates with a reopen), spend budget,
//!   back off
//! * any other server error: release the connection and surface immediately
//!
//! While a request is in flight its client session is busy; a second call
//! on the same session is rejected, never queued.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::addresses::AddressList;
use crate::config::ClientConfig;
use crate::error::{DriverError, ServerError, ServerErrorKind};
use crate::pool::{Connection, ConnectionPool};
use crate::protocol::{self, Request, ResponseEnvelope};
use crate::session::{ClientSession, SessionRegistry};
use crate::wire;

enum Attempt {
    Ok(ResponseEnvelope),
    /// Write failed; nothing of the request reached the peer.
    NotSent(DriverError),
    /// I/O failure after the request was (at least partially) written.
    Failed(DriverError),
    Server(ServerError),
    /// Protocol violation or unrecoverable local error.
    Fatal(DriverError),
}

/// Executes framed requests against the cluster on behalf of client
/// sessions. Shared by the storage, the admin surface, and the push
/// listener's re-subscribe path.
pub struct RequestExecutor {
    addresses: Arc<AddressList>,
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionRegistry>,
    config: ClientConfig,
    /// Database this executor opens sessions against; `None` runs
    /// server-level (connect) handshakes instead.
    database: Option<String>,
    serializer_name: String,
    closed: Arc<AtomicBool>,
}

impl RequestExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addresses: Arc<AddressList>,
        pool: Arc<ConnectionPool>,
        sessions: Arc<SessionRegistry>,
        config: ClientConfig,
        database: Option<String>,
        serializer_name: String,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            addresses,
            pool,
            sessions,
            config,
            database,
            serializer_name,
            closed,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn addresses(&self) -> &Arc<AddressList> {
        &self.addresses
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Run one request to completion, retrying per policy. Returns the
    /// decoded `OK` payload.
    pub async fn execute(
        &self,
        session: &Arc<ClientSession>,
        request: &Request,
    ) -> Result<Vec<u8>, DriverError> {
        let _guard = session.begin_command()?;
        self.execute_unguarded(session, request).await
    }

    /// Same as [`execute`](Self::execute) but without taking the session's
    /// single-flight guard. For callers that already hold it.
    pub async fn execute_unguarded(
        &self,
        session: &Arc<ClientSession>,
        request: &Request,
    ) -> Result<Vec<u8>, DriverError> {
        let mut budget = self.config.connection_retries.max(1);
        let mut forced_target: Option<String> = None;
        let mut removed_urls: HashSet<String> = HashSet::new();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(DriverError::StorageClosed);
            }

            let url = match forced_target.take() {
                Some(url) => url,
                None => self.addresses.next_available(
                    self.config.strategy,
                    request.is_handshake(),
                    session,
                )?,
            };

            let mut conn = match self.pool.acquire(&url, &self.config).await {
                Ok(conn) => conn,
                Err(e) if e.is_transient() => {
                    debug!(url, error = %e, operation = request.name(), "connect attempt failed");
                    self.spend(&mut budget, request, e)?;
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.attempt(&mut conn, session, request).await {
                Attempt::Ok(envelope) => {
                    if let Some(token) = envelope.token_refresh {
                        session.update_node_token(&url, token);
                    }
                    self.pool.release(conn);
                    return Ok(envelope.payload);
                }
                Attempt::NotSent(e) => {
                    let fresh = conn.is_fresh();
                    self.pool.remove(conn);
                    debug!(url, error = %e, fresh, operation = request.name(), "request not sent");
                    if fresh {
                        // A brand-new socket failing to take the write is a
                        // real connectivity problem, not a stale pool entry.
                        self.spend(&mut budget, request, e)?;
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
                Attempt::Failed(e) => {
                    self.pool.remove(conn);
                    // The node may have dropped the session along with the
                    // connection. Keep the token so the next attempt can
                    // revalidate with a reopen instead of a full open.
                    session.invalidate_node_session(&url);
                    warn!(url, error = %e, operation = request.name(), "request failed mid-flight");
                    self.spend(&mut budget, request, e)?;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Attempt::Server(error) => match error.kind() {
                    ServerErrorKind::Redirect => {
                        self.pool.release(conn);
                        let suggested = error
                            .redirect_target()
                            .map(|target| self.addresses.add_host(target));
                        match suggested {
                            Some(next) => {
                                debug!(from = url, to = next, "server redirect");
                                session.reset_pin(Some(&next));
                                forced_target = Some(next);
                            }
                            None => {
                                return Err(DriverError::Protocol(
                                    "redirect response without a target address".to_string(),
                                ))
                            }
                        }
                    }
                    ServerErrorKind::NodeOffline => {
                        self.pool.release(conn);
                        let next = self.addresses.remove_and_get_next(&url);
                        self.sessions.remove_node_sessions(&url);
                        session.reset_pin(next.as_deref());
                        if !removed_urls.insert(url.clone()) {
                            // Second strike on the same URL within one call.
                            self.spend(
                                &mut budget,
                                request,
                                DriverError::Server(error),
                            )?;
                        }
                    }
                    ServerErrorKind::DatabaseFrozen => {
                        self.pool.release(conn);
                        debug!(url, "database frozen, backing off");
                        tokio::time::sleep(self.config.freeze_backoff).await;
                    }
                    ServerErrorKind::TokenExpired => {
                        self.pool.release(conn);
                        session.remove_node_session(&url);
                        if session.is_sticky() {
                            self.spend(&mut budget, request, DriverError::Server(error))?;
                        }
                    }
                    ServerErrorKind::Application => {
                        self.pool.release(conn);
                        return Err(DriverError::Server(error));
                    }
                },
                Attempt::Fatal(e) => {
                    self.pool.remove(conn);
                    return Err(e);
                }
            }
        }
    }

    /// Spend one retry from the budget or convert the failure into the
    /// terminal error.
    fn spend(
        &self,
        budget: &mut u32,
        request: &Request,
        cause: DriverError,
    ) -> Result<(), DriverError> {
        if *budget <= 1 {
            return Err(DriverError::retries_exhausted(request.name(), cause));
        }
        *budget -= 1;
        Ok(())
    }

    async fn attempt(
        &self,
        conn: &mut Connection,
        session: &Arc<ClientSession>,
        request: &Request,
    ) -> Attempt {
        if !request.is_handshake() {
            if let Some(outcome) = self.ensure_node_session(conn, session).await {
                return outcome;
            }
        }

        let url = conn.url().to_string();
        let (session_id, token) = if request.is_handshake() {
            match session.node_session(&url) {
                // Reopen reuses the token it is revalidating.
                Some(node) if matches!(request, Request::Reopen { .. }) => {
                    (node.session_id, node.token)
                }
                _ => (-1, None),
            }
        } else {
            session
                .node_session(&url)
                .map(|node| (node.session_id, node.token))
                .unwrap_or((-1, None))
        };

        let payload = match request.encode_payload().await {
            Ok(payload) => payload,
            Err(e) => return Attempt::Fatal(e),
        };

        if let Err(e) = protocol::write_request(
            conn.stream_mut(),
            request.command(),
            session_id,
            token.as_ref(),
            &payload,
        )
        .await
        {
            return Attempt::NotSent(e);
        }

        self.read_response(conn).await
    }

    async fn read_response(&self, conn: &mut Connection) -> Attempt {
        let read = async {
            let status = wire::read_u8(conn.stream_mut()).await?;
            match status {
                protocol::STATUS_OK => {
                    Ok(Ok(protocol::read_ok_envelope(conn.stream_mut()).await?))
                }
                protocol::STATUS_ERROR => {
                    Ok(Err(protocol::read_error_envelope(conn.stream_mut()).await?))
                }
                other => Err(DriverError::Protocol(format!(
                    "unrecognized response status byte: {other}"
                ))),
            }
        };

        match tokio::time::timeout(self.config.request_timeout, read).await {
            Err(_) => Attempt::Failed(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "response read timed out",
            ))),
            Ok(Err(e)) => match e {
                DriverError::Io(_) => Attempt::Failed(e),
                other => Attempt::Fatal(other),
            },
            Ok(Ok(Ok(envelope))) => Attempt::Ok(envelope),
            Ok(Ok(Err(server_error))) => Attempt::Server(server_error),
        }
    }

    /// Make sure a valid node session exists on the connection's node,
    /// transparently running the open (or reopen) handshake when it does
    /// not. Returns the failure outcome for the caller's classification
    /// loop, `None` on success.
    async fn ensure_node_session(
        &self,
        conn: &mut Connection,
        session: &Arc<ClientSession>,
    ) -> Option<Attempt> {
        let url = conn.url().to_string();
        let existing = session.node_session(&url);
        if existing.as_ref().map(|node| node.is_valid()).unwrap_or(false) {
            return None;
        }

        // A live token with a lost session id only needs a reopen; anything
        // else runs the full handshake with the stored credentials.
        let reopen_token = existing.as_ref().and_then(|node| {
            node.token
                .clone()
                .filter(|token| !token.is_expired() && node.session_id < 0)
        });

        let (handshake, session_id, token) = match (&self.database, &reopen_token) {
            (Some(database), Some(token)) => (
                Request::Reopen {
                    database: database.clone(),
                },
                existing.as_ref().map(|node| node.session_id).unwrap_or(-1),
                Some(token.clone()),
            ),
            _ => {
                let Some((username, password)) = session.credentials() else {
                    return Some(Attempt::Fatal(DriverError::Config(
                        "session has no credentials for the open handshake".to_string(),
                    )));
                };
                let request = match &self.database {
                    Some(database) => Request::Open {
                        database: database.clone(),
                        username,
                        password,
                        serializer: self.serializer_name.clone(),
                    },
                    None => Request::Connect { username, password },
                };
                (request, -1, None)
            }
        };

        debug!(url, handshake = handshake.name(), "opening node session");
        let payload = match handshake.encode_payload().await {
            Ok(payload) => payload,
            Err(e) => return Some(Attempt::Fatal(e)),
        };
        if let Err(e) = protocol::write_request(
            conn.stream_mut(),
            handshake.command(),
            session_id,
            token.as_ref(),
            &payload,
        )
        .await
        {
            return Some(Attempt::NotSent(e));
        }

        match self.read_response(conn).await {
            Attempt::Ok(envelope) => {
                let response =
                    match crate::protocol::response::HandshakeResponse::decode(&envelope.payload)
                        .await
                    {
                        Ok(response) => response,
                        Err(e) => return Some(Attempt::Fatal(e)),
                    };
                let new_token = response
                    .token
                    .map(crate::session::SessionToken::new)
                    .or(token);
                session.set_node_session(&url, response.session_id, new_token);
                session.pin_url(&url);
                None
            }
            other => Some(other),
        }
    }
}
