//! Client sessions and per-node sub-sessions.
//!
//! A [`ClientSession`] represents one logical client of one database. It
//! holds the connection credentials, one [`NodeSession`] per server node the
//! client has authenticated against, a sticky counter pinning the session to
//! its current node while greater than zero, and the single-flight flag that
//! rejects concurrent requests on the same session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::error::DriverError;

/// Opaque auth token. When at least 8 bytes long, the first 8 bytes carry a
/// big-endian epoch-millisecond expiry (0 = no expiry) that the client uses
/// as the token's validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    raw: Vec<u8>,
}

impl SessionToken {
    pub fn new(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.raw.len() < 8 {
            return None;
        }
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&self.raw[..8]);
        let millis = i64::from_be_bytes(millis);
        if millis == 0 {
            return None;
        }
        Utc.timestamp_millis_opt(millis).single()
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at() {
            Some(expiry) => Utc::now() >= expiry,
            None => false,
        }
    }
}

/// Session state for one (client session, server node) pair. Replaced
/// wholesale on reopen or redirect, removed on token failure.
#[derive(Debug, Clone)]
pub struct NodeSession {
    pub server_url: String,
    pub session_id: i32,
    pub token: Option<SessionToken>,
}

impl NodeSession {
    fn new(server_url: String) -> Self {
        Self {
            server_url,
            session_id: -1,
            token: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.session_id >= 0
            && self
                .token
                .as_ref()
                .map(|token| !token.is_expired())
                .unwrap_or(true)
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    username: Option<String>,
    password: Option<String>,
    nodes: HashMap<String, NodeSession>,
    current_url: Option<String>,
    url_index: Option<usize>,
}

/// One logical client of one database.
pub struct ClientSession {
    serial: i32,
    inner: Mutex<SessionInner>,
    sticky: AtomicI32,
    busy: AtomicBool,
    closed: AtomicBool,
}

impl ClientSession {
    fn new(serial: i32) -> Self {
        Self {
            serial,
            inner: Mutex::new(SessionInner::default()),
            sticky: AtomicI32::new(0),
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn serial(&self) -> i32 {
        self.serial
    }

    pub fn set_credentials(&self, username: &str, password: &str) {
        let mut inner = self.inner.lock();
        inner.username = Some(username.to_string());
        inner.password = Some(password.to_string());
    }

    pub fn credentials(&self) -> Option<(String, String)> {
        let inner = self.inner.lock();
        Some((inner.username.clone()?, inner.password.clone()?))
    }

    /// Session id on the currently pinned node, or -1 when the session has
    /// no node sessions.
    pub fn session_id(&self) -> i32 {
        let inner = self.inner.lock();
        inner
            .current_url
            .as_ref()
            .and_then(|url| inner.nodes.get(url))
            .map(|node| node.session_id)
            .unwrap_or(-1)
    }

    pub fn server_url(&self) -> Option<String> {
        self.inner.lock().current_url.clone()
    }

    pub fn node_session(&self, url: &str) -> Option<NodeSession> {
        self.inner.lock().nodes.get(url).cloned()
    }

    pub fn node_urls(&self) -> Vec<String> {
        self.inner.lock().nodes.keys().cloned().collect()
    }

    pub fn has_nodes(&self) -> bool {
        !self.inner.lock().nodes.is_empty()
    }

    pub fn set_node_session(&self, url: &str, session_id: i32, token: Option<SessionToken>) {
        let mut inner = self.inner.lock();
        let node = inner
            .nodes
            .entry(url.to_string())
            .or_insert_with(|| NodeSession::new(url.to_string()));
        node.session_id = session_id;
        node.token = token;
    }

    /// Apply a token refresh carried by a response envelope.
    pub fn update_node_token(&self, url: &str, token: SessionToken) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(url) {
            node.token = Some(token);
        }
    }

    pub fn remove_node_session(&self, url: &str) {
        self.inner.lock().nodes.remove(url);
    }

    /// Drop the node's session id but keep its token. The next request to
    /// that node revalidates with a reopen instead of a full open.
    pub fn invalidate_node_session(&self, url: &str) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.nodes.get_mut(url) {
            node.session_id = -1;
        }
    }

    /// Clear all node sessions, returning them so the caller can send
    /// best-effort close frames.
    pub fn take_node_sessions(&self) -> Vec<NodeSession> {
        let mut inner = self.inner.lock();
        inner.current_url = None;
        inner.nodes.drain().map(|(_, node)| node).collect()
    }

    // Target pinning used by the address list.

    pub fn pinned_url(&self) -> Option<String> {
        self.inner.lock().current_url.clone()
    }

    pub fn pin_url(&self, url: &str) {
        self.inner.lock().current_url = Some(url.to_string());
    }

    /// Re-pin after a URL was removed from the list; resets the per-session
    /// rotation index.
    pub fn reset_pin(&self, url: Option<&str>) {
        let mut inner = self.inner.lock();
        inner.current_url = url.map(str::to_string);
        inner.url_index = Some(0);
    }

    /// Advance the per-session rotation index modulo `len` and return the
    /// new index.
    pub fn next_url_index(&self, len: usize) -> usize {
        let mut inner = self.inner.lock();
        let next = match inner.url_index {
            None => 0,
            Some(i) => (i + 1) % len,
        };
        inner.url_index = Some(next);
        next
    }

    // Sticky counter.

    pub fn stick(&self) {
        self.sticky.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unstick(&self) {
        let previous = self.sticky.fetch_sub(1, Ordering::SeqCst);
        if previous <= 0 {
            // Unbalanced unstick; clamp back rather than going negative.
            self.sticky.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky.load(Ordering::SeqCst) > 0
    }

    // Single-flight guard.

    /// Mark the session busy for one request. A second call while busy is
    /// rejected immediately, never queued.
    pub fn begin_command(self: &Arc<Self>) -> Result<CommandGuard, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::SessionClosed);
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DriverError::SessionBusy);
        }
        Ok(CommandGuard {
            session: Arc::clone(self),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Clears the single-flight flag when the request finishes, on any path.
pub struct CommandGuard {
    session: Arc<ClientSession>,
}

impl Drop for CommandGuard {
    fn drop(&mut self) {
        self.session.busy.store(false, Ordering::SeqCst);
    }
}

/// All live client sessions of one storage. Node-offline handling walks this
/// set to drop node sessions for the dead URL.
pub struct SessionRegistry {
    serial: AtomicI32,
    sessions: Mutex<Vec<Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            serial: AtomicI32::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn new_session(&self, username: &str, password: &str) -> Arc<ClientSession> {
        let serial = self.serial.fetch_sub(1, Ordering::SeqCst) - 1;
        let session = Arc::new(ClientSession::new(serial));
        session.set_credentials(username, password);
        self.sessions.lock().push(Arc::clone(&session));
        session
    }

    pub fn remove(&self, session: &Arc<ClientSession>) {
        self.sessions
            .lock()
            .retain(|existing| existing.serial != session.serial);
    }

    pub fn all(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.lock().clone()
    }

    /// Drop the node session for `url` in every client session.
    pub fn remove_node_sessions(&self, url: &str) {
        for session in self.all() {
            session.remove_node_session(url);
        }
    }

    /// Find any session holding a node session for `url`; used by push
    /// reconnection to find credentials for re-subscription.
    pub fn find_with_node(&self, url: &str) -> Option<Arc<ClientSession>> {
        self.all()
            .into_iter()
            .find(|session| session.node_session(url).is_some())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
