//! Remote storage: the client-side face of one database on a cluster.
//!
//! Owns the address list, connection pool, session registry, request
//! executor and push listener for one database, and exposes the operation
//! surface built on them: session open/close, queries with paged result
//! sets, the transaction protocol, live queries, and metadata reload.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::addresses::AddressList;
use crate::config::ClientConfig;
use crate::error::DriverError;
use crate::executor::RequestExecutor;
use crate::live::{LiveQueryListener, LiveQueryRegistry};
use crate::pool::ConnectionPool;
use crate::protocol::push::PushMessage;
use crate::protocol::response::{
    HandshakeResponse, QueryResponse, SubscribeAck, TxBeginResponse, TxCommitResponse,
    TxFetchResponse,
};
use crate::protocol::{self, QueryKind, Request, SubscribeRequest};
use crate::push::{PushHandler, PushListener};
use crate::record::{MsgpackSerializer, Record, RecordSerializer};
use crate::session::{ClientSession, SessionRegistry, SessionToken};
use crate::tx::TxBatch;
use crate::wire;

/// Latest metadata documents pushed by the server, kept as opaque
/// serialized payloads for the schema/index layers above the driver.
#[derive(Debug, Default)]
struct MetadataCache {
    storage_config: Option<Vec<u8>>,
    schema: Option<Vec<u8>>,
    index_manager: Option<Vec<u8>>,
    functions: Option<Vec<u8>>,
    sequences: Option<Vec<u8>>,
}

pub struct RemoteStorage {
    database: String,
    config: ClientConfig,
    addresses: Arc<AddressList>,
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionRegistry>,
    executor: RequestExecutor,
    push: PushListener,
    live: Arc<LiveQueryRegistry>,
    serializer: Arc<dyn RecordSerializer>,
    closed: Arc<AtomicBool>,
    push_started: AtomicBool,
    metadata: RwLock<MetadataCache>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteStorage {
    /// Connect the storage to a cluster. Runs DNS peer discovery when
    /// enabled and starts the idle-connection sweeper; sessions are opened
    /// separately with [`open_session`](Self::open_session).
    pub async fn open<S: AsRef<str>>(
        hosts: &[S],
        database: &str,
        config: ClientConfig,
    ) -> Result<Arc<Self>, DriverError> {
        let addresses = Arc::new(AddressList::new(hosts, config.use_ssl)?);
        if config.dns_discovery {
            addresses.discover_peers(config.dns_timeout).await;
        }

        let pool = Arc::new(ConnectionPool::new(config.pool_capacity));
        let sessions = Arc::new(SessionRegistry::new());
        let closed = Arc::new(AtomicBool::new(false));
        let serializer: Arc<dyn RecordSerializer> = Arc::new(MsgpackSerializer);

        let executor = RequestExecutor::new(
            Arc::clone(&addresses),
            Arc::clone(&pool),
            Arc::clone(&sessions),
            config.clone(),
            Some(database.to_string()),
            serializer.name().to_string(),
            Arc::clone(&closed),
        );

        let storage = Arc::new(Self {
            database: database.to_string(),
            push: PushListener::new(config.clone()),
            config,
            addresses,
            pool,
            sessions,
            executor,
            live: Arc::new(LiveQueryRegistry::new()),
            serializer,
            closed,
            push_started: AtomicBool::new(false),
            metadata: RwLock::new(MetadataCache::default()),
            sweeper: Mutex::new(None),
        });
        storage.start_sweeper();
        info!(database, urls = ?storage.addresses.urls(), "remote storage opened");
        Ok(storage)
    }

    fn start_sweeper(self: &Arc<Self>) {
        let pool = Arc::clone(&self.pool);
        let closed = Arc::clone(&self.closed);
        let idle = self.config.idle_timeout;
        let period = idle.max(std::time::Duration::from_secs(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.sweep_idle(idle);
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn addresses(&self) -> &Arc<AddressList> {
        &self.addresses
    }

    pub fn serializer(&self) -> &Arc<dyn RecordSerializer> {
        &self.serializer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn schema(&self) -> Option<Vec<u8>> {
        self.metadata.read().schema.clone()
    }

    pub fn storage_config(&self) -> Option<Vec<u8>> {
        self.metadata.read().storage_config.clone()
    }

    pub fn index_manager(&self) -> Option<Vec<u8>> {
        self.metadata.read().index_manager.clone()
    }

    pub fn functions(&self) -> Option<Vec<u8>> {
        self.metadata.read().functions.clone()
    }

    pub fn sequences(&self) -> Option<Vec<u8>> {
        self.metadata.read().sequences.clone()
    }

    /// Authenticate a new client session against the cluster. The first
    /// session also brings up the push channel.
    pub async fn open_session(
        self: &Arc<Self>,
        username: &str,
        password: &str,
    ) -> Result<Arc<ClientSession>, DriverError> {
        if self.is_closed() {
            return Err(DriverError::StorageClosed);
        }
        let session = self.sessions.new_session(username, password);
        let request = Request::Open {
            database: self.database.clone(),
            username: username.to_string(),
            password: password.to_string(),
            serializer: self.serializer.name().to_string(),
        };
        let payload = match self.executor.execute(&session, &request).await {
            Ok(payload) => payload,
            Err(e) => {
                self.sessions.remove(&session);
                return Err(e);
            }
        };
        let response = HandshakeResponse::decode(&payload).await?;
        let url = session.pinned_url().ok_or_else(|| {
            DriverError::Protocol("open handshake finished without a target".to_string())
        })?;
        session.set_node_session(
            &url,
            response.session_id,
            response.token.map(SessionToken::new),
        );
        debug!(url, session_id = response.session_id, "session opened");

        // Bring the push channel up on the first session, and bring it back
        // after the listener surrendered for lack of a usable session.
        if !self.push_started.swap(true, Ordering::SeqCst) || self.push.is_shutdown() {
            if let Err(e) = self.init_push(&session).await {
                // Pushes are best effort at open time; the listener retries
                // on its own once started.
                warn!(error = %e, "push channel initialization failed");
            }
        }
        Ok(session)
    }

    /// Close a session: best-effort close frame to every node it touched,
    /// then drop it from the registry.
    pub async fn close_session(&self, session: &Arc<ClientSession>) {
        for node in session.take_node_sessions() {
            if node.session_id < 0 {
                continue;
            }
            self.send_best_effort_close(&node.server_url, node.session_id, node.token.as_ref())
                .await;
        }
        session.mark_closed();
        self.sessions.remove(session);
    }

    async fn send_best_effort_close(
        &self,
        url: &str,
        session_id: i32,
        token: Option<&SessionToken>,
    ) {
        let Ok(mut conn) = self.pool.acquire(url, &self.config).await else {
            return;
        };
        let sent = protocol::write_request(
            conn.stream_mut(),
            protocol::CMD_CLOSE,
            session_id,
            token,
            &[],
        )
        .await;
        match sent {
            Ok(()) => {
                // The close answer is drained so the connection can be
                // pooled again.
                let drained = async {
                    let status = wire::read_u8(conn.stream_mut()).await?;
                    if status == protocol::STATUS_OK {
                        protocol::read_ok_envelope(conn.stream_mut()).await?;
                    } else {
                        protocol::read_error_envelope(conn.stream_mut()).await?;
                    }
                    Ok::<(), DriverError>(())
                };
                match tokio::time::timeout(self.config.request_timeout, drained).await {
                    Ok(Ok(())) => self.pool.release(conn),
                    _ => self.pool.remove(conn),
                }
            }
            Err(_) => self.pool.remove(conn),
        }
    }

    // Queries.

    pub async fn query(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        statement: &str,
        params: Option<&Value>,
    ) -> Result<ResultSet, DriverError> {
        self.run_statement(session, QueryKind::Query, statement, params)
            .await
    }

    pub async fn command(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        statement: &str,
        params: Option<&Value>,
    ) -> Result<ResultSet, DriverError> {
        self.run_statement(session, QueryKind::Command, statement, params)
            .await
    }

    pub async fn execute_script(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        script: &str,
        params: Option<&Value>,
    ) -> Result<ResultSet, DriverError> {
        self.run_statement(session, QueryKind::Execute, script, params)
            .await
    }

    async fn run_statement(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        kind: QueryKind,
        statement: &str,
        params: Option<&Value>,
    ) -> Result<ResultSet, DriverError> {
        let params = params.map(|value| self.serializer.encode(value)).transpose()?;
        let request = Request::Query {
            kind,
            statement: statement.to_string(),
            params,
            page_size: self.config.page_size,
        };
        let payload = self.executor.execute(session, &request).await?;
        let response = QueryResponse::decode(&payload, self.serializer.as_ref()).await?;

        // An open server-side cursor pins the session to this node until
        // the cursor is drained or closed.
        let sticky_held = response.has_next_page;
        if sticky_held {
            session.stick();
        }
        Ok(ResultSet {
            storage: Arc::clone(self),
            session: Arc::clone(session),
            cursor_id: response.cursor_id,
            page: response.records.into(),
            has_next_page: response.has_next_page,
            sticky_held,
        })
    }

    // Transactions.

    /// Begin a transaction. On success the session is pinned to its node
    /// until commit or rollback.
    pub async fn begin_tx(
        &self,
        session: &Arc<ClientSession>,
        batch: &TxBatch,
    ) -> Result<TxBeginResponse, DriverError> {
        let payload = self
            .executor
            .execute(session, &Request::TxBegin(batch.clone()))
            .await?;
        let response = TxBeginResponse::decode(&payload).await?;
        session.stick();
        Ok(response)
    }

    pub async fn commit_tx(
        &self,
        session: &Arc<ClientSession>,
        batch: &TxBatch,
    ) -> Result<TxCommitResponse, DriverError> {
        let payload = self
            .executor
            .execute(session, &Request::TxCommit(batch.clone()))
            .await?;
        session.unstick();
        TxCommitResponse::decode(&payload).await
    }

    pub async fn rollback_tx(
        &self,
        session: &Arc<ClientSession>,
        tx_id: i64,
    ) -> Result<(), DriverError> {
        self.executor
            .execute(session, &Request::TxRollback { tx_id })
            .await?;
        session.unstick();
        Ok(())
    }

    /// Fetch the server's current view of an in-flight transaction, used
    /// to resync after a reconnect.
    pub async fn fetch_tx(
        &self,
        session: &Arc<ClientSession>,
        tx_id: i64,
    ) -> Result<TxFetchResponse, DriverError> {
        let payload = self
            .executor
            .execute(session, &Request::TxFetch { tx_id })
            .await?;
        TxFetchResponse::decode(&payload).await
    }

    /// Re-read the storage configuration from the server.
    pub async fn reload(
        &self,
        session: &Arc<ClientSession>,
    ) -> Result<Vec<u8>, DriverError> {
        let payload = self.executor.execute(session, &Request::Reload).await?;
        self.metadata.write().storage_config = Some(payload.clone());
        Ok(payload)
    }

    // Live queries.

    /// Subscribe a live query over the push channel. Returns the monitor
    /// id to pass to [`unsubscribe_live_query`](Self::unsubscribe_live_query).
    pub async fn live_query(
        &self,
        session: &Arc<ClientSession>,
        statement: &str,
        params: Option<&Value>,
        listener: Arc<dyn LiveQueryListener>,
    ) -> Result<i32, DriverError> {
        let params = params.map(|value| self.serializer.encode(value)).transpose()?;
        let request = Request::Subscribe(SubscribeRequest::LiveQuery {
            statement: statement.to_string(),
            params,
        });
        let payload = self.push.subscribe(session, &request).await?.ok_or_else(|| {
            DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "live query subscription was not acknowledged in time",
            ))
        })?;
        let ack = SubscribeAck::decode(&payload).await?;
        let monitor_id = ack.monitor_id.ok_or_else(|| {
            DriverError::Protocol("live query acknowledgment without a monitor id".to_string())
        })?;
        self.live.register(monitor_id, listener);
        debug!(monitor_id, "live query subscribed");
        Ok(monitor_id)
    }

    pub async fn unsubscribe_live_query(
        &self,
        session: &Arc<ClientSession>,
        monitor_id: i32,
    ) -> Result<(), DriverError> {
        self.executor
            .execute(session, &Request::UnsubscribeLiveQuery { monitor_id })
            .await?;
        if let Some(listener) = self.live.unregister(monitor_id) {
            listener.on_end();
        }
        Ok(())
    }

    // Push channel.

    async fn init_push(self: &Arc<Self>, session: &Arc<ClientSession>) -> Result<(), DriverError> {
        let url = session.server_url().ok_or_else(|| {
            DriverError::Protocol("no server URL for the push channel".to_string())
        })?;
        let conn = self.pool.acquire(&url, &self.config).await?;
        let stream = self.pool.detach(conn);
        let handler: Arc<dyn PushHandler> = Arc::new(StoragePushHandler {
            storage: Arc::downgrade(self),
        });
        self.push.start(stream, &url, handler).await;
        self.subscribe_metadata(session).await
    }

    /// Subscribe (or re-subscribe) the metadata push feeds.
    async fn subscribe_metadata(
        &self,
        session: &Arc<ClientSession>,
    ) -> Result<(), DriverError> {
        let feeds = [
            SubscribeRequest::StorageConfig,
            SubscribeRequest::Schema,
            SubscribeRequest::IndexManager,
            SubscribeRequest::Functions,
            SubscribeRequest::Sequences,
            SubscribeRequest::DistributedConfig,
        ];
        for feed in feeds {
            let request = Request::Subscribe(feed);
            match self.push.subscribe(session, &request).await {
                Ok(Some(_)) => {}
                Ok(None) => warn!(request = request.name(), "subscription not acknowledged"),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn apply_push(&self, message: PushMessage) {
        match message {
            PushMessage::StorageConfig(doc) => self.metadata.write().storage_config = Some(doc),
            PushMessage::Schema(doc) => self.metadata.write().schema = Some(doc),
            PushMessage::IndexManager(doc) => self.metadata.write().index_manager = Some(doc),
            PushMessage::Functions(doc) => self.metadata.write().functions = Some(doc),
            PushMessage::Sequences(doc) => self.metadata.write().sequences = Some(doc),
            PushMessage::DistributedConfig { hosts } => {
                debug!(?hosts, "cluster membership update");
                self.addresses.merge_hosts(&hosts);
            }
            PushMessage::LiveQuery {
                monitor_id,
                events,
                complete,
            } => self.live.dispatch(monitor_id, events, complete),
        }
    }

    /// Shut the storage down: stop the push listener and sweeper, close
    /// every session best-effort, reject all further operations.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.push.shutdown().await;
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        for session in self.sessions.all() {
            for node in session.take_node_sessions() {
                if node.session_id >= 0 {
                    self.send_best_effort_close(
                        &node.server_url,
                        node.session_id,
                        node.token.as_ref(),
                    )
                    .await;
                }
            }
            session.mark_closed();
            self.sessions.remove(&session);
        }
        info!(database = self.database, "remote storage closed");
    }
}

struct StoragePushHandler {
    storage: Weak<RemoteStorage>,
}

impl PushHandler for StoragePushHandler {
    fn on_message(&self, message: PushMessage) {
        if let Some(storage) = self.storage.upgrade() {
            storage.apply_push(message);
        }
    }

    fn on_disconnect(&self) {
        if let Some(storage) = self.storage.upgrade() {
            storage.live.fail_all(|| {
                DriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "push channel lost",
                ))
            });
        }
    }

    fn on_reconnect(&self) -> bool {
        let Some(storage) = self.storage.upgrade() else {
            return false;
        };
        let url = storage.push.url();
        let Some(session) = storage.sessions.find_with_node(&url) else {
            return false;
        };
        // Re-subscribing needs the reader running, so it cannot happen on
        // this task.
        tokio::spawn(async move {
            if let Err(e) = storage.subscribe_metadata(&session).await {
                warn!(error = %e, "re-subscription after push reconnect failed");
            }
        });
        true
    }

    fn on_shutdown(&self) {
        if let Some(storage) = self.storage.upgrade() {
            storage.live.end_all();
        }
    }
}

/// Paged query results. Fetches further pages on demand and releases the
/// session pin once the server-side cursor is exhausted or closed.
pub struct ResultSet {
    storage: Arc<RemoteStorage>,
    session: Arc<ClientSession>,
    cursor_id: String,
    page: VecDeque<Record>,
    has_next_page: bool,
    sticky_held: bool,
}

impl ResultSet {
    pub fn cursor_id(&self) -> &str {
        &self.cursor_id
    }

    pub fn has_next_page(&self) -> bool {
        self.has_next_page
    }

    /// Next record, fetching the next page from the server when the local
    /// buffer runs out.
    pub async fn next(&mut self) -> Result<Option<Record>, DriverError> {
        loop {
            if let Some(record) = self.page.pop_front() {
                return Ok(Some(record));
            }
            if !self.has_next_page {
                return Ok(None);
            }
            self.fetch_next_page().await?;
        }
    }

    /// Drain the remaining records into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<Record>, DriverError> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }

    async fn fetch_next_page(&mut self) -> Result<(), DriverError> {
        let request = Request::QueryNextPage {
            cursor_id: self.cursor_id.clone(),
            page_size: self.storage.config.page_size,
        };
        let payload = self.storage.executor.execute(&self.session, &request).await?;
        let response =
            QueryResponse::decode(&payload, self.storage.serializer.as_ref()).await?;
        self.page = response.records.into();
        self.has_next_page = response.has_next_page;
        if !self.has_next_page {
            self.release_stick();
        }
        Ok(())
    }

    /// Close the server-side cursor early.
    pub async fn close(mut self) -> Result<(), DriverError> {
        if self.has_next_page {
            self.has_next_page = false;
            let request = Request::QueryClose {
                cursor_id: self.cursor_id.clone(),
            };
            let result = self.storage.executor.execute(&self.session, &request).await;
            self.release_stick();
            result?;
        }
        self.release_stick();
        Ok(())
    }

    fn release_stick(&mut self) {
        if self.sticky_held {
            self.session.unstick();
            self.sticky_held = false;
        }
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        self.release_stick();
    }
}
