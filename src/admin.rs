//! Server-level administration: database lifecycle and global
//! configuration, using a dedicated server session over the same executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::addresses::AddressList;
use crate::config::ClientConfig;
use crate::error::DriverError;
use crate::executor::RequestExecutor;
use crate::pool::ConnectionPool;
use crate::protocol::response::{
    self as response, HandshakeResponse,
};
use crate::protocol::{self, Request};
use crate::record::{MsgpackSerializer, RecordSerializer};
use crate::session::{ClientSession, SessionRegistry, SessionToken};

/// Administrative client for one server or cluster. Holds a single
/// server-level session; it is never sticky, so admin calls follow the
/// configured selection strategy like any other request.
pub struct ServerAdmin {
    pool: Arc<ConnectionPool>,
    executor: RequestExecutor,
    session: Arc<ClientSession>,
    config: ClientConfig,
    closed: Arc<AtomicBool>,
}

impl ServerAdmin {
    pub async fn connect<S: AsRef<str>>(
        hosts: &[S],
        username: &str,
        password: &str,
        config: ClientConfig,
    ) -> Result<Self, DriverError> {
        let addresses = Arc::new(AddressList::new(hosts, config.use_ssl)?);
        let pool = Arc::new(ConnectionPool::new(config.pool_capacity));
        let sessions = Arc::new(SessionRegistry::new());
        let closed = Arc::new(AtomicBool::new(false));

        let executor = RequestExecutor::new(
            Arc::clone(&addresses),
            Arc::clone(&pool),
            Arc::clone(&sessions),
            config.clone(),
            None,
            MsgpackSerializer.name().to_string(),
            Arc::clone(&closed),
        );

        let session = sessions.new_session(username, password);
        let request = Request::Connect {
            username: username.to_string(),
            password: password.to_string(),
        };
        let payload = executor.execute(&session, &request).await?;
        let handshake = HandshakeResponse::decode(&payload).await?;
        let url = session.pinned_url().ok_or_else(|| {
            DriverError::Protocol("connect handshake finished without a target".to_string())
        })?;
        session.set_node_session(
            &url,
            handshake.session_id,
            handshake.token.map(SessionToken::new),
        );
        info!(url, "server admin connected");

        Ok(Self {
            pool,
            executor,
            session,
            config,
            closed,
        })
    }

    pub async fn create_database(
        &self,
        name: &str,
        storage_kind: &str,
    ) -> Result<(), DriverError> {
        self.executor
            .execute(
                &self.session,
                &Request::DbCreate {
                    name: name.to_string(),
                    storage_kind: storage_kind.to_string(),
                },
            )
            .await?;
        debug!(name, "database created");
        Ok(())
    }

    pub async fn drop_database(&self, name: &str) -> Result<(), DriverError> {
        self.executor
            .execute(
                &self.session,
                &Request::DbDrop {
                    name: name.to_string(),
                },
            )
            .await?;
        debug!(name, "database dropped");
        Ok(())
    }

    pub async fn database_exists(&self, name: &str) -> Result<bool, DriverError> {
        let payload = self
            .executor
            .execute(
                &self.session,
                &Request::DbExists {
                    name: name.to_string(),
                },
            )
            .await?;
        response::decode_bool(&payload).await
    }

    pub async fn list_databases(&self) -> Result<Vec<String>, DriverError> {
        let payload = self.executor.execute(&self.session, &Request::DbList).await?;
        response::decode_string_list(&payload).await
    }

    /// Freeze a database: writes are prohibited until it is released.
    pub async fn freeze_database(&self, name: &str) -> Result<(), DriverError> {
        self.executor
            .execute(
                &self.session,
                &Request::DbFreeze {
                    name: name.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn release_database(&self, name: &str) -> Result<(), DriverError> {
        self.executor
            .execute(
                &self.session,
                &Request::DbRelease {
                    name: name.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn get_global_config(&self, key: &str) -> Result<Option<String>, DriverError> {
        let payload = self
            .executor
            .execute(
                &self.session,
                &Request::ConfigGet {
                    key: key.to_string(),
                },
            )
            .await?;
        response::decode_opt_string(&payload).await
    }

    pub async fn set_global_config(&self, key: &str, value: &str) -> Result<(), DriverError> {
        self.executor
            .execute(
                &self.session,
                &Request::ConfigSet {
                    key: key.to_string(),
                    value: value.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list_global_config(&self) -> Result<Vec<(String, String)>, DriverError> {
        let payload = self
            .executor
            .execute(&self.session, &Request::ConfigList)
            .await?;
        response::decode_string_pairs(&payload).await
    }

    /// Best-effort close of the server session.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for node in self.session.take_node_sessions() {
            if node.session_id < 0 {
                continue;
            }
            if let Ok(mut conn) = self.pool.acquire(&node.server_url, &self.config).await {
                let _ = protocol::write_request(
                    conn.stream_mut(),
                    protocol::CMD_CLOSE,
                    node.session_id,
                    node.token.as_ref(),
                    &[],
                )
                .await;
                self.pool.remove(conn);
            }
        }
        self.session.mark_closed();
    }
}
