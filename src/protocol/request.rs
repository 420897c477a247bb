//! Outbound request shapes and their payload encoding.

use crate::error::DriverError;
use crate::protocol::push::PushKind;
use crate::protocol::{self};
use crate::tx::TxBatch;
use crate::wire;

/// Flavor of a statement execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Read-only query; results are paged.
    Query,
    /// Idempotency not assumed; single statement.
    Command,
    /// Multi-statement script.
    Execute,
}

impl QueryKind {
    fn tag(self) -> u8 {
        match self {
            QueryKind::Query => 0,
            QueryKind::Command => 1,
            QueryKind::Execute => 2,
        }
    }
}

/// A push-channel subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeRequest {
    StorageConfig,
    Schema,
    IndexManager,
    Functions,
    Sequences,
    DistributedConfig,
    LiveQuery {
        statement: String,
        params: Option<Vec<u8>>,
    },
}

impl SubscribeRequest {
    pub fn kind(&self) -> PushKind {
        match self {
            SubscribeRequest::StorageConfig => PushKind::StorageConfig,
            SubscribeRequest::Schema => PushKind::Schema,
            SubscribeRequest::IndexManager => PushKind::IndexManager,
            SubscribeRequest::Functions => PushKind::Functions,
            SubscribeRequest::Sequences => PushKind::Sequences,
            SubscribeRequest::DistributedConfig => PushKind::DistributedConfig,
            SubscribeRequest::LiveQuery { .. } => PushKind::LiveQuery,
        }
    }
}

/// Every request the client can put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Server-level authentication, used by admin operations.
    Connect {
        username: String,
        password: String,
    },
    /// Open a database session on one node.
    Open {
        database: String,
        username: String,
        password: String,
        serializer: String,
    },
    /// Re-authenticate an existing session after reconnect, reusing the
    /// session's token.
    Reopen {
        database: String,
    },
    Close,
    Query {
        kind: QueryKind,
        statement: String,
        params: Option<Vec<u8>>,
        page_size: i32,
    },
    QueryNextPage {
        cursor_id: String,
        page_size: i32,
    },
    QueryClose {
        cursor_id: String,
    },
    TxBegin(TxBatch),
    TxCommit(TxBatch),
    TxRollback {
        tx_id: i64,
    },
    TxFetch {
        tx_id: i64,
    },
    DbCreate {
        name: String,
        storage_kind: String,
    },
    DbDrop {
        name: String,
    },
    DbExists {
        name: String,
    },
    DbList,
    DbFreeze {
        name: String,
    },
    DbRelease {
        name: String,
    },
    ConfigGet {
        key: String,
    },
    ConfigSet {
        key: String,
        value: String,
    },
    ConfigList,
    Subscribe(SubscribeRequest),
    UnsubscribeLiveQuery {
        monitor_id: i32,
    },
    /// Re-read storage configuration after cluster changes.
    Reload,
}

impl Request {
    pub fn command(&self) -> u8 {
        match self {
            Request::Connect { .. } => protocol::CMD_CONNECT,
            Request::Open { .. } => protocol::CMD_OPEN,
            Request::Reopen { .. } => protocol::CMD_REOPEN,
            Request::Close => protocol::CMD_CLOSE,
            Request::Query { .. } => protocol::CMD_QUERY,
            Request::QueryNextPage { .. } => protocol::CMD_QUERY_NEXT_PAGE,
            Request::QueryClose { .. } => protocol::CMD_QUERY_CLOSE,
            Request::TxBegin(_) => protocol::CMD_TX_BEGIN,
            Request::TxCommit(_) => protocol::CMD_TX_COMMIT,
            Request::TxRollback { .. } => protocol::CMD_TX_ROLLBACK,
            Request::TxFetch { .. } => protocol::CMD_TX_FETCH,
            Request::DbCreate { .. } => protocol::CMD_DB_CREATE,
            Request::DbDrop { .. } => protocol::CMD_DB_DROP,
            Request::DbExists { .. } => protocol::CMD_DB_EXISTS,
            Request::DbList => protocol::CMD_DB_LIST,
            Request::DbFreeze { .. } => protocol::CMD_DB_FREEZE,
            Request::DbRelease { .. } => protocol::CMD_DB_RELEASE,
            Request::ConfigGet { .. } => protocol::CMD_CONFIG_GET,
            Request::ConfigSet { .. } => protocol::CMD_CONFIG_SET,
            Request::ConfigList => protocol::CMD_CONFIG_LIST,
            Request::Subscribe(_) => protocol::CMD_SUBSCRIBE,
            Request::UnsubscribeLiveQuery { .. } => protocol::CMD_UNSUBSCRIBE,
            Request::Reload => protocol::CMD_RELOAD,
        }
    }

    /// Short name for logging and error context.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "connect",
            Request::Open { .. } => "open",
            Request::Reopen { .. } => "reopen",
            Request::Close => "close",
            Request::Query { .. } => "query",
            Request::QueryNextPage { .. } => "query-next-page",
            Request::QueryClose { .. } => "query-close",
            Request::TxBegin(_) => "tx-begin",
            Request::TxCommit(_) => "tx-commit",
            Request::TxRollback { .. } => "tx-rollback",
            Request::TxFetch { .. } => "tx-fetch",
            Request::DbCreate { .. } => "db-create",
            Request::DbDrop { .. } => "db-drop",
            Request::DbExists { .. } => "db-exists",
            Request::DbList => "db-list",
            Request::DbFreeze { .. } => "db-freeze",
            Request::DbRelease { .. } => "db-release",
            Request::ConfigGet { .. } => "config-get",
            Request::ConfigSet { .. } => "config-set",
            Request::ConfigList => "config-list",
            Request::Subscribe(_) => "subscribe",
            Request::UnsubscribeLiveQuery { .. } => "unsubscribe-live-query",
            Request::Reload => "reload",
        }
    }

    /// Handshake requests establish or refresh a session instead of
    /// requiring one.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Request::Connect { .. } | Request::Open { .. } | Request::Reopen { .. }
        )
    }

    pub async fn encode_payload(&self) -> Result<Vec<u8>, DriverError> {
        let mut buf = Vec::new();
        let w = &mut buf;
        match self {
            Request::Connect { username, password } => {
                wire::write_string(w, protocol::DRIVER_NAME).await?;
                wire::write_string(w, protocol::DRIVER_VERSION).await?;
                wire::write_i16(w, protocol::PROTOCOL_VERSION).await?;
                wire::write_string(w, username).await?;
                wire::write_string(w, password).await?;
            }
            Request::Open {
                database,
                username,
                password,
                serializer,
            } => {
                wire::write_string(w, protocol::DRIVER_NAME).await?;
                wire::write_string(w, protocol::DRIVER_VERSION).await?;
                wire::write_i16(w, protocol::PROTOCOL_VERSION).await?;
                wire::write_string(w, serializer).await?;
                wire::write_string(w, database).await?;
                wire::write_string(w, username).await?;
                wire::write_string(w, password).await?;
            }
            Request::Reopen { database } => {
                wire::write_string(w, database).await?;
            }
            Request::Close | Request::DbList | Request::ConfigList | Request::Reload => {}
            Request::Query {
                kind,
                statement,
                params,
                page_size,
            } => {
                wire::write_u8(w, kind.tag()).await?;
                wire::write_string(w, statement).await?;
                wire::write_opt_bytes(w, params.as_deref()).await?;
                wire::write_i32(w, *page_size).await?;
            }
            Request::QueryNextPage {
                cursor_id,
                page_size,
            } => {
                wire::write_string(w, cursor_id).await?;
                wire::write_i32(w, *page_size).await?;
            }
            Request::QueryClose { cursor_id } => {
                wire::write_string(w, cursor_id).await?;
            }
            Request::TxBegin(batch) | Request::TxCommit(batch) => {
                batch.write(w).await?;
            }
            Request::TxRollback { tx_id } | Request::TxFetch { tx_id } => {
                wire::write_i64(w, *tx_id).await?;
            }
            Request::DbCreate { name, storage_kind } => {
                wire::write_string(w, name).await?;
                wire::write_string(w, storage_kind).await?;
            }
            Request::DbDrop { name }
            | Request::DbExists { name }
            | Request::DbFreeze { name }
            | Request::DbRelease { name } => {
                wire::write_string(w, name).await?;
            }
            Request::ConfigGet { key } => {
                wire::write_string(w, key).await?;
            }
            Request::ConfigSet { key, value } => {
                wire::write_string(w, key).await?;
                wire::write_string(w, value).await?;
            }
            Request::Subscribe(subscribe) => {
                wire::write_u8(w, subscribe.kind() as u8).await?;
                if let SubscribeRequest::LiveQuery { statement, params } = subscribe {
                    wire::write_string(w, statement).await?;
                    wire::write_opt_bytes(w, params.as_deref()).await?;
                }
            }
            Request::UnsubscribeLiveQuery { monitor_id } => {
                wire::write_i32(w, *monitor_id).await?;
            }
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_payload_layout() {
        let request = Request::Open {
            database: "crm".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            serializer: "msgpack-v1".to_string(),
        };
        let payload = request.encode_payload().await.unwrap();

        let mut r = payload.as_slice();
        assert_eq!(wire::read_string(&mut r).await.unwrap(), protocol::DRIVER_NAME);
        assert_eq!(
            wire::read_string(&mut r).await.unwrap(),
            protocol::DRIVER_VERSION
        );
        assert_eq!(
            wire::read_i16(&mut r).await.unwrap(),
            protocol::PROTOCOL_VERSION
        );
        assert_eq!(wire::read_string(&mut r).await.unwrap(), "msgpack-v1");
        assert_eq!(wire::read_string(&mut r).await.unwrap(), "crm");
        assert_eq!(wire::read_string(&mut r).await.unwrap(), "admin");
        assert_eq!(wire::read_string(&mut r).await.unwrap(), "secret");
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload_requests() {
        assert!(Request::Close.encode_payload().await.unwrap().is_empty());
        assert!(Request::DbList.encode_payload().await.unwrap().is_empty());
        assert!(Request::Reload.encode_payload().await.unwrap().is_empty());
    }

    #[test]
    fn test_handshake_classification() {
        assert!(Request::Connect {
            username: "a".into(),
            password: "b".into()
        }
        .is_handshake());
        assert!(Request::Reopen {
            database: "crm".into()
        }
        .is_handshake());
        assert!(!Request::Close.is_handshake());
        assert!(!Request::DbList.is_handshake());
    }

    #[tokio::test]
    async fn test_subscribe_live_query_payload() {
        let request = Request::Subscribe(SubscribeRequest::LiveQuery {
            statement: "select from users".to_string(),
            params: None,
        });
        let payload = request.encode_payload().await.unwrap();

        let mut r = payload.as_slice();
        assert_eq!(wire::read_u8(&mut r).await.unwrap(), PushKind::LiveQuery as u8);
        assert_eq!(
            wire::read_string(&mut r).await.unwrap(),
            "select from users"
        );
        assert_eq!(wire::read_opt_bytes(&mut r).await.unwrap(), None);
        assert!(r.is_empty());
    }
}
