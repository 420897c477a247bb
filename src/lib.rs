//! RiftDB remote client.
//!
//! Async driver core for talking to a RiftDB cluster over its framed
//! binary protocol: multi-server address list with failover, per-address
//! connection pool, per-node session and token handling, a retrying and
//! redirect-aware request executor, a background push listener for
//! server-initiated events (schema, configuration, live queries), and the
//! transaction wire protocol.
//!
//! ```no_run
//! use riftdb_client::{ClientConfig, RemoteStorage};
//!
//! # async fn demo() -> Result<(), riftdb_client::DriverError> {
//! let storage = RemoteStorage::open(
//!     &["db1.example.com", "db2.example.com"],
//!     "crm",
//!     ClientConfig::default(),
//! )
//! .await?;
//! let session = storage.open_session("admin", "secret").await?;
//! let mut results = storage.query(&session, "select from users", None).await?;
//! while let Some(record) = results.next().await? {
//!     println!("{} {}", record.id, record.body);
//! }
//! storage.close().await;
//! # Ok(())
//! # }
//! ```

pub mod addresses;
pub mod admin;
pub mod config;
pub mod error;
pub mod executor;
pub mod live;
pub mod pool;
pub mod protocol;
pub mod push;
pub mod record;
pub mod session;
pub mod storage;
pub mod tx;
pub mod wire;

pub use addresses::{AddressList, DEFAULT_PORT, DEFAULT_SSL_PORT};
pub use admin::ServerAdmin;
pub use config::{ClientConfig, ConnectionStrategy};
pub use error::{DriverError, ServerError, ServerErrorKind};
pub use executor::RequestExecutor;
pub use live::{LiveQueryListener, LiveQueryRegistry};
pub use pool::{Connection, ConnectionPool};
pub use protocol::{PushKind, PushMessage, QueryKind, Request, SubscribeRequest};
pub use push::{PushHandler, PushListener};
pub use record::{MsgpackSerializer, Record, RecordId, RecordSerializer};
pub use session::{ClientSession, NodeSession, SessionRegistry, SessionToken};
pub use storage::{RemoteStorage, ResultSet};
pub use tx::{IndexChangeOp, IndexChanges, KeyChanges, RecordOperation, TxBatch};
