//! Typed response payloads and their decoding.
//!
//! The executor hands callers the raw `OK` payload bytes; each operation
//! decodes them into one of these shapes. Encoders exist alongside the
//! decoders so scripted test servers can produce byte-exact frames.

use std::collections::HashMap;

use crate::error::DriverError;
use crate::protocol::push::PushKind;
use crate::record::{Record, RecordId, RecordSerializer};
use crate::tx::{self, CollectionChange, FetchedOperation};
use crate::wire;

/// Result of an open/connect/reopen handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub session_id: i32,
    pub token: Option<Vec<u8>>,
}

impl HandshakeResponse {
    pub async fn decode(payload: &[u8]) -> Result<Self, DriverError> {
        let mut r = payload;
        Ok(Self {
            session_id: wire::read_i32(&mut r).await?,
            token: wire::read_opt_bytes(&mut r).await?.filter(|t| !t.is_empty()),
        })
    }

    pub async fn encode(&self) -> Result<Vec<u8>, DriverError> {
        let mut buf = Vec::new();
        wire::write_i32(&mut buf, self.session_id).await?;
        wire::write_opt_bytes(&mut buf, self.token.as_deref()).await?;
        Ok(buf)
    }
}

/// One page of query results plus the cursor to fetch more.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub cursor_id: String,
    pub records: Vec<Record>,
    pub has_next_page: bool,
}

impl QueryResponse {
    pub async fn decode(
        payload: &[u8],
        serializer: &dyn RecordSerializer,
    ) -> Result<Self, DriverError> {
        let mut r = payload;
        let cursor_id = wire::read_string(&mut r).await?;
        let count = tx::read_count(&mut r, "query result").await?;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let id = wire::read_rid(&mut r).await?;
            let version = wire::read_i32(&mut r).await?;
            let kind = wire::read_u8(&mut r).await?;
            let body = serializer.decode(&wire::read_bytes(&mut r).await?)?;
            records.push(Record {
                id,
                version,
                kind,
                body,
            });
        }
        let has_next_page = wire::read_bool(&mut r).await?;
        Ok(Self {
            cursor_id,
            records,
            has_next_page,
        })
    }

    pub async fn encode(
        &self,
        serializer: &dyn RecordSerializer,
    ) -> Result<Vec<u8>, DriverError> {
        let mut buf = Vec::new();
        wire::write_string(&mut buf, &self.cursor_id).await?;
        wire::write_i32(&mut buf, self.records.len() as i32).await?;
        for record in &self.records {
            wire::write_rid(&mut buf, record.id).await?;
            wire::write_i32(&mut buf, record.version).await?;
            wire::write_u8(&mut buf, record.kind).await?;
            wire::write_bytes(&mut buf, &serializer.encode(&record.body)?).await?;
        }
        wire::write_bool(&mut buf, self.has_next_page).await?;
        Ok(buf)
    }
}

async fn read_id_mapping(r: &mut &[u8]) -> Result<HashMap<RecordId, RecordId>, DriverError> {
    let count = tx::read_count(r, "id mapping").await?;
    let mut mapping = HashMap::with_capacity(count);
    for _ in 0..count {
        let provisional = wire::read_rid(r).await?;
        let assigned = wire::read_rid(r).await?;
        mapping.insert(provisional, assigned);
    }
    Ok(mapping)
}

async fn write_id_mapping(
    buf: &mut Vec<u8>,
    mapping: &HashMap<RecordId, RecordId>,
) -> Result<(), DriverError> {
    wire::write_i32(buf, mapping.len() as i32).await?;
    for (provisional, assigned) in mapping {
        wire::write_rid(buf, *provisional).await?;
        wire::write_rid(buf, *assigned).await?;
    }
    Ok(())
}

/// Server-assigned identities for a begun transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxBeginResponse {
    pub tx_id: i64,
    pub id_mapping: HashMap<RecordId, RecordId>,
}

impl TxBeginResponse {
    pub async fn decode(payload: &[u8]) -> Result<Self, DriverError> {
        let mut r = payload;
        Ok(Self {
            tx_id: wire::read_i64(&mut r).await?,
            id_mapping: read_id_mapping(&mut r).await?,
        })
    }

    pub async fn encode(&self) -> Result<Vec<u8>, DriverError> {
        let mut buf = Vec::new();
        wire::write_i64(&mut buf, self.tx_id).await?;
        write_id_mapping(&mut buf, &self.id_mapping).await?;
        Ok(buf)
    }
}

/// Commit acknowledgment: id mapping plus collection-pointer changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TxCommitResponse {
    pub id_mapping: HashMap<RecordId, RecordId>,
    pub collection_changes: Vec<CollectionChange>,
}

impl TxCommitResponse {
    pub async fn decode(payload: &[u8]) -> Result<Self, DriverError> {
        let mut r = payload;
        let id_mapping = read_id_mapping(&mut r).await?;
        let count = tx::read_count(&mut r, "collection change").await?;
        let mut collection_changes = Vec::with_capacity(count);
        for _ in 0..count {
            collection_changes.push(CollectionChange::read(&mut r).await?);
        }
        Ok(Self {
            id_mapping,
            collection_changes,
        })
    }

    pub async fn encode(&self) -> Result<Vec<u8>, DriverError> {
        let mut buf = Vec::new();
        write_id_mapping(&mut buf, &self.id_mapping).await?;
        wire::write_i32(&mut buf, self.collection_changes.len() as i32).await?;
        for change in &self.collection_changes {
            change.write(&mut buf).await?;
        }
        Ok(buf)
    }
}

/// The server's current view of an in-flight transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxFetchResponse {
    pub tx_id: i64,
    pub operations: Vec<FetchedOperation>,
}

impl TxFetchResponse {
    pub async fn decode(payload: &[u8]) -> Result<Self, DriverError> {
        let mut r = payload;
        let tx_id = wire::read_i64(&mut r).await?;
        let count = tx::read_count(&mut r, "fetched operation").await?;
        let mut operations = Vec::with_capacity(count);
        for _ in 0..count {
            operations.push(FetchedOperation::read(&mut r).await?);
        }
        Ok(Self { tx_id, operations })
    }

    pub async fn encode(&self) -> Result<Vec<u8>, DriverError> {
        let mut buf = Vec::new();
        wire::write_i64(&mut buf, self.tx_id).await?;
        wire::write_i32(&mut buf, self.operations.len() as i32).await?;
        for op in &self.operations {
            op.write(&mut buf).await?;
        }
        Ok(buf)
    }
}

pub async fn decode_bool(payload: &[u8]) -> Result<bool, DriverError> {
    wire::read_bool(&mut &payload[..]).await
}

pub async fn encode_bool(value: bool) -> Result<Vec<u8>, DriverError> {
    let mut buf = Vec::new();
    wire::write_bool(&mut buf, value).await?;
    Ok(buf)
}

pub async fn decode_string_list(payload: &[u8]) -> Result<Vec<String>, DriverError> {
    let mut r = payload;
    let count = tx::read_count(&mut r, "string list").await?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(wire::read_string(&mut r).await?);
    }
    Ok(values)
}

pub async fn encode_string_list<S: AsRef<str>>(values: &[S]) -> Result<Vec<u8>, DriverError> {
    let mut buf = Vec::new();
    wire::write_i32(&mut buf, values.len() as i32).await?;
    for value in values {
        wire::write_string(&mut buf, value.as_ref()).await?;
    }
    Ok(buf)
}

pub async fn decode_opt_string(payload: &[u8]) -> Result<Option<String>, DriverError> {
    wire::read_opt_string(&mut &payload[..]).await
}

pub async fn decode_string_pairs(
    payload: &[u8],
) -> Result<Vec<(String, String)>, DriverError> {
    let mut r = payload;
    let count = tx::read_count(&mut r, "config entry").await?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key = wire::read_string(&mut r).await?;
        let value = wire::read_string(&mut r).await?;
        entries.push((key, value));
    }
    Ok(entries)
}

pub async fn encode_string_pairs(entries: &[(String, String)]) -> Result<Vec<u8>, DriverError> {
    let mut buf = Vec::new();
    wire::write_i32(&mut buf, entries.len() as i32).await?;
    for (key, value) in entries {
        wire::write_string(&mut buf, key).await?;
        wire::write_string(&mut buf, value).await?;
    }
    Ok(buf)
}

/// Acknowledgment for a push-channel subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeAck {
    pub kind: PushKind,
    /// Set for live-query subscriptions.
    pub monitor_id: Option<i32>,
}

impl SubscribeAck {
    pub async fn decode(payload: &[u8]) -> Result<Self, DriverError> {
        let mut r = payload;
        let kind = PushKind::from_tag(wire::read_u8(&mut r).await?)?;
        let monitor_id = if kind == PushKind::LiveQuery {
            Some(wire::read_i32(&mut r).await?)
        } else {
            None
        };
        Ok(Self { kind, monitor_id })
    }

    pub async fn encode(&self) -> Result<Vec<u8>, DriverError> {
        let mut buf = Vec::new();
        wire::write_u8(&mut buf, self.kind as u8).await?;
        if let Some(monitor_id) = self.monitor_id {
            wire::write_i32(&mut buf, monitor_id).await?;
        }
        Ok(buf)
    }
}
