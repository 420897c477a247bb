//! Transaction wire shapes: record-operation batches and index-change sets.
//!
//! Begin and commit share one encoding for a record-operation list followed
//! by an index-change list. Fetch returns the server's current view of the
//! same list, with original identities preserved so the caller can rewrite
//! in-memory references after provisional ids were replaced.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::error::DriverError;
use crate::record::RecordId;
use crate::wire;

pub const OP_CREATED: u8 = 1;
pub const OP_UPDATED: u8 = 2;
pub const OP_DELETED: u8 = 3;

const INDEX_OP_PUT: u8 = 1;
const INDEX_OP_REMOVE: u8 = 2;
const INDEX_OP_CLEAR: u8 = 3;

/// One record operation inside a transaction batch, in client issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOperation {
    Created {
        id: RecordId,
        record_kind: u8,
        payload: Vec<u8>,
        content_changed: bool,
    },
    Updated {
        id: RecordId,
        record_kind: u8,
        version: i32,
        payload: Vec<u8>,
        content_changed: bool,
    },
    Deleted {
        id: RecordId,
        record_kind: u8,
        version: i32,
    },
}

impl RecordOperation {
    pub fn id(&self) -> RecordId {
        match self {
            RecordOperation::Created { id, .. }
            | RecordOperation::Updated { id, .. }
            | RecordOperation::Deleted { id, .. } => *id,
        }
    }

    fn set_id(&mut self, new_id: RecordId) {
        match self {
            RecordOperation::Created { id, .. }
            | RecordOperation::Updated { id, .. }
            | RecordOperation::Deleted { id, .. } => *id = new_id,
        }
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), DriverError> {
        match self {
            RecordOperation::Created {
                id,
                record_kind,
                payload,
                content_changed,
            } => {
                wire::write_u8(w, OP_CREATED).await?;
                wire::write_rid(w, *id).await?;
                wire::write_u8(w, *record_kind).await?;
                wire::write_bytes(w, payload).await?;
                wire::write_bool(w, *content_changed).await?;
            }
            RecordOperation::Updated {
                id,
                record_kind,
                version,
                payload,
                content_changed,
            } => {
                wire::write_u8(w, OP_UPDATED).await?;
                wire::write_rid(w, *id).await?;
                wire::write_u8(w, *record_kind).await?;
                wire::write_i32(w, *version).await?;
                wire::write_bytes(w, payload).await?;
                wire::write_bool(w, *content_changed).await?;
            }
            RecordOperation::Deleted {
                id,
                record_kind,
                version,
            } => {
                wire::write_u8(w, OP_DELETED).await?;
                wire::write_rid(w, *id).await?;
                wire::write_u8(w, *record_kind).await?;
                wire::write_i32(w, *version).await?;
            }
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, DriverError> {
        let tag = wire::read_u8(r).await?;
        let id = wire::read_rid(r).await?;
        let record_kind = wire::read_u8(r).await?;
        match tag {
            OP_CREATED => Ok(RecordOperation::Created {
                id,
                record_kind,
                payload: wire::read_bytes(r).await?,
                content_changed: wire::read_bool(r).await?,
            }),
            OP_UPDATED => Ok(RecordOperation::Updated {
                id,
                record_kind,
                version: wire::read_i32(r).await?,
                payload: wire::read_bytes(r).await?,
                content_changed: wire::read_bool(r).await?,
            }),
            OP_DELETED => Ok(RecordOperation::Deleted {
                id,
                record_kind,
                version: wire::read_i32(r).await?,
            }),
            other => Err(DriverError::Protocol(format!(
                "unknown transaction operation tag: {other}"
            ))),
        }
    }
}

/// One change to one index key. A remove with no target identity is
/// normalized to `Clear` when encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexChangeOp {
    Put(RecordId),
    Remove(Option<RecordId>),
    Clear,
}

impl IndexChangeOp {
    async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), DriverError> {
        match self {
            IndexChangeOp::Put(rid) => {
                wire::write_u8(w, INDEX_OP_PUT).await?;
                wire::write_rid(w, *rid).await?;
            }
            IndexChangeOp::Remove(Some(rid)) => {
                wire::write_u8(w, INDEX_OP_REMOVE).await?;
                wire::write_rid(w, *rid).await?;
            }
            IndexChangeOp::Remove(None) | IndexChangeOp::Clear => {
                wire::write_u8(w, INDEX_OP_CLEAR).await?;
            }
        }
        Ok(())
    }

    async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, DriverError> {
        match wire::read_u8(r).await? {
            INDEX_OP_PUT => Ok(IndexChangeOp::Put(wire::read_rid(r).await?)),
            INDEX_OP_REMOVE => Ok(IndexChangeOp::Remove(Some(wire::read_rid(r).await?))),
            INDEX_OP_CLEAR => Ok(IndexChangeOp::Clear),
            other => Err(DriverError::Protocol(format!(
                "unknown index change tag: {other}"
            ))),
        }
    }
}

/// Ordered changes for one index key. `key = None` is the null-key bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChanges {
    pub key: Option<Vec<u8>>,
    pub entries: Vec<IndexChangeOp>,
}

/// All changes to one index within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChanges {
    pub name: String,
    pub cleared: bool,
    pub keys: Vec<KeyChanges>,
}

impl IndexChanges {
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), DriverError> {
        wire::write_string(w, &self.name).await?;
        wire::write_bool(w, self.cleared).await?;
        wire::write_i32(w, self.keys.len() as i32).await?;
        for key in &self.keys {
            wire::write_opt_bytes(w, key.key.as_deref()).await?;
            wire::write_i32(w, key.entries.len() as i32).await?;
            for entry in &key.entries {
                entry.write(w).await?;
            }
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, DriverError> {
        let name = wire::read_string(r).await?;
        let cleared = wire::read_bool(r).await?;
        let key_count = read_count(r, "index key").await?;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let key = wire::read_opt_bytes(r).await?;
            let entry_count = read_count(r, "index entry").await?;
            let mut entries = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                entries.push(IndexChangeOp::read(r).await?);
            }
            keys.push(KeyChanges { key, entries });
        }
        Ok(Self {
            name,
            cleared,
            keys,
        })
    }
}

/// Outbound payload shared by begin and commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxBatch {
    pub tx_id: i64,
    pub has_content: bool,
    pub operations: Vec<RecordOperation>,
    pub index_changes: Vec<IndexChanges>,
}

impl TxBatch {
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), DriverError> {
        wire::write_i64(w, self.tx_id).await?;
        wire::write_bool(w, self.has_content).await?;
        if self.has_content {
            wire::write_i32(w, self.operations.len() as i32).await?;
            for op in &self.operations {
                op.write(w).await?;
            }
        }
        wire::write_i32(w, self.index_changes.len() as i32).await?;
        for change in &self.index_changes {
            change.write(w).await?;
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, DriverError> {
        let tx_id = wire::read_i64(r).await?;
        let has_content = wire::read_bool(r).await?;
        let mut operations = Vec::new();
        if has_content {
            let count = read_count(r, "transaction operation").await?;
            for _ in 0..count {
                operations.push(RecordOperation::read(r).await?);
            }
        }
        let count = read_count(r, "index change").await?;
        let mut index_changes = Vec::with_capacity(count);
        for _ in 0..count {
            index_changes.push(IndexChanges::read(r).await?);
        }
        Ok(Self {
            tx_id,
            has_content,
            operations,
            index_changes,
        })
    }

    /// Rewrite provisional record ids using a server-assigned mapping,
    /// covering both record operations and index-change targets.
    pub fn remap_ids(&mut self, mapping: &HashMap<RecordId, RecordId>) {
        for op in &mut self.operations {
            if let Some(new_id) = mapping.get(&op.id()) {
                op.set_id(*new_id);
            }
        }
        for change in &mut self.index_changes {
            for key in &mut change.keys {
                for entry in &mut key.entries {
                    match entry {
                        IndexChangeOp::Put(rid) | IndexChangeOp::Remove(Some(rid)) => {
                            if let Some(new_id) = mapping.get(rid) {
                                *rid = *new_id;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Pointer to an embedded collection structure, returned by commit when the
/// server relocated collections during the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionPointer {
    pub file_id: i64,
    pub page_index: i64,
    pub page_offset: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionChange {
    pub id: Uuid,
    pub pointer: CollectionPointer,
}

impl CollectionChange {
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), DriverError> {
        wire::write_bytes(w, self.id.as_bytes()).await?;
        wire::write_i64(w, self.pointer.file_id).await?;
        wire::write_i64(w, self.pointer.page_index).await?;
        wire::write_i32(w, self.pointer.page_offset).await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, DriverError> {
        let raw = wire::read_bytes(r).await?;
        let id = Uuid::from_slice(&raw)
            .map_err(|e| DriverError::Protocol(format!("invalid collection id: {e}")))?;
        Ok(Self {
            id,
            pointer: CollectionPointer {
                file_id: wire::read_i64(r).await?,
                page_index: wire::read_i64(r).await?,
                page_offset: wire::read_i32(r).await?,
            },
        })
    }
}

/// One operation in a fetched (server-side) transaction view. Carries both
/// the current identity and the identity the client originally used, plus
/// the pre-image for updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedOperation {
    pub tag: u8,
    pub id: RecordId,
    pub original_id: RecordId,
    pub record_kind: u8,
    pub version: i32,
    pub payload: Option<Vec<u8>>,
    pub pre_image: Option<Vec<u8>>,
}

impl FetchedOperation {
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), DriverError> {
        wire::write_u8(w, self.tag).await?;
        wire::write_rid(w, self.id).await?;
        wire::write_rid(w, self.original_id).await?;
        wire::write_u8(w, self.record_kind).await?;
        wire::write_i32(w, self.version).await?;
        wire::write_opt_bytes(w, self.payload.as_deref()).await?;
        wire::write_opt_bytes(w, self.pre_image.as_deref()).await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, DriverError> {
        Ok(Self {
            tag: wire::read_u8(r).await?,
            id: wire::read_rid(r).await?,
            original_id: wire::read_rid(r).await?,
            record_kind: wire::read_u8(r).await?,
            version: wire::read_i32(r).await?,
            payload: wire::read_opt_bytes(r).await?,
            pre_image: wire::read_opt_bytes(r).await?,
        })
    }
}

pub(crate) async fn read_count<R: AsyncRead + Unpin>(
    r: &mut R,
    what: &str,
) -> Result<usize, DriverError> {
    let count = wire::read_i32(r).await?;
    if !(0..=1_000_000).contains(&count) {
        return Err(DriverError::Protocol(format!(
            "invalid {what} count on the wire: {count}"
        )));
    }
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> TxBatch {
        TxBatch {
            tx_id: 42,
            has_content: true,
            operations: vec![
                RecordOperation::Created {
                    id: RecordId::new(-2, 1),
                    record_kind: b'd',
                    payload: vec![1, 2, 3],
                    content_changed: true,
                },
                RecordOperation::Updated {
                    id: RecordId::new(10, 5),
                    record_kind: b'd',
                    version: 3,
                    payload: vec![4, 5],
                    content_changed: false,
                },
                RecordOperation::Deleted {
                    id: RecordId::new(10, 6),
                    record_kind: b'd',
                    version: 1,
                },
            ],
            index_changes: vec![IndexChanges {
                name: "users.email".to_string(),
                cleared: false,
                keys: vec![
                    KeyChanges {
                        key: Some(b"alice@example.com".to_vec()),
                        entries: vec![
                            IndexChangeOp::Put(RecordId::new(-2, 1)),
                            IndexChangeOp::Remove(Some(RecordId::new(10, 6))),
                        ],
                    },
                    KeyChanges {
                        key: None,
                        entries: vec![IndexChangeOp::Put(RecordId::new(10, 5))],
                    },
                ],
            }],
        }
    }

    #[tokio::test]
    async fn test_batch_round_trip_preserves_order() {
        let batch = sample_batch();
        let mut buf = Vec::new();
        batch.write(&mut buf).await.unwrap();
        let decoded = TxBatch::read(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded, batch);
    }

    #[tokio::test]
    async fn test_empty_batch_without_content() {
        let batch = TxBatch {
            tx_id: 7,
            has_content: false,
            operations: Vec::new(),
            index_changes: Vec::new(),
        };
        let mut buf = Vec::new();
        batch.write(&mut buf).await.unwrap();
        let decoded = TxBatch::read(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded, batch);
    }

    #[tokio::test]
    async fn test_remove_without_value_normalized_to_clear() {
        let changes = IndexChanges {
            name: "idx".to_string(),
            cleared: false,
            keys: vec![KeyChanges {
                key: Some(b"k".to_vec()),
                entries: vec![IndexChangeOp::Remove(None)],
            }],
        };
        let mut buf = Vec::new();
        changes.write(&mut buf).await.unwrap();
        let decoded = IndexChanges::read(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded.keys[0].entries, vec![IndexChangeOp::Clear]);
    }

    #[test]
    fn test_remap_provisional_ids() {
        let mut batch = sample_batch();
        let mut mapping = HashMap::new();
        mapping.insert(RecordId::new(-2, 1), RecordId::new(12, 0));
        batch.remap_ids(&mapping);

        assert_eq!(batch.operations[0].id(), RecordId::new(12, 0));
        assert_eq!(batch.operations[1].id(), RecordId::new(10, 5));
        assert_eq!(
            batch.index_changes[0].keys[0].entries[0],
            IndexChangeOp::Put(RecordId::new(12, 0))
        );
    }

    #[tokio::test]
    async fn test_collection_change_round_trip() {
        let change = CollectionChange {
            id: Uuid::new_v4(),
            pointer: CollectionPointer {
                file_id: 9,
                page_index: 1024,
                page_offset: 16,
            },
        };
        let mut buf = Vec::new();
        change.write(&mut buf).await.unwrap();
        let decoded = CollectionChange::read(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded, change);
    }

    #[tokio::test]
    async fn test_fetched_operation_round_trip() {
        let op = FetchedOperation {
            tag: OP_UPDATED,
            id: RecordId::new(12, 0),
            original_id: RecordId::new(-2, 1),
            record_kind: b'd',
            version: 4,
            payload: Some(vec![1, 2]),
            pre_image: Some(vec![3, 4]),
        };
        let mut buf = Vec::new();
        op.write(&mut buf).await.unwrap();
        let decoded = FetchedOperation::read(&mut buf.as_slice()).await.unwrap();
        assert_eq!(decoded, op);
    }
}
