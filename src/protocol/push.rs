//! Unsolicited push frames and their decoding.
//!
//! A push frame follows a `PUSH` status byte on the dedicated push socket:
//! a push-type byte, an acknowledgment id (`-1` when the server does not
//! expect one), and a length-prefixed payload whose shape depends on the
//! type. Metadata pushes carry an opaque serialized document; distributed
//! configuration carries a host list; live-query pushes carry an event
//! batch for one monitor.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::DriverError;
use crate::record::RecordId;
use crate::tx::read_count;
use crate::wire;

/// Command id for the acknowledgment the listener writes back when a push
/// frame carries an ack id.
pub const CMD_PUSH_ACK: u8 = 90;

/// Discriminant for push frames and subscribe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PushKind {
    StorageConfig = 80,
    Schema = 81,
    IndexManager = 82,
    Functions = 83,
    Sequences = 84,
    DistributedConfig = 85,
    LiveQuery = 86,
}

impl PushKind {
    pub fn from_tag(tag: u8) -> Result<Self, DriverError> {
        match tag {
            80 => Ok(PushKind::StorageConfig),
            81 => Ok(PushKind::Schema),
            82 => Ok(PushKind::IndexManager),
            83 => Ok(PushKind::Functions),
            84 => Ok(PushKind::Sequences),
            85 => Ok(PushKind::DistributedConfig),
            86 => Ok(PushKind::LiveQuery),
            other => Err(DriverError::Protocol(format!(
                "unknown push type byte: {other}"
            ))),
        }
    }
}

/// What happened to a record matched by a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LiveEventKind {
    Created = 1,
    Updated = 2,
    Deleted = 3,
}

impl LiveEventKind {
    fn from_tag(tag: u8) -> Result<Self, DriverError> {
        match tag {
            1 => Ok(LiveEventKind::Created),
            2 => Ok(LiveEventKind::Updated),
            3 => Ok(LiveEventKind::Deleted),
            other => Err(DriverError::Protocol(format!(
                "unknown live event tag: {other}"
            ))),
        }
    }
}

/// One live-query event. `before` carries the pre-change image for updates
/// and deletes when the server provides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveQueryEvent {
    pub kind: LiveEventKind,
    pub id: RecordId,
    pub version: i32,
    pub payload: Vec<u8>,
    pub before: Option<Vec<u8>>,
}

impl LiveQueryEvent {
    async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), DriverError> {
        wire::write_u8(w, self.kind as u8).await?;
        wire::write_rid(w, self.id).await?;
        wire::write_i32(w, self.version).await?;
        wire::write_bytes(w, &self.payload).await?;
        wire::write_opt_bytes(w, self.before.as_deref()).await?;
        Ok(())
    }

    async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, DriverError> {
        Ok(Self {
            kind: LiveEventKind::from_tag(wire::read_u8(r).await?)?,
            id: wire::read_rid(r).await?,
            version: wire::read_i32(r).await?,
            payload: wire::read_bytes(r).await?,
            before: wire::read_opt_bytes(r).await?,
        })
    }
}

/// A decoded push frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    /// Updated storage configuration document.
    StorageConfig(Vec<u8>),
    /// Updated schema document.
    Schema(Vec<u8>),
    /// Updated index-manager document.
    IndexManager(Vec<u8>),
    /// Updated server-side functions document.
    Functions(Vec<u8>),
    /// Updated sequences document.
    Sequences(Vec<u8>),
    /// New cluster member list.
    DistributedConfig { hosts: Vec<String> },
    /// Event batch for one live-query monitor. `complete` marks the end of
    /// the subscription.
    LiveQuery {
        monitor_id: i32,
        events: Vec<LiveQueryEvent>,
        complete: bool,
    },
}

impl PushMessage {
    pub fn kind(&self) -> PushKind {
        match self {
            PushMessage::StorageConfig(_) => PushKind::StorageConfig,
            PushMessage::Schema(_) => PushKind::Schema,
            PushMessage::IndexManager(_) => PushKind::IndexManager,
            PushMessage::Functions(_) => PushKind::Functions,
            PushMessage::Sequences(_) => PushKind::Sequences,
            PushMessage::DistributedConfig { .. } => PushKind::DistributedConfig,
            PushMessage::LiveQuery { .. } => PushKind::LiveQuery,
        }
    }

    /// Read one push frame after the `PUSH` status byte. Returns the
    /// message and the acknowledgment id the server expects echoed back
    /// (`None` when no ack is requested).
    pub async fn read<R: AsyncRead + Unpin>(
        r: &mut R,
    ) -> Result<(Self, Option<i32>), DriverError> {
        let kind = PushKind::from_tag(wire::read_u8(r).await?)?;
        let ack_id = wire::read_i32(r).await?;
        let payload = wire::read_bytes(r).await?;
        let message = Self::decode(kind, &payload).await?;
        Ok((message, (ack_id >= 0).then_some(ack_id)))
    }

    async fn decode(kind: PushKind, payload: &[u8]) -> Result<Self, DriverError> {
        let mut r = payload;
        match kind {
            PushKind::StorageConfig => Ok(PushMessage::StorageConfig(r.to_vec())),
            PushKind::Schema => Ok(PushMessage::Schema(r.to_vec())),
            PushKind::IndexManager => Ok(PushMessage::IndexManager(r.to_vec())),
            PushKind::Functions => Ok(PushMessage::Functions(r.to_vec())),
            PushKind::Sequences => Ok(PushMessage::Sequences(r.to_vec())),
            PushKind::DistributedConfig => {
                let count = read_count(&mut r, "cluster host").await?;
                let mut hosts = Vec::with_capacity(count);
                for _ in 0..count {
                    hosts.push(wire::read_string(&mut r).await?);
                }
                Ok(PushMessage::DistributedConfig { hosts })
            }
            PushKind::LiveQuery => {
                let monitor_id = wire::read_i32(&mut r).await?;
                let complete = wire::read_bool(&mut r).await?;
                let count = read_count(&mut r, "live event").await?;
                let mut events = Vec::with_capacity(count);
                for _ in 0..count {
                    events.push(LiveQueryEvent::read(&mut r).await?);
                }
                Ok(PushMessage::LiveQuery {
                    monitor_id,
                    events,
                    complete,
                })
            }
        }
    }

    /// Frame a complete push message, status byte included. Used by
    /// scripted test servers.
    pub async fn write<W: AsyncWrite + Unpin>(
        &self,
        w: &mut W,
        ack_id: Option<i32>,
    ) -> Result<(), DriverError> {
        let payload = self.encode_payload().await?;
        wire::write_u8(w, super::STATUS_PUSH).await?;
        wire::write_u8(w, self.kind() as u8).await?;
        wire::write_i32(w, ack_id.unwrap_or(-1)).await?;
        wire::write_bytes(w, &payload).await?;
        Ok(())
    }

    async fn encode_payload(&self) -> Result<Vec<u8>, DriverError> {
        let mut buf = Vec::new();
        match self {
            PushMessage::StorageConfig(doc)
            | PushMessage::Schema(doc)
            | PushMessage::IndexManager(doc)
            | PushMessage::Functions(doc)
            | PushMessage::Sequences(doc) => buf.extend_from_slice(doc),
            PushMessage::DistributedConfig { hosts } => {
                wire::write_i32(&mut buf, hosts.len() as i32).await?;
                for host in hosts {
                    wire::write_string(&mut buf, host).await?;
                }
            }
            PushMessage::LiveQuery {
                monitor_id,
                events,
                complete,
            } => {
                wire::write_i32(&mut buf, *monitor_id).await?;
                wire::write_bool(&mut buf, *complete).await?;
                wire::write_i32(&mut buf, events.len() as i32).await?;
                for event in events {
                    event.write(&mut buf).await?;
                }
            }
        }
        Ok(buf)
    }
}

/// Write the acknowledgment for a push frame that requested one. Must be
/// called under the push socket's write lock.
pub async fn write_push_ack<W: AsyncWrite + Unpin>(
    w: &mut W,
    ack_id: i32,
) -> Result<(), DriverError> {
    wire::write_u8(w, CMD_PUSH_ACK).await?;
    wire::write_i32(w, ack_id).await?;
    Ok(())
}
