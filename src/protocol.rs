//! Transition wire protocol.
//!
//! This module owns **every message that crosses the transport boundary**
//! between the authority and its participants during a world transition.
//!
//! | Kind                      | Direction           | Payload                         |
//! |---------------------------|---------------------|---------------------------------|
//! | `WorldTransitionCommand`  | authority → client  | world index, correlation id, snapshot |
//! | `TransitionAck`           | client → authority  | correlation id, client id       |
//!
//! ## Snapshot layout
//!
//! Little-endian, length-prefixed by entity count (`u32`). Per entity, in
//! this exact order:
//!
//! 1. `is_player` (`u8`)
//! 2. `entity_id` (`u64`)
//! 3. `owner` (`u64`)
//! 4. parent presence flag (`u8`), then `parent_id` (`u64`) when present
//! 5. by replication mode:
//!    - prefab resync: `prefab_hash` (`u64`), position x/y/z (`f32`×3),
//!      rotation x/y/z (`f32`×3)
//!    - scene-authored resync: `persistent_instance_id` (`u64`)
//! 6. with variable replication enabled: payload length (`u32`) + verbatim
//!    payload bytes
//!
//! No other framing is defined. Decode failures are recoverable `Codec`
//! errors; the carrying command is skipped.

use crate::error::{GateError, Result};
use crate::types::{ClientId, CorrelationId, EntityId, EulerRot, ReplicationMode, Vec3};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Channels & message kinds
// ---------------------------------------------------------------------------

/// Application-level channel a message travels on.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

/// Internal control channel carrying transition commands and acknowledgments.
pub const CONTROL_CHANNEL: ChannelId = ChannelId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    WorldTransitionCommand,
    TransitionAck,
}

// ---------------------------------------------------------------------------
// Entity records
// ---------------------------------------------------------------------------

/// How a snapshot record resolves to a concrete entity on the receiving side.
///
/// Resolved exactly once at serialize/deserialize time, never by an implicit
/// runtime type check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeIdentity {
    /// Freshly constructed from a prefab, with spatial placement.
    Fresh {
        prefab_hash: u64,
        position: Vec3,
        rotation: EulerRot,
    },
    /// Already authored into the loaded world; resolved by stable id.
    Persistent { instance_id: u64 },
}

/// One replicated entity as carried in a transition snapshot.
///
/// Transient: the authoritative entity store is an external collaborator;
/// these records exist only while a snapshot is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_id: EntityId,
    pub owner: ClientId,
    pub is_player: bool,
    /// Present only when the entity declares that its hierarchical parent
    /// must survive replication.
    pub parent: Option<EntityId>,
    pub identity: TypeIdentity,
    /// Variable-replication payload, appended verbatim per entity.
    pub variables: Option<Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Snapshot codec
// ---------------------------------------------------------------------------

/// Visibility-filtered set of entity records for one client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub entities: Vec<EntityRecord>,
}

impl Snapshot {
    pub fn encode(&self, mode: ReplicationMode, variable_replication: bool) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(4 + self.entities.len() * 48);
        buf.put_u32_le(self.entities.len() as u32);

        for record in &self.entities {
            buf.put_u8(record.is_player as u8);
            buf.put_u64_le(record.entity_id.0);
            buf.put_u64_le(record.owner.0);
            match record.parent {
                Some(parent) => {
                    buf.put_u8(1);
                    buf.put_u64_le(parent.0);
                }
                None => buf.put_u8(0),
            }
            match (mode, record.identity) {
                (
                    ReplicationMode::PrefabResync,
                    TypeIdentity::Fresh {
                        prefab_hash,
                        position,
                        rotation,
                    },
                ) => {
                    buf.put_u64_le(prefab_hash);
                    buf.put_f32_le(position.x);
                    buf.put_f32_le(position.y);
                    buf.put_f32_le(position.z);
                    buf.put_f32_le(rotation.x);
                    buf.put_f32_le(rotation.y);
                    buf.put_f32_le(rotation.z);
                }
                (ReplicationMode::SceneAuthoredResync, TypeIdentity::Persistent { instance_id }) => {
                    buf.put_u64_le(instance_id);
                }
                (mode, identity) => {
                    return Err(GateError::Codec(format!(
                        "record {} identity {:?} does not match replication mode {:?}",
                        record.entity_id, identity, mode
                    )));
                }
            }
            if variable_replication {
                let payload = record.variables.as_deref().unwrap_or(&[]);
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
        }

        Ok(buf.freeze())
    }

    pub fn decode(
        payload: &[u8],
        mode: ReplicationMode,
        variable_replication: bool,
    ) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let count = reader.u32()? as usize;
        let mut entities = Vec::with_capacity(count.min(4096));

        for _ in 0..count {
            let is_player = reader.u8()? != 0;
            let entity_id = EntityId(reader.u64()?);
            let owner = ClientId(reader.u64()?);
            let parent = match reader.u8()? {
                0 => None,
                _ => Some(EntityId(reader.u64()?)),
            };
            let identity = match mode {
                ReplicationMode::PrefabResync => {
                    let prefab_hash = reader.u64()?;
                    let position = Vec3::new(reader.f32()?, reader.f32()?, reader.f32()?);
                    let rotation = EulerRot::new(reader.f32()?, reader.f32()?, reader.f32()?);
                    TypeIdentity::Fresh {
                        prefab_hash,
                        position,
                        rotation,
                    }
                }
                ReplicationMode::SceneAuthoredResync => TypeIdentity::Persistent {
                    instance_id: reader.u64()?,
                },
            };
            let variables = if variable_replication {
                let len = reader.u32()? as usize;
                let bytes = reader.bytes(len)?;
                if bytes.is_empty() {
                    None
                } else {
                    Some(bytes)
                }
            } else {
                None
            };

            entities.push(EntityRecord {
                entity_id,
                owner,
                is_player,
                parent,
                identity,
                variables,
            });
        }

        if reader.remaining() != 0 {
            return Err(GateError::Codec(format!(
                "{} trailing bytes after {} snapshot records",
                reader.remaining(),
                count
            )));
        }
        Ok(Self { entities })
    }
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// Authority → client: switch to `world_index` and apply `snapshot`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionCommand {
    pub world_index: u32,
    pub correlation: CorrelationId,
    /// Encoded [`Snapshot`]; decoded lazily so the command header can be
    /// validated first.
    pub snapshot: Bytes,
}

impl TransitionCommand {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(20 + self.snapshot.len());
        buf.put_u32_le(self.world_index);
        buf.put_slice(&self.correlation.to_bytes());
        buf.put_slice(&self.snapshot);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let world_index = reader.u32()?;
        let correlation = reader.correlation()?;
        let snapshot = Bytes::from(reader.rest());
        Ok(Self {
            world_index,
            correlation,
            snapshot,
        })
    }
}

/// Client → authority: loading finished for the identified transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ack {
    pub correlation: CorrelationId,
    pub client: ClientId,
}

impl Ack {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_slice(&self.correlation.to_bytes());
        buf.put_u64_le(self.client.0);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(payload);
        let correlation = reader.correlation()?;
        let client = ClientId(reader.u64()?);
        Ok(Self {
            correlation,
            client,
        })
    }
}

// ---------------------------------------------------------------------------
// Bounds-checked reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(GateError::Codec(format!(
                "payload truncated: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn f32(&mut self) -> Result<f32> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    fn correlation(&mut self) -> Result<CorrelationId> {
        self.need(16)?;
        let mut bytes = [0u8; 16];
        self.buf.copy_to_slice(&mut bytes);
        Ok(CorrelationId::from_bytes(bytes))
    }

    fn bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        self.need(n)?;
        let mut out = vec![0u8; n];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn rest(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.buf.remaining()];
        self.buf.copy_to_slice(&mut out);
        out
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
