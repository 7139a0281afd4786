//! Collaborator interfaces the coordinators drive but do not own.
//!
//! The transition protocol is deliberately engine-agnostic: world loading,
//! entity storage, transport, connection bookkeeping, and inbound message
//! buffering all live behind these traits. `crate::loopback` provides
//! in-memory implementations for tests and the demo server.

use crate::error::Result;
use crate::protocol::{ChannelId, EntityRecord, MessageKind};
use crate::types::{ClientId, EntityId, EulerRot, Vec3};
use bytes::Bytes;
use std::collections::HashSet;
use std::time::Instant;

// ---------------------------------------------------------------------------
// World loading
// ---------------------------------------------------------------------------

/// Handle for one asynchronous world load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTicket(pub u64);

/// Asynchronous world/content loader.
///
/// Each `load_world` call fires exactly one completion, which the host
/// delivers by invoking the coordinator's `on_world_loaded` with the same
/// ticket, on the same logical execution context as all other coordinator
/// work. No partial-progress contract is required.
pub trait WorldLoader {
    fn load_world(&mut self, name: &str) -> LoadTicket;
}

// ---------------------------------------------------------------------------
// Entity store
// ---------------------------------------------------------------------------

/// Snapshot-facing view of one live entity, produced by the store for the
/// authority's serializer.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub entity_id: EntityId,
    pub owner: ClientId,
    pub is_player: bool,
    /// Present only when the entity preserves its parent across replication.
    pub parent: Option<EntityId>,
    pub prefab_hash: u64,
    /// Stable identity for scene-authored entities.
    pub persistent_instance_id: Option<u64>,
    pub position: Vec3,
    pub rotation: EulerRot,
}

/// The authoritative entity spawn/destroy registry.
pub trait EntityStore {
    fn all_entities(&self) -> Vec<EntityId>;

    fn describe(&self, entity: EntityId) -> Option<EntityDescriptor>;

    fn parent_of(&self, entity: EntityId) -> Option<EntityId>;

    /// Detach an entity from its hierarchical parent. Mandatory before any
    /// cross-world relocation; relocating a still-parented child is
    /// undefined.
    fn detach_parent(&mut self, entity: EntityId);

    /// Relocate an entity to the transition-safe holding area, outside any
    /// world's destruction scope. Identity and attached state are preserved.
    fn move_to_holding(&mut self, entity: EntityId);

    /// Relocate an entity into the given world.
    fn move_to_world(&mut self, entity: EntityId, world_index: u32);

    /// Construct a fresh local entity from a snapshot record (prefab-resync
    /// path). The record's `identity` must be [`TypeIdentity::Fresh`].
    ///
    /// [`TypeIdentity::Fresh`]: crate::protocol::TypeIdentity::Fresh
    fn spawn_locally(&mut self, record: &EntityRecord) -> Result<EntityId>;

    /// Destroy every previously spawned non-persistent entity.
    fn destroy_non_persistent(&mut self);

    /// One-time sweep associating entities present in a freshly loaded world
    /// with their persistent instance identifiers.
    fn rebuild_scene_index(&mut self);

    /// Bind a snapshot record to the scene-authored entity carrying
    /// `instance_id`, assigning its network id, owner, and player flag
    /// (scene-authored-resync path). Fails if no such entity exists.
    fn adopt_scene_entity(&mut self, instance_id: u64, record: &EntityRecord) -> Result<EntityId>;

    /// Outbound variable-replication payload for an entity, if it has one.
    fn variable_payload(&self, entity: EntityId) -> Option<Vec<u8>>;

    /// Apply an inbound variable-replication payload to an entity.
    fn consume_variable_payload(&mut self, entity: EntityId, payload: &[u8]);
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Client(ClientId),
    Authority,
}

/// Low-level message transport. Delivery failures are the transport's
/// problem; a failed control send must not abort the coordinator, so the
/// signature is infallible and implementations log their own errors.
pub trait Transport {
    fn send(&mut self, to: Recipient, kind: MessageKind, channel: ChannelId, payload: Bytes);
}

// ---------------------------------------------------------------------------
// Connection registry
// ---------------------------------------------------------------------------

/// Client identity, connection lifecycle, and per-entity visibility.
pub trait ConnectionRegistry {
    fn connected_clients(&self) -> Vec<ClientId>;

    /// The authority's co-located client, when hosting; `None` on a
    /// dedicated deployment.
    fn local_client_id(&self) -> Option<ClientId>;

    /// Clients entitled to receive this entity's state.
    fn observers_of(&self, entity: EntityId) -> HashSet<ClientId>;

    fn set_done_loading(&mut self, client: ClientId, done: bool);

    fn is_done_loading(&self, client: ClientId) -> bool;
}

// ---------------------------------------------------------------------------
// Inbound message buffer
// ---------------------------------------------------------------------------

/// A message that arrived for an entity identifier that does not yet resolve
/// locally.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub target: EntityId,
    pub sender: ClientId,
    pub channel: ChannelId,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

/// Holds messages addressed to not-yet-existing entities. The participant
/// coordinator drains each queue once the entity is constructed and replays
/// the messages in FIFO receipt order through the normal inbound path.
pub trait InboundBuffer {
    /// Remove and return every buffered message for `entity`, oldest first.
    /// Empties atomically; a second drain returns nothing.
    fn drain(&mut self, entity: EntityId) -> Vec<BufferedMessage>;
}
