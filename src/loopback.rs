//! In-memory collaborators and a single-process transition fabric.
//!
//! [`LoopbackHarness`] wires one authority to any number of participants
//! through plain queues, with every backend trait implemented in memory.
//! The integration tests and the demo server both run on it; a real
//! deployment swaps these for engine-backed implementations.

use crate::authority::{AuthorityCoordinator, BroadcastEvents, TransitionTicket};
use crate::backend::{
    BufferedMessage, ConnectionRegistry, EntityDescriptor, EntityStore, InboundBuffer, LoadTicket,
    Recipient, Transport, WorldLoader,
};
use crate::error::{GateError, Result};
use crate::participant::{ApplyEvents, ParticipantCoordinator};
use crate::protocol::{Ack, ChannelId, EntityRecord, MessageKind, TransitionCommand, TypeIdentity};
use crate::registry::WorldRegistry;
use crate::types::{ClientId, CoordinatorConfig, EntityId, EulerRot, Vec3};
use bytes::Bytes;
use log::warn;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

// ---------------------------------------------------------------------------
// World loader
// ---------------------------------------------------------------------------

/// Loader whose completions are delivered manually, so tests control exactly
/// when the "asynchronous" load finishes.
#[derive(Debug, Default)]
pub struct MemoryWorldLoader {
    next_ticket: u64,
    pending: VecDeque<(LoadTicket, String)>,
}

impl MemoryWorldLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest outstanding load; the caller forwards it to the
    /// owning coordinator's `on_world_loaded`.
    pub fn complete_next(&mut self) -> Option<(LoadTicket, String)> {
        self.pending.pop_front()
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

impl WorldLoader for MemoryWorldLoader {
    fn load_world(&mut self, name: &str) -> LoadTicket {
        self.next_ticket += 1;
        let ticket = LoadTicket(self.next_ticket);
        self.pending.push_back((ticket, name.to_string()));
        ticket
    }
}

// ---------------------------------------------------------------------------
// Entity store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityLocation {
    World(u32),
    Holding,
}

#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub id: EntityId,
    pub owner: ClientId,
    pub is_player: bool,
    pub parent: Option<EntityId>,
    pub prefab_hash: u64,
    pub persistent_instance_id: Option<u64>,
    /// Survives `destroy_non_persistent`.
    pub persistent: bool,
    pub position: Vec3,
    pub rotation: EulerRot,
    pub location: EntityLocation,
    pub outbound_variables: Option<Vec<u8>>,
    pub consumed_variables: Vec<Vec<u8>>,
}

impl StoredEntity {
    pub fn new(id: EntityId, owner: ClientId, prefab_hash: u64) -> Self {
        Self {
            id,
            owner,
            is_player: false,
            parent: None,
            prefab_hash,
            persistent_instance_id: None,
            persistent: false,
            position: Vec3::zero(),
            rotation: EulerRot::zero(),
            location: EntityLocation::World(0),
            outbound_variables: None,
            consumed_variables: Vec::new(),
        }
    }
}

/// BTreeMap-backed store so iteration order is deterministic.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: BTreeMap<EntityId, StoredEntity>,
    scene_index: HashMap<u64, EntityId>,
    /// World index newly spawned entities land in.
    pub spawn_world: u32,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: StoredEntity) {
        self.entities.insert(entity.id, entity);
    }

    pub fn get(&self, id: EntityId) -> Option<&StoredEntity> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn location_of(&self, id: EntityId) -> Option<EntityLocation> {
        self.entities.get(&id).map(|e| e.location)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityStore for MemoryEntityStore {
    fn all_entities(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    fn describe(&self, entity: EntityId) -> Option<EntityDescriptor> {
        self.entities.get(&entity).map(|e| EntityDescriptor {
            entity_id: e.id,
            owner: e.owner,
            is_player: e.is_player,
            parent: e.parent,
            prefab_hash: e.prefab_hash,
            persistent_instance_id: e.persistent_instance_id,
            position: e.position,
            rotation: e.rotation,
        })
    }

    fn parent_of(&self, entity: EntityId) -> Option<EntityId> {
        self.entities.get(&entity).and_then(|e| e.parent)
    }

    fn detach_parent(&mut self, entity: EntityId) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.parent = None;
        }
    }

    fn move_to_holding(&mut self, entity: EntityId) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.location = EntityLocation::Holding;
        }
    }

    fn move_to_world(&mut self, entity: EntityId, world_index: u32) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.location = EntityLocation::World(world_index);
        }
    }

    fn spawn_locally(&mut self, record: &EntityRecord) -> Result<EntityId> {
        let TypeIdentity::Fresh {
            prefab_hash,
            position,
            rotation,
        } = record.identity
        else {
            return Err(GateError::Store(format!(
                "{} is not prefab-constructible",
                record.entity_id
            )));
        };
        let entity = StoredEntity {
            id: record.entity_id,
            owner: record.owner,
            is_player: record.is_player,
            parent: record.parent,
            prefab_hash,
            persistent_instance_id: None,
            persistent: false,
            position,
            rotation,
            location: EntityLocation::World(self.spawn_world),
            outbound_variables: None,
            consumed_variables: Vec::new(),
        };
        self.entities.insert(record.entity_id, entity);
        Ok(record.entity_id)
    }

    fn destroy_non_persistent(&mut self) {
        self.entities.retain(|_, e| e.persistent);
    }

    fn rebuild_scene_index(&mut self) {
        self.scene_index = self
            .entities
            .values()
            .filter_map(|e| e.persistent_instance_id.map(|pid| (pid, e.id)))
            .collect();
    }

    fn adopt_scene_entity(&mut self, instance_id: u64, record: &EntityRecord) -> Result<EntityId> {
        let local = self
            .scene_index
            .get(&instance_id)
            .copied()
            .ok_or_else(|| GateError::Store(format!("no scene entity {}", instance_id)))?;
        let mut entity = self
            .entities
            .remove(&local)
            .ok_or_else(|| GateError::Store(format!("scene index points at missing {}", local)))?;
        entity.id = record.entity_id;
        entity.owner = record.owner;
        entity.is_player = record.is_player;
        entity.parent = record.parent;
        self.entities.insert(record.entity_id, entity);
        self.scene_index.insert(instance_id, record.entity_id);
        Ok(record.entity_id)
    }

    fn variable_payload(&self, entity: EntityId) -> Option<Vec<u8>> {
        self.entities
            .get(&entity)
            .and_then(|e| e.outbound_variables.clone())
    }

    fn consume_variable_payload(&mut self, entity: EntityId, payload: &[u8]) {
        if let Some(e) = self.entities.get_mut(&entity) {
            e.consumed_variables.push(payload.to_vec());
        }
    }
}

// ---------------------------------------------------------------------------
// Connection registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryConnectionRegistry {
    clients: Vec<ClientId>,
    local: Option<ClientId>,
    observers: HashMap<EntityId, HashSet<ClientId>>,
    done_loading: HashMap<ClientId, bool>,
}

impl MemoryConnectionRegistry {
    pub fn new(clients: Vec<ClientId>, local: Option<ClientId>) -> Self {
        Self {
            clients,
            local,
            observers: HashMap::new(),
            done_loading: HashMap::new(),
        }
    }

    pub fn connect(&mut self, client: ClientId) {
        if !self.clients.contains(&client) {
            self.clients.push(client);
        }
    }

    pub fn disconnect(&mut self, client: ClientId) {
        self.clients.retain(|c| *c != client);
        self.done_loading.remove(&client);
    }

    /// Restrict an entity's observer set. Entities without an explicit entry
    /// are observed by every connected client.
    pub fn set_observers(&mut self, entity: EntityId, observers: HashSet<ClientId>) {
        self.observers.insert(entity, observers);
    }
}

impl ConnectionRegistry for MemoryConnectionRegistry {
    fn connected_clients(&self) -> Vec<ClientId> {
        self.clients.clone()
    }

    fn local_client_id(&self) -> Option<ClientId> {
        self.local
    }

    fn observers_of(&self, entity: EntityId) -> HashSet<ClientId> {
        match self.observers.get(&entity) {
            Some(set) => set.clone(),
            None => self.clients.iter().copied().collect(),
        }
    }

    fn set_done_loading(&mut self, client: ClientId, done: bool) {
        self.done_loading.insert(client, done);
    }

    fn is_done_loading(&self, client: ClientId) -> bool {
        self.done_loading.get(&client).copied().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Inbound buffer & transport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryInboundBuffer {
    queues: HashMap<EntityId, VecDeque<BufferedMessage>>,
}

impl MemoryInboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: BufferedMessage) {
        self.queues
            .entry(message.target)
            .or_default()
            .push_back(message);
    }

    pub fn queued(&self, entity: EntityId) -> usize {
        self.queues.get(&entity).map_or(0, VecDeque::len)
    }
}

impl InboundBuffer for MemoryInboundBuffer {
    fn drain(&mut self, entity: EntityId) -> Vec<BufferedMessage> {
        self.queues
            .remove(&entity)
            .map(Vec::from)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub to: Recipient,
    pub kind: MessageKind,
    pub channel: ChannelId,
    pub payload: Bytes,
}

/// Transport that parks every send in an outbox for the harness to pump.
#[derive(Debug, Default)]
pub struct QueueTransport {
    pub outbox: VecDeque<Envelope>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }
}

impl Transport for QueueTransport {
    fn send(&mut self, to: Recipient, kind: MessageKind, channel: ChannelId, payload: Bytes) {
        self.outbox.push_back(Envelope {
            to,
            kind,
            channel,
            payload,
        });
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// One participant plus its private backends.
pub struct ParticipantNode {
    pub coordinator: ParticipantCoordinator,
    pub store: MemoryEntityStore,
    pub loader: MemoryWorldLoader,
    pub buffer: MemoryInboundBuffer,
    pub transport: QueueTransport,
    /// Every apply result this node produced, oldest first.
    pub events: Vec<ApplyEvents>,
}

/// Single-process fabric: one authority, N participants, queue transport.
pub struct LoopbackHarness {
    pub authority: AuthorityCoordinator,
    pub store: MemoryEntityStore,
    pub loader: MemoryWorldLoader,
    pub connections: MemoryConnectionRegistry,
    pub transport: QueueTransport,
    pub participants: Vec<ParticipantNode>,
    pub broadcasts: Vec<BroadcastEvents>,
}

impl LoopbackHarness {
    /// Build a cluster where every node shares an identical world catalog
    /// and starts in `boot_world` (or with no prior world when `None`, which
    /// exercises the first-load path).
    pub fn new(
        catalog: &[(&str, u32)],
        remote_clients: &[ClientId],
        local_client: Option<ClientId>,
        boot_world: Option<u32>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        let template = WorldRegistry::with_catalog(catalog.iter().copied(), false)?;
        let boot_name = match boot_world {
            Some(index) => Some(template.resolve_name(index)?.to_string()),
            None => None,
        };
        let make_registry = || {
            let mut registry = template.clone();
            if let Some(name) = &boot_name {
                registry.set_active(name);
            }
            registry
        };

        let mut clients: Vec<ClientId> = remote_clients.to_vec();
        if let Some(local) = local_client {
            if !clients.contains(&local) {
                clients.push(local);
            }
        }

        let authority = AuthorityCoordinator::new(config.clone(), make_registry(), boot_world, true);
        let participants = remote_clients
            .iter()
            .map(|&client| ParticipantNode {
                coordinator: ParticipantCoordinator::new(
                    config.clone(),
                    make_registry(),
                    client,
                    boot_world,
                ),
                store: MemoryEntityStore::new(),
                loader: MemoryWorldLoader::new(),
                buffer: MemoryInboundBuffer::new(),
                transport: QueueTransport::new(),
                events: Vec::new(),
            })
            .collect();

        Ok(Self {
            authority,
            store: MemoryEntityStore::new(),
            loader: MemoryWorldLoader::new(),
            connections: MemoryConnectionRegistry::new(clients, local_client),
            transport: QueueTransport::new(),
            participants,
            broadcasts: Vec::new(),
        })
    }

    pub fn request_transition(&mut self, world: &str) -> Result<TransitionTicket> {
        self.authority
            .request_transition(world, &mut self.store, &mut self.loader)
    }

    pub fn participant(&mut self, client: ClientId) -> Option<&mut ParticipantNode> {
        self.participants
            .iter_mut()
            .find(|p| p.coordinator.client_id() == client)
    }

    /// Disconnect a client: connection registry plus barrier cleanup.
    pub fn disconnect(&mut self, client: ClientId) {
        self.connections.disconnect(client);
        self.authority.on_client_disconnected(client);
    }

    /// Pump one round: authority load completions, outbound command
    /// delivery, participant load completions, acknowledgment delivery.
    pub fn step(&mut self) {
        // Authority-side load completions.
        while let Some((ticket, _)) = self.loader.complete_next() {
            if let Some(events) = self.authority.on_world_loaded(
                ticket,
                &mut self.store,
                &mut self.connections,
                &mut self.transport,
            ) {
                self.broadcasts.push(events);
            }
        }

        // Authority → participants.
        for envelope in self.transport.take() {
            let Recipient::Client(client) = envelope.to else {
                warn!("authority sent {:?} to itself; dropped", envelope.kind);
                continue;
            };
            let Some(node) = self.participants.iter_mut().find(|p| p.coordinator.client_id() == client)
            else {
                warn!("no participant node for {}", client);
                continue;
            };
            match envelope.kind {
                MessageKind::WorldTransitionCommand => match TransitionCommand::decode(&envelope.payload) {
                    Ok(command) => {
                        node.coordinator
                            .on_transition_command(command, &mut node.store, &mut node.loader)
                    }
                    Err(e) => warn!("bad transition command for {}: {}", client, e),
                },
                MessageKind::TransitionAck => warn!("unexpected ack addressed to {}", client),
            }
        }

        // Participant-side load completions.
        for node in &mut self.participants {
            while let Some((ticket, _)) = node.loader.complete_next() {
                if let Some(events) = node.coordinator.on_world_loaded(
                    ticket,
                    &mut node.store,
                    &mut node.buffer,
                    &mut node.transport,
                ) {
                    node.events.push(events);
                }
            }
        }

        // Participants → authority.
        let mut acks = Vec::new();
        for node in &mut self.participants {
            for envelope in node.transport.take() {
                match envelope.kind {
                    MessageKind::TransitionAck => match Ack::decode(&envelope.payload) {
                        Ok(ack) => acks.push(ack),
                        Err(e) => warn!("bad ack: {}", e),
                    },
                    MessageKind::WorldTransitionCommand => {
                        warn!("participant emitted a transition command; dropped")
                    }
                }
            }
        }
        for ack in acks {
            self.connections.set_done_loading(ack.client, true);
            self.authority.on_client_ack(ack.client, ack.correlation);
        }
    }

    /// Step until the acknowledgment barrier for the active transition is
    /// satisfied. Returns false if it is not satisfied within `max_steps`.
    pub fn run_until_complete(&mut self, max_steps: usize) -> bool {
        for _ in 0..max_steps {
            if self.authority.barrier_complete(&self.connections) {
                return true;
            }
            self.step();
        }
        self.authority.barrier_complete(&self.connections)
    }
}
