//! Participant-side transition coordination.
//!
//! On a transition command the participant quarantines its local entities,
//! loads the target world, relocates the survivors, applies the incoming
//! snapshot according to the replication mode, replays messages buffered for
//! the newly constructed entities, and acknowledges back to the authority.
//!
//! A malformed or unknown command is skipped entirely; the participant
//! stays in its prior world, which a caller can detect later through
//! [`ParticipantCoordinator::has_world_mismatch`].

use crate::backend::{
    BufferedMessage, EntityStore, InboundBuffer, LoadTicket, Recipient, Transport, WorldLoader,
};
use crate::migrate::EntityMigrator;
use crate::protocol::{
    Ack, EntityRecord, MessageKind, Snapshot, TransitionCommand, TypeIdentity, CONTROL_CHANNEL,
};
use crate::registry::WorldRegistry;
use crate::types::{ClientId, CoordinatorConfig, CorrelationId, EntityId, ReplicationMode, TransitionState};
use log::{debug, info, warn};

/// Protocol phase of the participant coordinator.
///
/// `Quarantining`, `Applying`, and `Acking` are traversed within a single
/// call; `Loading` persists between the command and the load callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantPhase {
    Idle,
    Quarantining,
    Loading,
    Applying,
    Acking,
}

/// Result of applying one transition. The hosting layer feeds `replayed`
/// through its normal inbound-message path as non-fresh (already-ordered)
/// deliveries.
#[derive(Debug)]
pub struct ApplyEvents {
    /// Correlation id the acknowledgment was sent with. The sentinel value
    /// indicates the degenerate first-load path.
    pub acked: CorrelationId,
    /// Entities constructed or adopted from the snapshot, in record order.
    pub spawned: Vec<EntityId>,
    /// Buffered messages drained for the spawned entities, FIFO per entity.
    pub replayed: Vec<BufferedMessage>,
}

struct PendingCommand {
    world_index: u32,
    world_name: String,
    correlation: CorrelationId,
    records: Vec<EntityRecord>,
    /// Degenerate path: no prior world, nothing to migrate or apply.
    first_load: bool,
}

pub struct ParticipantCoordinator {
    config: CoordinatorConfig,
    client_id: ClientId,
    registry: WorldRegistry,
    state: TransitionState,
    migrator: EntityMigrator,
    phase: ParticipantPhase,
    pending_load: Option<LoadTicket>,
    pending: Option<PendingCommand>,
}

impl ParticipantCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: WorldRegistry,
        client_id: ClientId,
        boot_world: Option<u32>,
    ) -> Self {
        Self {
            config,
            client_id,
            registry,
            state: TransitionState::new(boot_world),
            migrator: EntityMigrator::new(),
            phase: ParticipantPhase::Idle,
            pending_load: None,
            pending: None,
        }
    }

    // -----------------------------------------------------------------------
    // Inbound command
    // -----------------------------------------------------------------------

    /// Handle a `WORLD_TRANSITION_COMMAND` from the authority.
    ///
    /// Validates the target world and the snapshot up front, then
    /// quarantines local entities and starts the asynchronous load. Invalid
    /// commands are logged and skipped, leaving the prior world active.
    pub fn on_transition_command(
        &mut self,
        command: TransitionCommand,
        store: &mut dyn EntityStore,
        loader: &mut dyn WorldLoader,
    ) {
        let world_name = match self.registry.resolve_name(command.world_index) {
            Ok(name) => name.to_string(),
            Err(e) => {
                warn!("ignoring transition command: {}", e);
                return;
            }
        };
        if self.state.in_progress {
            warn!(
                "transition command for '{}' while {} is in flight; ignoring",
                world_name, self.state.active_correlation
            );
            return;
        }

        let first_load = self.state.current_world.is_none();
        let records = if first_load {
            // Joining directly into the target world: nothing to reconcile.
            Vec::new()
        } else {
            match Snapshot::decode(
                &command.snapshot,
                self.config.replication_mode,
                self.config.variable_replication,
            ) {
                Ok(snapshot) => snapshot.entities,
                Err(e) => {
                    warn!("ignoring transition command with bad snapshot: {}", e);
                    return;
                }
            }
        };

        self.state.in_progress = true;
        self.state.pending_world = Some(world_name.clone());
        self.state.active_correlation = command.correlation;

        if !first_load {
            self.phase = ParticipantPhase::Quarantining;
            let live = store.all_entities();
            self.migrator.quarantine(store, &live);
        }

        self.phase = ParticipantPhase::Loading;
        let ticket = loader.load_world(&world_name);
        self.pending_load = Some(ticket);
        self.pending = Some(PendingCommand {
            world_index: command.world_index,
            world_name,
            correlation: command.correlation,
            records,
            first_load,
        });
        info!(
            "{}: transition {} accepted, loading world {}",
            self.client_id, command.correlation, command.world_index
        );
    }

    // -----------------------------------------------------------------------
    // Load completion → apply → ack
    // -----------------------------------------------------------------------

    /// Single-fire world-load callback: relocate, apply, acknowledge.
    pub fn on_world_loaded(
        &mut self,
        ticket: LoadTicket,
        store: &mut dyn EntityStore,
        buffer: &mut dyn InboundBuffer,
        transport: &mut dyn Transport,
    ) -> Option<ApplyEvents> {
        if self.pending_load != Some(ticket) {
            warn!("ignoring stray world-load completion {:?}", ticket);
            return None;
        }
        self.pending_load = None;
        let pending = self.pending.take()?;

        self.state.current_world = Some(pending.world_index);
        self.registry.set_active(&pending.world_name);

        if pending.first_load {
            // Skip quarantine/relocate/apply entirely and acknowledge with
            // the sentinel id: this client had no prior world.
            self.phase = ParticipantPhase::Acking;
            self.send_ack(CorrelationId::NONE, transport);
            self.finish();
            debug!("{}: first load of '{}' complete", self.client_id, pending.world_name);
            return Some(ApplyEvents {
                acked: CorrelationId::NONE,
                spawned: Vec::new(),
                replayed: Vec::new(),
            });
        }

        self.migrator.relocate(store, pending.world_index);
        self.phase = ParticipantPhase::Applying;

        let (spawned, replayed) = match self.config.replication_mode {
            ReplicationMode::PrefabResync => self.apply_prefab(&pending.records, store, buffer),
            ReplicationMode::SceneAuthoredResync => {
                self.apply_scene_authored(&pending.records, store, buffer)
            }
        };

        self.phase = ParticipantPhase::Acking;
        self.send_ack(pending.correlation, transport);
        self.finish();

        info!(
            "{}: transition {} applied: {} entities, {} buffered messages replayed",
            self.client_id,
            pending.correlation,
            spawned.len(),
            replayed.len()
        );
        Some(ApplyEvents {
            acked: pending.correlation,
            spawned,
            replayed,
        })
    }

    /// Destroy stale entities, then construct each snapshot record from its
    /// prefab hash and drain any messages buffered for it.
    fn apply_prefab(
        &self,
        records: &[EntityRecord],
        store: &mut dyn EntityStore,
        buffer: &mut dyn InboundBuffer,
    ) -> (Vec<EntityId>, Vec<BufferedMessage>) {
        store.destroy_non_persistent();

        let mut spawned = Vec::with_capacity(records.len());
        let mut replayed = Vec::new();
        for record in records {
            let entity = match store.spawn_locally(record) {
                Ok(entity) => entity,
                Err(e) => {
                    warn!("failed to spawn {}: {}", record.entity_id, e);
                    continue;
                }
            };
            self.attach(entity, record, store, buffer, &mut replayed);
            spawned.push(entity);
        }
        (spawned, replayed)
    }

    /// Associate records with entities already authored into the loaded
    /// world instead of constructing new objects.
    fn apply_scene_authored(
        &self,
        records: &[EntityRecord],
        store: &mut dyn EntityStore,
        buffer: &mut dyn InboundBuffer,
    ) -> (Vec<EntityId>, Vec<BufferedMessage>) {
        // One-time reconciliation pass over the freshly loaded world.
        store.rebuild_scene_index();

        let mut spawned = Vec::with_capacity(records.len());
        let mut replayed = Vec::new();
        for record in records {
            let TypeIdentity::Persistent { instance_id } = record.identity else {
                warn!("{} is not scene-authored; skipped", record.entity_id);
                continue;
            };
            let entity = match store.adopt_scene_entity(instance_id, record) {
                Ok(entity) => entity,
                Err(e) => {
                    warn!(
                        "no scene entity for persistent instance {}: {}",
                        instance_id, e
                    );
                    continue;
                }
            };
            self.attach(entity, record, store, buffer, &mut replayed);
            spawned.push(entity);
        }
        (spawned, replayed)
    }

    /// Shared tail of both apply paths: variable payload, then FIFO drain of
    /// the inbound buffer for the now-resolvable entity id.
    fn attach(
        &self,
        entity: EntityId,
        record: &EntityRecord,
        store: &mut dyn EntityStore,
        buffer: &mut dyn InboundBuffer,
        replayed: &mut Vec<BufferedMessage>,
    ) {
        if self.config.variable_replication {
            if let Some(payload) = &record.variables {
                store.consume_variable_payload(entity, payload);
            }
        }
        replayed.extend(buffer.drain(record.entity_id));
    }

    fn send_ack(&self, correlation: CorrelationId, transport: &mut dyn Transport) {
        let ack = Ack {
            correlation,
            client: self.client_id,
        };
        transport.send(
            Recipient::Authority,
            MessageKind::TransitionAck,
            CONTROL_CHANNEL,
            ack.encode(),
        );
    }

    fn finish(&mut self) {
        self.state.in_progress = false;
        self.state.pending_world = None;
        self.migrator.reset();
        self.phase = ParticipantPhase::Idle;
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// True iff this participant's active world differs from the world
    /// `world_index` resolves to. An unregistered index is a mismatch by
    /// definition (and a catalog defect worth logging).
    pub fn has_world_mismatch(&self, world_index: u32) -> bool {
        match self.registry.resolve_name(world_index) {
            Ok(name) => self.registry.active_name() != Some(name),
            Err(e) => {
                warn!("world mismatch check: {}", e);
                true
            }
        }
    }

    pub fn phase(&self) -> ParticipantPhase {
        self.phase
    }

    pub fn state(&self) -> &TransitionState {
        &self.state
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn registry(&self) -> &WorldRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut WorldRegistry {
        &mut self.registry
    }
}
