//! Authority-side transition coordination.
//!
//! The authority quarantines live entities, kicks off the world load, and on
//! load completion broadcasts a visibility-filtered snapshot to every remote
//! client, then marks its own co-located client done without a network
//! round-trip. Completion of the authority's *local* state (broadcast
//! finished, `in_progress` cleared) and completion of the *multi-client
//! barrier* (every expected client acknowledged) are distinct events; the
//! latter is only ever observed through the progress tracker.
//!
//! All methods run on one logical execution context; the only suspension
//! point is the asynchronous world load, whose completion the host delivers
//! through [`AuthorityCoordinator::on_world_loaded`] exactly once.

use crate::backend::{
    ConnectionRegistry, EntityDescriptor, EntityStore, LoadTicket, Recipient, Transport,
    WorldLoader,
};
use crate::error::{GateError, Result};
use crate::migrate::EntityMigrator;
use crate::progress::TransitionTracker;
use crate::protocol::{
    EntityRecord, MessageKind, Snapshot, TransitionCommand, TypeIdentity, CONTROL_CHANNEL,
};
use crate::registry::WorldRegistry;
use crate::types::{ClientId, CoordinatorConfig, CorrelationId, EntityId, ReplicationMode, TransitionState};
use log::{debug, info, warn};
use std::collections::HashSet;

/// Protocol phase of the authority coordinator.
///
/// `Quarantining` and `Broadcasting` are traversed within a single call;
/// `Loading` persists between the transition request and the load callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityPhase {
    Idle,
    Quarantining,
    Loading,
    Broadcasting,
    AwaitingAcks,
}

/// Returned by a successful transition request; resolves to the load-started
/// notification. Consumers may watch the load ticket for progress (e.g. UI).
#[derive(Debug, Clone)]
pub struct TransitionTicket {
    pub correlation: CorrelationId,
    pub world: String,
    pub load: LoadTicket,
}

/// Events produced by one broadcast pass. The hosting layer publishes or
/// inspects them; the coordinator does not call back into it.
#[derive(Debug, Clone)]
pub struct BroadcastEvents {
    pub correlation: CorrelationId,
    pub world_index: u32,
    /// Transition commands sent to remote clients.
    pub commands_sent: usize,
    /// Whether a co-located local client was marked done directly.
    pub local_client_marked: bool,
}

pub struct AuthorityCoordinator {
    config: CoordinatorConfig,
    holds_authority: bool,
    registry: WorldRegistry,
    state: TransitionState,
    tracker: TransitionTracker,
    migrator: EntityMigrator,
    phase: AuthorityPhase,
    pending_load: Option<LoadTicket>,
    /// Entities present before the current transition began; everything not
    /// in this set is "fresh" and belongs in the snapshot.
    pre_transition: HashSet<EntityId>,
}

impl AuthorityCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        registry: WorldRegistry,
        boot_world: Option<u32>,
        holds_authority: bool,
    ) -> Self {
        Self {
            config,
            holds_authority,
            registry,
            state: TransitionState::new(boot_world),
            tracker: TransitionTracker::new(),
            migrator: EntityMigrator::new(),
            phase: AuthorityPhase::Idle,
            pending_load: None,
            pre_transition: HashSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Transition request
    // -----------------------------------------------------------------------

    /// Start a transition to `world_name`.
    ///
    /// Quarantines live entities, registers a fresh progress entry, and
    /// issues the asynchronous world load. Returns immediately; the
    /// broadcast happens when the host delivers the load completion.
    pub fn request_transition(
        &mut self,
        world_name: &str,
        store: &mut dyn EntityStore,
        loader: &mut dyn WorldLoader,
    ) -> Result<TransitionTicket> {
        if !self.holds_authority {
            return Err(GateError::NotAuthority);
        }
        if self.state.in_progress {
            warn!(
                "transition to '{}' rejected: {} already in progress",
                world_name, self.state.active_correlation
            );
            return Err(GateError::AlreadyInProgress(self.state.active_correlation));
        }
        self.registry.resolve_index(world_name)?;

        self.state.in_progress = true;
        self.state.pending_world = Some(world_name.to_string());
        self.phase = AuthorityPhase::Quarantining;

        let live = store.all_entities();
        self.pre_transition = live.iter().copied().collect();
        self.migrator.quarantine(store, &live);

        let correlation = CorrelationId::generate(world_name);
        if let Err(e) = self.tracker.begin(correlation) {
            // Abort only this request; leave the coordinator usable.
            self.state.in_progress = false;
            self.state.pending_world = None;
            self.migrator.reset();
            self.pre_transition.clear();
            self.phase = AuthorityPhase::Idle;
            return Err(e);
        }
        self.state.active_correlation = correlation;

        self.phase = AuthorityPhase::Loading;
        let load = loader.load_world(world_name);
        self.pending_load = Some(load);

        info!(
            "transition {} started: '{}', {} entities quarantined",
            correlation,
            world_name,
            live.len()
        );
        Ok(TransitionTicket {
            correlation,
            world: world_name.to_string(),
            load,
        })
    }

    // -----------------------------------------------------------------------
    // Load completion → broadcast
    // -----------------------------------------------------------------------

    /// Single-fire world-load callback.
    ///
    /// Relocates the quarantined entities into the loaded world, then sends
    /// each remote client its visible subset of freshly constructed entities
    /// in deterministic (entity-id) order, clears the client's done-loading
    /// flag before the send, and finally marks the co-located local client
    /// done. Clears `in_progress`: the authority's own transition is finished
    /// even while remote acknowledgments are still outstanding.
    pub fn on_world_loaded(
        &mut self,
        ticket: LoadTicket,
        store: &mut dyn EntityStore,
        connections: &mut dyn ConnectionRegistry,
        transport: &mut dyn Transport,
    ) -> Option<BroadcastEvents> {
        if self.pending_load != Some(ticket) {
            warn!("ignoring stray world-load completion {:?}", ticket);
            return None;
        }
        self.pending_load = None;

        let Some(world_name) = self.state.pending_world.take() else {
            warn!("world-load completion with no pending world");
            return None;
        };
        let world_index = match self.registry.resolve_index(&world_name) {
            Ok(index) => index,
            Err(e) => {
                // Validated at request time; only a concurrent catalog edit gets here.
                warn!("loaded world '{}' no longer resolves: {}", world_name, e);
                self.finish_transition();
                return None;
            }
        };

        self.migrator.relocate(store, world_index);
        self.state.current_world = Some(world_index);
        self.registry.set_active(&world_name);
        self.phase = AuthorityPhase::Broadcasting;

        // Fresh entities only: anything constructed during or after
        // quarantine. Sorted so payload layout is deterministic per send.
        let mut fresh: Vec<EntityId> = store
            .all_entities()
            .into_iter()
            .filter(|e| !self.pre_transition.contains(e))
            .collect();
        fresh.sort();

        let correlation = self.state.active_correlation;
        let local = connections.local_client_id();
        let mut commands_sent = 0;

        for client in connections.connected_clients() {
            if Some(client) == local {
                continue;
            }
            let snapshot = self.snapshot_for(client, &fresh, store, connections);
            let payload = match snapshot
                .encode(self.config.replication_mode, self.config.variable_replication)
            {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("snapshot for {} failed to encode: {}", client, e);
                    continue;
                }
            };
            let command = TransitionCommand {
                world_index,
                correlation,
                snapshot: payload,
            };
            connections.set_done_loading(client, false);
            transport.send(
                Recipient::Client(client),
                MessageKind::WorldTransitionCommand,
                CONTROL_CHANNEL,
                command.encode(),
            );
            commands_sent += 1;
        }

        self.phase = AuthorityPhase::AwaitingAcks;

        // The co-located host client never round-trips a network message to
        // itself. Dedicated deployments have no local client and skip this.
        let local_client_marked = match local {
            Some(client) => {
                self.tracker.mark_client_done(correlation, client);
                true
            }
            None => false,
        };

        self.finish_transition();
        info!(
            "transition {} broadcast: world '{}' ({}), {} commands sent",
            correlation, world_name, world_index, commands_sent
        );
        Some(BroadcastEvents {
            correlation,
            world_index,
            commands_sent,
            local_client_marked,
        })
    }

    fn finish_transition(&mut self) {
        self.state.in_progress = false;
        self.state.pending_world = None;
        self.migrator.reset();
        self.pre_transition.clear();
        self.phase = AuthorityPhase::Idle;
    }

    fn snapshot_for(
        &self,
        client: ClientId,
        fresh: &[EntityId],
        store: &dyn EntityStore,
        connections: &dyn ConnectionRegistry,
    ) -> Snapshot {
        let mut entities = Vec::new();
        for &entity in fresh {
            if !connections.observers_of(entity).contains(&client) {
                continue;
            }
            let Some(descriptor) = store.describe(entity) else {
                continue;
            };
            if let Some(record) = self.build_record(descriptor, store) {
                entities.push(record);
            }
        }
        Snapshot { entities }
    }

    fn build_record(
        &self,
        descriptor: EntityDescriptor,
        store: &dyn EntityStore,
    ) -> Option<EntityRecord> {
        let identity = match self.config.replication_mode {
            ReplicationMode::PrefabResync => TypeIdentity::Fresh {
                prefab_hash: descriptor.prefab_hash,
                position: descriptor.position,
                rotation: descriptor.rotation,
            },
            ReplicationMode::SceneAuthoredResync => match descriptor.persistent_instance_id {
                Some(instance_id) => TypeIdentity::Persistent { instance_id },
                None => {
                    warn!(
                        "{} has no persistent instance id under scene-authored resync; omitted",
                        descriptor.entity_id
                    );
                    return None;
                }
            },
        };
        let variables = if self.config.variable_replication {
            store.variable_payload(descriptor.entity_id)
        } else {
            None
        };
        Some(EntityRecord {
            entity_id: descriptor.entity_id,
            owner: descriptor.owner,
            is_player: descriptor.is_player,
            parent: descriptor.parent,
            identity,
            variables,
        })
    }

    // -----------------------------------------------------------------------
    // Acknowledgments & disconnects
    // -----------------------------------------------------------------------

    /// Record a client's completion acknowledgment.
    ///
    /// The sentinel correlation id means the client loaded its boot world;
    /// there is no tracked transition to reconcile, so it is ignored.
    pub fn on_client_ack(&mut self, client: ClientId, correlation: CorrelationId) {
        if correlation.is_none() {
            debug!("{} loaded its boot world; no reconciliation needed", client);
            return;
        }
        self.tracker.mark_client_done(correlation, client);
    }

    /// Client disconnect: drop it from every tracked transition's barrier so
    /// a mid-transition disconnect can never deadlock completion.
    pub fn on_client_disconnected(&mut self, client: ClientId) {
        self.tracker.remove_client(client);
    }

    /// True iff every currently connected client has acknowledged the active
    /// transition.
    pub fn barrier_complete(&self, connections: &dyn ConnectionRegistry) -> bool {
        self.tracker.is_complete(
            self.state.active_correlation,
            &connections.connected_clients(),
        )
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn phase(&self) -> AuthorityPhase {
        self.phase
    }

    pub fn state(&self) -> &TransitionState {
        &self.state
    }

    pub fn tracker(&self) -> &TransitionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut TransitionTracker {
        &mut self.tracker
    }

    pub fn registry(&self) -> &WorldRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut WorldRegistry {
        &mut self.registry
    }
}
