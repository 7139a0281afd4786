//! End-to-end transition scenarios over the loopback fabric

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Instant;
    use worldgate::loopback::{
        EntityLocation, LoopbackHarness, MemoryEntityStore, StoredEntity,
    };
    use worldgate::{
        BufferedMessage, ClientId, ConnectionRegistry, CoordinatorConfig, CorrelationId,
        EntityId, EntityMigrator, EntityStore, GateError, InboundBuffer, ReplicationMode,
        CONTROL_CHANNEL,
    };

    const LOCAL: ClientId = ClientId(0);
    const ALICE: ClientId = ClientId(1);
    const BOB: ClientId = ClientId(2);

    const CATALOG: &[(&str, u32)] = &[("Lobby", 0), ("Arena", 1)];

    fn harness(config: CoordinatorConfig) -> LoopbackHarness {
        LoopbackHarness::new(CATALOG, &[ALICE, BOB], Some(LOCAL), Some(0), config)
            .expect("harness builds")
    }

    fn player(id: u64, owner: ClientId) -> StoredEntity {
        let mut entity = StoredEntity::new(EntityId(id), owner, 0xBEEF);
        entity.is_player = true;
        entity
    }

    // -----------------------------------------------------------------------
    // The canonical scenario: Lobby → Arena, two clients
    // -----------------------------------------------------------------------

    #[test]
    fn lobby_to_arena_reaches_the_barrier() {
        let mut h = harness(CoordinatorConfig::default());
        let ticket = h.request_transition("Arena").unwrap();

        // Entities constructed while the new world loads, i.e. the fresh set.
        h.store.insert(player(100, ALICE));
        h.store.insert(player(101, BOB));

        assert!(h.run_until_complete(8));

        // Both clients received the command for world index 1 with the same
        // correlation id, applied it, and acked.
        for node in &h.participants {
            assert_eq!(node.events.len(), 1);
            assert_eq!(node.events[0].acked, ticket.correlation);
            assert_eq!(node.events[0].spawned.len(), 2);
            assert_eq!(node.coordinator.state().current_world, Some(1));
            assert!(!node.coordinator.has_world_mismatch(1));
            assert!(node.store.contains(EntityId(100)));
            assert!(node.store.contains(EntityId(101)));
        }
        assert!(h
            .authority
            .tracker()
            .is_complete(ticket.correlation, &[LOCAL, ALICE, BOB]));
        assert!(!h.authority.state().in_progress);
        assert_eq!(h.authority.state().current_world, Some(1));
    }

    #[test]
    fn variable_payloads_travel_with_the_snapshot() {
        let mut h = harness(CoordinatorConfig::default());
        h.request_transition("Arena").unwrap();

        let mut entity = player(100, ALICE);
        entity.outbound_variables = Some(b"hp=73".to_vec());
        h.store.insert(entity);

        assert!(h.run_until_complete(8));
        let node = h.participant(ALICE).unwrap();
        let applied = node.store.get(EntityId(100)).unwrap();
        assert_eq!(applied.consumed_variables, vec![b"hp=73".to_vec()]);
    }

    // -----------------------------------------------------------------------
    // Single-flight
    // -----------------------------------------------------------------------

    #[test]
    fn second_request_while_in_flight_is_rejected() {
        let mut h = harness(CoordinatorConfig::default());
        let ticket = h.request_transition("Arena").unwrap();

        let err = h.request_transition("Lobby").unwrap_err();
        assert!(matches!(err, GateError::AlreadyInProgress(_)));

        // No second progress entry, original correlation id unchanged.
        assert_eq!(h.authority.tracker().tracked(), 1);
        assert_eq!(h.authority.state().active_correlation, ticket.correlation);
        assert!(h.authority.state().in_progress);
    }

    #[test]
    fn coordinator_is_reusable_after_a_completed_transition() {
        let mut h = harness(CoordinatorConfig::default());
        let first = h.request_transition("Arena").unwrap();
        assert!(h.run_until_complete(8));

        let second = h.request_transition("Lobby").unwrap();
        assert_ne!(first.correlation, second.correlation);
        assert!(h.run_until_complete(8));
        assert_eq!(h.authority.state().current_world, Some(0));
        assert_eq!(h.authority.tracker().tracked(), 2);
    }

    #[test]
    fn unknown_world_request_leaves_no_trace() {
        let mut h = harness(CoordinatorConfig::default());
        assert!(matches!(
            h.request_transition("Nether"),
            Err(GateError::UnknownWorld(_))
        ));
        assert!(!h.authority.state().in_progress);
        assert_eq!(h.authority.tracker().tracked(), 0);
    }

    // -----------------------------------------------------------------------
    // Broadcast bookkeeping
    // -----------------------------------------------------------------------

    #[test]
    fn broadcast_clears_done_loading_and_tracks_one_entry() {
        let mut h = harness(CoordinatorConfig::default());
        h.connections.set_done_loading(ALICE, true);
        h.connections.set_done_loading(BOB, true);

        h.request_transition("Arena").unwrap();
        h.store.insert(player(100, ALICE));

        // Complete the load and broadcast without pumping the acks.
        let (load, _) = h.loader.complete_next().unwrap();
        let events = h
            .authority
            .on_world_loaded(load, &mut h.store, &mut h.connections, &mut h.transport)
            .expect("broadcast happens");

        assert_eq!(events.commands_sent, 2);
        assert!(events.local_client_marked);
        assert!(!h.connections.is_done_loading(ALICE));
        assert!(!h.connections.is_done_loading(BOB));
        assert_eq!(h.authority.tracker().tracked(), 1);
        // Authority-local completion: in_progress already clear while the
        // remote barrier is still open.
        assert!(!h.authority.state().in_progress);
        assert!(!h.authority.barrier_complete(&h.connections));
    }

    #[test]
    fn local_client_never_receives_a_network_command() {
        let mut h = harness(CoordinatorConfig::default());
        let ticket = h.request_transition("Arena").unwrap();
        let (load, _) = h.loader.complete_next().unwrap();
        h.authority
            .on_world_loaded(load, &mut h.store, &mut h.connections, &mut h.transport);

        let envelopes = h.transport.take();
        assert_eq!(envelopes.len(), 2);
        assert!(envelopes
            .iter()
            .all(|e| e.to != worldgate::Recipient::Client(LOCAL)));
        // Yet the local client is already done.
        assert!(h
            .authority
            .tracker()
            .get(ticket.correlation)
            .unwrap()
            .done_clients()
            .contains(&LOCAL));
    }

    #[test]
    fn stray_load_completion_is_ignored() {
        let mut h = harness(CoordinatorConfig::default());
        let result = h.authority.on_world_loaded(
            worldgate::LoadTicket(999),
            &mut h.store,
            &mut h.connections,
            &mut h.transport,
        );
        assert!(result.is_none());
        assert!(h.transport.outbox.is_empty());
    }

    // -----------------------------------------------------------------------
    // Disconnects
    // -----------------------------------------------------------------------

    #[test]
    fn disconnect_mid_transition_releases_the_barrier() {
        let mut h = LoopbackHarness::new(
            CATALOG,
            &[ALICE, BOB, ClientId(3)],
            Some(LOCAL),
            Some(0),
            CoordinatorConfig::default(),
        )
        .unwrap();
        h.request_transition("Arena").unwrap();

        // Client 3 vanishes before it can acknowledge.
        h.participants
            .retain(|p| p.coordinator.client_id() != ClientId(3));
        h.disconnect(ClientId(3));

        assert!(h.run_until_complete(8));
    }

    // -----------------------------------------------------------------------
    // Buffered message replay
    // -----------------------------------------------------------------------

    #[test]
    fn buffered_messages_replay_fifo_exactly_once() {
        let mut h = harness(CoordinatorConfig::default());
        h.request_transition("Arena").unwrap();
        h.store.insert(player(100, ALICE));

        // Two messages that outran entity creation on Alice's side.
        let node = h.participant(ALICE).unwrap();
        for payload in [b"first".to_vec(), b"second".to_vec()] {
            node.buffer.push(BufferedMessage {
                target: EntityId(100),
                sender: BOB,
                channel: CONTROL_CHANNEL,
                payload,
                received_at: Instant::now(),
            });
        }

        assert!(h.run_until_complete(8));

        let node = h.participant(ALICE).unwrap();
        let replayed: Vec<&[u8]> = node.events[0]
            .replayed
            .iter()
            .map(|m| m.payload.as_slice())
            .collect();
        assert_eq!(replayed, vec![&b"first"[..], &b"second"[..]]);
        // Drained atomically: nothing left to replay a second time.
        assert_eq!(node.buffer.queued(EntityId(100)), 0);
        assert!(node.buffer.drain(EntityId(100)).is_empty());
    }

    // -----------------------------------------------------------------------
    // Visibility filtering
    // -----------------------------------------------------------------------

    #[test]
    fn snapshots_are_filtered_by_observer_set() {
        let mut h = harness(CoordinatorConfig::default());
        h.request_transition("Arena").unwrap();
        h.store.insert(player(100, ALICE));
        h.store.insert(player(101, BOB));
        h.connections
            .set_observers(EntityId(100), HashSet::from([ALICE]));

        assert!(h.run_until_complete(8));

        let alice = h.participant(ALICE).unwrap();
        assert!(alice.store.contains(EntityId(100)));
        assert!(alice.store.contains(EntityId(101)));

        let bob = h.participant(BOB).unwrap();
        assert!(!bob.store.contains(EntityId(100)));
        assert!(bob.store.contains(EntityId(101)));
    }

    // -----------------------------------------------------------------------
    // First-load path
    // -----------------------------------------------------------------------

    #[test]
    fn first_load_acks_with_the_sentinel_and_mutates_no_barrier() {
        let mut h = LoopbackHarness::new(
            CATALOG,
            &[ALICE, BOB],
            Some(LOCAL),
            None, // no prior world anywhere
            CoordinatorConfig::default(),
        )
        .unwrap();
        let ticket = h.request_transition("Arena").unwrap();
        for _ in 0..4 {
            h.step();
        }

        for node in &h.participants {
            assert_eq!(node.events.len(), 1);
            assert_eq!(node.events[0].acked, CorrelationId::NONE);
            assert!(node.events[0].spawned.is_empty());
            assert_eq!(node.coordinator.state().current_world, Some(1));
        }
        // Sentinel acks are no-ops: only the local client is marked done.
        let done = h
            .authority
            .tracker()
            .get(ticket.correlation)
            .unwrap()
            .done_clients();
        assert_eq!(done.len(), 1);
        assert!(done.contains(&LOCAL));
    }

    // -----------------------------------------------------------------------
    // Scene-authored resync
    // -----------------------------------------------------------------------

    #[test]
    fn scene_authored_resync_adopts_existing_entities() {
        let config = CoordinatorConfig {
            replication_mode: ReplicationMode::SceneAuthoredResync,
            ..Default::default()
        };
        let mut h = harness(config);
        h.request_transition("Arena").unwrap();

        // Authority-side fresh entity backed by a scene-authored identity.
        let mut door = player(910, ALICE);
        door.persistent_instance_id = Some(777);
        h.store.insert(door);

        // Alice's copy of the authored world already contains the door,
        // under a local id and the same persistent identity.
        let node = h.participant(ALICE).unwrap();
        let mut local_door = StoredEntity::new(EntityId(500), LOCAL, 0);
        local_door.persistent_instance_id = Some(777);
        node.store.insert(local_door);

        assert!(h.run_until_complete(8));

        let node = h.participant(ALICE).unwrap();
        assert_eq!(node.events[0].spawned, vec![EntityId(910)]);
        // Adopted, not reconstructed: rebound to the network id.
        assert!(node.store.contains(EntityId(910)));
        assert!(!node.store.contains(EntityId(500)));
        assert_eq!(node.store.get(EntityId(910)).unwrap().owner, ALICE);

        // Bob has no authored copy; the record is skipped, not fatal.
        let bob = h.participant(BOB).unwrap();
        assert!(bob.events[0].spawned.is_empty());
    }

    // -----------------------------------------------------------------------
    // Mismatch detection & unknown commands
    // -----------------------------------------------------------------------

    #[test]
    fn world_mismatch_is_detected_outside_the_transition_flow() {
        let mut h = harness(CoordinatorConfig::default());
        {
            let node = h.participant(ALICE).unwrap();
            assert!(node.coordinator.has_world_mismatch(1)); // still in Lobby
            assert!(!node.coordinator.has_world_mismatch(0));
            assert!(node.coordinator.has_world_mismatch(42)); // unregistered
        }

        h.request_transition("Arena").unwrap();
        assert!(h.run_until_complete(8));

        let node = h.participant(ALICE).unwrap();
        assert!(!node.coordinator.has_world_mismatch(1));
        assert!(node.coordinator.has_world_mismatch(0));
    }

    // -----------------------------------------------------------------------
    // Migration helper
    // -----------------------------------------------------------------------

    #[test]
    fn quarantine_detaches_parents_and_is_idempotent() {
        let mut store = MemoryEntityStore::new();
        let mut child = StoredEntity::new(EntityId(2), ALICE, 0);
        child.parent = Some(EntityId(1));
        store.insert(StoredEntity::new(EntityId(1), ALICE, 0));
        store.insert(child);

        let mut migrator = EntityMigrator::new();
        let live = store.all_entities();
        migrator.quarantine(&mut store, &live);
        migrator.quarantine(&mut store, &live); // no-op

        assert_eq!(store.parent_of(EntityId(2)), None);
        assert_eq!(store.location_of(EntityId(1)), Some(EntityLocation::Holding));
        assert_eq!(store.location_of(EntityId(2)), Some(EntityLocation::Holding));
        assert_eq!(migrator.quarantined().len(), 2);

        migrator.relocate(&mut store, 1);
        migrator.relocate(&mut store, 1); // no-op
        assert_eq!(store.location_of(EntityId(1)), Some(EntityLocation::World(1)));
        assert_eq!(store.location_of(EntityId(2)), Some(EntityLocation::World(1)));
    }
}
