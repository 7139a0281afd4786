//! Wire protocol codec tests

#[cfg(test)]
mod tests {
    use worldgate::{
        Ack, ClientId, CorrelationId, EntityId, EntityRecord, EulerRot, GateError,
        ReplicationMode, Snapshot, TransitionCommand, TypeIdentity, Vec3,
    };

    fn fresh_record(id: u64, parent: Option<u64>, variables: Option<&[u8]>) -> EntityRecord {
        EntityRecord {
            entity_id: EntityId(id),
            owner: ClientId(9),
            is_player: id % 2 == 0,
            parent: parent.map(EntityId),
            identity: TypeIdentity::Fresh {
                prefab_hash: 0xDEAD_BEEF ^ id,
                position: Vec3::new(1.0, -2.5, 3.25),
                rotation: EulerRot::new(0.0, 90.0, 180.0),
            },
            variables: variables.map(|v| v.to_vec()),
        }
    }

    // -----------------------------------------------------------------------
    // Snapshot round-trips
    // -----------------------------------------------------------------------

    #[test]
    fn prefab_snapshot_round_trips() {
        let snapshot = Snapshot {
            entities: vec![
                fresh_record(10, None, Some(b"vars-a")),
                fresh_record(11, Some(10), None),
            ],
        };
        let payload = snapshot
            .encode(ReplicationMode::PrefabResync, true)
            .unwrap();
        let decoded = Snapshot::decode(&payload, ReplicationMode::PrefabResync, true).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn scene_authored_snapshot_round_trips() {
        let snapshot = Snapshot {
            entities: vec![EntityRecord {
                entity_id: EntityId(900),
                owner: ClientId(1),
                is_player: true,
                parent: None,
                identity: TypeIdentity::Persistent { instance_id: 777 },
                variables: Some(b"scene-vars".to_vec()),
            }],
        };
        let payload = snapshot
            .encode(ReplicationMode::SceneAuthoredResync, true)
            .unwrap();
        let decoded =
            Snapshot::decode(&payload, ReplicationMode::SceneAuthoredResync, true).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn variable_replication_off_omits_payload_framing() {
        let snapshot = Snapshot {
            entities: vec![fresh_record(5, None, None)],
        };
        let with_vars = snapshot.encode(ReplicationMode::PrefabResync, true).unwrap();
        let without = snapshot
            .encode(ReplicationMode::PrefabResync, false)
            .unwrap();
        // The length prefix only exists when variable replication is on.
        assert_eq!(with_vars.len(), without.len() + 4);

        let decoded = Snapshot::decode(&without, ReplicationMode::PrefabResync, false).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn empty_snapshot_is_four_bytes() {
        let payload = Snapshot::default()
            .encode(ReplicationMode::PrefabResync, true)
            .unwrap();
        assert_eq!(payload.as_ref(), &[0, 0, 0, 0]);
    }

    // -----------------------------------------------------------------------
    // Malformed payloads
    // -----------------------------------------------------------------------

    #[test]
    fn identity_mode_mismatch_fails_to_encode() {
        let snapshot = Snapshot {
            entities: vec![fresh_record(1, None, None)],
        };
        assert!(matches!(
            snapshot.encode(ReplicationMode::SceneAuthoredResync, true),
            Err(GateError::Codec(_))
        ));
    }

    #[test]
    fn truncated_snapshot_fails_to_decode() {
        let snapshot = Snapshot {
            entities: vec![fresh_record(1, Some(2), Some(b"abc"))],
        };
        let payload = snapshot
            .encode(ReplicationMode::PrefabResync, true)
            .unwrap();
        for cut in [1, 5, payload.len() - 1] {
            assert!(matches!(
                Snapshot::decode(&payload[..cut], ReplicationMode::PrefabResync, true),
                Err(GateError::Codec(_))
            ));
        }
    }

    #[test]
    fn trailing_bytes_fail_to_decode() {
        let mut payload = Snapshot::default()
            .encode(ReplicationMode::PrefabResync, true)
            .unwrap()
            .to_vec();
        payload.push(0xFF);
        assert!(matches!(
            Snapshot::decode(&payload, ReplicationMode::PrefabResync, true),
            Err(GateError::Codec(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Control messages
    // -----------------------------------------------------------------------

    #[test]
    fn transition_command_round_trips() {
        let snapshot = Snapshot {
            entities: vec![fresh_record(3, None, None)],
        };
        let command = TransitionCommand {
            world_index: 1,
            correlation: CorrelationId::generate("Arena"),
            snapshot: snapshot.encode(ReplicationMode::PrefabResync, true).unwrap(),
        };
        let decoded = TransitionCommand::decode(&command.encode()).unwrap();
        assert_eq!(decoded, command);

        let inner =
            Snapshot::decode(&decoded.snapshot, ReplicationMode::PrefabResync, true).unwrap();
        assert_eq!(inner, snapshot);
    }

    #[test]
    fn ack_round_trips_including_the_sentinel() {
        for correlation in [CorrelationId::generate("Arena"), CorrelationId::NONE] {
            let ack = Ack {
                correlation,
                client: ClientId(42),
            };
            let decoded = Ack::decode(&ack.encode()).unwrap();
            assert_eq!(decoded, ack);
            assert_eq!(decoded.correlation.is_none(), correlation.is_none());
        }
    }

    #[test]
    fn short_control_payloads_fail_to_decode() {
        assert!(TransitionCommand::decode(&[0, 1, 2]).is_err());
        assert!(Ack::decode(&[0; 10]).is_err());
    }
}
