//! Entity migration – quarantine to the holding area and relocation into a
//! freshly loaded world.
//!
//! One migrator instance serves one transition episode. Both operations are
//! idempotent per entity and preserve entity identity and attached state;
//! only spatial placement and world membership change.

use crate::backend::EntityStore;
use crate::types::EntityId;
use log::debug;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct EntityMigrator {
    quarantined: HashSet<EntityId>,
    relocated: HashSet<EntityId>,
}

impl EntityMigrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detach each entity from its parent (cross-world relocation of a
    /// parented child is undefined) and move it to the holding area.
    /// Re-invoking on an already quarantined entity is a no-op.
    pub fn quarantine(&mut self, store: &mut dyn EntityStore, entities: &[EntityId]) {
        for &entity in entities {
            if !self.quarantined.insert(entity) {
                continue;
            }
            if store.parent_of(entity).is_some() {
                store.detach_parent(entity);
            }
            store.move_to_holding(entity);
        }
        debug!("{} entities in quarantine", self.quarantined.len());
    }

    /// Move every quarantined entity into `target_world`, mirroring the same
    /// unparenting rule. Idempotent per entity.
    pub fn relocate(&mut self, store: &mut dyn EntityStore, target_world: u32) {
        let mut pending: Vec<EntityId> = self
            .quarantined
            .iter()
            .filter(|e| !self.relocated.contains(e))
            .copied()
            .collect();
        pending.sort();

        for entity in pending {
            if store.parent_of(entity).is_some() {
                store.detach_parent(entity);
            }
            store.move_to_world(entity, target_world);
            self.relocated.insert(entity);
        }
        debug!(
            "{} entities relocated into world {}",
            self.relocated.len(),
            target_world
        );
    }

    pub fn quarantined(&self) -> &HashSet<EntityId> {
        &self.quarantined
    }

    /// Forget the current episode's bookkeeping.
    pub fn reset(&mut self) {
        self.quarantined.clear();
        self.relocated.clear();
    }
}
