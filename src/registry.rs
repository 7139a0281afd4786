//! World registry – the static name↔index catalog.
//!
//! Every participant must hold an identical catalog; consistency across the
//! fleet is an environment precondition, not something negotiated at runtime.
//! A mismatch between catalogs is a configuration defect, detectable later
//! through `ParticipantCoordinator::has_world_mismatch`.

use crate::error::{GateError, Result};
use log::{debug, warn};
use std::collections::HashMap;

/// Bijective mapping between world names and numeric indices, plus the name
/// of the world this process is presently in.
#[derive(Debug, Clone, Default)]
pub struct WorldRegistry {
    by_name: HashMap<String, u32>,
    by_index: HashMap<u32, String>,
    active: Option<String>,
    allow_runtime_registration: bool,
}

impl WorldRegistry {
    pub fn new(allow_runtime_registration: bool) -> Self {
        Self {
            by_name: HashMap::new(),
            by_index: HashMap::new(),
            active: None,
            allow_runtime_registration,
        }
    }

    /// Build a registry from a boot-time catalog. Boot registration is always
    /// permitted; the runtime flag only governs [`WorldRegistry::register`]
    /// afterward.
    pub fn with_catalog<'a, I>(catalog: I, allow_runtime_registration: bool) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, u32)>,
    {
        let mut registry = Self::new(allow_runtime_registration);
        for (name, index) in catalog {
            registry.insert(name, index)?;
        }
        Ok(registry)
    }

    /// Register a world after boot.
    ///
    /// Re-registering an identical name/index pair succeeds idempotently;
    /// a conflicting pair is a `RegistrationConflict`.
    pub fn register(&mut self, name: &str, index: u32) -> Result<()> {
        if !self.allow_runtime_registration {
            return Err(GateError::RegistrationDisabled);
        }
        self.insert(name, index)
    }

    fn insert(&mut self, name: &str, index: u32) -> Result<()> {
        let name_clash = self.by_name.get(name).is_some_and(|&i| i != index);
        let index_clash = self.by_index.get(&index).is_some_and(|n| n != name);
        if name_clash || index_clash {
            return Err(GateError::RegistrationConflict {
                name: name.to_string(),
                index,
            });
        }
        if self.by_name.contains_key(name) {
            debug!("world '{}' already registered as index {}", name, index);
            return Ok(());
        }
        self.by_name.insert(name.to_string(), index);
        self.by_index.insert(index, name.to_string());
        Ok(())
    }

    pub fn resolve_index(&self, name: &str) -> Result<u32> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| GateError::UnknownWorld(name.to_string()))
    }

    pub fn resolve_name(&self, index: u32) -> Result<&str> {
        self.by_index
            .get(&index)
            .map(String::as_str)
            .ok_or(GateError::UnknownWorldIndex(index))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn contains_index(&self, index: u32) -> bool {
        self.by_index.contains_key(&index)
    }

    /// Record which world the process is presently in.
    pub fn set_active(&mut self, name: &str) {
        self.active = Some(name.to_string());
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Index of the presently active world.
    ///
    /// An active world that was never registered is an observability
    /// condition, not an error: it is logged and `None` is returned.
    pub fn current_active_index(&self) -> Option<u32> {
        let name = self.active.as_deref()?;
        match self.by_name.get(name) {
            Some(&index) => Some(index),
            None => {
                warn!("active world '{}' is not in the registry", name);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
