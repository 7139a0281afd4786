//! Core identifier, math, and configuration types shared across all modules.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Network-wide identifier of a connected client.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Network-unique identifier of a replicated entity.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Correlation id
// ---------------------------------------------------------------------------

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque 128-bit identifier tying an authority's broadcast to each client's
/// acknowledgment for one transition.
///
/// The all-zero value is the sentinel meaning "no tracked transition": a
/// client acknowledging with it loaded its boot world and has nothing to
/// reconcile.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CorrelationId(u128);

impl CorrelationId {
    /// Sentinel: no tracked transition.
    pub const NONE: CorrelationId = CorrelationId(0);

    /// Derive a fresh id by hashing the target world name together with a
    /// process-monotonic counter and the wall clock.
    pub fn generate(world: &str) -> Self {
        let counter = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let mut material = Vec::with_capacity(world.len() + 24);
        material.extend_from_slice(world.as_bytes());
        material.extend_from_slice(&counter.to_le_bytes());
        material.extend_from_slice(&nanos.to_le_bytes());

        let digest = md5::compute(&material);
        let value = u128::from_le_bytes(digest.0);
        // Reserve the all-zero value for the sentinel.
        Self(if value == 0 { 1 } else { value })
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Euler rotation in degrees, serialized component-wise on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EulerRot {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl EulerRot {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }
}

// ---------------------------------------------------------------------------
// Replication mode & coordinator config
// ---------------------------------------------------------------------------

/// How a freshly loaded world's entities are reconciled on participants.
///
/// A static configuration switch, never negotiated at runtime; both sides
/// of a connection must agree on it out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Destroy stale entities and reconstruct each snapshot record from its
    /// prefab hash plus spatial state.
    PrefabResync,
    /// Associate snapshot records with entities already authored into the
    /// loaded world, keyed by persistent instance identifier.
    SceneAuthoredResync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub replication_mode: ReplicationMode,
    /// Append per-entity variable-replication payloads to snapshots.
    pub variable_replication: bool,
    /// Permit `WorldRegistry::register` after boot.
    pub allow_runtime_world_registration: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            replication_mode: ReplicationMode::PrefabResync,
            variable_replication: true,
            allow_runtime_world_registration: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Transition state
// ---------------------------------------------------------------------------

/// Per-coordinator transition bookkeeping.
///
/// Owned by the hosting coordinator instance rather than living in process
/// globals, so multiple independent simulations can coexist in one process.
#[derive(Debug, Clone)]
pub struct TransitionState {
    /// Index of the world this process is presently in, if any.
    pub current_world: Option<u32>,
    /// Name of the world being loaded while a transition is in flight.
    pub pending_world: Option<String>,
    /// Single-flight gate: a new transition is rejected while this is set.
    pub in_progress: bool,
    /// Correlation id of the most recently started transition.
    pub active_correlation: CorrelationId,
}

impl TransitionState {
    pub fn new(boot_world: Option<u32>) -> Self {
        Self {
            current_world: boot_world,
            pending_world: None,
            in_progress: false,
            active_correlation: CorrelationId::NONE,
        }
    }
}
