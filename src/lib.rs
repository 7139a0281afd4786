//! Worldgate
//!
//! Coordinates a world transition: moving every participant of a
//! client-server replicated simulation from one named world to another while
//! preserving surviving entities and guaranteeing that every client ends the
//! transition with a consistent entity set.
//!
//! ## Architecture
//!
//! ```text
//! AuthorityCoordinator  (authority.rs) ← quarantine, load, broadcast
//!   ├── WorldRegistry        (registry.rs) ← name↔index catalog
//!   ├── TransitionTracker    (progress.rs) ← per-client ack barrier
//!   └── EntityMigrator       (migrate.rs)  ← holding-area relocation
//! ParticipantCoordinator (participant.rs) ← quarantine, load, apply, ack
//! protocol.rs  ← control messages + snapshot wire codec
//! backend.rs   ← collaborator traits (loader, store, transport, …)
//! loopback.rs  ← in-memory backends + single-process harness
//! ```
//!
//! The authority quarantines live entities, loads the target world, and
//! sends each remote client a visibility-filtered snapshot tagged with a
//! correlation id; participants apply the snapshot, replay messages buffered
//! for not-yet-existing entities, and acknowledge. The `TransitionTracker`
//! observes the acknowledgment barrier; the caller decides what to do when
//! it completes.

// Protocol and coordinator logic are always available.
pub mod authority;
pub mod backend;
pub mod error;
pub mod loopback;
pub mod migrate;
pub mod participant;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod types;

// Convenience re-exports
pub use authority::{AuthorityCoordinator, AuthorityPhase, BroadcastEvents, TransitionTicket};
pub use backend::{
    BufferedMessage, ConnectionRegistry, EntityDescriptor, EntityStore, InboundBuffer, LoadTicket,
    Recipient, Transport, WorldLoader,
};
pub use error::{GateError, Result};
pub use migrate::EntityMigrator;
pub use participant::{ApplyEvents, ParticipantCoordinator, ParticipantPhase};
pub use progress::{TransitionProgress, TransitionTracker};
pub use protocol::{
    Ack, ChannelId, EntityRecord, MessageKind, Snapshot, TransitionCommand, TypeIdentity,
    CONTROL_CHANNEL,
};
pub use registry::WorldRegistry;
pub use types::{
    ClientId, CoordinatorConfig, CorrelationId, EntityId, EulerRot, ReplicationMode,
    TransitionState, Vec3,
};
