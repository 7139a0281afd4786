//! Error taxonomy for the transition protocol.
//!
//! No variant here terminates the process. Registration errors are
//! configuration defects; everything else is recoverable: the offending
//! operation is aborted and logged, and the coordinator stays usable.

use crate::types::CorrelationId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GateError>;

#[derive(Debug, Error)]
pub enum GateError {
    /// Runtime world registration was attempted but is disallowed by
    /// configuration.
    #[error("runtime world registration is disabled by configuration")]
    RegistrationDisabled,

    /// A world name or index is already registered with a different
    /// counterpart. Re-registering an identical pair is not an error.
    #[error("world registration conflict for '{name}' / index {index}")]
    RegistrationConflict { name: String, index: u32 },

    #[error("unknown world name '{0}'")]
    UnknownWorld(String),

    #[error("unknown world index {0}")]
    UnknownWorldIndex(u32),

    /// Single-flight violation: a transition is already running.
    #[error("transition {0} is already in progress")]
    AlreadyInProgress(CorrelationId),

    #[error("transition {0} is already tracked")]
    DuplicateTransition(CorrelationId),

    /// The caller does not hold transition authority.
    #[error("caller does not hold transition authority")]
    NotAuthority,

    /// Malformed wire payload; the carrying command is skipped.
    #[error("malformed payload: {0}")]
    Codec(String),

    /// The entity store rejected a spawn or adoption.
    #[error("entity store error: {0}")]
    Store(String),
}
