//! Transition progress tracking – the per-transition acknowledgment barrier.
//!
//! One [`TransitionProgress`] entry exists per in-flight transition, keyed by
//! correlation id. The tracker only records which clients acknowledged; the
//! set of clients *expected* to acknowledge comes from the connection
//! registry at query time, so disconnects never deadlock the barrier.

use crate::error::{GateError, Result};
use crate::types::{ClientId, CorrelationId};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};

/// Acknowledgment record for a single transition.
#[derive(Debug, Clone)]
pub struct TransitionProgress {
    id: CorrelationId,
    done: HashSet<ClientId>,
}

impl TransitionProgress {
    fn new(id: CorrelationId) -> Self {
        Self {
            id,
            done: HashSet::new(),
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn done_clients(&self) -> &HashSet<ClientId> {
        &self.done
    }
}

/// Tracks every in-flight transition's acknowledgment set.
///
/// Completed entries are not garbage-collected here; the caller observes
/// completion and decides when to [`TransitionTracker::remove`] them.
#[derive(Debug, Default)]
pub struct TransitionTracker {
    entries: HashMap<CorrelationId, TransitionProgress>,
}

impl TransitionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transition. Fails if `id` is already tracked.
    pub fn begin(&mut self, id: CorrelationId) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(GateError::DuplicateTransition(id));
        }
        self.entries.insert(id, TransitionProgress::new(id));
        Ok(())
    }

    /// Record that `client` finished loading for transition `id`.
    ///
    /// The sentinel id means the client booted without a prior world and has
    /// nothing to reconcile, a no-op. An unknown id is a stale or late
    /// acknowledgment: logged, never fatal.
    pub fn mark_client_done(&mut self, id: CorrelationId, client: ClientId) {
        if id.is_none() {
            debug!("{} acknowledged its boot world; nothing to track", client);
            return;
        }
        match self.entries.get_mut(&id) {
            Some(progress) => {
                progress.done.insert(client);
                debug!("{} done for transition {}", client, id);
            }
            None => warn!("stale acknowledgment from {} for transition {}", client, id),
        }
    }

    /// Remove a disconnected client from **every** tracked transition, not
    /// just the active one.
    pub fn remove_client(&mut self, client: ClientId) {
        for progress in self.entries.values_mut() {
            progress.done.remove(&client);
        }
    }

    /// True iff every expected client has acknowledged transition `id`.
    ///
    /// The expected set is supplied by the caller (the connection registry);
    /// it is never stored here.
    pub fn is_complete(&self, id: CorrelationId, expected: &[ClientId]) -> bool {
        match self.entries.get(&id) {
            Some(progress) => expected.iter().all(|c| progress.done.contains(c)),
            None => false,
        }
    }

    /// Caller-driven removal of a (typically completed) entry.
    pub fn remove(&mut self, id: CorrelationId) -> Option<TransitionProgress> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: CorrelationId) -> Option<&TransitionProgress> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
