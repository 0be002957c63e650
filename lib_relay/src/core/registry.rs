//! # Peer Registry
//!
//! A keyed collection of live peers. Every operation takes the same lock, and
//! `snapshot` copies the handles out so callers never hold it across an await.
//! The registry never closes what it removes; whoever deletes a handle owns it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::connections::peer::{PeerHandle, PeerId};
use crate::error::RelayError;

/// Concurrency-safe map from [`PeerId`] to [`PeerHandle`].
#[derive(Debug, Default)]
pub struct Registry {
    peers: Mutex<HashMap<PeerId, PeerHandle>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, PeerHandle>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a handle under `id`.
    ///
    /// Fails with [`RelayError::Conflict`] if the key is taken; the existing
    /// entry is left untouched.
    pub fn insert(&self, id: PeerId, handle: PeerHandle) -> Result<(), RelayError> {
        let mut peers = self.lock();
        if peers.contains_key(&id) {
            return Err(RelayError::Conflict(id));
        }
        peers.insert(id, handle);
        Ok(())
    }

    /// Removes and returns the handle under `id`, if any.
    pub fn delete(&self, id: &PeerId) -> Option<PeerHandle> {
        self.lock().remove(id)
    }

    /// Returns a clone of the handle under `id`.
    pub fn get(&self, id: &PeerId) -> Option<PeerHandle> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Point-in-time copy of every registered handle, in no particular order.
    pub fn snapshot(&self) -> Vec<PeerHandle> {
        self.lock().values().cloned().collect()
    }
}
