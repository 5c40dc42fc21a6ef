//! Authoritative list of live connections.
//!
//! Removal uses swap-with-last-and-shrink, so entry order changes whenever
//! something is compacted away. Callers must refer to connections by
//! [`ConnectionId`], never by index across ticks.

use crate::error::{Error, Result};
use crate::network::ConnectionId;
use std::collections::HashSet;

/// A connection identity plus its validity flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: ConnectionId,
    valid: bool,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId) -> Self {
        Self { id, valid: true }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the handle disconnected. Returns `true` only on the first call.
    pub fn invalidate(&mut self) -> bool {
        std::mem::replace(&mut self.valid, false)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: Vec<ConnectionHandle>,
    ids: HashSet<ConnectionId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
        }
    }

    /// Append a handle, rejecting identities already present (valid or not)
    pub fn add(&mut self, handle: ConnectionHandle) -> Result<()> {
        if !self.ids.insert(handle.id) {
            return Err(Error::DuplicateConnection(handle.id));
        }
        self.entries.push(handle);
        Ok(())
    }

    /// Mark the entry at `index` invalid. Out-of-range or already-invalid
    /// entries are left alone; returns whether anything changed.
    pub fn invalidate(&mut self, index: usize) -> bool {
        self.entries
            .get_mut(index)
            .map(ConnectionHandle::invalidate)
            .unwrap_or(false)
    }

    /// Drop every invalid entry. Not order-preserving. Returns the number removed.
    pub fn compact(&mut self) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].valid {
                i += 1;
                continue;
            }
            // The former last entry now sits at `i` and is checked next
            let dead = self.entries.swap_remove(i);
            self.ids.remove(&dead.id);
            removed += 1;
        }
        removed
    }

    /// View for one dispatch pass: slots may be invalidated, never added or removed
    pub fn snapshot(&mut self) -> Snapshot<'_> {
        Snapshot {
            entries: &mut self.entries,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.entries.iter()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(ConnectionHandle::id).collect()
    }

    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|h| h.valid).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }
}

/// Fixed-length view over the table's entries
///
/// Backed by a slice, so the entry set cannot change while it is alive.
/// Splitting it into batches hands each slot to exactly one owner.
pub struct Snapshot<'a> {
    entries: &'a mut [ConnectionHandle],
}

impl<'a> Snapshot<'a> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Disjoint mutable batches of at most `size` slots (clamped to 1)
    pub fn into_batches(self, size: usize) -> std::slice::ChunksMut<'a, ConnectionHandle> {
        self.entries.chunks_mut(size.max(1))
    }

    pub fn into_slots(self) -> std::slice::IterMut<'a, ConnectionHandle> {
        self.entries.iter_mut()
    }
}
