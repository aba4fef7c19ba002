//! In-memory index from key to the location of its newest entry.
//!
//! ## Invariants
//!
//! - One entry per key: the one with the greatest timestamp ever inserted
//! - Replacement only on a strictly greater timestamp; ties keep the
//!   incumbent, whatever the arrival order
//! - Deletes are tombstone entries inserted through the same [`KeyDir::put`]
//!   rule, so they can neither be skipped nor jump ahead of newer writes
//! - Live writes, recovery and merge all funnel through `put` or
//!   [`KeyDir::relocate`]; nothing else mutates the map
//!
//! A single `RwLock` guards the map. Critical sections are pure map
//! operations; no I/O ever happens under the lock.

use crate::codec::entry_len;
use crate::types::{SegmentId, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Location of a key's newest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDirEntry {
    /// Segment holding the entry.
    pub segment_id: SegmentId,
    /// Offset of the entry header within the segment's data file.
    pub offset: u64,
    /// Value length.
    pub value_size: u32,
    /// Entry timestamp.
    pub timestamp: Timestamp,
    /// Whether the entry is a tombstone.
    pub tombstone: bool,
}

impl KeyDirEntry {
    /// Length of the on-disk entry for a key of `key_len` bytes.
    #[must_use]
    pub fn record_len(&self, key_len: usize) -> u64 {
        // Keys in the index were accepted by the codec, so they fit in u32.
        entry_len(key_len as u32, self.value_size)
    }
}

/// Concurrent last-write-wins index.
#[derive(Debug, Default)]
pub struct KeyDir {
    entries: RwLock<HashMap<Vec<u8>, KeyDirEntry>>,
}

impl KeyDir {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the location of `key`, tombstones included.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<KeyDirEntry> {
        self.entries.read().get(key).copied()
    }

    /// Inserts `entry` for `key` if it is strictly newer than the incumbent.
    ///
    /// Returns whether the index changed.
    pub fn put(&self, key: &[u8], entry: KeyDirEntry) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(current) if entry.timestamp > current.timestamp => {
                *current = entry;
                true
            }
            Some(_) => false,
            None => {
                entries.insert(key.to_vec(), entry);
                true
            }
        }
    }

    /// Moves `key` from `expected` to `new` if it still points at `expected`.
    ///
    /// Merge completion uses this instead of [`KeyDir::put`]: the copied
    /// entry keeps its original timestamp, which would tie with the
    /// incumbent. Any write that landed while the merge ran has replaced
    /// `expected` and therefore wins.
    pub fn relocate(&self, key: &[u8], expected: &KeyDirEntry, new: KeyDirEntry) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(current) if current == expected => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    /// Removes `key` if it still points at `expected`.
    ///
    /// Merge uses this to forget tombstones whose segment it deleted; a
    /// write that replaced `expected` in the meantime is kept.
    pub fn remove_if(&self, key: &[u8], expected: &KeyDirEntry) -> bool {
        let mut entries = self.entries.write();
        if entries.get(key) == Some(expected) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Returns whether `key` currently resolves to exactly this location.
    #[must_use]
    pub fn is_current(
        &self,
        key: &[u8],
        segment_id: SegmentId,
        offset: u64,
        timestamp: Timestamp,
    ) -> bool {
        self.entries.read().get(key).is_some_and(|e| {
            e.segment_id == segment_id && e.offset == offset && e.timestamp == timestamp
        })
    }

    /// Number of indexed keys, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of keys whose newest entry is not a tombstone.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.entries.read().values().filter(|e| !e.tombstone).count()
    }

    /// Keys whose newest entry is not a tombstone, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| !e.tombstone)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Greatest timestamp in the index.
    #[must_use]
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.entries.read().values().map(|e| e.timestamp).max()
    }

    /// Copy of the whole map.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Vec<u8>, KeyDirEntry> {
        self.entries.read().clone()
    }
}
