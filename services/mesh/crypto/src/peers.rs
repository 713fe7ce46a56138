//! Bounded table of peer public keys.

use std::collections::HashMap;

use tracing::{debug, warn};

/// Default number of peers whose keys are remembered
pub const DEFAULT_PEER_CAPACITY: usize = 64;

/// A remembered peer key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerKeyEntry {
    /// X25519 public key
    pub public_key: [u8; 32],
    /// Last time the key was used or announced (Unix seconds)
    pub last_seen: u32,
}

/// What `save` did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    /// First key for this node
    Added,
    /// Same key announced again
    Unchanged,
    /// Node announced a different key; the stored one was kept
    Conflict,
}

/// Peer public keys, evicting the least recently seen over capacity
#[derive(Debug, Clone)]
pub struct PeerKeyTable {
    entries: HashMap<u32, PeerKeyEntry>,
    capacity: usize,
}

impl PeerKeyTable {
    /// Create an empty table
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Public key of `node_id`, if known
    pub fn get(&self, node_id: u32) -> Option<&[u8; 32]> {
        self.entries.get(&node_id).map(|e| &e.public_key)
    }

    /// Full entry of `node_id`
    pub fn entry(&self, node_id: u32) -> Option<&PeerKeyEntry> {
        self.entries.get(&node_id)
    }

    /// Store or refresh a key and enforce the capacity. A stored key is
    /// never overwritten; `remove` or `wipe` it first.
    /// Returns what changed and the nodes evicted to make room.
    pub fn save(&mut self, node_id: u32, public_key: [u8; 32], now: u32) -> (KeyChange, Vec<u32>) {
        let change = match self.entries.get_mut(&node_id) {
            Some(entry) if entry.public_key == public_key => {
                entry.last_seen = now;
                KeyChange::Unchanged
            }
            Some(_) => {
                warn!(
                    "Node {:#010x} announced a different public key, keeping the stored one",
                    node_id
                );
                KeyChange::Conflict
            }
            None => {
                self.entries.insert(
                    node_id,
                    PeerKeyEntry {
                        public_key,
                        last_seen: now,
                    },
                );
                KeyChange::Added
            }
        };
        let evicted = self.enforce_capacity(node_id);
        (change, evicted)
    }

    /// Insert an entry loaded from storage without touching `last_seen`
    pub fn restore(&mut self, node_id: u32, entry: PeerKeyEntry) {
        self.entries.insert(node_id, entry);
    }

    /// Mark a key as used now. Returns false if the node is unknown.
    pub fn touch(&mut self, node_id: u32, now: u32) -> bool {
        match self.entries.get_mut(&node_id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Forget one node
    pub fn remove(&mut self, node_id: u32) -> Option<PeerKeyEntry> {
        self.entries.remove(&node_id)
    }

    /// Forget every node
    pub fn wipe(&mut self) {
        self.entries.clear();
    }

    /// Drop the oldest entries until the table fits, never dropping `keep`
    pub fn enforce_capacity(&mut self, keep: u32) -> Vec<u32> {
        if self.entries.len() <= self.capacity {
            return Vec::new();
        }

        let mut by_age: Vec<(u32, u32)> = self
            .entries
            .iter()
            .filter(|(id, _)| **id != keep)
            .map(|(id, e)| (e.last_seen, *id))
            .collect();
        by_age.sort_unstable();

        let excess = self.entries.len() - self.capacity;
        let evicted: Vec<u32> = by_age.into_iter().take(excess).map(|(_, id)| id).collect();
        for id in &evicted {
            self.entries.remove(id);
        }
        debug!("Evicted {} peer keys over capacity", evicted.len());
        evicted
    }

    /// Entries ordered by node id, for persistence
    pub fn snapshot(&self) -> Vec<(u32, PeerKeyEntry)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(id, e)| (*id, *e)).collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PeerKeyTable {
    fn default() -> Self {
        Self::new(DEFAULT_PEER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_keeps_stored_key() {
        let mut table = PeerKeyTable::new(4);
        assert_eq!(table.save(1, [1; 32], 10).0, KeyChange::Added);
        assert_eq!(table.save(1, [1; 32], 11).0, KeyChange::Unchanged);
        assert_eq!(table.entry(1).unwrap().last_seen, 11);

        assert_eq!(table.save(1, [2; 32], 12).0, KeyChange::Conflict);
        assert_eq!(table.get(1), Some(&[1; 32]));
        assert_eq!(table.entry(1).unwrap().last_seen, 11);

        table.remove(1);
        assert_eq!(table.save(1, [2; 32], 13).0, KeyChange::Added);
        assert_eq!(table.get(1), Some(&[2; 32]));
    }

    #[test]
    fn test_evicts_least_recently_seen() {
        let mut table = PeerKeyTable::new(2);
        table.save(1, [1; 32], 100);
        table.save(2, [2; 32], 200);
        table.touch(1, 300);

        let (_, evicted) = table.save(3, [3; 32], 400);
        assert_eq!(evicted, vec![2]);
        assert!(table.get(1).is_some());
        assert!(table.get(3).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_new_entry_survives_equal_timestamps() {
        let mut table = PeerKeyTable::new(1);
        table.save(7, [7; 32], 50);
        let (_, evicted) = table.save(3, [3; 32], 50);
        assert_eq!(evicted, vec![7]);
        assert!(table.get(3).is_some());
    }

    #[test]
    fn test_touch_unknown_and_wipe() {
        let mut table = PeerKeyTable::default();
        assert!(!table.touch(9, 1));
        table.save(9, [9; 32], 1);
        assert!(table.touch(9, 2));
        table.wipe();
        assert!(table.is_empty());
    }
}
