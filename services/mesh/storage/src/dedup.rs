//! Replay suppression for received packets.

use std::collections::{HashSet, VecDeque};
use tracing::trace;

/// Default number of remembered `(origin, packet id)` pairs
pub const DEFAULT_DEDUP_CAPACITY: usize = 256;

/// Receiver-side duplicate detection
pub trait Dedup: Send {
    /// Whether `(origin, packet_id)` was already seen
    fn is_duplicate(&self, origin: u32, packet_id: u32) -> bool;

    /// Remember `(origin, packet_id)`
    fn mark_seen(&mut self, origin: u32, packet_id: u32);

    /// Check and remember in one step; true when the pair was new
    fn check_and_mark(&mut self, origin: u32, packet_id: u32) -> bool {
        if self.is_duplicate(origin, packet_id) {
            return false;
        }
        self.mark_seen(origin, packet_id);
        true
    }
}

/// Bounded set of recent packets with FIFO eviction
#[derive(Debug, Clone)]
pub struct RecentPackets {
    seen: HashSet<(u32, u32)>,
    order: VecDeque<(u32, u32)>,
    capacity: usize,
}

impl RecentPackets {
    /// Create a filter remembering at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Number of remembered packets
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for RecentPackets {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl Dedup for RecentPackets {
    fn is_duplicate(&self, origin: u32, packet_id: u32) -> bool {
        self.seen.contains(&(origin, packet_id))
    }

    fn mark_seen(&mut self, origin: u32, packet_id: u32) {
        if !self.seen.insert((origin, packet_id)) {
            return;
        }
        self.order.push_back((origin, packet_id));
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
                trace!("Dedup evicted {:#010x}/{}", oldest.0, oldest.1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_then_duplicate() {
        let mut dedup = RecentPackets::default();
        assert!(dedup.check_and_mark(0xAABBCCDD, 42));
        assert!(!dedup.check_and_mark(0xAABBCCDD, 42));
        // same id from another origin is a different packet
        assert!(dedup.check_and_mark(0x11223344, 42));
    }

    #[test]
    fn test_fifo_eviction() {
        let mut dedup = RecentPackets::new(3);
        for id in 1..=4 {
            dedup.mark_seen(1, id);
        }
        assert_eq!(dedup.len(), 3);
        assert!(!dedup.is_duplicate(1, 1));
        assert!(dedup.is_duplicate(1, 2));
        assert!(dedup.is_duplicate(1, 4));
    }

    #[test]
    fn test_remark_does_not_grow() {
        let mut dedup = RecentPackets::new(2);
        dedup.mark_seen(1, 1);
        dedup.mark_seen(1, 1);
        dedup.mark_seen(1, 2);
        assert!(dedup.is_duplicate(1, 1));
        assert_eq!(dedup.len(), 2);
    }
}
