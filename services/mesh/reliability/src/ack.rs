//! Acknowledgements awaited for sent packets.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A transmitted packet awaiting its routing reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    /// Destination of the packet
    pub dest: u32,
    /// Transmit time
    pub sent_at: Instant,
}

/// In-flight acknowledgements keyed by packet id
#[derive(Debug)]
pub struct AckTracker {
    pending: HashMap<u32, PendingAck>,
    timeout: Duration,
}

impl AckTracker {
    /// Create a tracker expiring entries after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Start waiting for the reply to `msg_id`
    pub fn register(&mut self, msg_id: u32, dest: u32, now: Instant) {
        debug!("Awaiting ack for msg_id={} from {:#010x}", msg_id, dest);
        self.pending.insert(msg_id, PendingAck { dest, sent_at: now });
    }

    /// Take the entry answered by `request_id`.
    /// Returns `None` when nothing (or nothing anymore) is pending.
    pub fn resolve(&mut self, request_id: u32) -> Option<PendingAck> {
        self.pending.remove(&request_id)
    }

    /// The entry awaiting `msg_id`, if any
    pub fn get(&self, msg_id: u32) -> Option<&PendingAck> {
        self.pending.get(&msg_id)
    }

    /// Whether `msg_id` is still awaited
    pub fn is_pending(&self, msg_id: u32) -> bool {
        self.pending.contains_key(&msg_id)
    }

    /// Remove and return every entry older than the timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<(u32, PendingAck)> {
        let timeout = self.timeout;
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, ack)| now.saturating_duration_since(ack.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(ack) = self.pending.remove(&id) {
                info!("Ack timeout for msg_id={} to {:#010x}", id, ack.dest);
                out.push((id, ack));
            }
        }
        out.sort_unstable_by_key(|(_, ack)| ack.sent_at);
        out
    }

    /// Entries still awaited
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is awaited
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_once() {
        let mut tracker = AckTracker::new(Duration::from_secs(60));
        let now = Instant::now();
        tracker.register(7, 0xB0B, now);
        assert!(tracker.is_pending(7));
        assert_eq!(tracker.get(7).map(|ack| ack.dest), Some(0xB0B));
        assert!(tracker.get(8).is_none());

        let ack = tracker.resolve(7).unwrap();
        assert_eq!(ack.dest, 0xB0B);
        assert!(tracker.resolve(7).is_none());
        // resolved entries never time out
        assert!(tracker.sweep(now + Duration::from_secs(120)).is_empty());
    }

    #[test]
    fn test_sweep_expires_once() {
        let mut tracker = AckTracker::new(Duration::from_secs(60));
        let t0 = Instant::now();
        tracker.register(1, 0xB0B, t0);
        tracker.register(2, 0xB0B, t0 + Duration::from_secs(30));

        assert!(tracker.sweep(t0 + Duration::from_secs(59)).is_empty());
        let expired = tracker.sweep(t0 + Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, 1);

        // a late reply finds nothing
        assert!(tracker.resolve(1).is_none());
        assert!(tracker.sweep(t0 + Duration::from_secs(60)).is_empty());
        assert_eq!(tracker.len(), 1);
    }
}
