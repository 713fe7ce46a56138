//! Strict FIFO outgoing queue with one message in flight.

use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};

use crate::{DeliveryConfig, DeliveryError};

/// A message waiting to be transmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    /// Packet id, unique per sender
    pub msg_id: u32,
    /// Destination node (broadcast allowed)
    pub dest: u32,
    /// Channel index used for channel encryption
    pub channel: usize,
    /// Application port
    pub portnum: u32,
    /// Encoded application payload
    pub payload: Vec<u8>,
    /// Ask the destination for a routing acknowledgement
    pub want_ack: bool,
    /// Ask the destination for an application reply
    pub want_response: bool,
    /// Packet id this message answers, zero if none
    pub request_id: u32,
    /// Must be sent with peer security; never falls back to the channel key
    pub require_pki: bool,
    /// Always sent with the channel key, even when the peer key is known
    pub channel_only: bool,
    /// Generated by the engine itself; no send result is reported
    pub internal: bool,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Time of the last failed attempt
    pub last_attempt: Option<Instant>,
}

impl PendingSend {
    /// New message with no flags set
    pub fn new(msg_id: u32, dest: u32, channel: usize, portnum: u32, payload: Vec<u8>) -> Self {
        Self {
            msg_id,
            dest,
            channel,
            portnum,
            payload,
            want_ack: false,
            want_response: false,
            request_id: 0,
            require_pki: false,
            channel_only: false,
            internal: false,
            retry_count: 0,
            last_attempt: None,
        }
    }
}

/// Result of a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Stays at the head; retried after the delay
    Retry {
        /// Failed attempts so far
        retry_count: u32,
    },
    /// Gave up; removed from the queue
    Dropped(PendingSend),
}

/// Outgoing FIFO
#[derive(Debug)]
pub struct DeliveryQueue {
    pending: VecDeque<PendingSend>,
    config: DeliveryConfig,
}

impl DeliveryQueue {
    /// Create an empty queue
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            pending: VecDeque::with_capacity(config.queue_capacity),
            config,
        }
    }

    /// Append a message at the tail
    pub fn enqueue(&mut self, send: PendingSend) -> Result<(), DeliveryError> {
        if self.pending.len() >= self.config.queue_capacity {
            return Err(DeliveryError::QueueFull(self.pending.len()));
        }
        debug!(
            "Queued msg_id={} dest={:#010x} portnum={} depth={}",
            send.msg_id,
            send.dest,
            send.portnum,
            self.pending.len() + 1
        );
        self.pending.push_back(send);
        Ok(())
    }

    /// The head, if it may be attempted at `now`.
    /// A head that failed before waits out the retry delay.
    pub fn ready(&self, now: Instant) -> Option<&PendingSend> {
        let head = self.pending.front()?;
        match head.last_attempt {
            Some(at) if now.saturating_duration_since(at) < self.config.retry_delay => None,
            _ => Some(head),
        }
    }

    /// The head succeeded; remove and return it
    pub fn complete(&mut self) -> Option<PendingSend> {
        self.pending.pop_front()
    }

    /// The head failed at `now`
    pub fn fail(&mut self, now: Instant) -> Option<FailOutcome> {
        let head = self.pending.front_mut()?;
        head.retry_count += 1;
        head.last_attempt = Some(now);

        if head.retry_count > self.config.max_retries {
            let dropped = self.pending.pop_front()?;
            warn!(
                "Dropping msg_id={} to {:#010x} after {} failed attempts",
                dropped.msg_id, dropped.dest, dropped.retry_count
            );
            return Some(FailOutcome::Dropped(dropped));
        }

        debug!(
            "msg_id={} failed (attempt {}/{})",
            head.msg_id, head.retry_count, self.config.max_retries
        );
        Some(FailOutcome::Retry {
            retry_count: head.retry_count,
        })
    }

    /// Queued messages
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Settings in use
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(max_retries: u32) -> DeliveryQueue {
        DeliveryQueue::new(DeliveryConfig {
            max_retries,
            retry_delay: Duration::from_secs(5),
            ..Default::default()
        })
    }

    fn send(msg_id: u32) -> PendingSend {
        PendingSend::new(msg_id, 0xB0B, 0, 1, b"hi".to_vec())
    }

    #[test]
    fn test_fifo_order() {
        let mut q = queue(3);
        q.enqueue(send(1)).unwrap();
        q.enqueue(send(2)).unwrap();
        let now = Instant::now();
        assert_eq!(q.ready(now).unwrap().msg_id, 1);
        assert_eq!(q.complete().unwrap().msg_id, 1);
        // the next head is available in the same tick
        assert_eq!(q.ready(now).unwrap().msg_id, 2);
    }

    #[test]
    fn test_retry_waits_for_delay() {
        let mut q = queue(3);
        q.enqueue(send(1)).unwrap();
        q.enqueue(send(2)).unwrap();
        let t0 = Instant::now();

        assert_eq!(q.fail(t0), Some(FailOutcome::Retry { retry_count: 1 }));
        // no head-of-line bypass while waiting
        assert!(q.ready(t0 + Duration::from_secs(4)).is_none());
        assert_eq!(q.ready(t0 + Duration::from_secs(5)).unwrap().msg_id, 1);
    }

    #[test]
    fn test_success_on_later_attempt_removes() {
        let mut q = queue(3);
        q.enqueue(send(1)).unwrap();
        let t0 = Instant::now();
        q.fail(t0);
        q.fail(t0 + Duration::from_secs(5));
        let done = q.complete().unwrap();
        assert_eq!(done.retry_count, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_dropped_after_max_retries() {
        let mut q = queue(2);
        q.enqueue(send(1)).unwrap();
        q.enqueue(send(2)).unwrap();
        let mut now = Instant::now();

        assert!(matches!(q.fail(now), Some(FailOutcome::Retry { .. })));
        now += Duration::from_secs(5);
        assert!(matches!(q.fail(now), Some(FailOutcome::Retry { .. })));
        now += Duration::from_secs(5);
        match q.fail(now) {
            Some(FailOutcome::Dropped(dropped)) => {
                assert_eq!(dropped.msg_id, 1);
                assert_eq!(dropped.retry_count, 3);
            }
            other => panic!("expected drop, got {:?}", other),
        }
        // never retried; the next message is up without waiting
        assert_eq!(q.ready(now).unwrap().msg_id, 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let mut q = DeliveryQueue::new(DeliveryConfig {
            queue_capacity: 1,
            ..Default::default()
        });
        q.enqueue(send(1)).unwrap();
        assert_eq!(q.enqueue(send(2)), Err(DeliveryError::QueueFull(1)));
        assert!(q.fail(Instant::now()).is_some());
        assert!(queue(1).fail(Instant::now()).is_none());
    }
}
