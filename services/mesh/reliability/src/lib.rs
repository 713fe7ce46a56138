//! Reliable delivery for the LoRa mesh.
//!
//! Outgoing packets go through a strict FIFO [`DeliveryQueue`] with one
//! message in flight at a time and a bounded number of retries. Packets that
//! want an acknowledgement are then tracked by the [`AckTracker`] until a
//! routing reply arrives or the acknowledgement times out.
//!
//! Both types take the current time as an argument and never read a clock,
//! so the engine decides what "now" means.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod queue;

use std::time::Duration;
use thiserror::Error;

pub use ack::{AckTracker, PendingAck};
pub use queue::{DeliveryQueue, FailOutcome, PendingSend};

/// Delivery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outgoing queue is full
    #[error("send queue full ({0} messages)")]
    QueueFull(usize),
}

/// Retry and timeout settings
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Failed attempts tolerated before a message is dropped
    pub max_retries: u32,
    /// Minimum time between two attempts of the same message
    pub retry_delay: Duration,
    /// How long an acknowledgement is awaited
    pub ack_timeout: Duration,
    /// Maximum number of queued messages
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(60),
            queue_capacity: 16,
        }
    }
}
