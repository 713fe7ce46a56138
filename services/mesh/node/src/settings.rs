//! Node, engine and pipeline settings.

use mesh_crypto::DEFAULT_PEER_CAPACITY;
use mesh_reliability::DeliveryConfig;
use mesh_storage::DEFAULT_DEDUP_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::NodeError;

/// One channel as configured by the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Channel name (part of the channel hash)
    pub name: String,
    /// Key bytes; empty or `[1]` for the default key, `[k]` for default key `k`
    #[serde(default)]
    pub psk: Vec<u8>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            name: "LongFast".to_string(),
            psk: vec![1],
        }
    }
}

/// Identity and radio-facing settings; can change at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Node id; zero derives it from the public key
    pub node_id: u32,
    /// Long name announced in identity messages
    pub long_name: String,
    /// Short name announced in identity messages
    pub short_name: String,
    /// Hardware model code announced in identity messages
    pub hw_model: i32,
    /// Hop limit of originated packets (0..=7)
    pub hop_limit: u8,
    /// Primary channel
    pub primary: ChannelSettings,
    /// Optional secondary channel
    pub secondary: Option<ChannelSettings>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            node_id: 0,
            long_name: "LoRa Mesh Node".to_string(),
            short_name: "MESH".to_string(),
            hw_model: 0,
            hop_limit: 3,
            primary: ChannelSettings::default(),
            secondary: None,
        }
    }
}

impl NodeSettings {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.hop_limit > 7 {
            return Err(NodeError::InvalidConfig(format!(
                "hop_limit {} exceeds 7",
                self.hop_limit
            )));
        }
        if self.node_id == mesh_wire::BROADCAST_ADDR {
            return Err(NodeError::InvalidConfig(
                "node_id cannot be the broadcast address".to_string(),
            ));
        }
        let channels = std::iter::once(&self.primary).chain(self.secondary.iter());
        for channel in channels {
            if channel.name.is_empty() {
                return Err(NodeError::InvalidConfig("empty channel name".to_string()));
            }
            if channel.psk.len() > mesh_crypto::channel::MAX_PSK_LEN {
                return Err(NodeError::InvalidConfig(format!(
                    "channel {} key longer than 32 bytes",
                    channel.name
                )));
            }
        }
        Ok(())
    }
}

/// Capacities and timings of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Outgoing queue depth
    pub queue_capacity: usize,
    /// Remembered `(origin, id)` pairs
    pub dedup_capacity: usize,
    /// Remembered peer keys
    pub peer_capacity: usize,
    /// Failed attempts before a message is dropped
    pub max_retries: u32,
    /// Seconds between attempts of the same message
    pub retry_delay_secs: u64,
    /// Seconds an acknowledgement is awaited
    pub ack_timeout_secs: u64,
    /// Seconds between identity broadcasts
    pub identity_interval_secs: u64,
    /// Minimum seconds between identities sent to one peer
    pub identity_throttle_secs: u64,
    /// Seconds of inactivity that abandon a verification
    pub verify_timeout_secs: u64,
}

impl Default for EngineLimits {
    fn default() -> Self {
        let delivery = DeliveryConfig::default();
        Self {
            queue_capacity: delivery.queue_capacity,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            peer_capacity: DEFAULT_PEER_CAPACITY,
            max_retries: delivery.max_retries,
            retry_delay_secs: delivery.retry_delay.as_secs(),
            ack_timeout_secs: delivery.ack_timeout.as_secs(),
            identity_interval_secs: 15 * 60,
            identity_throttle_secs: 30,
            verify_timeout_secs: mesh_verify::SESSION_TIMEOUT.as_secs(),
        }
    }
}

impl EngineLimits {
    /// Delivery queue and ack tracker settings
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_retries: self.max_retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            queue_capacity: self.queue_capacity,
        }
    }

    /// Identity broadcast period
    pub fn identity_interval(&self) -> Duration {
        Duration::from_secs(self.identity_interval_secs)
    }

    /// Directed identity throttle
    pub fn identity_throttle(&self) -> Duration {
        Duration::from_secs(self.identity_throttle_secs)
    }

    /// Verification inactivity timeout
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

/// Task pipeline settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames buffered between the radio and mesh tasks
    pub inbound_queue_depth: usize,
    /// Milliseconds the radio task waits for room before dropping a frame
    pub inbound_push_timeout_ms: u64,
    /// Milliseconds between mesh task cycles
    pub tick_interval_ms: u64,
    /// Milliseconds between radio polls when idle
    pub radio_poll_interval_ms: u64,
    /// Commands buffered towards the mesh task
    pub command_queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inbound_queue_depth: 16,
            inbound_push_timeout_ms: 100,
            tick_interval_ms: 50,
            radio_poll_interval_ms: 10,
            command_queue_depth: 32,
        }
    }
}

impl PipelineConfig {
    /// Radio task push timeout
    pub fn inbound_push_timeout(&self) -> Duration {
        Duration::from_millis(self.inbound_push_timeout_ms)
    }

    /// Mesh task cycle
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Idle radio poll period
    pub fn radio_poll_interval(&self) -> Duration {
        Duration::from_millis(self.radio_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(NodeSettings::default().validate().is_ok());
        let limits = EngineLimits::default();
        assert_eq!(limits.delivery().max_retries, 3);
        assert_eq!(limits.identity_throttle(), Duration::from_secs(30));
        assert_eq!(limits.verify_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_settings() {
        let mut settings = NodeSettings {
            hop_limit: 8,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        settings.hop_limit = 3;
        settings.secondary = Some(ChannelSettings {
            name: "admin".to_string(),
            psk: vec![0; 33],
        });
        assert!(matches!(
            settings.validate(),
            Err(NodeError::InvalidConfig(_))
        ));
    }
}
