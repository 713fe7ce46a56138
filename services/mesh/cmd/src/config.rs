//! Configuration handling for the mesh node.
//!
//! Settings come from the `services.mesh` section of a YAML file, then
//! `MESH_*` environment variables, then command line flags (applied in
//! `main`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use mesh_node::{EngineLimits, NodeSettings, PipelineConfig};
use mesh_storage::StorageMode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Where keys and the peer table live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `memory` or `file`
    pub mode: String,
    /// Directory for `file` mode
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: "file".to_string(),
            data_dir: PathBuf::from("./meshdata"),
        }
    }
}

impl StorageConfig {
    pub fn storage_mode(&self) -> Result<StorageMode> {
        match self.mode.as_str() {
            "memory" => Ok(StorageMode::InMemory),
            "file" => Ok(StorageMode::File {
                data_dir: self.data_dir.clone(),
            }),
            other => bail!("Invalid storage mode: {}. Use 'memory' or 'file'", other),
        }
    }
}

/// Simulated air: a UDP socket and the peers that hear it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Local bind address
    pub bind: SocketAddr,
    /// Every frame is sent to each of these
    pub peers: Vec<SocketAddr>,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4403)),
            peers: Vec::new(),
        }
    }
}

/// Mesh node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeSettings,
    pub limits: EngineLimits,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub radio: RadioConfig,
}

#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    mesh: Option<MeshConfig>,
}

impl MeshConfig {
    /// Load from `config_path` (defaults when missing), then apply the
    /// environment
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.services.and_then(|s| s.mesh).unwrap_or_default()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path))
            }
        };

        config.apply_environment_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply `MESH_*` overrides read through `lookup`
    pub fn apply_environment_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(value) = lookup("MESH_NODE_ID") {
            self.node.node_id = parse_node_id(&value)?;
            info!("Node ID overridden by environment: {}", value);
        }
        if let Some(value) = lookup("MESH_LONG_NAME") {
            self.node.long_name = value;
        }
        if let Some(value) = lookup("MESH_SHORT_NAME") {
            self.node.short_name = value;
        }
        if let Some(value) = lookup("MESH_HOP_LIMIT") {
            self.node.hop_limit = value
                .parse()
                .with_context(|| format!("MESH_HOP_LIMIT={:?}", value))?;
        }
        if let Some(value) = lookup("MESH_CHANNEL") {
            self.node.primary.name = value;
        }
        if let Some(value) = lookup("MESH_PSK") {
            self.node.primary.psk = parse_hex(&value)?;
            info!("Primary channel key overridden by environment");
        }
        if let Some(value) = lookup("MESH_STORAGE_MODE") {
            self.storage.mode = value;
        }
        if let Some(value) = lookup("MESH_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("MESH_BIND") {
            self.radio.bind = value
                .parse()
                .with_context(|| format!("MESH_BIND={:?}", value))?;
            info!("Radio bind address overridden by environment: {}", self.radio.bind);
        }
        if let Some(value) = lookup("MESH_PEERS") {
            self.radio.peers = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse().with_context(|| format!("MESH_PEERS entry {:?}", s)))
                .collect::<Result<_>>()?;
        }
        Ok(())
    }
}

/// Node id as `!aabbccdd`, `0xaabbccdd` or decimal
pub fn parse_node_id(value: &str) -> Result<u32> {
    let value = value.trim();
    let parsed = if let Some(hex) = value.strip_prefix('!') {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = value.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.with_context(|| format!("Invalid node id {:?}", value))
}

/// Channel key as hex digits
pub fn parse_hex(value: &str) -> Result<Vec<u8>> {
    let value = value.trim();
    if value.len() % 2 != 0 {
        bail!("Hex key must have an even number of digits");
    }
    (0..value.len())
        .step_by(2)
        .map(|i| {
            value
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .with_context(|| format!("Invalid hex key {:?}", value))
        })
        .collect()
}
