//! Persistence for the LoRa mesh: a namespaced key/value store with
//! pluggable backends, the peer key record format and the dedup filter.
//!
//! The engine persists two things: its own key pair and the table of peer
//! public keys. Both go through the [`KeyStore`] trait so the node can run
//! against memory (tests, ephemeral nodes) or a data directory.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod dedup;
pub mod records;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Namespace holding the local key pair
pub const KEYS_NAMESPACE: &str = "keys";
/// Key of the public half
pub const PUBLIC_KEY: &str = "public";
/// Key of the private half
pub const PRIVATE_KEY: &str = "private";
/// Namespace holding the peer key table
pub const PEERS_NAMESPACE: &str = "peers";
/// Key of the peer key table record
pub const PEER_TABLE_KEY: &str = "table";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
}

/// Namespaced blob store
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Read a value; `None` when it was never written
    async fn load(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a value, replacing any previous one
    async fn store(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a value; deleting a missing value is not an error
    async fn remove(&self, namespace: &str, key: &str) -> Result<(), StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// One file per value under a data directory
    File {
        /// Data directory path
        data_dir: PathBuf,
    },
}

// Re-export backend implementations
pub use backend::file::FileStore;
pub use backend::mem::MemoryStore;
pub use dedup::{Dedup, RecentPackets, DEFAULT_DEDUP_CAPACITY};
pub use records::{decode_peer_table, encode_peer_table, PeerRecord, PeerTableBlob};

/// Open the store selected by `mode`
pub async fn open_store(mode: StorageMode) -> Result<Arc<dyn KeyStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Arc::new(MemoryStore::new())),
        StorageMode::File { data_dir } => Ok(Arc::new(FileStore::open(data_dir).await?)),
    }
}

/// Reject names that would escape a namespace directory
pub(crate) fn validate_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::Invalid(format!("bad storage name {:?}", name)))
    }
}
