//! # Mesh Crypto
//!
//! Packet security for the LoRa mesh.
//!
//! - **Channel security**: AES-CTR under a pre-shared channel key, for
//!   broadcast and channel traffic
//! - **Peer security**: X25519 + AES-256-CCM between two nodes, for direct
//!   messages
//! - **Peer key table**: bounded store of the peers' public keys
//!
//! ## Example
//!
//! ```rust
//! use mesh_crypto::{KeyPair, PeerKeyTable, PeerSecurity};
//!
//! let alice = KeyPair::generate();
//! let bob = KeyPair::generate();
//!
//! let mut peers = PeerKeyTable::default();
//! peers.save(0xB0B, bob.public_key(), 0);
//! let alice = PeerSecurity::new(0xA11CE, alice, peers);
//!
//! let sealed = alice.encrypt(0xB0B, 1, b"hello").unwrap();
//! assert_eq!(sealed.len(), 5 + mesh_crypto::PKI_OVERHEAD);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod error;
pub mod peers;
pub mod pki;

pub use channel::{
    channel_hash, derive_key, xor_hash, ChannelKey, ChannelSet, DEFAULT_PSK, PRIMARY_INDEX,
    SECONDARY_INDEX,
};
pub use error::CryptoError;
pub use peers::{KeyChange, PeerKeyEntry, PeerKeyTable, DEFAULT_PEER_CAPACITY};
pub use pki::{fingerprint, is_valid_private_key, open, seal, KeyPair, PeerSecurity, PKI_OVERHEAD};

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
