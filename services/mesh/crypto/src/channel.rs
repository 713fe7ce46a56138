//! Channel (pre-shared key) security.
//!
//! Broadcast traffic is protected by a key every member of a channel shares.
//! On air a channel is identified only by a one-byte hash of its name and
//! key, which collides easily; receivers therefore try every channel whose
//! hash matches until the payload decodes.

use aes::{Aes128, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use tracing::debug;

use crate::CryptoError;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Built-in key used when a channel has no key configured
pub const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69,
    0x01,
];

/// Longest supported key
pub const MAX_PSK_LEN: usize = 32;

/// Index of the primary channel
pub const PRIMARY_INDEX: usize = 0;

/// Index of the secondary channel
pub const SECONDARY_INDEX: usize = 1;

/// XOR every byte of `bytes` into one accumulator
pub fn xor_hash(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// One-byte wire identifier of a channel
pub fn channel_hash(name: &str, psk: &[u8]) -> u8 {
    xor_hash(name.as_bytes()) ^ xor_hash(psk)
}

/// Expand the configured key into usable AES key material.
///
/// An empty or all-zero key selects the default key. A single nonzero byte
/// `k` selects the default key with `k - 1` added to its last byte. Anything
/// else is used verbatim, zero-padded up to 16 or 32 bytes.
pub fn derive_key(configured: &[u8]) -> Vec<u8> {
    if configured.iter().all(|b| *b == 0) {
        return default_key(1);
    }
    if configured.len() == 1 {
        return default_key(configured[0]);
    }

    let mut psk = configured[..configured.len().min(MAX_PSK_LEN)].to_vec();
    let target = if psk.len() <= 16 { 16 } else { MAX_PSK_LEN };
    psk.resize(target, 0);
    psk
}

fn default_key(index: u8) -> Vec<u8> {
    let mut psk = DEFAULT_PSK.to_vec();
    let last = psk.len() - 1;
    psk[last] = psk[last].wrapping_add(index.wrapping_sub(1));
    psk
}

/// Initial counter block: packet id (u64 LE), sender (u32 LE), zero
fn counter_block(from: u32, packet_id: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
    iv[8..12].copy_from_slice(&from.to_le_bytes());
    iv
}

/// Key material and wire hash of one channel
#[derive(Clone, PartialEq, Eq)]
pub struct ChannelKey {
    name: String,
    psk: Vec<u8>,
    hash: u8,
}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey")
            .field("name", &self.name)
            .field("psk_len", &self.psk.len())
            .field("hash", &self.hash)
            .finish()
    }
}

impl ChannelKey {
    /// Derive a channel from its name and configured key
    pub fn new(name: &str, configured: &[u8]) -> Self {
        let psk = derive_key(configured);
        let hash = channel_hash(name, &psk);
        Self {
            name: name.to_string(),
            psk,
            hash,
        }
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Expanded key
    pub fn psk(&self) -> &[u8] {
        &self.psk
    }

    /// Wire hash
    pub fn hash(&self) -> u8 {
        self.hash
    }

    /// Encrypt or decrypt `buf` in place (CTR mode is symmetric)
    pub fn apply(&self, from: u32, packet_id: u32, buf: &mut [u8]) -> Result<(), CryptoError> {
        let iv = counter_block(from, packet_id);
        match self.psk.len() {
            16 => Aes128Ctr::new_from_slices(&self.psk, &iv)
                .map_err(|_| CryptoError::KeyLength(self.psk.len()))?
                .apply_keystream(buf),
            32 => Aes256Ctr::new_from_slices(&self.psk, &iv)
                .map_err(|_| CryptoError::KeyLength(self.psk.len()))?
                .apply_keystream(buf),
            n => return Err(CryptoError::KeyLength(n)),
        }
        Ok(())
    }
}

/// The primary and optional secondary channel
#[derive(Debug, Clone)]
pub struct ChannelSet {
    channels: Vec<ChannelKey>,
}

impl ChannelSet {
    /// Build the set; the primary is always present
    pub fn new(primary: ChannelKey, secondary: Option<ChannelKey>) -> Self {
        let mut channels = vec![primary];
        if let Some(secondary) = secondary {
            channels.push(secondary);
        }
        debug!(
            "Channel set: {}",
            channels
                .iter()
                .map(|c| format!("{}=0x{:02x}", c.name, c.hash))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self { channels }
    }

    /// Channel by index (`PRIMARY_INDEX` or `SECONDARY_INDEX`)
    pub fn get(&self, index: usize) -> Option<&ChannelKey> {
        self.channels.get(index)
    }

    /// Every channel whose hash matches, in index order
    pub fn candidates(&self, hash: u8) -> impl Iterator<Item = (usize, &ChannelKey)> {
        self.channels
            .iter()
            .enumerate()
            .filter(move |(_, c)| c.hash == hash)
    }

    /// Number of configured channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Always false; the primary channel exists
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
