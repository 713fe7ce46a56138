//! Persisted peer key table.
//!
//! Current format (little-endian):
//!
//! ```text
//! version u8 = 2 | count u16 | count x { node_id u32, last_seen u32, key [32] } | crc32 u32
//! ```
//!
//! The CRC covers every byte before it. Older firmware wrote a bare
//! `n x { node_id u32, key [32] }` array; it is still read and reported as
//! legacy so the caller can rewrite it in the current format.

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use tracing::warn;

use crate::StorageError;

/// Current record version
pub const PEER_TABLE_VERSION: u8 = 2;

const HEADER_LEN: usize = 1 + 2;
const CRC_LEN: usize = 4;
const ENTRY_LEN: usize = 4 + 4 + 32;
const LEGACY_ENTRY_LEN: usize = 4 + 32;

/// One persisted peer key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    /// Node id
    pub node_id: u32,
    /// Last use (Unix seconds); zero for migrated entries
    pub last_seen: u32,
    /// X25519 public key
    pub public_key: [u8; 32],
}

/// Decoded peer table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerTableBlob {
    /// Entries in stored order
    pub records: Vec<PeerRecord>,
    /// Read from the unversioned layout; should be rewritten
    pub legacy: bool,
}

/// Serialize the peer table in the current format
pub fn encode_peer_table(records: &[PeerRecord]) -> Result<Vec<u8>, StorageError> {
    let count = u16::try_from(records.len())
        .map_err(|_| StorageError::Invalid(format!("{} peer records", records.len())))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + records.len() * ENTRY_LEN + CRC_LEN);
    buf.put_u8(PEER_TABLE_VERSION);
    buf.put_u16_le(count);
    for record in records {
        buf.put_u32_le(record.node_id);
        buf.put_u32_le(record.last_seen);
        buf.put_slice(&record.public_key);
    }
    let crc = compute_crc(&buf);
    buf.put_u32_le(crc);
    Ok(buf.to_vec())
}

/// Parse a stored peer table in either layout
pub fn decode_peer_table(bytes: &[u8]) -> Result<PeerTableBlob, StorageError> {
    if bytes.is_empty() {
        return Ok(PeerTableBlob::default());
    }
    if let Some(records) = decode_versioned(bytes)? {
        return Ok(PeerTableBlob {
            records,
            legacy: false,
        });
    }
    if bytes.len() % LEGACY_ENTRY_LEN == 0 {
        warn!(
            "Migrating legacy peer table ({} entries)",
            bytes.len() / LEGACY_ENTRY_LEN
        );
        return Ok(PeerTableBlob {
            records: decode_legacy(bytes),
            legacy: true,
        });
    }
    Err(StorageError::Corruption(format!(
        "peer table of {} bytes matches no known layout",
        bytes.len()
    )))
}

/// `Ok(None)` when the bytes are not a versioned record at all
fn decode_versioned(bytes: &[u8]) -> Result<Option<Vec<PeerRecord>>, StorageError> {
    if bytes.len() < HEADER_LEN + CRC_LEN || bytes[0] != PEER_TABLE_VERSION {
        return Ok(None);
    }
    let mut header = &bytes[1..HEADER_LEN];
    let count = header.get_u16_le() as usize;
    if bytes.len() != HEADER_LEN + count * ENTRY_LEN + CRC_LEN {
        return Ok(None);
    }

    let (body, mut trailer) = bytes.split_at(bytes.len() - CRC_LEN);
    let stored = trailer.get_u32_le();
    let computed = compute_crc(body);
    if stored != computed {
        if bytes.len() % LEGACY_ENTRY_LEN == 0 {
            // a legacy array that happens to look versioned
            return Ok(None);
        }
        return Err(StorageError::Corruption(format!(
            "peer table CRC mismatch: stored {:#010x}, computed {:#010x}",
            stored, computed
        )));
    }

    let mut buf = &body[HEADER_LEN..];
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let node_id = buf.get_u32_le();
        let last_seen = buf.get_u32_le();
        let mut public_key = [0u8; 32];
        buf.copy_to_slice(&mut public_key);
        records.push(PeerRecord {
            node_id,
            last_seen,
            public_key,
        });
    }
    Ok(Some(records))
}

fn decode_legacy(mut buf: &[u8]) -> Vec<PeerRecord> {
    let mut records = Vec::with_capacity(buf.len() / LEGACY_ENTRY_LEN);
    while buf.remaining() >= LEGACY_ENTRY_LEN {
        let node_id = buf.get_u32_le();
        let mut public_key = [0u8; 32];
        buf.copy_to_slice(&mut public_key);
        records.push(PeerRecord {
            node_id,
            last_seen: 0,
            public_key,
        });
    }
    records
}

fn compute_crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}
