//! Peer (public key) security for direct messages.
//!
//! Direct packets are encrypted with AES-256-CCM under a key derived from an
//! X25519 exchange between the two nodes' long-term keys. The 13-byte CCM
//! nonce is built from the packet id and the sender id, with 32 bits of
//! randomness carried in clear after the tag:
//!
//! ```text
//! +------------------+--------+-------------------+
//! | ciphertext (n B) | tag 8B | extra nonce 4B LE |
//! +------------------+--------+-------------------+
//! ```

use aes::Aes256;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U13, U8};
use ccm::Ccm;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::peers::PeerKeyTable;
use crate::CryptoError;

type PkiCipher = Ccm<Aes256, U8, U13>;

/// Key length of both halves of the key pair
pub const KEY_LEN: usize = 32;

/// Bytes added to a plaintext: 8-byte tag + 4-byte nonce extension
pub const PKI_OVERHEAD: usize = 12;

const TAG_LEN: usize = 8;
const EXTRA_NONCE_LEN: usize = 4;

/// Whether stored bytes can be used as a private key
pub fn is_valid_private_key(bytes: &[u8]) -> bool {
    bytes.len() == KEY_LEN && bytes.iter().any(|b| *b != 0)
}

/// This node's long-term X25519 key pair
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &fingerprint(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild the key pair from a stored private key
    pub fn from_private(bytes: &[u8]) -> Result<Self, CryptoError> {
        if !is_valid_private_key(bytes) {
            return Err(CryptoError::InvalidPrivateKey);
        }
        let mut raw = [0u8; KEY_LEN];
        raw.copy_from_slice(bytes);
        let secret = StaticSecret::from(raw);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public half
    pub fn public_key(&self) -> [u8; KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Private half, for persistence only
    pub fn private_key(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    /// AES-256 session key shared with the owner of `peer_public`
    pub fn session_key(&self, peer_public: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        // hashed in two 16-byte blocks on constrained targets; same digest
        let mut hasher = Sha256::new();
        for block in shared.as_bytes().chunks(16) {
            hasher.update(block);
        }
        hasher.finalize().into()
    }
}

/// Short hex fingerprint for logs
pub fn fingerprint(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn ccm_nonce(from: u32, packet_id: u32, extra_nonce: u32) -> [u8; 13] {
    let mut nonce = [0u8; 16];
    nonce[0..8].copy_from_slice(&u64::from(packet_id).to_le_bytes());
    nonce[8..12].copy_from_slice(&from.to_le_bytes());
    if extra_nonce != 0 {
        // overlaps the upper half of the packet id field on purpose
        nonce[4..8].copy_from_slice(&extra_nonce.to_le_bytes());
    }
    let mut out = [0u8; 13];
    out.copy_from_slice(&nonce[..13]);
    out
}

/// Encrypt with an explicit nonce extension
pub fn seal(
    session_key: &[u8; KEY_LEN],
    from: u32,
    packet_id: u32,
    extra_nonce: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = PkiCipher::new(GenericArray::from_slice(session_key));
    let nonce = ccm_nonce(from, packet_id, extra_nonce);
    let mut sealed = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    sealed.extend_from_slice(&extra_nonce.to_le_bytes());
    Ok(sealed)
}

/// Decrypt and authenticate; returns the plaintext and the nonce extension
pub fn open(
    session_key: &[u8; KEY_LEN],
    from: u32,
    packet_id: u32,
    sealed: &[u8],
) -> Result<(Vec<u8>, u32), CryptoError> {
    if sealed.len() <= PKI_OVERHEAD {
        return Err(CryptoError::TooShort(sealed.len()));
    }
    let (body, extra) = sealed.split_at(sealed.len() - EXTRA_NONCE_LEN);
    let mut extra_bytes = [0u8; EXTRA_NONCE_LEN];
    extra_bytes.copy_from_slice(extra);
    let extra_nonce = u32::from_le_bytes(extra_bytes);

    let cipher = PkiCipher::new(GenericArray::from_slice(session_key));
    let nonce = ccm_nonce(from, packet_id, extra_nonce);
    let plaintext = cipher
        .decrypt(GenericArray::from_slice(&nonce), body)
        .map_err(|_| CryptoError::Auth)?;
    debug_assert_eq!(body.len() - TAG_LEN, plaintext.len());
    Ok((plaintext, extra_nonce))
}

/// Local key pair plus the known peer keys
#[derive(Debug)]
pub struct PeerSecurity {
    node_id: u32,
    keys: KeyPair,
    peers: PeerKeyTable,
}

impl PeerSecurity {
    /// Create from this node's id, key pair and loaded peer table
    pub fn new(node_id: u32, keys: KeyPair, peers: PeerKeyTable) -> Self {
        Self {
            node_id,
            keys,
            peers,
        }
    }

    /// This node's public key
    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.keys.public_key()
    }

    /// Local key pair
    pub fn key_pair(&self) -> &KeyPair {
        &self.keys
    }

    /// Known peer keys
    pub fn peers(&self) -> &PeerKeyTable {
        &self.peers
    }

    /// Known peer keys, mutable
    pub fn peers_mut(&mut self) -> &mut PeerKeyTable {
        &mut self.peers
    }

    /// Whether a key for `node_id` is known
    pub fn has_key(&self, node_id: u32) -> bool {
        self.peers.get(node_id).is_some()
    }

    /// Encrypt a direct packet for `dest`
    pub fn encrypt(&self, dest: u32, packet_id: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let peer_key = self.peers.get(dest).ok_or(CryptoError::UnknownPeer(dest))?;
        let session_key = self.keys.session_key(peer_key);
        let extra_nonce = OsRng.next_u32();
        trace!(
            "PKI encrypt to {:#010x} id={} len={}",
            dest,
            packet_id,
            plaintext.len()
        );
        seal(&session_key, self.node_id, packet_id, extra_nonce, plaintext)
    }

    /// Decrypt a direct packet from `from`, failing closed
    pub fn decrypt(&self, from: u32, packet_id: u32, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() <= PKI_OVERHEAD {
            return Err(CryptoError::TooShort(sealed.len()));
        }
        let peer_key = self.peers.get(from).ok_or(CryptoError::UnknownPeer(from))?;
        let session_key = self.keys.session_key(peer_key);
        let (plaintext, _) = open(&session_key, from, packet_id, sealed).map_err(|e| {
            debug!(
                "PKI auth failed from {:#010x} id={} tag={}",
                from,
                packet_id,
                fingerprint(&sealed[sealed.len() - PKI_OVERHEAD..])
            );
            e
        })?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (PeerSecurity, PeerSecurity) {
        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        let mut alice_peers = PeerKeyTable::new(8);
        alice_peers.save(0xB0B, bob_keys.public_key(), 1);
        let mut bob_peers = PeerKeyTable::new(8);
        bob_peers.save(0xA11CE, alice_keys.public_key(), 1);
        (
            PeerSecurity::new(0xA11CE, alice_keys, alice_peers),
            PeerSecurity::new(0xB0B, bob_keys, bob_peers),
        )
    }

    #[test]
    fn test_session_key_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(
            a.session_key(&b.public_key()),
            b.session_key(&a.public_key())
        );
    }

    #[test]
    fn test_session_key_is_sha256_of_shared_secret() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let shared = a
            .secret
            .diffie_hellman(&PublicKey::from(b.public_key()));
        let expected: [u8; 32] = Sha256::digest(shared.as_bytes()).into();
        assert_eq!(a.session_key(&b.public_key()), expected);
    }

    #[test]
    fn test_roundtrip_all_lengths() {
        let (alice, bob) = pair();
        for len in 1..=200usize {
            let plaintext: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let sealed = alice.encrypt(0xB0B, len as u32, &plaintext).unwrap();
            assert_eq!(sealed.len(), len + PKI_OVERHEAD);
            assert_eq!(bob.decrypt(0xA11CE, len as u32, &sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_every_bit_flip_fails_closed() {
        let (alice, bob) = pair();
        let sealed = alice.encrypt(0xB0B, 7, b"attack at dawn").unwrap();
        // ciphertext and tag, not the clear nonce extension
        for byte in 0..sealed.len() - EXTRA_NONCE_LEN {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(
                    bob.decrypt(0xA11CE, 7, &tampered),
                    Err(CryptoError::Auth),
                    "flip byte {} bit {}",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_wrong_packet_id_fails() {
        let (alice, bob) = pair();
        let sealed = alice.encrypt(0xB0B, 7, b"hello").unwrap();
        assert_eq!(bob.decrypt(0xA11CE, 8, &sealed), Err(CryptoError::Auth));
    }

    #[test]
    fn test_unknown_peer_and_short_input() {
        let (alice, _) = pair();
        assert_eq!(
            alice.encrypt(0xDEAD, 1, b"x"),
            Err(CryptoError::UnknownPeer(0xDEAD))
        );
        assert_eq!(
            alice.decrypt(0xB0B, 1, &[0u8; 12]),
            Err(CryptoError::TooShort(12))
        );
        assert_eq!(
            alice.decrypt(0xDEAD, 1, &[0u8; 20]),
            Err(CryptoError::UnknownPeer(0xDEAD))
        );
    }

    #[test]
    fn test_reference_example() {
        let key = [0x5Au8; 32];
        let sealed = seal(&key, 0xAABBCCDD, 42, 0x01020304, b"hi").unwrap();
        assert_eq!(sealed.len(), 14);
        assert_eq!(&sealed[10..], &0x01020304u32.to_le_bytes());

        let (plaintext, extra) = open(&key, 0xAABBCCDD, 42, &sealed).unwrap();
        assert_eq!(plaintext, b"hi");
        assert_eq!(extra, 0x01020304);
    }

    #[test]
    fn test_zero_extra_nonce_keeps_packet_id() {
        assert_eq!(
            &ccm_nonce(0x11223344, 42, 0)[..12],
            &[42, 0, 0, 0, 0, 0, 0, 0, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(
            &ccm_nonce(0x11223344, 42, 0xA0B0C0D0)[..8],
            &[42, 0, 0, 0, 0xD0, 0xC0, 0xB0, 0xA0]
        );
    }

    #[test]
    fn test_private_key_validation() {
        assert!(!is_valid_private_key(&[0u8; 32]));
        assert!(!is_valid_private_key(&[1u8; 31]));
        assert!(is_valid_private_key(&[1u8; 32]));

        let keys = KeyPair::generate();
        let restored = KeyPair::from_private(&keys.private_key()).unwrap();
        assert_eq!(restored.public_key(), keys.public_key());
        assert!(KeyPair::from_private(&[0u8; 32]).is_err());
    }
}
