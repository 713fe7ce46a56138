//! Commitments and the pairing code.
//!
//! All integers are hashed little-endian, initiator fields first.

use sha2::{Digest, Sha256};

/// Security numbers are drawn from `0..SECURITY_NUMBER_RANGE`
pub const SECURITY_NUMBER_RANGE: u32 = 1_000_000;

/// Commitment binding the number, the nonce and both identities
pub fn security_hash1(
    number: u32,
    nonce: u64,
    initiator_id: u32,
    responder_id: u32,
    initiator_key: &[u8; 32],
    responder_key: &[u8; 32],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(number.to_le_bytes());
    hasher.update(nonce.to_le_bytes());
    hasher.update(initiator_id.to_le_bytes());
    hasher.update(responder_id.to_le_bytes());
    hasher.update(initiator_key);
    hasher.update(responder_key);
    hasher.finalize().into()
}

/// Commitment to `hash1` sent ahead of it
pub fn security_hash2(nonce: u64, hash1: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_le_bytes());
    hasher.update(hash1);
    hasher.finalize().into()
}

/// Eight characters from the first eight bytes of `hash1`, as `XXXX XXXX`
pub fn pairing_code(hash1: &[u8; 32]) -> String {
    let mut code = String::with_capacity(9);
    for (i, byte) in hash1[..8].iter().enumerate() {
        if i == 4 {
            code.push(' ');
        }
        code.push(char::from(b'0' + (byte >> 2)));
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_code_format() {
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&[0x00, 0x04, 0x08, 0xFC, 0x28, 0x03, 0xFF, 0x10]);
        assert_eq!(pairing_code(&hash), "012o :0o4");
    }

    #[test]
    fn test_hash1_depends_on_every_input() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let base = security_hash1(123456, 9, 1, 2, &a, &b);
        assert_ne!(base, security_hash1(123457, 9, 1, 2, &a, &b));
        assert_ne!(base, security_hash1(123456, 8, 1, 2, &a, &b));
        assert_ne!(base, security_hash1(123456, 9, 2, 1, &a, &b));
        assert_ne!(base, security_hash1(123456, 9, 1, 2, &b, &a));
        assert_eq!(base, security_hash1(123456, 9, 1, 2, &a, &b));
    }

    #[test]
    fn test_hash2_matches_manual_digest() {
        let hash1 = [7u8; 32];
        let mut manual = Vec::new();
        manual.extend_from_slice(&5u64.to_le_bytes());
        manual.extend_from_slice(&hash1);
        let expected: [u8; 32] = Sha256::digest(&manual).into();
        assert_eq!(security_hash2(5, &hash1), expected);
    }
}
