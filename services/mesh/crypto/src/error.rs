//! Crypto error types.

use thiserror::Error;

/// Channel and peer security errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// No public key stored for this node
    #[error("no public key for node {0:#010x}")]
    UnknownPeer(u32),

    /// Ciphertext too short to carry tag and nonce extension
    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),

    /// Authentication tag mismatch
    #[error("authentication failed")]
    Auth,

    /// AEAD refused to encrypt (payload too large for the length field)
    #[error("encryption failed")]
    Encrypt,

    /// Key material of an unusable length
    #[error("invalid key length {0}")]
    KeyLength(usize),

    /// Stored private key is missing, zero or the wrong length
    #[error("invalid private key")]
    InvalidPrivateKey,
}
