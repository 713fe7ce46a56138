//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame shorter than the fixed header
    #[error("incomplete header: {0} bytes")]
    Incomplete(usize),

    /// Frame or payload exceeds the radio MTU
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Protobuf payload could not be decoded
    #[error("payload decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Identity payload carries a public key of the wrong length
    #[error("bad public key length {0}")]
    KeyLength(usize),

    /// Verification hash of the wrong length
    #[error("bad hash length {0}")]
    HashLength(usize),

    /// Text payload is not valid UTF-8
    #[error("text payload is not utf-8")]
    Utf8,
}
