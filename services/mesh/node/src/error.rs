//! Node error types.

use mesh_crypto::CryptoError;
use mesh_reliability::DeliveryError;
use mesh_storage::StorageError;
use mesh_verify::VerifyError;
use mesh_wire::WireError;
use thiserror::Error;

/// Errors surfaced by the mesh adapter and its handle
#[derive(Error, Debug)]
pub enum NodeError {
    /// Wire encode/decode error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Channel or peer security error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Persistence error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Key verification refused the step
    #[error("verification error: {0}")]
    Verify(#[from] VerifyError),

    /// Send queue refused the message
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Encoded message would not fit in one frame
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Encoded size including security overhead
        size: usize,
        /// Largest allowed size
        max: usize,
    },

    /// No channel configured at this index
    #[error("unknown channel index {0}")]
    UnknownChannel(usize),

    /// Radio driver failure
    #[error("radio error: {0}")]
    Radio(String),

    /// Settings rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The mesh task is no longer running
    #[error("mesh task stopped")]
    Stopped,
}
