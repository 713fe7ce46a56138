//! Verification errors.

use thiserror::Error;

use crate::VerificationState;

/// Why a verification step was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Another verification is running
    #[error("verification already in progress ({0:?})")]
    Busy(VerificationState),

    /// No public key known for the node
    #[error("no public key for node {0:#010x}")]
    UnknownKey(u32),

    /// Step does not fit the current state
    #[error("unexpected verification step in state {0:?}")]
    Unexpected(VerificationState),

    /// Step belongs to another node or nonce
    #[error("verification step does not match the session")]
    SessionMismatch,

    /// Received without peer security or not addressed to this node
    #[error("verification step not sent directly with peer security")]
    Insecure,

    /// Commitment did not match; the session is kept
    #[error("security number does not match")]
    HashMismatch,
}
