//! Out-of-band key verification ("safety number") between two nodes.
//!
//! The initiator sends a nonce; the responder commits to a random six-digit
//! number bound to both public keys and shows the number to its operator.
//! The initiator's operator types the number in, which lets the initiator
//! open the commitment and reveal it. Both sides then show an eight-character
//! pairing code the operators compare.
//!
//! The machine is pure: it takes the current time and an RNG and returns
//! [`VerifyAction`]s for the engine to carry out.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hash;
pub mod machine;

pub use error::VerifyError;
pub use hash::{pairing_code, security_hash1, security_hash2, SECURITY_NUMBER_RANGE};
pub use machine::{KeyVerifier, VerificationState, VerifyAction, SESSION_TIMEOUT};
