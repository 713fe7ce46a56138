//! The verification state machine.
//!
//! ```text
//! initiator                                  responder
//!   Idle --{nonce}----------------------------> Idle
//!   SenderInitiated <------------{nonce,hash2}- ReceiverAwaitingHash1 (shows number)
//!   (operator types number)
//!   SenderAwaitingNumber --{nonce,hash1}------> ReceiverAwaitingHash1
//!   SenderAwaitingUser (shows code)             ReceiverAwaitingUser (shows code)
//! ```

use std::time::{Duration, Instant};

use mesh_wire::VerificationStep;
use rand::{Rng, RngCore};
use tracing::{debug, info, warn};

use crate::hash::{pairing_code, security_hash1, security_hash2, SECURITY_NUMBER_RANGE};
use crate::VerifyError;

/// Inactivity after which a session is abandoned
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    /// No session
    Idle,
    /// Nonce sent, waiting for the responder's commitment
    SenderInitiated,
    /// Commitment received, waiting for the operator to type the number
    SenderAwaitingNumber,
    /// Code shown to the initiator's operator
    SenderAwaitingUser,
    /// Number shown, waiting for the initiator's reveal
    ReceiverAwaitingHash1,
    /// Code shown to the responder's operator
    ReceiverAwaitingUser,
}

/// What the engine must do after a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyAction {
    /// Send a step to the peer (always with peer security)
    Send {
        /// Destination
        dest: u32,
        /// Step to send
        step: VerificationStep,
    },
    /// Show the security number to this operator
    NumberInform {
        /// Peer
        remote: u32,
        /// Session nonce
        nonce: u64,
        /// Number to read out to the peer's operator
        number: u32,
    },
    /// Ask this operator for the number shown on the peer
    NumberRequest {
        /// Peer
        remote: u32,
        /// Session nonce
        nonce: u64,
    },
    /// Show the pairing code
    Final {
        /// Peer
        remote: u32,
        /// Session nonce
        nonce: u64,
        /// Whether this node started the session
        is_initiator: bool,
        /// Code both operators compare
        pairing_code: String,
    },
}

#[derive(Debug, Clone)]
struct Session {
    state: VerificationState,
    nonce: u64,
    remote: u32,
    remote_key: [u8; 32],
    hash1: [u8; 32],
    hash2: [u8; 32],
    security_number: u32,
    last_activity: Instant,
}

/// At most one verification session against one peer
#[derive(Debug)]
pub struct KeyVerifier {
    local_id: u32,
    local_key: [u8; 32],
    timeout: Duration,
    session: Option<Session>,
}

impl KeyVerifier {
    /// Verifier for this node's id and public key
    pub fn new(local_id: u32, local_key: [u8; 32]) -> Self {
        Self {
            local_id,
            local_key,
            timeout: SESSION_TIMEOUT,
            session: None,
        }
    }

    /// Override the inactivity timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current state, ignoring expiry
    pub fn state(&self) -> VerificationState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(VerificationState::Idle)
    }

    /// Peer of the running session
    pub fn remote(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.remote)
    }

    /// Drop the session if it has been inactive too long.
    /// Returns true when a session expired.
    pub fn expire(&mut self, now: Instant) -> bool {
        let expired = self
            .session
            .as_ref()
            .is_some_and(|s| now.saturating_duration_since(s.last_activity) >= self.timeout);
        if expired {
            if let Some(session) = self.session.take() {
                info!(
                    "Verification with {:#010x} expired in {:?}",
                    session.remote, session.state
                );
            }
        }
        expired
    }

    /// Begin verifying `remote`; returns the opening step to send
    pub fn start<R: RngCore>(
        &mut self,
        remote: u32,
        remote_key: Option<[u8; 32]>,
        now: Instant,
        rng: &mut R,
    ) -> Result<VerificationStep, VerifyError> {
        self.expire(now);
        if let Some(session) = &self.session {
            return Err(VerifyError::Busy(session.state));
        }
        let remote_key = remote_key.ok_or(VerifyError::UnknownKey(remote))?;

        let nonce = rng.next_u64();
        self.session = Some(Session {
            state: VerificationState::SenderInitiated,
            nonce,
            remote,
            remote_key,
            hash1: [0; 32],
            hash2: [0; 32],
            security_number: 0,
            last_activity: now,
        });
        info!("Starting verification with {:#010x}", remote);
        Ok(VerificationStep {
            nonce,
            hash1: None,
            hash2: None,
        })
    }

    /// Handle a step received from `from`.
    ///
    /// `secure` must be true only for packets decrypted with peer security
    /// and addressed to this node.
    pub fn on_message<R: RngCore>(
        &mut self,
        from: u32,
        step: &VerificationStep,
        secure: bool,
        remote_key: Option<[u8; 32]>,
        now: Instant,
        rng: &mut R,
    ) -> Result<Vec<VerifyAction>, VerifyError> {
        self.expire(now);
        if !secure {
            warn!("Ignoring insecure verification step from {:#010x}", from);
            return Err(VerifyError::Insecure);
        }

        match (self.state(), step.hash1, step.hash2) {
            (VerificationState::Idle, None, None) => {
                self.respond(from, step.nonce, remote_key, now, rng)
            }
            (VerificationState::SenderInitiated, None, Some(hash2)) => {
                let session = self.matching_session(from, step.nonce)?;
                session.hash2 = hash2;
                session.state = VerificationState::SenderAwaitingNumber;
                session.last_activity = now;
                debug!("Got commitment from {:#010x}", from);
                Ok(vec![VerifyAction::NumberRequest {
                    remote: from,
                    nonce: step.nonce,
                }])
            }
            (VerificationState::ReceiverAwaitingHash1, Some(hash1), None) => {
                let session = self.matching_session(from, step.nonce)?;
                if hash1 != session.hash1 {
                    warn!("Verification reveal from {:#010x} does not match", from);
                    return Err(VerifyError::HashMismatch);
                }
                session.state = VerificationState::ReceiverAwaitingUser;
                session.last_activity = now;
                Ok(vec![VerifyAction::Final {
                    remote: from,
                    nonce: step.nonce,
                    is_initiator: false,
                    pairing_code: pairing_code(&hash1),
                }])
            }
            (state, _, _) => Err(VerifyError::Unexpected(state)),
        }
    }

    fn respond<R: RngCore>(
        &mut self,
        from: u32,
        nonce: u64,
        remote_key: Option<[u8; 32]>,
        now: Instant,
        rng: &mut R,
    ) -> Result<Vec<VerifyAction>, VerifyError> {
        let remote_key = remote_key.ok_or(VerifyError::UnknownKey(from))?;
        let number = rng.gen_range(0..SECURITY_NUMBER_RANGE);
        let hash1 = security_hash1(
            number,
            nonce,
            from,
            self.local_id,
            &remote_key,
            &self.local_key,
        );
        let hash2 = security_hash2(nonce, &hash1);

        self.session = Some(Session {
            state: VerificationState::ReceiverAwaitingHash1,
            nonce,
            remote: from,
            remote_key,
            hash1,
            hash2,
            security_number: number,
            last_activity: now,
        });
        info!("Verification requested by {:#010x}", from);

        Ok(vec![
            VerifyAction::Send {
                dest: from,
                step: VerificationStep {
                    nonce,
                    hash1: None,
                    hash2: Some(hash2),
                },
            },
            VerifyAction::NumberInform {
                remote: from,
                nonce,
                number,
            },
        ])
    }

    /// The initiator's operator typed the number shown on the peer
    pub fn submit_number(
        &mut self,
        remote: u32,
        nonce: u64,
        number: u32,
        now: Instant,
    ) -> Result<Vec<VerifyAction>, VerifyError> {
        self.expire(now);
        let state = self.state();
        if state != VerificationState::SenderAwaitingNumber {
            return Err(VerifyError::Unexpected(state));
        }
        let local_id = self.local_id;
        let local_key = self.local_key;
        let session = self.matching_session(remote, nonce)?;

        let hash1 = security_hash1(
            number,
            nonce,
            local_id,
            remote,
            &local_key,
            &session.remote_key,
        );
        if security_hash2(nonce, &hash1) != session.hash2 {
            warn!("Wrong security number for {:#010x}", remote);
            return Err(VerifyError::HashMismatch);
        }

        session.hash1 = hash1;
        session.security_number = number;
        session.state = VerificationState::SenderAwaitingUser;
        session.last_activity = now;

        Ok(vec![
            VerifyAction::Send {
                dest: remote,
                step: VerificationStep {
                    nonce,
                    hash1: Some(hash1),
                    hash2: None,
                },
            },
            VerifyAction::Final {
                remote,
                nonce,
                is_initiator: true,
                pairing_code: pairing_code(&hash1),
            },
        ])
    }

    /// The operator confirmed or dismissed the code.
    /// Returns false when no session was running.
    pub fn finish(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                info!(
                    "Verification with {:#010x} finished in {:?} (number {})",
                    session.remote, session.state, session.security_number
                );
                true
            }
            None => false,
        }
    }

    /// Abandon any session
    pub fn reset(&mut self) {
        if self.session.take().is_some() {
            debug!("Verification reset");
        }
    }

    fn matching_session(&mut self, remote: u32, nonce: u64) -> Result<&mut Session, VerifyError> {
        match self.session.as_mut() {
            Some(session) if session.remote == remote && session.nonce == nonce => Ok(session),
            Some(_) => Err(VerifyError::SessionMismatch),
            None => Err(VerifyError::Unexpected(VerificationState::Idle)),
        }
    }
}
