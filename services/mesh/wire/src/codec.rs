//! Payload codec.
//!
//! The engine never looks inside application payloads itself: it hands
//! `(portnum, bytes)` to a [`PayloadCodec`] and gets a typed [`AppMessage`]
//! back, and the reverse on the way out. [`ProtobufCodec`] is the codec used
//! on air today.

use prost::Message;
use tracing::{debug, trace};

use crate::proto::{self, PortNum, RoutingError};
use crate::WireError;

/// Length of an X25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Decrypted envelope: the application port plus routing metadata
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    /// Application port number (raw, may be a team extension value)
    pub portnum: u32,
    /// Encoded application payload
    pub payload: Vec<u8>,
    /// Sender asks for an application-level answer
    pub want_response: bool,
    /// Packet id this envelope answers (0 if none)
    pub request_id: u32,
}

/// Identity announced by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Textual node id, `!aabbccdd`
    pub id: String,
    /// Long name
    pub long_name: String,
    /// Short name
    pub short_name: String,
    /// Hardware model code
    pub hw_model: i32,
    /// Public key, if the node supports PKI
    pub public_key: Option<[u8; PUBLIC_KEY_LEN]>,
}

/// Position report in fixed-point degrees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionReport {
    /// Latitude in 1e-7 degrees
    pub latitude_i: Option<i32>,
    /// Longitude in 1e-7 degrees
    pub longitude_i: Option<i32>,
    /// Altitude in metres
    pub altitude: Option<i32>,
    /// Fix time (Unix seconds)
    pub time: u32,
}

/// Key verification step; empty hashes are `None`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationStep {
    /// Session nonce
    pub nonce: u64,
    /// Initiator's revealed commitment
    pub hash1: Option<[u8; 32]>,
    /// Receiver's commitment
    pub hash2: Option<[u8; 32]>,
}

/// Typed application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    /// Chat text
    Text(String),
    /// Compressed chat text, passed through undecoded
    CompressedText(Vec<u8>),
    /// Node identity
    Identity(Identity),
    /// Position report
    Position(PositionReport),
    /// Routing ack (`RoutingError::None`) or error
    Routing(RoutingError),
    /// Key verification step
    KeyVerification(VerificationStep),
    /// Any other portnum, including team extensions
    Opaque {
        /// Raw portnum
        portnum: u32,
        /// Raw payload
        payload: Vec<u8>,
    },
}

impl AppMessage {
    /// Portnum this message travels on
    pub fn portnum(&self) -> u32 {
        match self {
            AppMessage::Text(_) => PortNum::TextMessageApp as u32,
            AppMessage::CompressedText(_) => PortNum::TextMessageCompressedApp as u32,
            AppMessage::Identity(_) => PortNum::NodeinfoApp as u32,
            AppMessage::Position(_) => PortNum::PositionApp as u32,
            AppMessage::Routing(_) => PortNum::RoutingApp as u32,
            AppMessage::KeyVerification(_) => PortNum::KeyVerificationApp as u32,
            AppMessage::Opaque { portnum, .. } => *portnum,
        }
    }
}

/// Converts envelopes and application messages to and from bytes
pub trait PayloadCodec: Send + Sync {
    /// Encode the envelope that gets encrypted
    fn encode_envelope(&self, envelope: &Envelope) -> Vec<u8>;

    /// Decode a decrypted envelope
    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, WireError>;

    /// Encode an application message into its portnum and payload
    fn encode_app(&self, message: &AppMessage) -> (u32, Vec<u8>);

    /// Decode an application payload received on `portnum`
    fn decode_app(&self, portnum: u32, payload: &[u8]) -> Result<AppMessage, WireError>;
}

/// Protobuf codec matching the deployed schema
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufCodec;

impl PayloadCodec for ProtobufCodec {
    fn encode_envelope(&self, envelope: &Envelope) -> Vec<u8> {
        proto::Data {
            portnum: envelope.portnum as i32,
            payload: envelope.payload.clone(),
            want_response: envelope.want_response,
            request_id: envelope.request_id,
            ..Default::default()
        }
        .encode_to_vec()
    }

    fn decode_envelope(&self, bytes: &[u8]) -> Result<Envelope, WireError> {
        let data = proto::Data::decode(bytes)?;
        Ok(Envelope {
            portnum: data.portnum as u32,
            payload: data.payload,
            want_response: data.want_response,
            request_id: data.request_id,
        })
    }

    fn encode_app(&self, message: &AppMessage) -> (u32, Vec<u8>) {
        let payload = match message {
            AppMessage::Text(text) => text.as_bytes().to_vec(),
            AppMessage::CompressedText(bytes) => bytes.clone(),
            AppMessage::Identity(identity) => proto::User {
                id: identity.id.clone(),
                long_name: identity.long_name.clone(),
                short_name: identity.short_name.clone(),
                hw_model: identity.hw_model,
                role: 0,
                public_key: identity
                    .public_key
                    .map(|key| key.to_vec())
                    .unwrap_or_default(),
            }
            .encode_to_vec(),
            AppMessage::Position(position) => proto::Position {
                latitude_i: position.latitude_i,
                longitude_i: position.longitude_i,
                altitude: position.altitude,
                time: position.time,
            }
            .encode_to_vec(),
            AppMessage::Routing(error) => proto::Routing {
                error_reason: Some(*error as i32),
            }
            .encode_to_vec(),
            AppMessage::KeyVerification(step) => proto::KeyVerification {
                nonce: step.nonce,
                hash1: step.hash1.map(|h| h.to_vec()).unwrap_or_default(),
                hash2: step.hash2.map(|h| h.to_vec()).unwrap_or_default(),
            }
            .encode_to_vec(),
            AppMessage::Opaque { payload, .. } => payload.clone(),
        };
        (message.portnum(), payload)
    }

    fn decode_app(&self, portnum: u32, payload: &[u8]) -> Result<AppMessage, WireError> {
        let known = i32::try_from(portnum)
            .ok()
            .and_then(|p| PortNum::try_from(p).ok());

        let message = match known {
            Some(PortNum::TextMessageApp) => AppMessage::Text(
                String::from_utf8(payload.to_vec()).map_err(|_| WireError::Utf8)?,
            ),
            Some(PortNum::TextMessageCompressedApp) => {
                AppMessage::CompressedText(payload.to_vec())
            }
            Some(PortNum::NodeinfoApp) => {
                let user = proto::User::decode(payload)?;
                let public_key = match user.public_key.len() {
                    0 => None,
                    PUBLIC_KEY_LEN => {
                        let mut key = [0u8; PUBLIC_KEY_LEN];
                        key.copy_from_slice(&user.public_key);
                        Some(key)
                    }
                    n => {
                        debug!("Identity {:?} carries a {}-byte public key", user.id, n);
                        return Err(WireError::KeyLength(n));
                    }
                };
                AppMessage::Identity(Identity {
                    id: user.id,
                    long_name: user.long_name,
                    short_name: user.short_name,
                    hw_model: user.hw_model,
                    public_key,
                })
            }
            Some(PortNum::PositionApp) => {
                let position = proto::Position::decode(payload)?;
                AppMessage::Position(PositionReport {
                    latitude_i: position.latitude_i,
                    longitude_i: position.longitude_i,
                    altitude: position.altitude,
                    time: position.time,
                })
            }
            Some(PortNum::RoutingApp) => {
                let routing = proto::Routing::decode(payload)?;
                AppMessage::Routing(routing.error_reason())
            }
            Some(PortNum::KeyVerificationApp) => {
                let step = proto::KeyVerification::decode(payload)?;
                AppMessage::KeyVerification(VerificationStep {
                    nonce: step.nonce,
                    hash1: optional_hash(&step.hash1)?,
                    hash2: optional_hash(&step.hash2)?,
                })
            }
            _ => {
                trace!("Portnum {} passed through as {} opaque bytes", portnum, payload.len());
                AppMessage::Opaque {
                    portnum,
                    payload: payload.to_vec(),
                }
            }
        };
        Ok(message)
    }
}

fn optional_hash(bytes: &[u8]) -> Result<Option<[u8; 32]>, WireError> {
    match bytes.len() {
        0 => Ok(None),
        32 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(bytes);
            Ok(Some(hash))
        }
        n => {
            debug!("Verification hash of {} bytes rejected", n);
            Err(WireError::HashLength(n))
        }
    }
}

/// Format a node id the way identity messages carry it
pub fn node_id_string(node_id: u32) -> String {
    format!("!{:08x}", node_id)
}
