//! On-air packet header, portnums and payload codec for the LoRa mesh.
//!
//! This crate owns everything that is byte-for-byte visible on the radio
//! except the encryption itself: the fixed packet header, the protobuf
//! envelope and application messages, and the [`PayloadCodec`] seam the
//! engine uses to stay agnostic of application payload formats.
//!
//! ## Frame Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | Header (16B)         | to, from, id, flags, chan  |
//! +----------------------+----------------------------+
//! | payload (0..239B)    | AES-CTR(Data) for channels |
//! |                      | CCM(Data)‖tag‖ext for PKI  |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod header;
pub mod proto;

// Re-export main types
pub use codec::{
    node_id_string, AppMessage, Envelope, Identity, PayloadCodec, PositionReport,
    ProtobufCodec, VerificationStep, PUBLIC_KEY_LEN,
};
pub use error::WireError;
pub use header::{
    encode_frame, PacketFlags, RawPacket, WireHeader, BROADCAST_ADDR, HEADER_SIZE,
    MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, PKI_CHANNEL,
};
pub use proto::{PortNum, RoutingError};
