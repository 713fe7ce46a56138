//! On-air packet header.
//!
//! Every LoRa frame starts with a 16-byte little-endian header followed by the
//! (possibly encrypted) payload. The header is the only part a node can read
//! before it knows which key protects the payload, so dedup and channel
//! selection work from it alone.
//!
//! ```text
//! +--------+--------+--------+-------+---------+----------+------------+
//! | to u32 | from   | id u32 | flags | channel | next_hop | relay_node |
//! |        | u32    |        | u8    | u8      | u8       | u8         |
//! +--------+--------+--------+-------+---------+----------+------------+
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::WireError;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest frame the radio accepts
pub const MAX_FRAME_SIZE: usize = 255;

/// Largest payload (after encryption) that fits behind the header
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Destination address meaning "every node"
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Channel byte used for PKI (direct) packets
pub const PKI_CHANNEL: u8 = 0;

const HOP_LIMIT_MASK: u8 = 0x07;
const HOP_START_SHIFT: u8 = 5;

bitflags! {
    /// Named bits of the header flags byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PacketFlags: u8 {
        /// Sender wants a routing ack
        const WANT_ACK = 1 << 3;
        /// Packet passed through an MQTT gateway
        const VIA_MQTT = 1 << 4;
    }
}

/// Parsed packet header. Immutable once decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireHeader {
    /// Destination node ID (`BROADCAST_ADDR` for everyone)
    pub to: u32,
    /// Originating node ID
    pub from: u32,
    /// Per-sender packet identifier
    pub id: u32,
    /// Hop limit, want-ack and hop start packed into one byte
    pub flags: u8,
    /// `PKI_CHANNEL` or the one-byte channel hash
    pub channel: u8,
    /// Next hop hint (0 when unused)
    pub next_hop: u8,
    /// Last relaying node hint (0 when unused)
    pub relay_node: u8,
}

impl WireHeader {
    /// Create a header for a freshly originated packet
    pub fn new(from: u32, to: u32, id: u32, channel: u8, hop_limit: u8, want_ack: bool) -> Self {
        let hop_limit = hop_limit & HOP_LIMIT_MASK;
        let mut flags = hop_limit | (hop_limit << HOP_START_SHIFT);
        if want_ack {
            flags |= PacketFlags::WANT_ACK.bits();
        }
        Self {
            to,
            from,
            id,
            flags,
            channel,
            next_hop: 0,
            relay_node: 0,
        }
    }

    /// Remaining hops
    pub fn hop_limit(&self) -> u8 {
        self.flags & HOP_LIMIT_MASK
    }

    /// Hop limit the originator started with
    pub fn hop_start(&self) -> u8 {
        (self.flags >> HOP_START_SHIFT) & HOP_LIMIT_MASK
    }

    /// Whether the sender asked for a routing ack
    pub fn want_ack(&self) -> bool {
        self.named_flags().contains(PacketFlags::WANT_ACK)
    }

    /// Named flag bits, ignoring the hop fields
    pub fn named_flags(&self) -> PacketFlags {
        PacketFlags::from_bits_truncate(self.flags)
    }

    /// Whether the packet is addressed to every node
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }

    /// Whether the payload is protected by the PKI path
    pub fn is_pki(&self) -> bool {
        self.channel == PKI_CHANNEL && !self.is_broadcast()
    }

    /// Encode the header (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.to);
        buf.put_u32_le(self.from);
        buf.put_u32_le(self.id);
        buf.put_u8(self.flags);
        buf.put_u8(self.channel);
        buf.put_u8(self.next_hop);
        buf.put_u8(self.relay_node);
    }

    /// Decode the header from the front of `buf`
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Incomplete(buf.len()));
        }

        Ok(Self {
            to: buf.get_u32_le(),
            from: buf.get_u32_le(),
            id: buf.get_u32_le(),
            flags: buf.get_u8(),
            channel: buf.get_u8(),
            next_hop: buf.get_u8(),
            relay_node: buf.get_u8(),
        })
    }
}

/// A received frame split into header and still-encrypted payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket<'a> {
    /// Parsed header
    pub header: WireHeader,
    /// Payload bytes as received
    pub payload: &'a [u8],
}

impl<'a> RawPacket<'a> {
    /// Split a received frame, rejecting truncated and oversize frames
    pub fn parse(frame: &'a [u8]) -> Result<Self, WireError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(WireError::Size(frame.len()));
        }
        let header = WireHeader::decode(frame)?;
        Ok(Self {
            header,
            payload: &frame[HEADER_SIZE..],
        })
    }
}

/// Assemble a frame from a header and an already encrypted payload
pub fn encode_frame(header: &WireHeader, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::Size(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf.to_vec())
}
