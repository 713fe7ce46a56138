//! Events the engine reports to the application.

use mesh_wire::PositionReport;
use tokio::sync::mpsc;

use crate::radio::SignalQuality;

/// Something the application should know about
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Final outcome of a caller's send
    SendResult {
        /// Packet id returned when the message was queued
        msg_id: u32,
        /// Delivered (or transmitted, when no ack was asked for)
        ok: bool,
    },
    /// A node announced its identity
    IdentityUpdate {
        /// Node id
        node_id: u32,
        /// Short name
        short_name: String,
        /// Long name
        long_name: String,
        /// Link quality of the announcement
        signal_quality: SignalQuality,
        /// Reception time (Unix seconds)
        timestamp: u32,
        /// Portnum the announcement arrived on
        protocol_tag: u32,
    },
    /// Show this number to the operator; the peer types it in
    VerificationNumberInform {
        /// Peer
        remote: u32,
        /// Session nonce
        nonce: u64,
        /// Security number
        number: u32,
    },
    /// Ask the operator for the number shown on the peer
    VerificationNumberRequest {
        /// Peer
        remote: u32,
        /// Session nonce
        nonce: u64,
    },
    /// Show the pairing code
    VerificationFinal {
        /// Peer
        remote: u32,
        /// Session nonce
        nonce: u64,
        /// Whether this node started the session
        is_initiator: bool,
        /// Code both operators compare
        pairing_code: String,
    },
    /// Chat text
    TextReceived {
        /// Sender
        from: u32,
        /// Destination (this node or broadcast)
        to: u32,
        /// Packet id
        packet_id: u32,
        /// Text
        text: String,
        /// Received with peer security
        pki: bool,
        /// Link quality
        signal_quality: SignalQuality,
    },
    /// Position report
    PositionReceived {
        /// Sender
        from: u32,
        /// Report
        position: PositionReport,
        /// Link quality
        signal_quality: SignalQuality,
    },
    /// Payload for a port the engine does not interpret
    AppData {
        /// Sender
        from: u32,
        /// Destination
        to: u32,
        /// Raw portnum
        portnum: u32,
        /// Raw payload
        payload: Vec<u8>,
        /// Received with peer security
        pki: bool,
    },
}

/// Sending half, held by the adapter
pub type EventSink = mpsc::UnboundedSender<MeshEvent>;

/// Receiving half, held by the application
#[derive(Debug)]
pub struct MeshEvents {
    rx: mpsc::UnboundedReceiver<MeshEvent>,
}

impl MeshEvents {
    /// Create a connected sink and receiver
    pub fn channel() -> (EventSink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next event if one is ready, without waiting
    pub fn poll_incoming(&mut self) -> Option<MeshEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event; `None` once the engine stopped
    pub async fn next(&mut self) -> Option<MeshEvent> {
        self.rx.recv().await
    }
}
