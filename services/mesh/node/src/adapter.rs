//! The mesh adapter: owns all protocol state and is the only component that
//! talks to the radio.
//!
//! Receive path: parse header, drop own packets, dedup, decrypt (peer or
//! channel security), decode the envelope, acknowledge, dispatch by portnum.
//! Send path: callers enqueue, [`MeshAdapter::process_send_queue`] encrypts
//! and transmits the head of the queue and tracks acknowledgements.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use mesh_crypto::{
    fingerprint, ChannelKey, ChannelSet, CryptoError, KeyChange, KeyPair, PeerKeyEntry,
    PeerKeyTable, PeerSecurity, PKI_OVERHEAD,
};
use mesh_reliability::{AckTracker, DeliveryQueue, FailOutcome, PendingSend};
use mesh_storage::{
    decode_peer_table, encode_peer_table, Dedup, KeyStore, PeerRecord, RecentPackets,
    KEYS_NAMESPACE, PEERS_NAMESPACE, PEER_TABLE_KEY, PRIVATE_KEY, PUBLIC_KEY,
};
use mesh_verify::{KeyVerifier, VerificationState, VerifyAction};
use mesh_wire::{
    encode_frame, node_id_string, AppMessage, Envelope, Identity, PayloadCodec, PortNum,
    RawPacket, RoutingError, VerificationStep, WireHeader, BROADCAST_ADDR, MAX_PAYLOAD_SIZE,
    PKI_CHANNEL,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::events::{EventSink, MeshEvent};
use crate::radio::{RadioGate, RxFrame, SignalQuality};
use crate::settings::{EngineLimits, NodeSettings};
use crate::NodeError;

/// Why a received frame was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Header could not be parsed or frame is oversized
    Malformed,
    /// Sent by this node
    OwnPacket,
    /// Already processed
    Duplicate,
    /// Addressed to another node
    NotForUs,
    /// No configured channel has this hash
    UnknownChannel,
    /// Direct packet from a node whose key is unknown
    UnknownPeerKey,
    /// Authentication failed or no channel key produced a valid envelope
    DecryptFailed,
    /// Envelope or application payload did not decode
    DecodeFailed,
    /// Decoded but refused by the handler
    Rejected,
}

/// Result of [`MeshAdapter::handle_raw_packet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Decoded and dispatched
    Delivered {
        /// Sender
        from: u32,
        /// Application port
        portnum: u32,
    },
    /// Dropped; the engine state is unchanged apart from dedup
    Dropped(DropReason),
}

/// Counters and sizes for status output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    /// This node
    pub node_id: u32,
    /// Messages waiting to be sent
    pub queued: usize,
    /// Acknowledgements awaited
    pub awaiting_ack: usize,
    /// Known peer keys
    pub known_peers: usize,
    /// Verification state
    pub verification: VerificationState,
}

/// A decrypted packet on its way to dispatch
struct Inbound {
    header: WireHeader,
    envelope: Envelope,
    pki: bool,
    signal: SignalQuality,
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Node id from the public key when none is configured
fn derive_node_id(public_key: &[u8; 32]) -> u32 {
    let id = u32::from_le_bytes([public_key[28], public_key[29], public_key[30], public_key[31]]);
    match id {
        0 | BROADCAST_ADDR => 1,
        id => id,
    }
}

/// Single-owner protocol state
pub struct MeshAdapter {
    node_id: u32,
    settings: NodeSettings,
    limits: EngineLimits,
    channels: ChannelSet,
    security: PeerSecurity,
    dedup: RecentPackets,
    queue: DeliveryQueue,
    acks: AckTracker,
    verifier: KeyVerifier,
    codec: Arc<dyn PayloadCodec>,
    store: Arc<dyn KeyStore>,
    radio: RadioGate,
    events: EventSink,
    next_packet_id: u32,
    last_identity_broadcast: Option<Instant>,
    identity_sent: HashMap<u32, Instant>,
    peers_dirty: bool,
    rng: StdRng,
}

impl std::fmt::Debug for MeshAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshAdapter")
            .field("node_id", &node_id_string(self.node_id))
            .field("queued", &self.queue.len())
            .field("awaiting_ack", &self.acks.len())
            .finish_non_exhaustive()
    }
}

impl MeshAdapter {
    /// Load or create the key pair, load the peer table and build the engine
    pub async fn open(
        settings: NodeSettings,
        limits: EngineLimits,
        store: Arc<dyn KeyStore>,
        radio: RadioGate,
        codec: Arc<dyn PayloadCodec>,
        events: EventSink,
    ) -> Result<Self, NodeError> {
        settings.validate()?;

        let keys = load_or_create_keys(store.as_ref()).await?;
        let node_id = match settings.node_id {
            0 => derive_node_id(&keys.public_key()),
            id => id,
        };
        let (peers, legacy) = load_peers(store.as_ref(), limits.peer_capacity).await;

        let delivery = limits.delivery();
        let mut adapter = Self {
            node_id,
            channels: build_channels(&settings),
            verifier: KeyVerifier::new(node_id, keys.public_key())
                .with_timeout(limits.verify_timeout()),
            security: PeerSecurity::new(node_id, keys, peers),
            dedup: RecentPackets::new(limits.dedup_capacity),
            acks: AckTracker::new(delivery.ack_timeout),
            queue: DeliveryQueue::new(delivery),
            settings,
            limits,
            codec,
            store,
            radio,
            events,
            next_packet_id: 0,
            last_identity_broadcast: None,
            identity_sent: HashMap::new(),
            peers_dirty: false,
            rng: StdRng::from_entropy(),
        };
        adapter.next_packet_id = adapter.rng.gen();

        if legacy {
            adapter.persist_peers().await?;
        }
        info!(
            "Mesh node {} up, {} known peers",
            node_id_string(node_id),
            adapter.security.peers().len()
        );
        Ok(adapter)
    }

    /// This node's id
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// This node's public key
    pub fn public_key(&self) -> [u8; 32] {
        self.security.public_key()
    }

    /// Current settings
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Known peer keys
    pub fn peers(&self) -> &PeerKeyTable {
        self.security.peers()
    }

    /// Sizes and state for status output
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id,
            queued: self.queue.len(),
            awaiting_ack: self.acks.len(),
            known_peers: self.security.peers().len(),
            verification: self.verifier.state(),
        }
    }

    // ---------------------------------------------------------------------
    // Receive path
    // ---------------------------------------------------------------------

    /// Process one frame captured by the radio
    pub async fn handle_raw_packet(&mut self, frame: &RxFrame, now: Instant) -> PacketOutcome {
        let packet = match RawPacket::parse(&frame.bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed frame ({} bytes): {}", frame.bytes.len(), e);
                return PacketOutcome::Dropped(DropReason::Malformed);
            }
        };
        let header = packet.header;

        if header.from == self.node_id {
            return PacketOutcome::Dropped(DropReason::OwnPacket);
        }
        if !self.dedup.check_and_mark(header.from, header.id) {
            trace!("Duplicate {}/{}", node_id_string(header.from), header.id);
            return PacketOutcome::Dropped(DropReason::Duplicate);
        }
        if header.to != self.node_id && !header.is_broadcast() {
            trace!(
                "Packet {} for {} is not ours",
                header.id,
                node_id_string(header.to)
            );
            return PacketOutcome::Dropped(DropReason::NotForUs);
        }

        let direct = header.is_pki() && header.to == self.node_id;
        let inbound = if direct {
            self.open_direct(&header, packet.payload, now)
        } else {
            self.open_channel(&header, packet.payload)
        };
        let inbound = match inbound {
            Ok(envelope) => Inbound {
                pki: direct,
                header,
                envelope,
                signal: frame.signal,
            },
            Err(reason) => return PacketOutcome::Dropped(reason),
        };

        if inbound.header.want_ack() && inbound.header.to == self.node_id {
            self.send_routing_reply(&inbound, RoutingError::None);
        }

        let message = match self
            .codec
            .decode_app(inbound.envelope.portnum, &inbound.envelope.payload)
        {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    "Undecodable portnum {} payload from {}: {}",
                    inbound.envelope.portnum,
                    node_id_string(inbound.header.from),
                    e
                );
                return PacketOutcome::Dropped(DropReason::DecodeFailed);
            }
        };

        let from = inbound.header.from;
        let portnum = inbound.envelope.portnum;
        match self.dispatch(inbound, message, now).await {
            Ok(()) => PacketOutcome::Delivered { from, portnum },
            Err(e) => {
                debug!("Rejected packet from {}: {}", node_id_string(from), e);
                PacketOutcome::Dropped(DropReason::Rejected)
            }
        }
    }

    fn open_direct(
        &mut self,
        header: &WireHeader,
        payload: &[u8],
        now: Instant,
    ) -> Result<Envelope, DropReason> {
        if !self.security.has_key(header.from) {
            info!(
                "Direct packet from {} without a known key",
                node_id_string(header.from)
            );
            // one identity + error pair per peer and throttle window
            if self.send_identity(header.from, true, 0, false, now) {
                let routing_error = self.codec.encode_app(&AppMessage::Routing(
                    RoutingError::PkiUnknownPubkey,
                ));
                let mut reply = self.internal_send(header.from, 0, routing_error);
                reply.request_id = header.id;
                self.enqueue_internal(reply);
            }
            return Err(DropReason::UnknownPeerKey);
        }

        let plaintext = match self.security.decrypt(header.from, header.id, payload) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                let tail = payload.len().saturating_sub(PKI_OVERHEAD);
                warn!(
                    "PKI decrypt from {} failed: {} (tag {})",
                    node_id_string(header.from),
                    e,
                    fingerprint(&payload[tail..])
                );
                return Err(DropReason::DecryptFailed);
            }
        };
        let envelope = self.codec.decode_envelope(&plaintext).map_err(|e| {
            debug!("Bad envelope from {}: {}", node_id_string(header.from), e);
            DropReason::DecodeFailed
        })?;

        if self.security.peers_mut().touch(header.from, unix_now()) {
            self.peers_dirty = true;
        }
        Ok(envelope)
    }

    fn open_channel(&self, header: &WireHeader, payload: &[u8]) -> Result<Envelope, DropReason> {
        let mut tried = 0usize;
        for (index, channel) in self.channels.candidates(header.channel) {
            tried += 1;
            let mut buf = payload.to_vec();
            if let Err(e) = channel.apply(header.from, header.id, &mut buf) {
                warn!("Channel {} unusable: {}", channel.name(), e);
                continue;
            }
            match self.codec.decode_envelope(&buf) {
                Ok(envelope) if envelope.portnum != PortNum::UnknownApp as u32 => {
                    trace!("Packet {} decrypted on channel {}", header.id, index);
                    return Ok(envelope);
                }
                _ => continue,
            }
        }

        if tried == 0 {
            trace!("No channel with hash {:#04x}", header.channel);
            Err(DropReason::UnknownChannel)
        } else {
            debug!(
                "No channel key for hash {:#04x} decoded packet {} from {}",
                header.channel,
                header.id,
                node_id_string(header.from)
            );
            Err(DropReason::DecryptFailed)
        }
    }

    async fn dispatch(
        &mut self,
        inbound: Inbound,
        message: AppMessage,
        now: Instant,
    ) -> Result<(), NodeError> {
        let Inbound {
            header,
            envelope,
            pki,
            signal,
        } = inbound;

        match message {
            AppMessage::Text(text) => {
                debug!("Text from {} ({} bytes)", node_id_string(header.from), text.len());
                self.emit(MeshEvent::TextReceived {
                    from: header.from,
                    to: header.to,
                    packet_id: header.id,
                    text,
                    pki,
                    signal_quality: signal,
                });
            }
            AppMessage::CompressedText(payload) => {
                self.emit(MeshEvent::AppData {
                    from: header.from,
                    to: header.to,
                    portnum: envelope.portnum,
                    payload,
                    pki,
                });
            }
            AppMessage::Opaque { portnum, payload } => {
                self.emit(MeshEvent::AppData {
                    from: header.from,
                    to: header.to,
                    portnum,
                    payload,
                    pki,
                });
            }
            AppMessage::Identity(identity) => {
                self.on_identity(&header, &envelope, identity, signal, now)
                    .await?;
            }
            AppMessage::Position(position) => {
                self.emit(MeshEvent::PositionReceived {
                    from: header.from,
                    position,
                    signal_quality: signal,
                });
            }
            AppMessage::Routing(error) => {
                self.on_routing(header.from, envelope.request_id, error, now);
            }
            AppMessage::KeyVerification(step) => {
                let secure = pki && header.to == self.node_id;
                let remote_key = self.security.peers().get(header.from).copied();
                let actions = self.verifier.on_message(
                    header.from,
                    &step,
                    secure,
                    remote_key,
                    now,
                    &mut self.rng,
                )?;
                self.apply_verify_actions(actions)?;
            }
        }
        Ok(())
    }

    async fn on_identity(
        &mut self,
        header: &WireHeader,
        envelope: &Envelope,
        identity: Identity,
        signal: SignalQuality,
        now: Instant,
    ) -> Result<(), NodeError> {
        let timestamp = unix_now();
        if let Some(public_key) = identity.public_key {
            let (change, evicted) = self
                .security
                .peers_mut()
                .save(header.from, public_key, timestamp);
            if !evicted.is_empty() {
                debug!("Peer table full, evicted {:?}", evicted);
            }
            match change {
                KeyChange::Added => {
                    info!("Learned key of {}", node_id_string(header.from));
                    self.persist_peers().await?;
                }
                KeyChange::Conflict => {
                    warn!(
                        "Ignoring announced key {} of {}; forget the peer to accept it",
                        fingerprint(&public_key),
                        node_id_string(header.from)
                    );
                }
                KeyChange::Unchanged => self.peers_dirty = true,
            }
        }

        info!(
            "Identity {} = {:?}/{:?}",
            node_id_string(header.from),
            identity.short_name,
            identity.long_name
        );
        self.emit(MeshEvent::IdentityUpdate {
            node_id: header.from,
            short_name: identity.short_name,
            long_name: identity.long_name,
            signal_quality: signal,
            timestamp,
            protocol_tag: envelope.portnum,
        });

        if envelope.want_response && header.to == self.node_id {
            self.send_identity(header.from, false, header.id, false, now);
        }
        Ok(())
    }

    fn on_routing(&mut self, from: u32, request_id: u32, error: RoutingError, now: Instant) {
        if request_id == 0 {
            trace!("Routing message from {} without request id", node_id_string(from));
            return;
        }
        match self.acks.get(request_id) {
            None => {
                debug!(
                    "Routing reply {:?} for msg_id={} not awaited",
                    error, request_id
                );
                return;
            }
            Some(ack) if ack.dest != from => {
                warn!(
                    "Routing reply for msg_id={} from {}, but it was sent to {}",
                    request_id,
                    node_id_string(from),
                    node_id_string(ack.dest)
                );
                return;
            }
            Some(_) => {}
        }

        if matches!(error, RoutingError::PkiUnknownPubkey | RoutingError::NoChannel) {
            info!(
                "{} cannot read msg_id={} ({:?}); re-sending identity",
                node_id_string(from),
                request_id,
                error
            );
            self.send_identity(from, false, 0, true, now);
        }

        if self.acks.resolve(request_id).is_some() {
            let ok = error == RoutingError::None;
            debug!("msg_id={} acknowledged: {:?}", request_id, error);
            self.emit(MeshEvent::SendResult {
                msg_id: request_id,
                ok,
            });
        }
    }

    // ---------------------------------------------------------------------
    // Send path
    // ---------------------------------------------------------------------

    /// Queue chat text; returns the packet id reported in `SendResult`
    pub fn send_text(
        &mut self,
        dest: u32,
        channel: usize,
        text: &str,
        want_ack: bool,
    ) -> Result<u32, NodeError> {
        let (portnum, payload) = self.codec.encode_app(&AppMessage::Text(text.to_string()));
        self.send_app_data(dest, channel, portnum, payload, want_ack)
    }

    /// Queue an application payload on any portnum
    pub fn send_app_data(
        &mut self,
        dest: u32,
        channel: usize,
        portnum: u32,
        payload: Vec<u8>,
        want_ack: bool,
    ) -> Result<u32, NodeError> {
        if self.channels.get(channel).is_none() {
            return Err(NodeError::UnknownChannel(channel));
        }
        let msg_id = self.allocate_packet_id();
        let mut send = PendingSend::new(msg_id, dest, channel, portnum, payload);
        send.want_ack = want_ack && dest != BROADCAST_ADDR;
        self.check_size(&send)?;
        self.queue.enqueue(send)?;
        Ok(msg_id)
    }

    fn check_size(&self, send: &PendingSend) -> Result<(), NodeError> {
        let envelope = self.codec.encode_envelope(&envelope_of(send));
        let overhead = if send.dest == BROADCAST_ADDR {
            0
        } else {
            PKI_OVERHEAD
        };
        let size = envelope.len() + overhead;
        if size > MAX_PAYLOAD_SIZE {
            return Err(NodeError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(())
    }

    fn allocate_packet_id(&mut self) -> u32 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    fn internal_send(&mut self, dest: u32, channel: usize, encoded: (u32, Vec<u8>)) -> PendingSend {
        let msg_id = self.allocate_packet_id();
        let mut send = PendingSend::new(msg_id, dest, channel, encoded.0, encoded.1);
        send.internal = true;
        send
    }

    fn enqueue_internal(&mut self, send: PendingSend) {
        let msg_id = send.msg_id;
        if let Err(e) = self
            .check_size(&send)
            .and_then(|_| self.queue.enqueue(send).map_err(NodeError::from))
        {
            warn!("Could not queue internal msg_id={}: {}", msg_id, e);
        }
    }

    fn send_routing_reply(&mut self, inbound: &Inbound, error: RoutingError) {
        let encoded = self.codec.encode_app(&AppMessage::Routing(error));
        let mut reply = self.internal_send(inbound.header.from, 0, encoded);
        reply.request_id = inbound.header.id;
        trace!(
            "Routing {:?} for {}/{}",
            error,
            node_id_string(inbound.header.from),
            inbound.header.id
        );
        self.enqueue_internal(reply);
    }

    fn own_identity(&self) -> AppMessage {
        AppMessage::Identity(Identity {
            id: node_id_string(self.node_id),
            long_name: self.settings.long_name.clone(),
            short_name: self.settings.short_name.clone(),
            hw_model: self.settings.hw_model,
            public_key: Some(self.security.public_key()),
        })
    }

    /// Queue this node's identity. Directed sends are throttled per peer
    /// unless `force` is set. Returns false when throttled.
    fn send_identity(
        &mut self,
        dest: u32,
        want_response: bool,
        request_id: u32,
        force: bool,
        now: Instant,
    ) -> bool {
        if dest != BROADCAST_ADDR {
            let throttle = self.limits.identity_throttle();
            if !force {
                if let Some(last) = self.identity_sent.get(&dest) {
                    if now.saturating_duration_since(*last) < throttle {
                        trace!("Identity to {} throttled", node_id_string(dest));
                        return false;
                    }
                }
            }
            if !self.identity_sent.contains_key(&dest)
                && self.identity_sent.len() >= self.limits.peer_capacity
            {
                self.prune_identity_sent(now);
                if self.identity_sent.len() >= self.limits.peer_capacity {
                    debug!(
                        "Identity to {} skipped, {} peers already answered",
                        node_id_string(dest),
                        self.identity_sent.len()
                    );
                    return false;
                }
            }
            self.identity_sent.insert(dest, now);
        }

        let encoded = self.codec.encode_app(&self.own_identity());
        let mut send = self.internal_send(dest, 0, encoded);
        send.want_response = want_response;
        send.request_id = request_id;
        // a peer missing our key cannot open a PKI packet
        send.channel_only = true;
        debug!("Queued identity for {}", node_id_string(dest));
        self.enqueue_internal(send);
        true
    }

    fn prune_identity_sent(&mut self, now: Instant) {
        let throttle = self.limits.identity_throttle();
        self.identity_sent
            .retain(|_, at| now.saturating_duration_since(*at) < throttle);
    }

    /// One engine cycle: expire acknowledgements, broadcast identity when
    /// due, then transmit from the head of the queue until it is empty, a
    /// retry is pending or the radio fails.
    pub async fn process_send_queue(&mut self, now: Instant) {
        for (msg_id, _) in self.acks.sweep(now) {
            self.emit(MeshEvent::SendResult { msg_id, ok: false });
        }
        self.verifier.expire(now);
        self.prune_identity_sent(now);

        let identity_due = self
            .last_identity_broadcast
            .map_or(true, |at| {
                now.saturating_duration_since(at) >= self.limits.identity_interval()
            });
        if identity_due {
            self.last_identity_broadcast = Some(now);
            self.send_identity(BROADCAST_ADDR, false, 0, true, now);
        }

        while let Some(head) = self.queue.ready(now).cloned() {
            match self.transmit(&head).await {
                Ok(()) => {
                    self.queue.complete();
                    if head.want_ack {
                        self.acks.register(head.msg_id, head.dest, now);
                    } else if !head.internal {
                        self.emit(MeshEvent::SendResult {
                            msg_id: head.msg_id,
                            ok: true,
                        });
                    }
                }
                Err(e) => {
                    warn!("Transmit of msg_id={} failed: {}", head.msg_id, e);
                    if let Some(FailOutcome::Dropped(dropped)) = self.queue.fail(now) {
                        debug!("Gave up on msg_id={}", dropped.msg_id);
                    }
                    break;
                }
            }
        }

        if self.peers_dirty {
            if let Err(e) = self.persist_peers().await {
                warn!("Failed to persist peer table: {}", e);
            }
        }
    }

    async fn transmit(&mut self, send: &PendingSend) -> Result<(), NodeError> {
        let plaintext = self.codec.encode_envelope(&envelope_of(send));
        let direct = send.dest != BROADCAST_ADDR
            && !send.channel_only
            && self.security.has_key(send.dest);

        let (channel_byte, body) = if direct {
            let sealed = self.security.encrypt(send.dest, send.msg_id, &plaintext)?;
            (PKI_CHANNEL, sealed)
        } else if send.require_pki {
            return Err(CryptoError::UnknownPeer(send.dest).into());
        } else {
            let channel = self
                .channels
                .get(send.channel)
                .ok_or(NodeError::UnknownChannel(send.channel))?;
            let mut body = plaintext;
            channel.apply(self.node_id, send.msg_id, &mut body)?;
            (channel.hash(), body)
        };

        let header = WireHeader::new(
            self.node_id,
            send.dest,
            send.msg_id,
            channel_byte,
            self.settings.hop_limit,
            send.want_ack,
        );
        let frame = encode_frame(&header, &body)?;
        self.radio.transmit(&frame).await?;

        trace!(
            "Sent msg_id={} to {} ({} bytes, {})",
            send.msg_id,
            node_id_string(send.dest),
            frame.len(),
            if direct { "pki" } else { "channel" }
        );
        if direct && self.security.peers_mut().touch(send.dest, unix_now()) {
            self.peers_dirty = true;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Configuration and peers
    // ---------------------------------------------------------------------

    /// Replace the runtime settings. The node id cannot change.
    pub fn apply_config(&mut self, settings: NodeSettings) -> Result<(), NodeError> {
        settings.validate()?;
        if settings.node_id != 0 && settings.node_id != self.node_id {
            return Err(NodeError::InvalidConfig(
                "node_id cannot change at runtime".to_string(),
            ));
        }
        self.channels = build_channels(&settings);
        self.settings = settings;
        // announce the new names on the next cycle
        self.last_identity_broadcast = None;
        info!("Configuration applied");
        Ok(())
    }

    /// Forget one peer key
    pub async fn forget_peer(&mut self, node_id: u32) -> Result<bool, NodeError> {
        let removed = self.security.peers_mut().remove(node_id).is_some();
        if removed {
            self.persist_peers().await?;
        }
        Ok(removed)
    }

    /// Forget every peer key
    pub async fn wipe_peers(&mut self) -> Result<(), NodeError> {
        self.security.peers_mut().wipe();
        warn!("Peer key table wiped");
        self.persist_peers().await
    }

    async fn persist_peers(&mut self) -> Result<(), NodeError> {
        let records: Vec<PeerRecord> = self
            .security
            .peers()
            .snapshot()
            .into_iter()
            .map(|(node_id, entry)| PeerRecord {
                node_id,
                last_seen: entry.last_seen,
                public_key: entry.public_key,
            })
            .collect();
        let blob = encode_peer_table(&records)?;
        self.store
            .store(PEERS_NAMESPACE, PEER_TABLE_KEY, &blob)
            .await?;
        self.peers_dirty = false;
        trace!("Persisted {} peer keys", records.len());
        Ok(())
    }

    /// Write pending peer table changes
    pub async fn flush(&mut self) -> Result<(), NodeError> {
        if self.peers_dirty {
            self.persist_peers().await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Key verification
    // ---------------------------------------------------------------------

    /// Start verifying `remote`'s key
    pub fn start_verification(&mut self, remote: u32, now: Instant) -> Result<(), NodeError> {
        let remote_key = self.security.peers().get(remote).copied();
        let step = self.verifier.start(remote, remote_key, now, &mut self.rng)?;
        self.send_verification(remote, step)
    }

    /// The operator typed the number shown on `remote`
    pub fn submit_number(
        &mut self,
        remote: u32,
        nonce: u64,
        number: u32,
        now: Instant,
    ) -> Result<(), NodeError> {
        let actions = self.verifier.submit_number(remote, nonce, number, now)?;
        self.apply_verify_actions(actions)
    }

    /// The operator confirmed or dismissed the pairing code
    pub fn finish_verification(&mut self) -> bool {
        self.verifier.finish()
    }

    /// Abandon any verification
    pub fn reset_verification(&mut self) {
        self.verifier.reset();
    }

    fn apply_verify_actions(&mut self, actions: Vec<VerifyAction>) -> Result<(), NodeError> {
        for action in actions {
            match action {
                VerifyAction::Send { dest, step } => self.send_verification(dest, step)?,
                VerifyAction::NumberInform {
                    remote,
                    nonce,
                    number,
                } => self.emit(MeshEvent::VerificationNumberInform {
                    remote,
                    nonce,
                    number,
                }),
                VerifyAction::NumberRequest { remote, nonce } => {
                    self.emit(MeshEvent::VerificationNumberRequest { remote, nonce })
                }
                VerifyAction::Final {
                    remote,
                    nonce,
                    is_initiator,
                    pairing_code,
                } => self.emit(MeshEvent::VerificationFinal {
                    remote,
                    nonce,
                    is_initiator,
                    pairing_code,
                }),
            }
        }
        Ok(())
    }

    fn send_verification(&mut self, dest: u32, step: VerificationStep) -> Result<(), NodeError> {
        let encoded = self.codec.encode_app(&AppMessage::KeyVerification(step));
        let mut send = self.internal_send(dest, 0, encoded);
        send.require_pki = true;
        self.check_size(&send)?;
        self.queue.enqueue(send)?;
        Ok(())
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            trace!("Event receiver gone");
        }
    }
}

fn envelope_of(send: &PendingSend) -> Envelope {
    Envelope {
        portnum: send.portnum,
        payload: send.payload.clone(),
        want_response: send.want_response,
        request_id: send.request_id,
    }
}

fn build_channels(settings: &NodeSettings) -> ChannelSet {
    let primary = ChannelKey::new(&settings.primary.name, &settings.primary.psk);
    let secondary = settings
        .secondary
        .as_ref()
        .map(|c| ChannelKey::new(&c.name, &c.psk));
    ChannelSet::new(primary, secondary)
}

async fn load_or_create_keys(store: &dyn KeyStore) -> Result<KeyPair, NodeError> {
    if let Some(private) = store.load(KEYS_NAMESPACE, PRIVATE_KEY).await? {
        match KeyPair::from_private(&private) {
            Ok(keys) => {
                debug!("Loaded key pair {}", fingerprint(&keys.public_key()));
                return Ok(keys);
            }
            Err(e) => warn!("Stored private key unusable ({}), generating a new one", e),
        }
    }

    let keys = KeyPair::generate();
    store
        .store(KEYS_NAMESPACE, PRIVATE_KEY, &keys.private_key())
        .await?;
    store
        .store(KEYS_NAMESPACE, PUBLIC_KEY, &keys.public_key())
        .await?;
    info!("Generated key pair {}", fingerprint(&keys.public_key()));
    Ok(keys)
}

/// Load the peer table; returns whether it must be rewritten
async fn load_peers(store: &dyn KeyStore, capacity: usize) -> (PeerKeyTable, bool) {
    let mut table = PeerKeyTable::new(capacity);
    let blob = match store.load(PEERS_NAMESPACE, PEER_TABLE_KEY).await {
        Ok(Some(blob)) => blob,
        Ok(None) => return (table, false),
        Err(e) => {
            warn!("Could not read peer table: {}", e);
            return (table, false);
        }
    };
    let decoded = match decode_peer_table(&blob) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Discarding unreadable peer table: {}", e);
            return (table, true);
        }
    };

    for record in &decoded.records {
        table.restore(
            record.node_id,
            PeerKeyEntry {
                public_key: record.public_key,
                last_seen: record.last_seen,
            },
        );
    }
    let evicted = table.enforce_capacity(0);
    (table, decoded.legacy || !evicted.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MeshEvents;
    use crate::radio::SimAir;
    use mesh_storage::MemoryStore;
    use mesh_wire::ProtobufCodec;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const ALICE: u32 = 0xA11CE;
    const BOB: u32 = 0xB0B;

    struct TestNode {
        adapter: MeshAdapter,
        events: MeshEvents,
        gate: RadioGate,
        store: MemoryStore,
    }

    async fn node(air: &SimAir, node_id: u32) -> TestNode {
        let store = MemoryStore::new();
        node_with_store(air, node_id, store).await
    }

    async fn node_with_store(air: &SimAir, node_id: u32, store: MemoryStore) -> TestNode {
        let gate = RadioGate::new(Box::new(air.attach()));
        let (sink, events) = MeshEvents::channel();
        let settings = NodeSettings {
            node_id,
            ..Default::default()
        };
        let adapter = MeshAdapter::open(
            settings,
            EngineLimits::default(),
            Arc::new(store.clone()),
            gate.clone(),
            Arc::new(ProtobufCodec),
            sink,
        )
        .await
        .unwrap();
        TestNode {
            adapter,
            events,
            gate,
            store,
        }
    }

    async fn frames(gate: &RadioGate) -> Vec<RxFrame> {
        let mut out = Vec::new();
        while let Some(frame) = gate.receive().await.unwrap() {
            out.push(frame);
        }
        out
    }

    fn drain(events: &mut MeshEvents) -> Vec<MeshEvent> {
        std::iter::from_fn(|| events.poll_incoming()).collect()
    }

    /// Both nodes broadcast identities and learn each other's key
    async fn introduce(a: &mut TestNode, b: &mut TestNode, now: Instant) {
        a.adapter.process_send_queue(now).await;
        b.adapter.process_send_queue(now).await;
        for frame in frames(&b.gate).await {
            b.adapter.handle_raw_packet(&frame, now).await;
        }
        for frame in frames(&a.gate).await {
            a.adapter.handle_raw_packet(&frame, now).await;
        }
        drain(&mut a.events);
        drain(&mut b.events);
    }

    /// Deliver everything `from` transmits at `now` to `to`
    async fn relay(from: &mut TestNode, to: &mut TestNode, now: Instant) -> Vec<PacketOutcome> {
        from.adapter.process_send_queue(now).await;
        let mut outcomes = Vec::new();
        for frame in frames(&to.gate).await {
            outcomes.push(to.adapter.handle_raw_packet(&frame, now).await);
        }
        outcomes
    }

    #[tokio::test]
    async fn test_identity_exchange_learns_keys() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();

        alice.adapter.process_send_queue(now).await;
        let outcomes: Vec<_> = {
            let mut v = Vec::new();
            for frame in frames(&bob.gate).await {
                v.push(bob.adapter.handle_raw_packet(&frame, now).await);
            }
            v
        };
        assert_eq!(
            outcomes,
            vec![PacketOutcome::Delivered {
                from: ALICE,
                portnum: PortNum::NodeinfoApp as u32
            }]
        );
        assert_eq!(
            bob.adapter.peers().get(ALICE),
            Some(&alice.adapter.public_key())
        );
        match bob.events.poll_incoming() {
            Some(MeshEvent::IdentityUpdate {
                node_id,
                short_name,
                protocol_tag,
                ..
            }) => {
                assert_eq!(node_id, ALICE);
                assert_eq!(short_name, "MESH");
                assert_eq!(protocol_tag, PortNum::NodeinfoApp as u32);
            }
            other => panic!("expected identity, got {:?}", other),
        }
        // persisted right away
        assert!(bob
            .store
            .load(PEERS_NAMESPACE, PEER_TABLE_KEY)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_and_own_packets_dropped() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();
        introduce(&mut alice, &mut bob, now).await;

        alice.adapter.send_text(BROADCAST_ADDR, 0, "hello", false).unwrap();
        alice.adapter.process_send_queue(now).await;
        let frame = frames(&bob.gate).await.remove(0);

        assert!(matches!(
            bob.adapter.handle_raw_packet(&frame, now).await,
            PacketOutcome::Delivered { from: ALICE, .. }
        ));
        assert_eq!(
            bob.adapter.handle_raw_packet(&frame, now).await,
            PacketOutcome::Dropped(DropReason::Duplicate)
        );
        assert_eq!(
            alice.adapter.handle_raw_packet(&frame, now).await,
            PacketOutcome::Dropped(DropReason::OwnPacket)
        );

        let events = drain(&mut bob.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            MeshEvent::TextReceived { text, pki: false, .. } if text == "hello"
        ));
        // broadcast without ack reports success at transmit
        assert_eq!(
            drain(&mut alice.events),
            vec![MeshEvent::SendResult {
                msg_id: alice.adapter.next_packet_id,
                ok: true
            }]
        );
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_channel() {
        let air = SimAir::new();
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();

        assert_eq!(
            bob.adapter
                .handle_raw_packet(&RxFrame::new(vec![1, 2, 3]), now)
                .await,
            PacketOutcome::Dropped(DropReason::Malformed)
        );

        let own_hash = bob.adapter.channels.get(0).unwrap().hash();
        let header = WireHeader::new(ALICE, BROADCAST_ADDR, 5, own_hash ^ 0x55, 3, false);
        let frame = encode_frame(&header, b"garbage").unwrap();
        assert_eq!(
            bob.adapter.handle_raw_packet(&RxFrame::new(frame), now).await,
            PacketOutcome::Dropped(DropReason::UnknownChannel)
        );

        let header = WireHeader::new(ALICE, 0x1234, 6, own_hash, 3, false);
        let frame = encode_frame(&header, b"garbage").unwrap();
        assert_eq!(
            bob.adapter.handle_raw_packet(&RxFrame::new(frame), now).await,
            PacketOutcome::Dropped(DropReason::NotForUs)
        );
    }

    #[tokio::test]
    async fn test_direct_message_with_ack() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();
        introduce(&mut alice, &mut bob, now).await;

        let msg_id = alice.adapter.send_text(BOB, 0, "secret", true).unwrap();
        let outcomes = relay(&mut alice, &mut bob, now).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(alice.adapter.status().awaiting_ack, 1);
        assert!(matches!(
            &drain(&mut bob.events)[..],
            [MeshEvent::TextReceived { text, pki: true, from: ALICE, .. }] if text == "secret"
        ));

        // bob's routing ack resolves the send exactly once
        relay(&mut bob, &mut alice, now).await;
        assert_eq!(
            drain(&mut alice.events),
            vec![MeshEvent::SendResult { msg_id, ok: true }]
        );
        alice
            .adapter
            .process_send_queue(now + Duration::from_secs(120))
            .await;
        assert!(drain(&mut alice.events).is_empty());
    }

    #[tokio::test]
    async fn test_ack_timeout_reports_failure_once() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let now = Instant::now();

        let msg_id = alice.adapter.send_text(0xDEAD, 0, "anyone?", true).unwrap();
        alice.adapter.process_send_queue(now).await;
        assert!(drain(&mut alice.events).is_empty());

        alice
            .adapter
            .process_send_queue(now + Duration::from_secs(59))
            .await;
        assert!(drain(&mut alice.events).is_empty());

        alice
            .adapter
            .process_send_queue(now + Duration::from_secs(60))
            .await;
        alice
            .adapter
            .process_send_queue(now + Duration::from_secs(61))
            .await;
        assert_eq!(
            drain(&mut alice.events),
            vec![MeshEvent::SendResult { msg_id, ok: false }]
        );
    }

    /// Frame from `from` on `receiver`'s primary channel carrying `message`
    fn channel_frame(
        receiver: &TestNode,
        from: u32,
        to: u32,
        id: u32,
        message: &AppMessage,
        request_id: u32,
    ) -> RxFrame {
        let codec = ProtobufCodec;
        let (portnum, payload) = codec.encode_app(message);
        let mut body = codec.encode_envelope(&Envelope {
            portnum,
            payload,
            want_response: false,
            request_id,
        });
        let channel = receiver.adapter.channels.get(0).unwrap();
        channel.apply(from, id, &mut body).unwrap();
        let header = WireHeader::new(from, to, id, channel.hash(), 3, false);
        RxFrame::new(encode_frame(&header, &body).unwrap())
    }

    fn junk_direct_frame(from: u32, to: u32, id: u32) -> RxFrame {
        let header = WireHeader::new(from, to, id, PKI_CHANNEL, 3, false);
        RxFrame::new(encode_frame(&header, &[0x5A; 20]).unwrap())
    }

    /// Everything `from` transmits to `to` must be its own identity on the
    /// channel key
    async fn expect_identity_sent(from: &mut TestNode, to: &mut TestNode, now: Instant) {
        from.adapter.process_send_queue(now).await;
        let sent = frames(&to.gate).await;
        assert!(!sent.is_empty(), "no identity re-sent");
        for frame in sent {
            let header = RawPacket::parse(&frame.bytes).unwrap().header;
            assert_eq!(header.to, to.adapter.node_id());
            assert!(!header.is_pki());
            assert_eq!(
                to.adapter.handle_raw_packet(&frame, now).await,
                PacketOutcome::Delivered {
                    from: from.adapter.node_id(),
                    portnum: PortNum::NodeinfoApp as u32
                }
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_key_triggers_identity_and_error() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();

        // alice knows bob's key, bob does not know alice
        alice.adapter.process_send_queue(now).await;
        bob.adapter.process_send_queue(now).await;
        for frame in frames(&alice.gate).await {
            alice.adapter.handle_raw_packet(&frame, now).await;
        }
        frames(&bob.gate).await;

        let msg_id = alice.adapter.send_text(BOB, 0, "hi", true).unwrap();
        let outcomes = relay(&mut alice, &mut bob, now).await;
        assert_eq!(
            outcomes,
            vec![PacketOutcome::Dropped(DropReason::UnknownPeerKey)]
        );

        // bob answers with its identity and a PKI_UNKNOWN_PUBKEY error
        let outcomes = relay(&mut bob, &mut alice, now).await;
        assert_eq!(outcomes.len(), 2);
        let events = drain(&mut alice.events);
        assert!(events.contains(&MeshEvent::SendResult { msg_id, ok: false }));
        assert_eq!(alice.adapter.status().awaiting_ack, 0);

        // alice re-sends her identity in a form bob can read
        expect_identity_sent(&mut alice, &mut bob, now).await;
        assert_eq!(
            bob.adapter.peers().get(ALICE),
            Some(&alice.adapter.public_key())
        );
    }

    #[tokio::test]
    async fn test_routing_errors_resend_identity() {
        for error in [RoutingError::PkiUnknownPubkey, RoutingError::NoChannel] {
            let air = SimAir::new();
            let mut alice = node(&air, ALICE).await;
            let mut bob = node(&air, BOB).await;
            let now = Instant::now();
            introduce(&mut alice, &mut bob, now).await;

            let msg_id = alice.adapter.send_text(BOB, 0, "hi", true).unwrap();
            alice.adapter.process_send_queue(now).await;
            frames(&bob.gate).await;

            let reply = channel_frame(&alice, BOB, ALICE, 900, &AppMessage::Routing(error), msg_id);
            assert!(matches!(
                alice.adapter.handle_raw_packet(&reply, now).await,
                PacketOutcome::Delivered { from: BOB, .. }
            ));
            assert_eq!(
                drain(&mut alice.events),
                vec![MeshEvent::SendResult { msg_id, ok: false }]
            );
            assert_eq!(alice.adapter.status().queued, 1, "{:?}", error);
            expect_identity_sent(&mut alice, &mut bob, now).await;
        }
    }

    #[tokio::test]
    async fn test_unknown_sender_answered_once_per_window() {
        let air = SimAir::new();
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();
        const STRANGER: u32 = 0x5EED;

        for id in 1..=8 {
            assert_eq!(
                bob.adapter
                    .handle_raw_packet(&junk_direct_frame(STRANGER, BOB, id), now)
                    .await,
                PacketOutcome::Dropped(DropReason::UnknownPeerKey)
            );
        }
        // one identity and one routing error
        assert_eq!(bob.adapter.status().queued, 2);
        bob.adapter.send_text(ALICE, 0, "still room", false).unwrap();

        let later = now + EngineLimits::default().identity_throttle();
        bob.adapter
            .handle_raw_packet(&junk_direct_frame(STRANGER, BOB, 9), later)
            .await;
        assert_eq!(bob.adapter.status().queued, 5);
    }

    #[tokio::test]
    async fn test_identity_throttle_map_stays_bounded() {
        let air = SimAir::new();
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();
        let capacity = EngineLimits::default().peer_capacity;

        for i in 0..500u32 {
            bob.adapter
                .handle_raw_packet(&junk_direct_frame(0x10_0000 + i, BOB, 1), now)
                .await;
        }
        assert!(bob.adapter.identity_sent.len() <= capacity);

        bob.adapter
            .process_send_queue(now + EngineLimits::default().identity_throttle())
            .await;
        assert!(bob.adapter.identity_sent.is_empty());
    }

    #[tokio::test]
    async fn test_announced_key_does_not_replace_stored_key() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();
        introduce(&mut alice, &mut bob, now).await;
        let real = alice.adapter.public_key();

        let forged = AppMessage::Identity(Identity {
            id: node_id_string(ALICE),
            long_name: "Mallory".to_string(),
            short_name: "MAL".to_string(),
            hw_model: 0,
            public_key: Some([0x42; 32]),
        });
        let frame = channel_frame(&bob, ALICE, BROADCAST_ADDR, 700, &forged, 0);
        assert!(matches!(
            bob.adapter.handle_raw_packet(&frame, now).await,
            PacketOutcome::Delivered { from: ALICE, .. }
        ));
        assert_eq!(bob.adapter.peers().get(ALICE), Some(&real));

        // only after the operator forgets the peer is a new key accepted
        assert!(bob.adapter.forget_peer(ALICE).await.unwrap());
        let frame = channel_frame(&bob, ALICE, BROADCAST_ADDR, 701, &forged, 0);
        bob.adapter.handle_raw_packet(&frame, now).await;
        assert_eq!(bob.adapter.peers().get(ALICE), Some(&[0x42; 32]));
    }

    #[tokio::test]
    async fn test_ack_from_other_node_ignored() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();
        introduce(&mut alice, &mut bob, now).await;

        let msg_id = alice.adapter.send_text(BOB, 0, "hi", true).unwrap();
        relay(&mut alice, &mut bob, now).await;

        let spoofed = channel_frame(
            &alice,
            0xCA401,
            ALICE,
            800,
            &AppMessage::Routing(RoutingError::None),
            msg_id,
        );
        alice.adapter.handle_raw_packet(&spoofed, now).await;
        assert!(drain(&mut alice.events).is_empty());
        assert_eq!(alice.adapter.status().awaiting_ack, 1);

        relay(&mut bob, &mut alice, now).await;
        assert_eq!(
            drain(&mut alice.events),
            vec![MeshEvent::SendResult { msg_id, ok: true }]
        );
    }

    #[tokio::test]
    async fn test_retry_then_drop_on_radio_failure() {
        let air = SimAir::new();
        let radio = air.attach();
        let jam = radio.jam_switch();
        let gate = RadioGate::new(Box::new(radio));
        let (sink, mut events) = MeshEvents::channel();
        let mut adapter = MeshAdapter::open(
            NodeSettings {
                node_id: ALICE,
                ..Default::default()
            },
            EngineLimits {
                max_retries: 1,
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
            gate,
            Arc::new(ProtobufCodec),
            sink,
        )
        .await
        .unwrap();
        let listener = RadioGate::new(Box::new(air.attach()));

        jam.store(true, Ordering::Relaxed);
        let t0 = Instant::now();
        // the text is at the head and blocks the identity broadcast behind it
        adapter.send_text(BROADCAST_ADDR, 0, "one", false).unwrap();
        adapter.process_send_queue(t0).await;
        assert_eq!(adapter.status().queued, 2);
        adapter.process_send_queue(t0 + Duration::from_secs(1)).await;
        assert_eq!(adapter.status().queued, 2);
        adapter.process_send_queue(t0 + Duration::from_secs(5)).await;
        // text dropped after its second failure, identity still queued
        assert_eq!(adapter.status().queued, 1);

        jam.store(false, Ordering::Relaxed);
        adapter.process_send_queue(t0 + Duration::from_secs(6)).await;
        assert_eq!(adapter.status().queued, 0);
        assert_eq!(frames(&listener).await.len(), 1);
        // exhausted retries are silent
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_payload_too_large_and_unknown_channel() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let text = "x".repeat(MAX_PAYLOAD_SIZE);
        assert!(matches!(
            alice.adapter.send_text(BROADCAST_ADDR, 0, &text, false),
            Err(NodeError::PayloadTooLarge { .. })
        ));
        assert!(matches!(
            alice.adapter.send_text(BROADCAST_ADDR, 1, "hi", false),
            Err(NodeError::UnknownChannel(1))
        ));
    }

    #[tokio::test]
    async fn test_verification_over_the_air() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();
        introduce(&mut alice, &mut bob, now).await;

        alice.adapter.start_verification(BOB, now).unwrap();
        relay(&mut alice, &mut bob, now).await;
        let (nonce, number) = match drain(&mut bob.events).pop() {
            Some(MeshEvent::VerificationNumberInform {
                remote,
                nonce,
                number,
            }) => {
                assert_eq!(remote, ALICE);
                (nonce, number)
            }
            other => panic!("expected number inform, got {:?}", other),
        };

        relay(&mut bob, &mut alice, now).await;
        assert_eq!(
            drain(&mut alice.events),
            vec![MeshEvent::VerificationNumberRequest { remote: BOB, nonce }]
        );

        alice.adapter.submit_number(BOB, nonce, number, now).unwrap();
        let alice_code = match drain(&mut alice.events).pop() {
            Some(MeshEvent::VerificationFinal {
                pairing_code,
                is_initiator: true,
                ..
            }) => pairing_code,
            other => panic!("expected final, got {:?}", other),
        };
        relay(&mut alice, &mut bob, now).await;
        let bob_code = match drain(&mut bob.events).pop() {
            Some(MeshEvent::VerificationFinal {
                pairing_code,
                is_initiator: false,
                ..
            }) => pairing_code,
            other => panic!("expected final, got {:?}", other),
        };
        assert_eq!(alice_code, bob_code);
        assert!(alice.adapter.finish_verification());
    }

    #[tokio::test]
    async fn test_key_pair_and_peers_survive_restart() {
        let air = SimAir::new();
        let store = MemoryStore::new();
        let mut alice = node_with_store(&air, ALICE, store.clone()).await;
        let mut bob = node(&air, BOB).await;
        let now = Instant::now();
        introduce(&mut alice, &mut bob, now).await;
        let public = alice.adapter.public_key();
        drop(alice);

        let restarted = node_with_store(&air, ALICE, store).await;
        assert_eq!(restarted.adapter.public_key(), public);
        assert!(restarted.adapter.peers().get(BOB).is_some());
    }

    #[tokio::test]
    async fn test_legacy_peer_table_migrated() {
        let store = MemoryStore::new();
        let mut legacy = Vec::new();
        legacy.extend_from_slice(&BOB.to_le_bytes());
        legacy.extend_from_slice(&[9u8; 32]);
        store
            .store(PEERS_NAMESPACE, PEER_TABLE_KEY, &legacy)
            .await
            .unwrap();

        let air = SimAir::new();
        let alice = node_with_store(&air, ALICE, store.clone()).await;
        assert_eq!(alice.adapter.peers().get(BOB), Some(&[9u8; 32]));

        let rewritten = store
            .load(PEERS_NAMESPACE, PEER_TABLE_KEY)
            .await
            .unwrap()
            .unwrap();
        let decoded = decode_peer_table(&rewritten).unwrap();
        assert!(!decoded.legacy);
        assert_eq!(decoded.records.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_config_rejects_node_id_change() {
        let air = SimAir::new();
        let mut alice = node(&air, ALICE).await;
        let settings = NodeSettings {
            node_id: BOB,
            ..Default::default()
        };
        assert!(alice.adapter.apply_config(settings).is_err());

        let settings = NodeSettings {
            node_id: ALICE,
            short_name: "ALC".to_string(),
            ..Default::default()
        };
        alice.adapter.apply_config(settings).unwrap();
        assert_eq!(alice.adapter.settings().short_name, "ALC");
    }

    #[test]
    fn test_derive_node_id_avoids_reserved() {
        let mut key = [0u8; 32];
        assert_eq!(derive_node_id(&key), 1);
        key[28..].copy_from_slice(&[0xFF; 4]);
        assert_eq!(derive_node_id(&key), 1);
        key[28..].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(derive_node_id(&key), 0x04030201);
    }
}
