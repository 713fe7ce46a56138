//! Basic usage example for the mesh wire format.

use mesh_wire::{
    encode_frame, AppMessage, Envelope, PayloadCodec, ProtobufCodec, RawPacket, WireHeader,
    BROADCAST_ADDR,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mesh Wire Format Example ===\n");

    let codec = ProtobufCodec;

    // 1. Encode a chat message into an envelope
    println!("1. Encoding a text message...");
    let (portnum, payload) = codec.encode_app(&AppMessage::Text("Hello, mesh!".to_string()));
    let envelope = Envelope {
        portnum,
        payload,
        ..Default::default()
    };
    let inner = codec.encode_envelope(&envelope);
    println!("   Envelope size: {} bytes", inner.len());

    // 2. Frame it (unencrypted here; the engine encrypts `inner` first)
    println!("\n2. Building a broadcast frame...");
    let header = WireHeader::new(0xAABBCCDD, BROADCAST_ADDR, 42, 8, 3, false);
    let frame = encode_frame(&header, &inner)?;
    println!("   Frame size: {} bytes", frame.len());

    // 3. Parse it back
    println!("\n3. Parsing the frame...");
    let packet = RawPacket::parse(&frame)?;
    println!(
        "   from=!{:08x} to=!{:08x} id={} hop_limit={}",
        packet.header.from,
        packet.header.to,
        packet.header.id,
        packet.header.hop_limit()
    );

    let decoded = codec.decode_envelope(packet.payload)?;
    let message = codec.decode_app(decoded.portnum, &decoded.payload)?;
    println!("   Message: {:?}", message);

    Ok(())
}
