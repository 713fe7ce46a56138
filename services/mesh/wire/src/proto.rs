//! Protobuf payload messages.
//!
//! Declared by hand with `prost` derives instead of generated from `.proto`
//! files. Field numbers and types follow the deployed mesh schema so frames
//! interoperate with existing radios; only the fields this engine reads or
//! writes are declared; unknown fields are skipped on decode.

/// Application port numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    /// Unset or unknown
    UnknownApp = 0,
    /// UTF-8 chat text
    TextMessageApp = 1,
    /// Remote GPIO control
    RemoteHardwareApp = 2,
    /// Position report
    PositionApp = 3,
    /// Node identity (`User`)
    NodeinfoApp = 4,
    /// Routing acks and errors
    RoutingApp = 5,
    /// Admin messages
    AdminApp = 6,
    /// Unishox2-compressed chat text
    TextMessageCompressedApp = 7,
    /// Waypoint
    WaypointApp = 8,
    /// Key verification handshake
    KeyVerificationApp = 12,
    /// First portnum available to private/team extensions
    PrivateApp = 256,
}

/// Routing error codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RoutingError {
    /// Delivered (this is an ack)
    None = 0,
    /// No route to destination
    NoRoute = 1,
    /// Explicit negative ack
    GotNak = 2,
    /// Timed out
    Timeout = 3,
    /// No suitable interface
    NoInterface = 4,
    /// Retransmissions exhausted
    MaxRetransmit = 5,
    /// Receiver has no channel matching the packet
    NoChannel = 6,
    /// Packet too large
    TooLarge = 7,
    /// No response from the application
    NoResponse = 8,
    /// Regional duty cycle exhausted
    DutyCycleLimit = 9,
    /// Malformed request
    BadRequest = 32,
    /// Not authorized
    NotAuthorized = 33,
    /// PKI decryption failed
    PkiFailed = 34,
    /// Receiver does not know the sender's public key
    PkiUnknownPubkey = 35,
}

/// Envelope carried inside every encrypted payload
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
    /// Application port
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    /// Application payload
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    /// Sender asks the receiving application to answer
    #[prost(bool, tag = "3")]
    pub want_response: bool,
    /// Final destination (multi-hop hint)
    #[prost(fixed32, tag = "4")]
    pub dest: u32,
    /// Original source (multi-hop hint)
    #[prost(fixed32, tag = "5")]
    pub source: u32,
    /// Packet id this message answers
    #[prost(fixed32, tag = "6")]
    pub request_id: u32,
    /// Packet id this message replies to (chat threading)
    #[prost(fixed32, tag = "7")]
    pub reply_id: u32,
}

/// Node identity broadcast
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    /// Textual node id, `!aabbccdd`
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    /// Operator's long name
    #[prost(string, tag = "2")]
    pub long_name: ::prost::alloc::string::String,
    /// Operator's short name (up to 4 characters)
    #[prost(string, tag = "3")]
    pub short_name: ::prost::alloc::string::String,
    /// Hardware model code
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
    /// Device role code
    #[prost(int32, tag = "7")]
    pub role: i32,
    /// X25519 public key (32 bytes, empty when PKI is unsupported)
    #[prost(bytes = "vec", tag = "8")]
    pub public_key: ::prost::alloc::vec::Vec<u8>,
}

/// Position report
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Position {
    /// Latitude in 1e-7 degrees
    #[prost(sfixed32, optional, tag = "1")]
    pub latitude_i: ::core::option::Option<i32>,
    /// Longitude in 1e-7 degrees
    #[prost(sfixed32, optional, tag = "2")]
    pub longitude_i: ::core::option::Option<i32>,
    /// Altitude in metres above MSL
    #[prost(int32, optional, tag = "3")]
    pub altitude: ::core::option::Option<i32>,
    /// Fix time, seconds since the Unix epoch
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

/// Routing control message; only the error variant is used by this engine
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Routing {
    /// Error code; `NONE` is an ack
    #[prost(enumeration = "RoutingError", optional, tag = "3")]
    pub error_reason: ::core::option::Option<i32>,
}

/// Key verification handshake step
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyVerification {
    /// Session nonce chosen by the initiator
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
    /// Commitment revealed by the initiator in the final step
    #[prost(bytes = "vec", tag = "2")]
    pub hash1: ::prost::alloc::vec::Vec<u8>,
    /// Commitment sent by the receiver in the reply step
    #[prost(bytes = "vec", tag = "3")]
    pub hash2: ::prost::alloc::vec::Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_data_field_layout() {
        let data = Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: b"hi".to_vec(),
            ..Default::default()
        };
        // tag 1 varint 1, tag 2 len 2 "hi"
        assert_eq!(data.encode_to_vec(), vec![0x08, 0x01, 0x12, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_routing_ack_is_not_empty() {
        let ack = Routing {
            error_reason: Some(RoutingError::None as i32),
        };
        let bytes = ack.encode_to_vec();
        assert_eq!(bytes, vec![0x18, 0x00]);

        let decoded = Routing::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.error_reason(), RoutingError::None);
    }

    #[test]
    fn test_unknown_portnum_preserved() {
        let data = Data {
            portnum: 300,
            payload: vec![1, 2, 3],
            ..Default::default()
        };
        let decoded = Data::decode(data.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.portnum, 300);
        assert!(PortNum::try_from(decoded.portnum).is_err());
    }
}
