//! Wire protocol: message tags, bodies, and envelope codecs.

pub mod codec;
pub mod compress;
pub mod crypto;
pub mod envelope;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;

pub use codec::{CodecError, decode_message, encode_message};
pub use compress::{CompressError, compress_payload, decompress_payload};
pub use crypto::{CryptoError, Keyring, KeyringError, SecretKey};
pub use envelope::{
    EnvelopeError, check_crc, pack_compound, prepend_label, split_label, unpack_compound, wrap_crc,
};

/// Protocol version at which the checksum envelope is emitted.
pub const PROTOCOL_VERSION_CRC: u8 = 5;

/// Current protocol version range spoken by this implementation.
pub const PROTOCOL_VERSION_MIN: u8 = 1;
pub const PROTOCOL_VERSION_MAX: u8 = 5;

/// Delegate (user payload) protocol version range.
pub const DELEGATE_VERSION_MIN: u8 = 2;
pub const DELEGATE_VERSION_MAX: u8 = 5;

/// One-byte message tags. The numeric values are part of the wire format
/// and must never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 1,
    IndirectPing = 2,
    Ack = 3,
    Suspect = 4,
    Alive = 5,
    Dead = 6,
    PushPull = 7,
    Compound = 8,
    User = 9,
    Compress = 10,
    Encrypt = 11,
    Nack = 12,
    HasCrc = 13,
    Err = 14,
    Label = 244,
}

impl MessageType {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Ping),
            2 => Some(Self::IndirectPing),
            3 => Some(Self::Ack),
            4 => Some(Self::Suspect),
            5 => Some(Self::Alive),
            6 => Some(Self::Dead),
            7 => Some(Self::PushPull),
            8 => Some(Self::Compound),
            9 => Some(Self::User),
            10 => Some(Self::Compress),
            11 => Some(Self::Encrypt),
            12 => Some(Self::Nack),
            13 => Some(Self::HasCrc),
            14 => Some(Self::Err),
            244 => Some(Self::Label),
            _ => None,
        }
    }
}

/// Liveness state of a peer as carried in push/pull records. The numeric
/// values are part of the wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PeerState {
    Alive = 0,
    Suspect = 1,
    Dead = 2,
    Left = 3,
}

impl PeerState {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Alive),
            1 => Some(Self::Suspect),
            2 => Some(Self::Dead),
            3 => Some(Self::Left),
            _ => None,
        }
    }
}

/// Protocol version vector:
/// `[proto_min, proto_max, proto_cur, delegate_min, delegate_max, delegate_cur]`.
pub type VersionVector = [u8; 6];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ping {
    pub seq_no: u32,
    /// Intended recipient. A receiver whose name differs drops the ping.
    pub node: Option<String>,
    pub source_addr: Bytes,
    pub source_port: u16,
    pub source_node: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndirectPingReq {
    pub seq_no: u32,
    pub target: Bytes,
    pub port: u16,
    pub node: String,
    /// Whether the requester understands nack responses.
    pub nack: bool,
    pub source_addr: Bytes,
    pub source_port: u16,
    pub source_node: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub seq_no: u32,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nack {
    pub seq_no: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Suspect {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alive {
    pub incarnation: u64,
    pub node: String,
    pub addr: Bytes,
    pub port: u16,
    pub meta: Bytes,
    pub vsn: VersionVector,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dead {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushPullHeader {
    pub nodes: u32,
    pub user_state_len: u32,
    pub join: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushNodeState {
    pub name: String,
    pub addr: Bytes,
    pub port: u16,
    pub meta: Bytes,
    pub incarnation: u64,
    pub state: PeerState,
    pub vsn: VersionVector,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorResp {
    pub error: String,
}

/// A fully decoded protocol message as routed by the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    IndirectPing(IndirectPingReq),
    Ack(Ack),
    Nack(Nack),
    Suspect(Suspect),
    Alive(Alive),
    Dead(Dead),
    User(Bytes),
    Err(ErrorResp),
}

impl Message {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Ping(_) => MessageType::Ping,
            Message::IndirectPing(_) => MessageType::IndirectPing,
            Message::Ack(_) => MessageType::Ack,
            Message::Nack(_) => MessageType::Nack,
            Message::Suspect(_) => MessageType::Suspect,
            Message::Alive(_) => MessageType::Alive,
            Message::Dead(_) => MessageType::Dead,
            Message::User(_) => MessageType::User,
            Message::Err(_) => MessageType::Err,
        }
    }
}

/// Encode an IP address into the wire representation (4 or 16 bytes).
#[must_use]
pub fn encode_addr(addr: IpAddr) -> Bytes {
    match addr {
        IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
    }
}

/// Decode a wire address (4 or 16 bytes) plus port into a socket address.
#[must_use]
pub fn decode_addr(raw: &[u8], port: u16) -> Option<SocketAddr> {
    match raw.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(raw);
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}
