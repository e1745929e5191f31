//! Packet definitions for the LAN/Bluetooth wire protocol

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Wire type tag of each packet variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    InvalidRequest = 0x00,
    Authentication = 0x01,
    Syncing = 0x02,
    PingPong = 0x03,
    CertificateExchange = 0x04,
}

impl PacketType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0x00 => Some(Self::InvalidRequest),
            0x01 => Some(Self::Authentication),
            0x02 => Some(Self::Syncing),
            0x03 => Some(Self::PingPong),
            0x04 => Some(Self::CertificateExchange),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Outcome of the server's authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Ok,
    Fail,
}

impl AuthStatus {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            AuthStatus::Ok => 0,
            AuthStatus::Fail => 1,
        }
    }

    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(AuthStatus::Ok),
            1 => Some(AuthStatus::Fail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingKind {
    Ping,
    Pong,
}

impl PingKind {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            PingKind::Ping => 0,
            PingKind::Pong => 1,
        }
    }

    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(PingKind::Ping),
            1 => Some(PingKind::Pong),
            _ => None,
        }
    }
}

/// Reason code carried by an `InvalidRequest` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidRequestCode {
    /// A recognized packet whose body could not be parsed
    CodingError,
    /// A packet with an unrecognized type tag
    InvalidPacket,
}

impl InvalidRequestCode {
    pub(crate) fn to_wire(self) -> u32 {
        match self {
            InvalidRequestCode::CodingError => 0,
            InvalidRequestCode::InvalidPacket => 1,
        }
    }

    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(InvalidRequestCode::CodingError),
            1 => Some(InvalidRequestCode::InvalidPacket),
            _ => None,
        }
    }
}

/// One clipboard representation: a MIME type and its raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardItem {
    pub mime_type: String,
    pub payload: Vec<u8>,
}

impl ClipboardItem {
    pub fn new(mime_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            mime_type: mime_type.into(),
            payload: payload.into(),
        }
    }

    /// Plain UTF-8 text item
    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text/plain", text.into().into_bytes())
    }

    /// The payload as text, if this is a text item holding valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        if self.mime_type.starts_with("text/") {
            std::str::from_utf8(&self.payload).ok()
        } else {
            None
        }
    }
}

/// SHA256 hash over an ordered list of clipboard items, used for echo suppression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    pub fn of(items: &[ClipboardItem]) -> Self {
        let mut hasher = Sha256::new();
        for item in items {
            hasher.update((item.mime_type.len() as u64).to_be_bytes());
            hasher.update(item.mime_type.as_bytes());
            hasher.update((item.payload.len() as u64).to_be_bytes());
            hasher.update(&item.payload);
        }
        ContentHash(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// All packets exchanged on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    InvalidRequest {
        code: InvalidRequestCode,
        message: Vec<u8>,
    },
    Authentication(AuthStatus),
    Syncing(Vec<ClipboardItem>),
    PingPong(PingKind),
    CertificateExchange(Vec<u8>),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::InvalidRequest { .. } => PacketType::InvalidRequest,
            Packet::Authentication(_) => PacketType::Authentication,
            Packet::Syncing(_) => PacketType::Syncing,
            Packet::PingPong(_) => PacketType::PingPong,
            Packet::CertificateExchange(_) => PacketType::CertificateExchange,
        }
    }

    pub fn invalid_request(code: InvalidRequestCode, message: impl Into<Vec<u8>>) -> Self {
        Packet::InvalidRequest {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_tags() {
        for tag in 0..=4 {
            let ty = PacketType::from_tag(tag).unwrap();
            assert_eq!(ty.tag(), tag);
        }
        assert!(PacketType::from_tag(5).is_none());
    }

    #[test]
    fn test_content_hash_consistency() {
        let items = vec![ClipboardItem::text("hello")];
        assert_eq!(ContentHash::of(&items), ContentHash::of(&items));
    }

    #[test]
    fn test_content_hash_different() {
        let a = vec![ClipboardItem::text("hello")];
        let b = vec![ClipboardItem::text("world")];
        assert_ne!(ContentHash::of(&a), ContentHash::of(&b));
    }

    #[test]
    fn test_content_hash_is_boundary_aware() {
        let a = vec![ClipboardItem::new("text/plain", b"ab".to_vec())];
        let b = vec![ClipboardItem::new("text/plainab", Vec::new())];
        assert_ne!(ContentHash::of(&a), ContentHash::of(&b));
    }

    #[test]
    fn test_as_text() {
        assert_eq!(ClipboardItem::text("hi").as_text(), Some("hi"));
        assert_eq!(ClipboardItem::new("image/png", vec![0xff]).as_text(), None);
    }
}
