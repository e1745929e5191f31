use thiserror::Error;

use crate::protocol::DecodeError;

/// Clipbridge error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unknown packet type: {0:#04x}")]
    UnknownPacket(u32),

    #[error("Unexpected packet: {0}")]
    UnexpectedPacket(String),

    #[error("Peer presented no usable identity: {0}")]
    MalformedPeer(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Failed to serialize/deserialize: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Clipboard error: {0}")]
    Clipboard(String),

    #[error("Hub error: {0}")]
    Hub(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Operation requires the {0} role")]
    WrongRole(&'static str),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownType(tag) => Error::UnknownPacket(tag),
            other => Error::MalformedPacket(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
