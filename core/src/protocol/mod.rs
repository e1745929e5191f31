//! Wire protocol: packet types and the length-prefixed binary codec

pub mod codec;
pub mod constants;
mod packet;

pub use codec::{decode, encode, DecodeError, Frame, PacketCodec};
pub use packet::{
    AuthStatus, ClipboardItem, ContentHash, InvalidRequestCode, Packet, PacketType, PingKind,
};
