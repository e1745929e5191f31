//! Binary packet codec
//!
//! Every packet on the wire is:
//! - 4 bytes: big-endian u32 total length, including these 4 bytes
//! - 4 bytes: big-endian u32 type tag
//! - N bytes: type-specific body
//!
//! Variable-length fields inside a body carry their own u32 length prefix,
//! except the trailing `message` of `InvalidRequest` and the certificate of
//! `CertificateExchange`, which fill whatever the declared length leaves.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::constants::{HEADER_LEN, MAX_PACKET_SIZE};
use super::packet::{
    AuthStatus, ClipboardItem, InvalidRequestCode, Packet, PacketType, PingKind,
};
use crate::Error;

/// Why a buffer could not be decoded into a packet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("incomplete packet: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("declared length {declared} does not match {actual} buffered bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("declared length {0} is shorter than the packet header")]
    LengthTooSmall(usize),

    #[error("declared length {0} exceeds the maximum packet size")]
    TooLarge(usize),

    #[error("unknown packet type {0:#04x}")]
    UnknownType(u32),

    #[error("malformed {packet:?} body: {reason}")]
    Malformed {
        packet: PacketType,
        reason: &'static str,
    },

    #[error("{0} trailing bytes after packet body")]
    TrailingBytes(usize),
}

impl DecodeError {
    fn malformed(packet: PacketType, reason: &'static str) -> Self {
        DecodeError::Malformed { packet, reason }
    }

    /// The `InvalidRequest` reply owed to the peer for this failure
    pub fn reply(&self) -> Packet {
        let code = match self {
            DecodeError::UnknownType(_) => InvalidRequestCode::InvalidPacket,
            _ => InvalidRequestCode::CodingError,
        };
        Packet::invalid_request(code, self.to_string().into_bytes())
    }
}

/// Encode a packet into its wire representation.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let mut body = BytesMut::new();
    match packet {
        Packet::InvalidRequest { code, message } => {
            body.put_u32(code.to_wire());
            body.put_slice(message);
        }
        Packet::Authentication(status) => body.put_u32(status.to_wire()),
        Packet::PingPong(kind) => body.put_u32(kind.to_wire()),
        Packet::CertificateExchange(der) => body.put_slice(der),
        Packet::Syncing(items) => {
            body.put_u32(items.len() as u32);
            for item in items {
                body.put_u32(item.mime_type.len() as u32);
                body.put_slice(item.mime_type.as_bytes());
                body.put_u32(item.payload.len() as u32);
                body.put_slice(&item.payload);
            }
        }
    }

    let total = HEADER_LEN + body.len();
    let mut out = Vec::with_capacity(total);
    out.put_u32(total as u32);
    out.put_u32(packet.packet_type().tag());
    out.extend_from_slice(&body);
    out
}

/// Decode exactly one packet from `bytes`.
///
/// The buffer must hold precisely the declared length: fewer bytes yield
/// `Incomplete` (retry once more data is buffered), more yield `TrailingBytes`.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let declared = declared_length(bytes)?;
    if declared < HEADER_LEN {
        return Err(DecodeError::LengthTooSmall(declared));
    }
    if bytes.len() < declared {
        return Err(DecodeError::Incomplete {
            needed: declared,
            available: bytes.len(),
        });
    }
    if bytes.len() > declared {
        return Err(DecodeError::TrailingBytes(bytes.len() - declared));
    }
    decode_frame(bytes)
}

fn declared_length(bytes: &[u8]) -> Result<usize, DecodeError> {
    match bytes.get(..4) {
        Some(prefix) => {
            let mut prefix = prefix;
            Ok(prefix.get_u32() as usize)
        }
        None => Err(DecodeError::Incomplete {
            needed: 4,
            available: bytes.len(),
        }),
    }
}

/// Parse a frame whose length prefix has already been checked against its size.
fn decode_frame(frame: &[u8]) -> Result<Packet, DecodeError> {
    let declared = declared_length(frame)?;
    if declared != frame.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: frame.len(),
        });
    }

    let mut reader = BodyReader::new(&frame[4..]);
    let tag = reader
        .u32()
        .ok_or(DecodeError::LengthTooSmall(frame.len()))?;
    let packet_type = PacketType::from_tag(tag).ok_or(DecodeError::UnknownType(tag))?;

    let packet = match packet_type {
        PacketType::InvalidRequest => {
            let code = reader
                .u32()
                .and_then(InvalidRequestCode::from_wire)
                .ok_or(DecodeError::malformed(packet_type, "bad error code"))?;
            Packet::InvalidRequest {
                code,
                message: reader.rest().to_vec(),
            }
        }
        PacketType::Authentication => {
            let status = reader
                .u32()
                .and_then(AuthStatus::from_wire)
                .ok_or(DecodeError::malformed(packet_type, "bad status"))?;
            Packet::Authentication(status)
        }
        PacketType::PingPong => {
            let kind = reader
                .u32()
                .and_then(PingKind::from_wire)
                .ok_or(DecodeError::malformed(packet_type, "bad kind"))?;
            Packet::PingPong(kind)
        }
        PacketType::CertificateExchange => Packet::CertificateExchange(reader.rest().to_vec()),
        PacketType::Syncing => Packet::Syncing(decode_items(&mut reader)?),
    };

    match reader.remaining() {
        0 => Ok(packet),
        n => Err(DecodeError::TrailingBytes(n)),
    }
}

fn decode_items(reader: &mut BodyReader<'_>) -> Result<Vec<ClipboardItem>, DecodeError> {
    let malformed = |reason| DecodeError::malformed(PacketType::Syncing, reason);

    let count = reader.u32().ok_or(malformed("missing item count"))? as usize;
    // Each item needs at least its two length prefixes.
    let mut items = Vec::with_capacity(count.min(reader.remaining() / 8));
    for _ in 0..count {
        let mime = reader
            .prefixed()
            .ok_or(malformed("mime type overruns packet"))?;
        let mime_type = std::str::from_utf8(mime)
            .map_err(|_| malformed("mime type is not UTF-8"))?
            .to_string();
        let payload = reader
            .prefixed()
            .ok_or(malformed("payload overruns packet"))?
            .to_vec();
        items.push(ClipboardItem { mime_type, payload });
    }
    Ok(items)
}

struct BodyReader<'a> {
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn u32(&mut self) -> Option<u32> {
        if self.buf.len() < 4 {
            return None;
        }
        Some(self.buf.get_u32())
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() < len {
            return None;
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Some(head)
    }

    fn prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        self.bytes(len)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Item produced by the streaming decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Packet(Packet),
    /// A complete frame that could not be parsed; the stream is still coherent.
    Rejected(DecodeError),
}

/// Streaming codec used by sessions.
///
/// Partial frames stay buffered until the declared length has arrived. A frame
/// with a recognized type but a bad body is consumed and surfaced as
/// `Frame::Rejected`; an unrecognized type tag discards everything buffered,
/// since the rest of the buffer cannot be trusted to start on a frame boundary.
/// Lengths that cannot describe a valid frame are unrecoverable and end the
/// stream with an error.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let declared = declared_length(src)?;
        if declared < HEADER_LEN {
            return Err(DecodeError::LengthTooSmall(declared).into());
        }
        if declared > self.max_packet_size {
            return Err(DecodeError::TooLarge(declared).into());
        }
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let tag = (&src[4..8]).get_u32();
        if PacketType::from_tag(tag).is_none() {
            src.clear();
            return Ok(Some(Frame::Rejected(DecodeError::UnknownType(tag))));
        }

        if src.len() < declared {
            src.reserve(declared - src.len());
            return Ok(None);
        }

        let frame = src.split_to(declared);
        Ok(Some(match decode_frame(&frame) {
            Ok(packet) => Frame::Packet(packet),
            Err(err) => Frame::Rejected(err),
        }))
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = Error;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        let bytes = encode(&packet);
        if bytes.len() > self.max_packet_size {
            return Err(DecodeError::TooLarge(bytes.len()).into());
        }
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<Packet> {
        vec![
            Packet::invalid_request(InvalidRequestCode::CodingError, b"bad".to_vec()),
            Packet::invalid_request(InvalidRequestCode::InvalidPacket, Vec::new()),
            Packet::Authentication(AuthStatus::Ok),
            Packet::Authentication(AuthStatus::Fail),
            Packet::PingPong(PingKind::Ping),
            Packet::PingPong(PingKind::Pong),
            Packet::CertificateExchange(vec![0x30, 0x82, 0x01]),
            Packet::CertificateExchange(Vec::new()),
            Packet::Syncing(Vec::new()),
            Packet::Syncing(vec![
                ClipboardItem::text("hello"),
                ClipboardItem::new("", Vec::new()),
                ClipboardItem::new("image/png", vec![0u8; 300]),
            ]),
        ]
    }

    #[test]
    fn test_roundtrip_all_variants() {
        for packet in all_variants() {
            let bytes = encode(&packet);
            assert_eq!(decode(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn test_length_prefix_covers_whole_packet() {
        for packet in all_variants() {
            let bytes = encode(&packet);
            let declared = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
            assert_eq!(declared, bytes.len());
        }
    }

    #[test]
    fn test_wire_layout() {
        let bytes = encode(&Packet::Syncing(vec![ClipboardItem::new("a", vec![7])]));
        assert_eq!(
            bytes,
            vec![
                0, 0, 0, 22, // total length
                0, 0, 0, 2, // type
                0, 0, 0, 1, // item count
                0, 0, 0, 1, b'a', // mime
                0, 0, 0, 1, 7, // payload
            ]
        );
        assert_eq!(
            encode(&Packet::Authentication(AuthStatus::Fail)),
            vec![0, 0, 0, 12, 0, 0, 0, 1, 0, 0, 0, 1]
        );
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = encode(&Packet::PingPong(PingKind::Ping));
        bytes.push(0);
        assert_eq!(decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_rejects_short_buffer() {
        let bytes = encode(&Packet::PingPong(PingKind::Ping));
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::Incomplete { .. })
        ));
        assert!(matches!(decode(&bytes[..2]), Err(DecodeError::Incomplete { .. })));
    }

    #[test]
    fn test_rejects_body_shorter_than_declared_fields() {
        // Authentication with a declared length that leaves no room for the status.
        let bytes = vec![0, 0, 0, 8, 0, 0, 0, 1];
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::Malformed { packet: PacketType::Authentication, .. })
        ));
    }

    #[test]
    fn test_rejects_extra_bytes_inside_fixed_body() {
        // PingPong declaring 13 bytes: one byte more than its fixed body.
        let bytes = vec![0, 0, 0, 13, 0, 0, 0, 3, 0, 0, 0, 0, 9];
        assert_eq!(decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_rejects_item_overrun() {
        let mut bytes = encode(&Packet::Syncing(vec![ClipboardItem::text("hi")]));
        // Inflate the payload length of the only item past the packet end.
        let payload_len_at = bytes.len() - 2 - 4;
        bytes[payload_len_at + 3] = 50;
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::Malformed { packet: PacketType::Syncing, .. })
        ));
    }

    #[test]
    fn test_unknown_type() {
        let bytes = vec![0, 0, 0, 8, 0, 0, 0, 9];
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownType(9)));
        assert_eq!(
            DecodeError::UnknownType(9).reply(),
            Packet::invalid_request(
                InvalidRequestCode::InvalidPacket,
                DecodeError::UnknownType(9).to_string().into_bytes()
            )
        );
    }

    #[test]
    fn test_streaming_waits_for_full_frame() {
        let bytes = encode(&Packet::Syncing(vec![ClipboardItem::text("streamed")]));
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();

        for chunk in bytes.chunks(3) {
            assert_eq!(codec.decode(&mut buf).unwrap(), None);
            buf.extend_from_slice(chunk);
        }
        let frame = codec.decode(&mut buf).unwrap();
        assert_eq!(
            frame,
            Some(Frame::Packet(Packet::Syncing(vec![ClipboardItem::text("streamed")])))
        );
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_framed_read_over_split_reads() {
        use futures_util::StreamExt;
        use tokio_util::codec::FramedRead;

        let first = encode(&Packet::Syncing(vec![ClipboardItem::text("split across reads")]));
        let second = encode(&Packet::PingPong(PingKind::Pong));
        let (head, tail) = first.split_at(6);
        let mut joined = tail.to_vec();
        joined.extend_from_slice(&second);

        let io = tokio_test::io::Builder::new().read(head).read(&joined).build();
        let mut frames = FramedRead::new(io, PacketCodec::default());

        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::Packet(Packet::Syncing(vec![ClipboardItem::text("split across reads")]))
        );
        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            Frame::Packet(Packet::PingPong(PingKind::Pong))
        );
        assert!(frames.next().await.is_none());
    }

    #[test]
    fn test_streaming_recovers_after_bad_body() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        // Authentication with status 7, followed by a valid ping.
        buf.extend_from_slice(&[0, 0, 0, 12, 0, 0, 0, 1, 0, 0, 0, 7]);
        buf.extend_from_slice(&encode(&Packet::PingPong(PingKind::Ping)));

        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Rejected(err)) => {
                assert_eq!(err.reply().packet_type(), PacketType::InvalidRequest);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Packet(Packet::PingPong(PingKind::Ping)))
        );
    }

    #[test]
    fn test_streaming_unknown_type_discards_buffer() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 8, 0, 0, 0, 0x42]);
        buf.extend_from_slice(&encode(&Packet::PingPong(PingKind::Ping)));

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Rejected(DecodeError::UnknownType(0x42)))
        );
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_streaming_rejects_oversized_length() {
        let mut codec = PacketCodec::new(64);
        let mut buf = BytesMut::from(&[0u8, 0, 1, 0, 0, 0, 0, 2][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encoder_enforces_limit() {
        let mut codec = PacketCodec::new(16);
        let mut dst = BytesMut::new();
        let big = Packet::CertificateExchange(vec![0u8; 32]);
        assert!(codec.encode(big, &mut dst).is_err());
        assert!(codec
            .encode(Packet::PingPong(PingKind::Pong), &mut dst)
            .is_ok());
        assert_eq!(dst.len(), 12);
    }
}
