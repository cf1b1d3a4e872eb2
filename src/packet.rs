//! Bit-exact wire codec for control and data packets.
//!
//! All multi-byte integers are big-endian. Every packet starts with the
//! fixed 16-byte header:
//!
//! ```ascii
//!  0: magic (u16) - 0x4D42
//!  2: protocol version (u8) - 1
//!  3: kind (u8) - DATA=1, NAK=2, HEARTBEAT=3
//!  4: peer id (u32)
//!  8: session id (u16)
//! 10: sequence (u32) - DATA: the packet's sequence; HEARTBEAT: the highest
//!      assigned sequence; NAK: the request id
//! 14: flags (u16) - bit 0: encrypted payload (DATA), bit 1: unrecoverable
//!      (NAK echo), bits 2..15 reserved / zero
//! ```
//!
//! DATA body: topic length (u16, 1..=250), topic (UTF-8), payload length
//! (u32), payload. NAK body: target peer id (u32), target session id (u16),
//! range count (u16), then `count` inclusive `{start (u32), end (u32)}`
//! pairs. HEARTBEAT has no body.

use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::error::{BusError, BusResult};
use crate::seq::{Seq, SeqRange};
use crate::topic;

pub const MAGIC: u16 = 0x4d42;
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

pub const FLAG_ENCRYPTED: u16 = 0x0001;
pub const FLAG_UNRECOVERABLE: u16 = 0x0002;

const KIND_DATA: u8 = 1;
const KIND_NAK: u8 = 2;
const KIND_HEARTBEAT: u8 = 3;

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub peer_id: u32,
    pub session_id: u16,
    pub sequence: Seq,
    pub flags: u16,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PacketBody {
    Data {
        topic: String,
        payload: Vec<u8>,
    },
    Nak {
        target_peer_id: u32,
        target_session_id: u16,
        ranges: Vec<SeqRange>,
    },
    Heartbeat,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: PacketBody,
}

impl Packet {
    pub fn is_encrypted(&self) -> bool {
        self.header.flags & FLAG_ENCRYPTED != 0
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.header.flags & FLAG_UNRECOVERABLE != 0
    }

    fn kind(&self) -> u8 {
        match self.body {
            PacketBody::Data { .. } => KIND_DATA,
            PacketBody::Nak { .. } => KIND_NAK,
            PacketBody::Heartbeat => KIND_HEARTBEAT,
        }
    }

    /// Serialize into `buf`. Output is byte-exact for equal inputs; callers
    /// rely on this when retransmitting the original packet bytes.
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind());
        buf.put_u32(self.header.peer_id);
        buf.put_u16(self.header.session_id);
        buf.put_u32(self.header.sequence.to_raw());
        buf.put_u16(self.header.flags);

        match &self.body {
            PacketBody::Data { topic, payload } => {
                buf.put_u16(topic.len() as u16);
                buf.put_slice(topic.as_bytes());
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            PacketBody::Nak { target_peer_id, target_session_id, ranges } => {
                buf.put_u32(*target_peer_id);
                buf.put_u16(*target_session_id);
                buf.put_u16(ranges.len() as u16);
                for range in ranges {
                    buf.put_u32(range.from.to_raw());
                    buf.put_u32(range.to.to_raw());
                }
            }
            PacketBody::Heartbeat => {}
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.to_vec()
    }

    /// Decode a full datagram. The datagram must contain exactly one packet;
    /// trailing bytes are rejected as malformed.
    pub fn deser(buf: &mut impl Buf) -> BusResult<Packet> {
        let magic = try_get_u16(buf)?;
        if magic != MAGIC {
            return Err(BusError::MalformedPacket("magic mismatch"));
        }
        let version = try_get_u8(buf)?;
        if version != PROTOCOL_VERSION {
            return Err(BusError::MalformedPacket("unsupported protocol version"));
        }
        let kind = try_get_u8(buf)?;

        let header = PacketHeader {
            peer_id: try_get_u32(buf)?,
            session_id: try_get_u16(buf)?,
            sequence: Seq::from_raw(try_get_u32(buf)?),
            flags: try_get_u16(buf)?,
        };

        let body = match kind {
            KIND_DATA => Self::deser_data_body(buf)?,
            KIND_NAK => Self::deser_nak_body(buf)?,
            KIND_HEARTBEAT => PacketBody::Heartbeat,
            _ => return Err(BusError::MalformedPacket("unknown packet kind")),
        };

        if buf.has_remaining() {
            return Err(BusError::MalformedPacket("trailing bytes after body"));
        }

        Ok(Packet { header, body })
    }

    fn deser_data_body(buf: &mut impl Buf) -> BusResult<PacketBody> {
        let topic_len = try_get_u16(buf)? as usize;
        if topic_len == 0 || topic_len > topic::MAX_TOPIC_LEN {
            return Err(BusError::MalformedPacket("topic length out of range"));
        }
        if buf.remaining() < topic_len {
            return Err(BusError::MalformedPacket("truncated topic"));
        }
        let mut topic_bytes = vec![0u8; topic_len];
        buf.copy_to_slice(&mut topic_bytes);
        let topic = String::from_utf8(topic_bytes)
            .map_err(|_| BusError::MalformedPacket("topic is not valid UTF-8"))?;
        topic::segments(&topic)
            .map_err(|_| BusError::MalformedPacket("topic violates segmenter rules"))?;

        let payload_len = try_get_u32(buf)? as usize;
        if buf.remaining() < payload_len {
            return Err(BusError::MalformedPacket("truncated payload"));
        }
        let mut payload = vec![0u8; payload_len];
        buf.copy_to_slice(&mut payload);

        Ok(PacketBody::Data { topic, payload })
    }

    fn deser_nak_body(buf: &mut impl Buf) -> BusResult<PacketBody> {
        let target_peer_id = try_get_u32(buf)?;
        let target_session_id = try_get_u16(buf)?;
        let range_count = try_get_u16(buf)? as usize;

        let mut ranges = Vec::with_capacity(range_count.min(256));
        for _ in 0..range_count {
            let from = Seq::from_raw(try_get_u32(buf)?);
            let to = Seq::from_raw(try_get_u32(buf)?);
            if to.diff(from) < 0 {
                return Err(BusError::MalformedPacket("inverted sequence range"));
            }
            ranges.push(SeqRange { from, to });
        }

        Ok(PacketBody::Nak { target_peer_id, target_session_id, ranges })
    }
}

// named-trait calls: `bytes` newer than 1.8 has `try_get_*` on `Buf` itself,
// which would otherwise be ambiguous with the bytes_varint extension trait
fn try_get_u8(buf: &mut impl Buf) -> BusResult<u8> {
    TryGetFixedSupport::try_get_u8(buf).map_err(|_| BusError::MalformedPacket("truncated packet"))
}

fn try_get_u16(buf: &mut impl Buf) -> BusResult<u16> {
    TryGetFixedSupport::try_get_u16(buf).map_err(|_| BusError::MalformedPacket("truncated packet"))
}

fn try_get_u32(buf: &mut impl Buf) -> BusResult<u32> {
    TryGetFixedSupport::try_get_u32(buf).map_err(|_| BusError::MalformedPacket("truncated packet"))
}
