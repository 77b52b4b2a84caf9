//! Framed envelope and body codecs
//!
//! Every frame is validated with CRC32:
//!
//! ```text
//! [version:1][frame_type:1][length:4][body:N][crc32:4]
//! ```
//!
//! Integers are little-endian. The version byte lets body layouts evolve per
//! frame type without touching the others.

use crate::error::{ProtocolError, Result};
use crate::handshake::{HandshakeRequest, HandshakeResponse};
use crate::packet::{BatchPacket, OperationKind, OrderedPacket, Payload};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;

/// Current envelope version
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes before the body: version + type + length
pub const HEADER_LEN: usize = 6;

/// Bytes after the body: crc32
pub const TRAILER_LEN: usize = 4;

/// Frame type bytes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Source announces itself to a target group
    Connect = 0x01,
    /// Target's handshake request
    Handshake = 0x02,
    /// Source's handshake response
    HandshakeReply = 0x03,
    /// Single packet
    Packet = 0x10,
    /// Packet batch
    Batch = 0x11,
    /// Confirmation of applied keys
    Ack = 0x20,
    /// Refusal with a reason code
    Reject = 0xFF,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::Handshake),
            0x03 => Ok(Self::HandshakeReply),
            0x10 => Ok(Self::Packet),
            0x11 => Ok(Self::Batch),
            0x20 => Ok(Self::Ack),
            0xFF => Ok(Self::Reject),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// Reasons carried by a reject frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// Another source currently feeds the target group
    SourceAlreadyAttached = 1,
    /// Requested resume key was compacted away; re-attach as first handshake
    ResumeKeyCompacted = 2,
    /// Frame could not be understood or was out of place
    Protocol = 3,
    /// Group or member not known to the receiver
    UnknownGroup = 4,
    /// Receiver failed while processing
    Internal = 5,
}

impl TryFrom<u8> for RejectCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::SourceAlreadyAttached),
            2 => Ok(Self::ResumeKeyCompacted),
            3 => Ok(Self::Protocol),
            4 => Ok(Self::UnknownGroup),
            5 => Ok(Self::Internal),
            other => Err(ProtocolError::UnknownRejectCode(other)),
        }
    }
}

/// Replication frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Source identifies itself for a group
    Connect {
        /// Source member name
        source: String,
        /// Replication group
        group: String,
    },
    /// Target's handshake request
    Handshake(HandshakeRequest),
    /// Source's handshake response
    HandshakeReply(HandshakeResponse),
    /// One packet
    Packet(OrderedPacket),
    /// Several packets
    Batch(BatchPacket),
    /// Everything up to and including `key` applied
    Ack {
        /// Confirmed key
        key: u64,
    },
    /// Refusal
    Reject {
        /// Reason code
        code: RejectCode,
        /// Human readable detail
        message: String,
    },
}

impl Frame {
    /// Frame type of this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Connect { .. } => FrameType::Connect,
            Self::Handshake(_) => FrameType::Handshake,
            Self::HandshakeReply(_) => FrameType::HandshakeReply,
            Self::Packet(_) => FrameType::Packet,
            Self::Batch(_) => FrameType::Batch,
            Self::Ack { .. } => FrameType::Ack,
            Self::Reject { .. } => FrameType::Reject,
        }
    }

    /// Reject frame helper
    pub fn reject(code: RejectCode, message: impl Into<String>) -> Self {
        Self::Reject {
            code,
            message: message.into(),
        }
    }

    /// Encode into a complete envelope
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        match self {
            Self::Connect { source, group } => {
                put_str(&mut body, source)?;
                put_str(&mut body, group)?;
            }
            Self::Handshake(request) => encode_handshake_request(&mut body, request)?,
            Self::HandshakeReply(response) => encode_handshake_response(&mut body, response)?,
            Self::Packet(packet) => encode_packet(&mut body, packet)?,
            Self::Batch(batch) => encode_batch(&mut body, batch)?,
            Self::Ack { key } => body.put_u64_le(*key),
            Self::Reject { code, message } => {
                body.put_u8(*code as u8);
                put_str(&mut body, message)?;
            }
        }

        let body_len = u32::try_from(body.len())
            .map_err(|_| ProtocolError::malformed("frame body exceeds u32 length"))?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len() + TRAILER_LEN);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.frame_type() as u8);
        buf.put_u32_le(body_len);
        buf.extend_from_slice(&body);

        // CRC32 of version + type + length + body
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.put_u32_le(hasher.finalize());

        Ok(buf.freeze())
    }

    /// Decode one complete envelope
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN + TRAILER_LEN {
            return Err(ProtocolError::Truncated {
                context: "envelope",
                needed: HEADER_LEN + TRAILER_LEN - buf.len(),
            });
        }

        let body_len = body_len_from_header(&buf[..HEADER_LEN]);
        let total = HEADER_LEN + body_len + TRAILER_LEN;
        if buf.len() < total {
            return Err(ProtocolError::Truncated {
                context: "envelope body",
                needed: total - buf.len(),
            });
        }
        if buf.len() > total {
            return Err(ProtocolError::malformed(format!(
                "{} trailing bytes after frame",
                buf.len() - total
            )));
        }

        let crc_offset = HEADER_LEN + body_len;
        let mut stored = &buf[crc_offset..];
        let expected = stored.get_u32_le();
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let actual = hasher.finalize();
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let frame_type = FrameType::try_from(buf[1])?;

        let mut body = &buf[HEADER_LEN..crc_offset];
        let frame = match frame_type {
            FrameType::Connect => Self::Connect {
                source: get_str(&mut body, "connect source")?,
                group: get_str(&mut body, "connect group")?,
            },
            FrameType::Handshake => Self::Handshake(decode_handshake_request(&mut body)?),
            FrameType::HandshakeReply => {
                Self::HandshakeReply(decode_handshake_response(&mut body)?)
            }
            FrameType::Packet => Self::Packet(decode_packet(&mut body)?),
            FrameType::Batch => Self::Batch(decode_batch(&mut body)?),
            FrameType::Ack => {
                need(&body, 8, "ack key")?;
                Self::Ack {
                    key: body.get_u64_le(),
                }
            }
            FrameType::Reject => {
                need(&body, 1, "reject code")?;
                let code = RejectCode::try_from(body.get_u8())?;
                Self::Reject {
                    code,
                    message: get_str(&mut body, "reject message")?,
                }
            }
        };

        if body.has_remaining() {
            return Err(ProtocolError::malformed(format!(
                "{} unread bytes in {:?} body",
                body.remaining(),
                frame_type
            )));
        }
        Ok(frame)
    }
}

/// Body length announced by a frame header
///
/// `header` must hold at least [`HEADER_LEN`] bytes.
pub fn body_len_from_header(header: &[u8]) -> usize {
    let mut len = &header[2..HEADER_LEN];
    len.get_u32_le() as usize
}

/// Append the packet body layout to `buf`
pub fn encode_packet(buf: &mut BytesMut, packet: &OrderedPacket) -> Result<()> {
    let payload = packet.payload.encode()?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::malformed("payload exceeds u32 length"))?;

    buf.put_u64_le(packet.key);
    buf.put_u8(packet.kind().code());
    buf.put_u32_le(packet.weight);
    buf.put_u8(packet.transient as u8);
    buf.put_u8(packet.from_gateway as u8);
    buf.put_u32_le(payload_len);
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Read one packet body from `buf`
pub fn decode_packet(buf: &mut &[u8]) -> Result<OrderedPacket> {
    need(buf, 8 + 1 + 4 + 1 + 1 + 4, "packet header")?;
    let key = buf.get_u64_le();
    let kind = OperationKind::try_from(buf.get_u8())?;
    let weight = buf.get_u32_le();
    let transient = get_bool(buf)?;
    let from_gateway = get_bool(buf)?;
    let payload_len = buf.get_u32_le() as usize;
    need(buf, payload_len, "packet payload")?;
    let payload = Payload::decode(kind, &buf[..payload_len])?;
    buf.advance(payload_len);

    Ok(OrderedPacket {
        key,
        weight,
        transient,
        from_gateway,
        payload,
    })
}

fn encode_batch(buf: &mut BytesMut, batch: &BatchPacket) -> Result<()> {
    let count = u32::try_from(batch.packets.len())
        .map_err(|_| ProtocolError::malformed("batch exceeds u32 count"))?;
    buf.put_u32_le(count);
    for packet in &batch.packets {
        encode_packet(buf, packet)?;
    }
    Ok(())
}

fn decode_batch(buf: &mut &[u8]) -> Result<BatchPacket> {
    need(buf, 4, "batch count")?;
    let count = buf.get_u32_le() as usize;
    // Each packet needs at least its 19 byte header
    if count > buf.remaining() / 19 {
        return Err(ProtocolError::malformed(format!(
            "batch count {} exceeds remaining {} bytes",
            count,
            buf.remaining()
        )));
    }
    let mut packets = Vec::with_capacity(count);
    let mut previous: Option<u64> = None;
    for _ in 0..count {
        let packet = decode_packet(buf)?;
        if let Some(prev) = previous {
            if packet.key <= prev {
                return Err(ProtocolError::malformed(format!(
                    "batch keys not increasing: {} after {}",
                    packet.key, prev
                )));
            }
        }
        previous = Some(packet.key);
        packets.push(packet);
    }
    Ok(BatchPacket { packets })
}

fn encode_handshake_request(buf: &mut BytesMut, request: &HandshakeRequest) -> Result<()> {
    buf.put_u8(request.first_handshake as u8);
    buf.put_u64_le(request.last_confirmed_key);
    put_opt_blob(buf, request.reliable_async_state.as_deref())
}

fn decode_handshake_request(buf: &mut &[u8]) -> Result<HandshakeRequest> {
    need(buf, 1 + 8, "handshake request")?;
    let first_handshake = get_bool(buf)?;
    let last_confirmed_key = buf.get_u64_le();
    let reliable_async_state = get_opt_blob(buf)?;
    Ok(HandshakeRequest {
        first_handshake,
        last_confirmed_key,
        reliable_async_state,
    })
}

fn encode_handshake_response(buf: &mut BytesMut, response: &HandshakeResponse) -> Result<()> {
    buf.put_u64_le(response.start_key);
    buf.put_u8(response.discard_local_state as u8);
    put_opt_blob(buf, response.reliable_async_state.as_deref())
}

fn decode_handshake_response(buf: &mut &[u8]) -> Result<HandshakeResponse> {
    need(buf, 8 + 1, "handshake response")?;
    let start_key = buf.get_u64_le();
    let discard_local_state = get_bool(buf)?;
    let reliable_async_state = get_opt_blob(buf)?;
    Ok(HandshakeResponse {
        start_key,
        discard_local_state,
        reliable_async_state,
    })
}

fn need(buf: &&[u8], n: usize, context: &'static str) -> Result<()> {
    if buf.remaining() < n {
        return Err(ProtocolError::Truncated {
            context,
            needed: n - buf.remaining(),
        });
    }
    Ok(())
}

fn get_bool(buf: &mut &[u8]) -> Result<bool> {
    need(buf, 1, "bool")?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::malformed(format!("invalid bool byte {}", other))),
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| ProtocolError::malformed("string exceeds u16 length"))?;
    buf.put_u16_le(len);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8], context: &'static str) -> Result<String> {
    need(buf, 2, context)?;
    let len = buf.get_u16_le() as usize;
    need(buf, len, context)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| ProtocolError::malformed(format!("{}: invalid UTF-8: {}", context, e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn put_opt_blob(buf: &mut BytesMut, blob: Option<&[u8]>) -> Result<()> {
    match blob {
        Some(bytes) => {
            let len = u32::try_from(bytes.len())
                .map_err(|_| ProtocolError::malformed("state blob exceeds u32 length"))?;
            buf.put_u8(1);
            buf.put_u32_le(len);
            buf.extend_from_slice(bytes);
        }
        None => buf.put_u8(0),
    }
    Ok(())
}

fn get_opt_blob(buf: &mut &[u8]) -> Result<Option<Vec<u8>>> {
    if !get_bool(buf)? {
        return Ok(None);
    }
    need(buf, 4, "state blob length")?;
    let len = buf.get_u32_le() as usize;
    need(buf, len, "state blob")?;
    let blob = buf[..len].to_vec();
    buf.advance(len);
    Ok(Some(blob))
}
