//! Packet envelope codec: typed, length-prefixed records with streaming decode.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Wire header: 1 byte type + 3 bytes big-endian body length.
pub const PACKET_HEAD_LEN: usize = 4;

/// Default cap on a packet body, in bytes.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024;

/// Largest body length the 24-bit header can carry.
const MAX_WIRE_BODY_LEN: usize = 0xFF_FFFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Session negotiation: request from the client, reply from the server.
    Handshake = 1,
    /// Client commit of a negotiated handshake.
    HandshakeAck = 2,
    Heartbeat = 3,
    Data = 4,
    /// Orderly shutdown notice from either side.
    Close = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(raw: u8) -> Result<Self, PacketError> {
        match raw {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::HandshakeAck),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::Data),
            5 => Ok(Self::Close),
            other => Err(PacketError::WrongPacketType { raw: other }),
        }
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("wrong packet type {raw}")]
    WrongPacketType { raw: u8 },
    #[error("packet size exceeded: max {max} got {got}")]
    SizeExceeded { max: usize, got: usize },
}

/// One framed record on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub data: Bytes,
}

impl Packet {
    #[must_use]
    pub fn new(kind: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// A body-less packet of the given type.
    #[must_use]
    pub fn empty(kind: PacketType) -> Self {
        Self {
            kind,
            data: Bytes::new(),
        }
    }

    /// Frame the packet as `[type][len3 BE][body]`.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let len = self.data.len();
        if len > MAX_WIRE_BODY_LEN {
            return Err(PacketError::SizeExceeded {
                max: MAX_WIRE_BODY_LEN,
                got: len,
            });
        }
        let mut buf = Vec::with_capacity(PACKET_HEAD_LEN + len);
        buf.push(self.kind as u8);
        buf.push(((len >> 16) & 0xFF) as u8);
        buf.push(((len >> 8) & 0xFF) as u8);
        buf.push((len & 0xFF) as u8);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }
}

/// Incremental packet parser over an arbitrarily fragmented byte stream.
///
/// Feed chunks as they arrive; each call yields every packet completed so
/// far and retains the trailing partial bytes. A decode error poisons the
/// stream; callers are expected to drop the transport.
#[derive(Debug)]
pub struct PacketDecoder {
    buf: BytesMut,
    /// Header of the packet whose body is still incomplete.
    pending: Option<(PacketType, usize)>,
    max_packet_size: usize,
}

impl PacketDecoder {
    #[must_use]
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            pending: None,
            max_packet_size,
        }
    }

    fn read_header(&mut self) -> Result<(), PacketError> {
        let kind = PacketType::try_from(self.buf[0])?;
        let len = (usize::from(self.buf[1]) << 16)
            | (usize::from(self.buf[2]) << 8)
            | usize::from(self.buf[3]);
        if len > self.max_packet_size {
            return Err(PacketError::SizeExceeded {
                max: self.max_packet_size,
                got: len,
            });
        }
        self.buf.advance(PACKET_HEAD_LEN);
        self.pending = Some((kind, len));
        Ok(())
    }

    /// Absorb `data` and return every packet now complete, in order.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Packet>, PacketError> {
        self.buf.extend_from_slice(data);

        let mut packets = Vec::new();
        if self.pending.is_none() {
            if self.buf.len() < PACKET_HEAD_LEN {
                return Ok(packets);
            }
            self.read_header()?;
        }

        while let Some((kind, len)) = self.pending {
            if self.buf.len() < len {
                break;
            }
            let data = self.buf.split_to(len).freeze();
            packets.push(Packet { kind, data });
            self.pending = None;

            if self.buf.len() < PACKET_HEAD_LEN {
                break;
            }
            self.read_header()?;
        }

        Ok(packets)
    }
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}
