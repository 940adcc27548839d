//! Wire codecs for the tether session protocol.
//!
//! Two layers, both bit-exact:
//! - [`packet`]: the transport envelope, typed and length-prefixed, with
//!   a streaming decoder.
//! - [`message`]: the application header carried inside a Data packet:
//!   type flag, variable-length id, route, payload.

#![forbid(unsafe_code)]

pub mod message;
pub mod packet;

pub use message::{MAX_ROUTE_LEN, Message, MessageError, MessageType};
pub use packet::{
    DEFAULT_MAX_PACKET_SIZE, PACKET_HEAD_LEN, Packet, PacketDecoder, PacketError, PacketType,
};
