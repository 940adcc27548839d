//! Application message codec: type flag, varint id, route, payload.

use bytes::Bytes;
use thiserror::Error;

/// Flag byte plus at least one byte of header.
pub const MSG_HEAD_LEN: usize = 2;

/// Route length travels as a single unsigned byte.
pub const MAX_ROUTE_LEN: usize = 255;

const MSG_TYPE_MASK: u8 = 0x07;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Notify = 1,
    Response = 2,
    Push = 3,
}

impl MessageType {
    /// Request and Response carry a correlation id.
    #[must_use]
    pub fn has_id(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }

    /// Everything except Response is addressed to a route.
    #[must_use]
    pub fn has_route(self) -> bool {
        matches!(self, Self::Request | Self::Notify | Self::Push)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(raw: u8) -> Result<Self, MessageError> {
        match raw {
            0 => Ok(Self::Request),
            1 => Ok(Self::Notify),
            2 => Ok(Self::Response),
            3 => Ok(Self::Push),
            other => Err(MessageError::WrongMessageType { raw: other }),
        }
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("wrong message type {raw}")]
    WrongMessageType { raw: u8 },
    #[error("invalid message: {reason}")]
    Invalid { reason: &'static str },
    #[error("route exceeds {MAX_ROUTE_LEN} bytes: got {got}")]
    RouteTooLong { got: usize },
}

/// One application-layer record, carried inside a Data packet.
///
/// `id` is zero for Notify and Push; `route` is empty for Response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub id: u64,
    pub route: String,
    pub data: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(kind: MessageType, id: u64, route: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            id,
            route: route.into(),
            data: data.into(),
        }
    }

    /// Header layout by type:
    ///
    /// ```text
    /// | request  |----000-| <varint id> <route> |
    /// | notify   |----001-| <route>             |
    /// | response |----010-| <varint id>         |
    /// | push     |----011-| <route>             |
    /// ```
    ///
    /// The flag's reserved bits are always emitted as zero; the decoder
    /// ignores them.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        if self.kind.has_route() && self.route.len() > MAX_ROUTE_LEN {
            return Err(MessageError::RouteTooLong {
                got: self.route.len(),
            });
        }

        let mut buf = Vec::with_capacity(1 + 10 + 1 + self.route.len() + self.data.len());
        buf.push((self.kind as u8) << 1);

        if self.kind.has_id() {
            // Base-128 little-endian: low 7 bits per byte, high bit continues.
            let mut id = self.id;
            loop {
                let byte = (id & 0x7F) as u8;
                id >>= 7;
                if id != 0 {
                    buf.push(byte | 0x80);
                } else {
                    buf.push(byte);
                    break;
                }
            }
        }

        if self.kind.has_route() {
            buf.push(self.route.len() as u8);
            buf.extend_from_slice(self.route.as_bytes());
        }

        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(data: Bytes) -> Result<Self, MessageError> {
        if data.len() < MSG_HEAD_LEN {
            return Err(MessageError::Invalid {
                reason: "shorter than message header",
            });
        }

        let flag = data[0];
        let kind = MessageType::try_from((flag >> 1) & MSG_TYPE_MASK)?;
        let mut offset = 1;

        let mut id = 0u64;
        if kind.has_id() {
            let mut shift = 0u32;
            loop {
                let Some(&byte) = data.get(offset) else {
                    return Err(MessageError::Invalid {
                        reason: "truncated message id",
                    });
                };
                offset += 1;
                let chunk = u64::from(byte & 0x7F);
                if shift >= 64 || (shift == 63 && chunk > 1) {
                    return Err(MessageError::Invalid {
                        reason: "message id overflows u64",
                    });
                }
                id |= chunk << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
        }

        let mut route = String::new();
        if kind.has_route() {
            let Some(&route_len) = data.get(offset) else {
                return Err(MessageError::Invalid {
                    reason: "truncated route length",
                });
            };
            offset += 1;
            let end = offset + usize::from(route_len);
            if end > data.len() {
                return Err(MessageError::Invalid {
                    reason: "truncated route",
                });
            }
            route = std::str::from_utf8(&data[offset..end])
                .map_err(|_| MessageError::Invalid {
                    reason: "route is not utf-8",
                })?
                .to_string();
            offset = end;
        }

        Ok(Self {
            kind,
            id,
            route,
            data: data.slice(offset..),
        })
    }
}
