//! System messages are the peers' bookkeeping: they carry negative type ids and never reach user
//!  handlers.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::BusError;
use crate::log::LogMode;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::wire::message::{Message, SenderId, Timestamp, TypeId};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum SystemMessageType {
    SenderDescription = -1,
    TypeDescription = -2,
    UdpDescription = -3,
    LogDescription = -4,
    Disconnect = -5,
}

impl SystemMessageType {
    pub fn type_id(self) -> TypeId {
        TypeId(self.into())
    }

    pub fn of(type_id: TypeId) -> Option<SystemMessageType> {
        SystemMessageType::try_from(type_id.0).ok()
    }
}

/// A remote peer's (id, name) pair for a sender or a type. The id is the peer's own, and it
///  travels in the message's sender field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub id: i32,
    pub name: String,
}

/// The peer's inbound UDP port. The address is the TCP peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDescription {
    pub port: u16,
}

/// The peer asks us to log this session. The mode travels in the sender field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDescription {
    pub mode: LogMode,
    pub incoming: String,
    pub outgoing: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    SenderDescription(Description),
    TypeDescription(Description),
    UdpDescription(UdpDescription),
    LogDescription(LogDescription),
    Disconnect,
}

impl SystemMessage {
    pub fn kind(&self) -> SystemMessageType {
        match self {
            SystemMessage::SenderDescription(_) => SystemMessageType::SenderDescription,
            SystemMessage::TypeDescription(_) => SystemMessageType::TypeDescription,
            SystemMessage::UdpDescription(_) => SystemMessageType::UdpDescription,
            SystemMessage::LogDescription(_) => SystemMessageType::LogDescription,
            SystemMessage::Disconnect => SystemMessageType::Disconnect,
        }
    }

    /// Returns `Ok(None)` for user messages
    pub fn parse(msg: &Message) -> Result<Option<SystemMessage>, BusError> {
        let Some(kind) = SystemMessageType::of(msg.type_id) else {
            if msg.type_id.is_system() {
                return Err(BusError::Framing(format!("unknown system message type {:?}", msg.type_id)));
            }
            return Ok(None);
        };

        let mut buf: &[u8] = &msg.payload;
        let result = match kind {
            SystemMessageType::SenderDescription => SystemMessage::SenderDescription(Description {
                id: msg.sender.0,
                name: buf.checked_string()?,
            }),
            SystemMessageType::TypeDescription => SystemMessage::TypeDescription(Description {
                id: msg.sender.0,
                name: buf.checked_string()?,
            }),
            SystemMessageType::UdpDescription => {
                let port = buf.checked_u32()?;
                let port = u16::try_from(port)
                    .map_err(|_| BusError::Framing(format!("UDP port {} out of range", port)))?;
                SystemMessage::UdpDescription(UdpDescription { port })
            }
            SystemMessageType::LogDescription => {
                let mode = u8::try_from(msg.sender.0).ok()
                    .and_then(LogMode::from_bits)
                    .ok_or_else(|| BusError::Framing(format!("invalid log mode {}", msg.sender.0)))?;
                SystemMessage::LogDescription(LogDescription {
                    mode,
                    incoming: buf.checked_string()?,
                    outgoing: buf.checked_string()?,
                })
            }
            SystemMessageType::Disconnect => SystemMessage::Disconnect,
        };
        Ok(Some(result))
    }

    /// the value that goes into the wire message's sender field
    fn sender_field(&self) -> SenderId {
        match self {
            SystemMessage::SenderDescription(d) | SystemMessage::TypeDescription(d) => SenderId(d.id),
            SystemMessage::LogDescription(d) => SenderId(d.mode.bits().into()),
            SystemMessage::UdpDescription(_) | SystemMessage::Disconnect => SenderId(0),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            SystemMessage::SenderDescription(d) | SystemMessage::TypeDescription(d) => buf.put_string(&d.name),
            SystemMessage::UdpDescription(d) => buf.put_u32(d.port.into()),
            SystemMessage::LogDescription(d) => {
                buf.put_string(&d.incoming);
                buf.put_string(&d.outgoing);
            }
            SystemMessage::Disconnect => {}
        }
    }

    pub fn to_message(&self, time: Timestamp) -> Message {
        let mut payload = BytesMut::new();
        self.ser(&mut payload);
        Message {
            type_id: self.kind().type_id(),
            sender: self.sender_field(),
            time,
            payload: Bytes::from(payload),
        }
    }
}
