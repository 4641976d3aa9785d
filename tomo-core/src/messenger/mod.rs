//! Transport-agnostic request/reply messenger.

pub mod tcp;

use crate::error::Result;

/// The message `type` tag carried on the wire ahead of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    StreamJson = 1,
    ReplicateJson = 2,
    GetNumDevices = 3,
    GetStructure = 4,
    GetRequisition = 5,
    SendInputs = 6,
    GetResult = 7,
    Cleanup = 8,
    Terminate = 9,
    Ack = 10,
    Invalid = 11,
    Error = 12,
}

impl MessageType {
    pub fn from_u16(value: u16) -> Option<Self> {
        use MessageType::*;
        Some(match value {
            1 => StreamJson,
            2 => ReplicateJson,
            3 => GetNumDevices,
            4 => GetStructure,
            5 => GetRequisition,
            6 => SendInputs,
            7 => GetResult,
            8 => Cleanup,
            9 => Terminate,
            10 => Ack,
            11 => Invalid,
            12 => Error,
            _ => return None,
        })
    }
}

/// One request or reply: a type tag plus an opaque payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Message { kind, payload }
    }

    pub fn ack() -> Self {
        Message::new(MessageType::Ack, Vec::new())
    }

    pub fn error(text: impl Into<String>) -> Self {
        Message::new(MessageType::Error, text.into().into_bytes())
    }
}

/// A request/reply channel over a pluggable transport. Client and server
/// sides alternate strictly: one `send_blocking` must be answered by exactly
/// one `recv_blocking` before the next request goes out.
pub trait Messenger: Send {
    fn send_blocking(&mut self, message: &Message) -> Result<()>;
    fn recv_blocking(&mut self) -> Result<Message>;
}
