//! TCP transport for the wire protocol: `type:u16 | data_size:u64 | data:bytes`.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

use super::{Message, MessageType, Messenger};

pub struct TcpMessenger {
    stream: TcpStream,
}

impl TcpMessenger {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|e| Error::TransportFailed(e.to_string()))?;
        stream.set_nodelay(true).map_err(|e| Error::TransportFailed(e.to_string()))?;
        Ok(TcpMessenger { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        TcpMessenger { stream }
    }

    /// A clone of the underlying stream so a caller can
    /// `.shutdown(Shutdown::Both)` it from another thread to unblock a
    /// pending `recv_blocking`, instead of connecting a second client to
    /// inject a termination message.
    pub fn try_clone_stream(&self) -> Result<TcpStream> {
        self.stream.try_clone().map_err(|e| Error::TransportFailed(e.to_string()))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.stream.shutdown(Shutdown::Both).map_err(|e| Error::TransportFailed(e.to_string()))
    }
}

impl Messenger for TcpMessenger {
    fn send_blocking(&mut self, message: &Message) -> Result<()> {
        self.stream
            .write_u16::<LittleEndian>(message.kind as u16)
            .map_err(|e| Error::TransportFailed(e.to_string()))?;
        self.stream
            .write_u64::<LittleEndian>(message.payload.len() as u64)
            .map_err(|e| Error::TransportFailed(e.to_string()))?;
        self.stream
            .write_all(&message.payload)
            .map_err(|e| Error::TransportFailed(e.to_string()))?;
        self.stream.flush().map_err(|e| Error::TransportFailed(e.to_string()))
    }

    fn recv_blocking(&mut self) -> Result<Message> {
        let raw_type = self
            .stream
            .read_u16::<LittleEndian>()
            .map_err(|e| Error::TransportFailed(e.to_string()))?;
        let kind = MessageType::from_u16(raw_type)
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown message type {raw_type}")))?;
        let size = self
            .stream
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::TransportFailed(e.to_string()))?;
        let mut payload = vec![0u8; size as usize];
        self.stream.read_exact(&mut payload).map_err(|e| Error::TransportFailed(e.to_string()))?;
        Ok(Message::new(kind, payload))
    }
}
