//! The remote-node proxy: a local `Task` that drives a remote daemon over a
//! `Messenger`, making a whole remote sub-graph look like one transform task
//! to the local scheduler.
//!
//! Implements the client side of the wire protocol from spec.md §4.7: the
//! `stream_json` / `get_requisition` / `send_inputs` / `get_result` /
//! `cleanup` / `terminate` request sequence that `daemon.rs`'s dispatcher
//! (grounded on `examples/original_source/ufo/ufo-daemon.c`'s handler table)
//! replies to.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::buffer::{Buffer, Dims};
use crate::error::{Error, Result};
use crate::messenger::tcp::TcpMessenger;
use crate::messenger::{Message, MessageType, Messenger};
use crate::resource::ResourceManager;
use crate::task::{Configuration, ProcessOutcome, Requisition, Task, TaskKind};

/// Proxies a sub-graph, serialised as `graph_json`, to a remote daemon.
pub struct RemoteTask {
    name: String,
    address: String,
    graph_json: Vec<u8>,
    config: Configuration,
    messenger: Option<TcpMessenger>,
}

impl RemoteTask {
    pub fn new(name: impl Into<String>, address: impl Into<String>, graph_json: Vec<u8>) -> Self {
        RemoteTask {
            name: name.into(),
            address: address.into(),
            graph_json,
            config: Configuration::new(),
            messenger: None,
        }
    }

    fn messenger_mut(&mut self) -> Result<&mut TcpMessenger> {
        self.messenger
            .as_mut()
            .ok_or_else(|| Error::ProtocolViolation("remote task not set up".into()))
    }

    fn roundtrip(&mut self, request: Message) -> Result<Message> {
        let messenger = self.messenger_mut()?;
        messenger.send_blocking(&request)?;
        let reply = messenger.recv_blocking()?;
        if reply.kind == MessageType::Error {
            return Err(Error::ProtocolViolation(String::from_utf8_lossy(&reply.payload).into_owned()));
        }
        Ok(reply)
    }
}

impl Task for RemoteTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Remote
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn configuration(&self) -> &Configuration {
        &self.config
    }

    fn setup(&mut self, _resources: &ResourceManager) -> Result<()> {
        let mut messenger = TcpMessenger::connect(&self.address)?;
        messenger.send_blocking(&Message::new(MessageType::StreamJson, self.graph_json.clone()))?;
        let ack = messenger.recv_blocking()?;
        if ack.kind != MessageType::Ack {
            return Err(Error::ProtocolViolation(format!(
                "remote node '{}' rejected stream_json",
                self.address
            )));
        }
        self.messenger = Some(messenger);
        Ok(())
    }

    fn get_requisition(&mut self, inputs: &[&Buffer]) -> Result<Requisition> {
        let reply = self.roundtrip(Message::new(MessageType::GetRequisition, Vec::new()))?;
        if reply.kind == MessageType::Invalid {
            // The remote stream has drained; mirror the last known shape so
            // the scheduler can still allocate an output buffer to finish on.
            return Ok(Requisition::new(inputs[0].dims()));
        }
        let mut cursor = std::io::Cursor::new(&reply.payload);
        let _ndims = cursor.read_u32::<LittleEndian>()?;
        let width = cursor.read_u64::<LittleEndian>()? as usize;
        let height = cursor.read_u64::<LittleEndian>()? as usize;
        Ok(Requisition::new(Dims::new(width, height)))
    }

    fn process(&mut self, inputs: &mut [Buffer], output: &mut Buffer) -> Result<ProcessOutcome> {
        if inputs[0].is_finish() {
            self.roundtrip(Message::new(MessageType::Cleanup, Vec::new()))?;
            let messenger = self.messenger_mut()?;
            messenger.send_blocking(&Message::new(MessageType::Terminate, Vec::new()))?;
            let _ = messenger.recv_blocking();
            return Ok(ProcessOutcome::Finish);
        }

        let dims = inputs[0].dims();
        let bytes = f32_to_bytes(inputs[0].host_snapshot().unwrap_or(&[]));
        let mut payload = Vec::with_capacity(24 + bytes.len());
        payload.write_u64::<LittleEndian>(dims.width as u64)?;
        payload.write_u64::<LittleEndian>(dims.height as u64)?;
        payload.write_u64::<LittleEndian>(bytes.len() as u64)?;
        payload.extend_from_slice(&bytes);

        let ack = self.roundtrip(Message::new(MessageType::SendInputs, payload))?;
        if ack.kind != MessageType::Ack {
            return Err(Error::ProtocolViolation(format!(
                "remote node '{}' rejected send_inputs",
                self.address
            )));
        }

        let result = self.roundtrip(Message::new(MessageType::GetResult, Vec::new()))?;
        if result.kind == MessageType::Invalid {
            return Ok(ProcessOutcome::Finish);
        }

        let data = bytes_to_f32(&result.payload, dims.element_count());
        output.transfer_id(&inputs[0]);
        output.seed_host(data);
        Ok(ProcessOutcome::Continue)
    }
}

fn f32_to_bytes(data: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 4);
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn bytes_to_f32(bytes: &[u8], count: usize) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .take(count)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
