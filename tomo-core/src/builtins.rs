//! Framework-supplied input, output, and dummy tasks.
//!
//! These splice a sub-graph into a remote worker: `input_task` and
//! `output_task` are the synchronous handoff points the daemon drives from
//! outside the scheduler, and `dummy_task` is an identity placeholder used
//! while a graph document is still being assembled.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::resource::ResourceManager;
use crate::task::{Configuration, ProcessOutcome, Requisition, Task, TaskKind};

/// The scheduler-side half of the input splice point.
pub struct InputTask {
    name: String,
    config: Configuration,
    rx: Receiver<Buffer>,
    pending: Option<Buffer>,
}

/// The outside-world half of the input splice point: cloneable, callable
/// from the daemon's request thread while the scheduler's executor runs
/// `InputTask` on its own thread.
#[derive(Clone)]
pub struct InputHandle {
    tx: Sender<Buffer>,
}

/// Creates a synchronous handoff point: `InputTask` is driven by the
/// scheduler, `InputHandle::release_input_buffer` is called from outside it.
pub fn input_task(name: impl Into<String>) -> (InputTask, InputHandle) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (
        InputTask { name: name.into(), config: Configuration::new(), rx, pending: None },
        InputHandle { tx },
    )
}

impl InputHandle {
    /// Hands a buffer to the task's `process` loop. Blocks if a previous
    /// buffer hasn't been consumed yet.
    pub fn release_input_buffer(&self, buffer: Buffer) -> Result<()> {
        self.tx
            .send(buffer)
            .map_err(|_| Error::TransportFailed("input task no longer running".into()))
    }
}

impl Task for InputTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Source
    }

    fn num_inputs(&self) -> usize {
        0
    }

    fn num_outputs(&self) -> usize {
        1
    }

    fn configuration(&self) -> &Configuration {
        &self.config
    }

    fn setup(&mut self, _resources: &ResourceManager) -> Result<()> {
        Ok(())
    }

    fn get_requisition(&mut self, _inputs: &[&Buffer]) -> Result<Requisition> {
        if self.pending.is_none() {
            self.pending = Some(
                self.rx
                    .recv()
                    .map_err(|_| Error::TransportFailed("input channel closed".into()))?,
            );
        }
        let buf = self.pending.as_ref().expect("just populated above");
        Ok(Requisition::new(buf.dims()))
    }

    fn process(&mut self, _inputs: &mut [Buffer], output: &mut Buffer) -> Result<ProcessOutcome> {
        let incoming = self.pending.take().expect(
            "get_requisition is always called before process and populates pending",
        );
        if incoming.is_finish() {
            return Ok(ProcessOutcome::Finish);
        }
        output.transfer_id(&incoming);
        if let Some(data) = incoming.host_snapshot() {
            output.seed_host(data.to_vec());
        }
        Ok(ProcessOutcome::Continue)
    }
}

/// One produced frame, or the end of the stream, queued for an external
/// reader of an `OutputTask`.
enum Drained {
    Frame(Requisition, Buffer),
    Finish,
}

/// The scheduler-side half of the output splice point.
pub struct OutputTask {
    name: String,
    config: Configuration,
    tx: Sender<Drained>,
}

/// The outside-world half of the output splice point.
pub struct OutputHandle {
    rx: Receiver<Drained>,
    staged: Mutex<Option<Drained>>,
}

pub fn output_task(name: impl Into<String>) -> (OutputTask, OutputHandle) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (
        OutputTask { name: name.into(), config: Configuration::new(), tx },
        OutputHandle { rx, staged: Mutex::new(None) },
    )
}

impl OutputHandle {
    fn ensure_staged(&self) -> Result<()> {
        let mut staged = self.staged.lock();
        if staged.is_none() {
            *staged = Some(
                self.rx
                    .recv()
                    .map_err(|_| Error::TransportFailed("output task no longer running".into()))?,
            );
        }
        Ok(())
    }

    /// The shape of the frame about to be available from `get_output_buffer`.
    /// `None` once the stream has drained.
    pub fn get_output_requisition(&self) -> Result<Option<Requisition>> {
        self.ensure_staged()?;
        let staged = self.staged.lock();
        Ok(match staged.as_ref() {
            Some(Drained::Frame(req, _)) => Some(*req),
            _ => None,
        })
    }

    /// Blocks until a frame (or the end of the stream) is available.
    pub fn get_output_buffer(&self) -> Result<Option<Buffer>> {
        self.ensure_staged()?;
        let mut staged = self.staged.lock();
        match staged.take() {
            Some(Drained::Frame(_, buffer)) => Ok(Some(buffer)),
            Some(Drained::Finish) | None => Ok(None),
        }
    }

    /// Returns logical ownership of a drained buffer to the resource manager.
    pub fn release_output_buffer(&self, resources: &ResourceManager, buffer: Buffer) {
        resources.release_buffer(buffer);
    }
}

impl Task for OutputTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Sink
    }

    fn num_inputs(&self) -> usize {
        1
    }

    fn num_outputs(&self) -> usize {
        0
    }

    fn configuration(&self) -> &Configuration {
        &self.config
    }

    fn setup(&mut self, _resources: &ResourceManager) -> Result<()> {
        Ok(())
    }

    fn get_requisition(&mut self, _inputs: &[&Buffer]) -> Result<Requisition> {
        // Sinks have no outputs of their own; the scheduler never calls this.
        Ok(Requisition::new(crate::buffer::Dims::new(0, 0)))
    }

    fn process(&mut self, inputs: &mut [Buffer], _output: &mut Buffer) -> Result<ProcessOutcome> {
        let frame = std::mem::replace(&mut inputs[0], Buffer::finish_sentinel());
        if frame.is_finish() {
            let _ = self.tx.send(Drained::Finish);
            return Ok(ProcessOutcome::Finish);
        }
        let req = Requisition::new(frame.dims());
        self.tx
            .send(Drained::Frame(req, frame))
            .map_err(|_| Error::TransportFailed("output reader gone".into()))?;
        Ok(ProcessOutcome::Continue)
    }
}

/// Identity passthrough; removed at graph-load time if found at a root.
pub struct DummyTask {
    name: String,
    config: Configuration,
}

impl DummyTask {
    pub fn new(name: impl Into<String>) -> Self {
        DummyTask { name: name.into(), config: Configuration::new() }
    }
}

impl Task for DummyTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Transform
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

    fn is_dummy(&self) -> bool {
        true
    }

    fn setup(&mut self, _resources: &ResourceManager) -> Result<()> {
        Ok(())
    }

    fn get_requisition(&mut self, inputs: &[&Buffer]) -> Result<Requisition> {
        Ok(Requisition::new(inputs[0].dims()))
    }

    fn process(&mut self, inputs: &mut [Buffer], output: &mut Buffer) -> Result<ProcessOutcome> {
        if inputs[0].is_finish() {
            return Ok(ProcessOutcome::Finish);
        }
        output.transfer_id(&inputs[0]);
        if let Some(data) = inputs[0].host_snapshot() {
            output.seed_host(data.to_vec());
        }
        Ok(ProcessOutcome::Continue)
    }
}
