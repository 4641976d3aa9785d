//! Executes a task graph to completion: one executor thread per node,
//! buffered edges, and finish-sentinel propagation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::graph::{NodeId, TaskGraph};
use crate::resource::ResourceManager;
use crate::task::{ProcessOutcome, Task};

/// A running (or finished) graph execution.
pub struct RunHandle {
    cancelled: Arc<AtomicBool>,
    root_senders: Vec<Sender<Buffer>>,
    threads: Vec<JoinHandle<()>>,
    first_error: Arc<Mutex<Option<Error>>>,
}

impl RunHandle {
    /// Injects *finish* at every root edge and flags executors to drain
    /// promptly instead of producing further frames.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        for tx in &self.root_senders {
            let _ = tx.send(Buffer::finish_sentinel());
        }
    }

    /// Waits for every executor to exit and returns the first recorded error.
    pub fn join(self) -> Result<()> {
        for t in self.threads {
            let _ = t.join();
        }
        match Arc::try_unwrap(self.first_error) {
            Ok(mutex) => match mutex.into_inner() {
                Ok(Some(e)) => Err(e),
                _ => Ok(()),
            },
            Err(shared) => match shared.lock().unwrap().take() {
                Some(e) => Err(e),
                None => Ok(()),
            },
        }
    }
}

/// Binds `graph` to `resources` and runs it on a fresh set of executor
/// threads, one per node.
pub fn run(mut graph: TaskGraph, resources: Arc<ResourceManager>) -> Result<RunHandle> {
    let order = graph.topological_order()?;

    for &id in &order {
        let name = graph.task(id).name().to_string();
        graph
            .task_mut(id)
            .setup(&resources)
            .map_err(|e| Error::TaskSetupFailed { name, source: Box::new(e) })?;
    }

    let mut senders: HashMap<NodeId, Vec<Sender<Buffer>>> = HashMap::new();
    let mut receiver_slots: HashMap<NodeId, Vec<Option<Receiver<Buffer>>>> = HashMap::new();

    for &id in &order {
        receiver_slots.insert(id, vec![None; graph.task(id).num_inputs()]);
    }

    for edge in graph.edge_indices() {
        let (src, dst, spec) = graph
            .edge_endpoints(edge)
            .expect("edge_indices only returns indices present in the graph");
        let (tx, rx) = crossbeam_channel::bounded(spec.capacity.max(1));
        senders.entry(src).or_default().push(tx);
        let slots = receiver_slots
            .get_mut(&dst)
            .expect("every node has a receiver_slots entry seeded above");
        slots[spec.dst_port] = Some(rx);
    }

    let cancelled = Arc::new(AtomicBool::new(false));
    let first_error = Arc::new(Mutex::new(None::<Error>));
    let roots: Vec<NodeId> = graph.roots();
    let root_senders: Vec<Sender<Buffer>> =
        roots.iter().flat_map(|r| senders.get(r).cloned().unwrap_or_default()).collect();

    let mut threads = Vec::with_capacity(order.len());

    // Extract ownership of every task so each can move into its own thread.
    let mut tasks: HashMap<NodeId, Box<dyn Task>> = HashMap::new();
    for &id in &order {
        tasks.insert(id, graph.extract_task(id));
    }

    for &id in &order {
        let task = tasks.remove(&id).expect("populated above for every node");
        let inputs: Vec<Receiver<Buffer>> = receiver_slots
            .remove(&id)
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(port, slot)| {
                slot.unwrap_or_else(|| {
                    panic!("input port {port} of node has no connected edge")
                })
            })
            .collect();
        let outputs = senders.remove(&id).unwrap_or_default();
        let resources = Arc::clone(&resources);
        let cancelled = Arc::clone(&cancelled);
        let first_error = Arc::clone(&first_error);

        threads.push(thread::spawn(move || {
            run_executor(task, inputs, outputs, resources, cancelled, first_error);
        }));
    }

    Ok(RunHandle { cancelled, root_senders, threads, first_error })
}

fn run_executor(
    mut task: Box<dyn Task>,
    inputs: Vec<Receiver<Buffer>>,
    outputs: Vec<Sender<Buffer>>,
    resources: Arc<ResourceManager>,
    cancelled: Arc<AtomicBool>,
    first_error: Arc<Mutex<Option<Error>>>,
) {
    let name = task.name().to_string();
    let is_sink = task.num_outputs() == 0;

    loop {
        if cancelled.load(Ordering::SeqCst) && inputs.is_empty() {
            // A root with no input edges has no way to observe the
            // cancellation except this flag; non-roots observe it as the
            // finish sentinel arriving on an input edge instead.
            push_finish(&outputs);
            break;
        }

        let mut frame_inputs = Vec::with_capacity(inputs.len());
        let mut saw_finish = false;
        for rx in &inputs {
            match rx.recv() {
                Ok(buf) => {
                    if buf.is_finish() {
                        saw_finish = true;
                    }
                    frame_inputs.push(buf);
                }
                Err(_) => {
                    saw_finish = true;
                    frame_inputs.push(Buffer::finish_sentinel());
                }
            }
        }

        if saw_finish && !is_sink {
            debug!("task '{name}' observed finish, propagating");
            push_finish(&outputs);
            break;
        }

        if is_sink {
            let mut unused = Buffer::finish_sentinel();
            match task.process(&mut frame_inputs, &mut unused) {
                Ok(ProcessOutcome::Finish) => break,
                Ok(ProcessOutcome::Continue) => continue,
                Err(e) => {
                    record_error(&first_error, &name, e);
                    break;
                }
            }
        }

        let req = {
            let refs: Vec<&Buffer> = frame_inputs.iter().collect();
            match task.get_requisition(&refs) {
                Ok(r) => r,
                Err(e) => {
                    record_error(&first_error, &name, e);
                    push_finish(&outputs);
                    break;
                }
            }
        };

        // GPU-enabled tasks write their output via a kernel, so they need a
        // device-resident buffer; host-only tasks (including the framework's
        // input/output/dummy splice points) populate it via `seed_host`
        // themselves, so a zero-filled host buffer avoids allocating device
        // memory that's about to be discarded.
        let host_seed = if task.is_gpu_enabled() { None } else { Some(vec![0.0; req.element_count]) };
        let mut output = match resources.request_buffer(req.dims, host_seed, false) {
            Ok(b) => b,
            Err(e) => {
                record_error(&first_error, &name, e);
                push_finish(&outputs);
                break;
            }
        };

        match task.process(&mut frame_inputs, &mut output) {
            Ok(ProcessOutcome::Continue) => {
                for buf in frame_inputs {
                    resources.release_buffer(buf);
                }
                if let Err(e) = push_output(&outputs, output, &resources) {
                    record_error(&first_error, &name, e);
                    break;
                }
            }
            Ok(ProcessOutcome::Finish) => {
                resources.release_buffer(output);
                push_finish(&outputs);
                break;
            }
            Err(e) => {
                record_error(&first_error, &name, e);
                push_finish(&outputs);
                break;
            }
        }
    }
}

fn push_finish(outputs: &[Sender<Buffer>]) {
    for tx in outputs {
        let _ = tx.send(Buffer::finish_sentinel());
    }
}

/// Sends `buffer` to the first output edge and a host-side duplicate to any
/// additional ones, since a buffer has exactly one logical holder at a time.
fn push_output(outputs: &[Sender<Buffer>], buffer: Buffer, resources: &ResourceManager) -> Result<()> {
    let mut iter = outputs.iter();
    let Some(first) = iter.next() else {
        resources.release_buffer(buffer);
        return Ok(());
    };
    let queue = resources.get_command_queue(0).ok();
    let mut buffer = buffer;
    for tx in iter {
        let dup = match queue {
            Some(q) => buffer.duplicate(q)?,
            None => {
                warn!("fanning out without a command queue; duplicate may lose device residency");
                buffer.duplicate(resources.get_command_queue(0)?)?
            }
        };
        if tx.send(dup).is_err() {
            error!("downstream executor for an output edge has exited early");
        }
    }
    if first.send(buffer).is_err() {
        error!("downstream executor for an output edge has exited early");
    }
    Ok(())
}

fn record_error(first_error: &Mutex<Option<Error>>, task_name: &str, err: Error) {
    error!("task '{task_name}' failed: {err}");
    let mut slot = first_error.lock().unwrap();
    if slot.is_none() {
        *slot = Some(Error::TaskProcessFailed {
            name: task_name.to_string(),
            source: Box::new(err),
        });
    }
}
