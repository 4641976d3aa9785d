//! Full scheduler runs over host-only tasks (input/dummy/output splice
//! points), using `ResourceManager::without_devices()` since none of them are
//! GPU-enabled and so never request a device-resident buffer. Scheduler runs
//! that exercise an actual kernel live in `tests/remote.rs` and are
//! `#[ignore]`d there instead, since compiling one needs a real OpenCL ICD.

use std::sync::Arc;
use std::time::Duration;

use tomo_core::builtins::{input_task, output_task, DummyTask};
use tomo_core::buffer::{Buffer, Dims};
use tomo_core::graph::TaskGraph;
use tomo_core::{scheduler, ResourceManager};

fn passthrough_graph() -> (TaskGraph, tomo_core::builtins::InputHandle, tomo_core::builtins::OutputHandle) {
    let mut graph = TaskGraph::new();
    let (input, input_handle) = input_task("input");
    let dummy = DummyTask::new("dummy");
    let (output, output_handle) = output_task("output");

    let input_id = graph.add_node(Box::new(input));
    let dummy_id = graph.add_node(Box::new(dummy));
    let output_id = graph.add_node(Box::new(output));
    graph.connect(input_id, dummy_id, 0).unwrap();
    graph.connect(dummy_id, output_id, 0).unwrap();

    (graph, input_handle, output_handle)
}

#[test]
fn two_frame_passthrough() {
    let (graph, input, output) = passthrough_graph();
    let resources = Arc::new(ResourceManager::without_devices());
    let run = scheduler::run(graph, resources).expect("scheduler start");

    let dims = Dims::new(4, 4);
    let a = vec![1.0; 16];
    let b = vec![2.0; 16];
    input.release_input_buffer(Buffer::from_host(dims, a.clone())).unwrap();
    input.release_input_buffer(Buffer::from_host(dims, b.clone())).unwrap();
    input.release_input_buffer(Buffer::finish_sentinel()).unwrap();

    let first = output.get_output_buffer().unwrap().expect("frame A");
    assert_eq!(first.host_snapshot().unwrap(), a.as_slice());
    let second = output.get_output_buffer().unwrap().expect("frame B");
    assert_eq!(second.host_snapshot().unwrap(), b.as_slice());
    assert!(output.get_output_buffer().unwrap().is_none(), "stream should be drained");

    run.join().expect("clean shutdown");
}

#[test]
fn finish_idempotence() {
    let (graph, input, output) = passthrough_graph();
    let resources = Arc::new(ResourceManager::without_devices());
    let run = scheduler::run(graph, resources).expect("scheduler start");

    input.release_input_buffer(Buffer::finish_sentinel()).unwrap();
    assert!(output.get_output_buffer().unwrap().is_none());

    // A root observing cancellation after its own finish is a no-op; the
    // leaf must not see a second finish signal or any frame.
    run.cancel();
    run.join().expect("clean shutdown");
}

#[test]
fn backpressure_no_frame_loss() {
    let mut graph = TaskGraph::new();
    let (input, input_handle) = input_task("input");
    let (output, output_handle) = output_task("output");
    let input_id = graph.add_node(Box::new(input));
    let output_id = graph.add_node(Box::new(output));
    graph.connect_with_capacity(input_id, output_id, 0, 1).unwrap();

    let resources = Arc::new(ResourceManager::without_devices());
    let run = scheduler::run(graph, resources).expect("scheduler start");

    let producer = std::thread::spawn(move || {
        for i in 0..100u32 {
            let dims = Dims::new(1, 1);
            input_handle.release_input_buffer(Buffer::from_host(dims, vec![i as f32])).unwrap();
        }
        input_handle.release_input_buffer(Buffer::finish_sentinel()).unwrap();
    });

    let mut received = Vec::new();
    loop {
        std::thread::sleep(Duration::from_millis(1));
        match output_handle.get_output_buffer().unwrap() {
            Some(buf) => received.push(buf.host_snapshot().unwrap()[0] as u32),
            None => break,
        }
    }

    producer.join().unwrap();
    run.join().expect("clean shutdown");

    assert_eq!(received.len(), 100);
    assert_eq!(received, (0..100).collect::<Vec<_>>());
}
