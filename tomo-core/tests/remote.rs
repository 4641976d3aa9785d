//! Remote round-trip over a TCP loopback daemon, matching the spec's
//! "remote round-trip" scenario: `stream_json` for `input -> add_one ->
//! output`, `send_inputs` with a zeroed frame, `get_result` returns it
//! incremented. Requires a real OpenCL platform (both the daemon and the
//! client connecting to it construct a `ResourceManager`, and the daemon
//! compiles a kernel), so this is `#[ignore]`d the same way the in-process
//! scheduler tests are.

use std::io::Write;
use std::sync::Arc;

use tomo_core::buffer::{Buffer, Dims};
use tomo_core::daemon::DaemonHandle;
use tomo_core::remote_task::RemoteTask;
use tomo_core::task::Task;
use tomo_core::ResourceManager;

const ADD_ONE_KERNEL: &str = r#"
__kernel void add_one(__global float* in, __global float* out) {
    int i = get_global_id(0);
    out[i] = in[i] + 1.0f;
}
"#;

#[test]
#[ignore = "requires a real OpenCL platform and a free loopback port"]
fn remote_round_trip_add_one() {
    let addr = "127.0.0.1:15199";

    let mut kernel_file = tempfile::NamedTempFile::new().expect("tempfile");
    kernel_file.write_all(ADD_ONE_KERNEL.as_bytes()).expect("write kernel source");

    let daemon_resources = ResourceManager::new().expect("daemon device context");
    daemon_resources.add_program(kernel_file.path()).expect("compile add_one");
    let mut handle = DaemonHandle::start(Arc::new(daemon_resources), addr).expect("daemon bind");

    let graph_json = br#"{"nodes":[{"name":"k","plugin":"kernel_map","properties":{"kernel":"add_one"}}],"edges":[]}"#.to_vec();
    let local_resources = ResourceManager::new().expect("client device context");

    let mut task = RemoteTask::new("remote", addr, graph_json);
    task.setup(&local_resources).expect("stream_json handshake");

    let dims = Dims::new(2, 2);
    let frame = Buffer::from_host(dims, vec![0.0, 0.0, 0.0, 0.0]);
    let req = task.get_requisition(&[&frame]).expect("get_requisition");
    assert_eq!(req.dims, dims);

    let mut inputs = vec![frame];
    let mut output = Buffer::from_host(dims, vec![0.0; 4]);
    let outcome = task.process(&mut inputs, &mut output).expect("send_inputs/get_result");
    assert_eq!(outcome, tomo_core::ProcessOutcome::Continue);
    assert_eq!(output.host_snapshot().unwrap(), &[1.0, 1.0, 1.0, 1.0]);

    let mut finish_inputs = vec![Buffer::finish_sentinel()];
    let mut unused = Buffer::finish_sentinel();
    let outcome = task.process(&mut finish_inputs, &mut unused).expect("cleanup/terminate");
    assert_eq!(outcome, tomo_core::ProcessOutcome::Finish);

    handle.stop().expect("daemon shutdown");
}
