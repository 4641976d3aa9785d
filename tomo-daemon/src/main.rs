//! `tomo-daemon`: binary front-end that exposes a `tomo-core` scheduler run
//! over the remote-worker wire protocol.
//!
//! Exit codes: `0` clean shutdown (a client sent `terminate`), `1` startup
//! failure (device context or listen address), `2` a request-loop error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use tomo_core::daemon::DaemonHandle;
use tomo_core::ResourceManager;

/// Serve tomo-core's scheduler over TCP, one sub-graph run per client.
#[derive(Parser, Debug)]
#[command(name = "tomo-daemon", version, about)]
struct Args {
    /// Address to listen on, e.g. `127.0.0.1:9001`.
    listen_address: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let resources = match ResourceManager::new().context("initializing device context") {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(1);
        }
    };
    info!("found {} device(s)", resources.num_devices());

    let mut handle = match DaemonHandle::start(resources, args.listen_address.clone()) {
        Ok(h) => {
            info!("listening on {}", args.listen_address);
            h
        }
        Err(e) => {
            error!("failed to bind {}: {e}", args.listen_address);
            return ExitCode::from(1);
        }
    };

    match handle.wait() {
        Ok(()) => {
            info!("shut down cleanly");
            ExitCode::from(0)
        }
        Err(e) => {
            error!("request loop failed: {e}");
            ExitCode::from(2)
        }
    }
}
