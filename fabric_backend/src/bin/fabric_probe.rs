// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Diagnostic binary: opens a transport session, runs bootstrap
//! rendezvous, and prints the resolved rank and address table. Useful
//! for checking a fabric provider and a set of hosts can find each other
//! before pointing a real computation at them.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::error;

use fabric_backend::Config;

#[derive(Parser, Debug)]
#[command(name = "fabric_probe", about = "Bootstrap rendezvous diagnostic")]
struct Args {
    /// Host the bootstrap master listens on (falls back to LAIK_FABRIC_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port the bootstrap master listens on (falls back to LAIK_FABRIC_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Number of processes expected to rendezvous (falls back to LAIK_SIZE).
    #[arg(long)]
    size: Option<u32>,

    /// Seconds the master waits for peers before giving up. Unbounded if
    /// omitted, matching the original's indefinite-hang behavior.
    #[arg(long)]
    accept_timeout_secs: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::from_env();
    if let Some(host) = args.host {
        config.home_host = host;
    }
    if let Some(port) = args.port {
        config.home_port = port;
    }
    if let Some(size) = args.size {
        config.world_size = size;
    }

    let accept_timeout = args.accept_timeout_secs.map(Duration::from_secs);

    match fabric_backend::start(config, accept_timeout) {
        Ok(instance) => {
            println!(
                "rank {} of {} (address_length={})",
                instance.mylid(),
                instance.world_size(),
                instance.address_length
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            // §6: configuration/transport/protocol failures are not
            // retried here, just reported and exited non-zero.
            error!("fabric_probe failed: {e}");
            ExitCode::FAILURE
        }
    }
}
