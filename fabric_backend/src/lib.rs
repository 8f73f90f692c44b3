// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A libfabric-backed communication backend for a distributed parallel
//! computation runtime: bootstrap rendezvous, RMA-write transport,
//! memory registration, and the action-sequence planner/executor that
//! lowers blocking send/recv pairs into asynchronous RMA writes with
//! round-tagged completions.

pub mod action;
pub mod backend;
pub mod bootstrap;
pub mod context;
pub mod error;
pub mod executor;
pub mod instance;
pub mod planner;
pub mod registry;
pub mod transport;

pub use action::{ActionKind, ActionRecord, ActionSequence, BufRecv, BufSend, BufferRef, Rank};
pub use backend::{Backend, FabricBackend};
pub use context::{ContextRef, DType, DataTypeContext, ReduceOp, ScalarType};
pub use error::{Error, ProtocolError, Result};
pub use instance::{Config, Group, Instance};

use std::time::Duration;

use log::info;

/// Brings up a fully initialized `Instance` for this process: opens the
/// transport session, runs bootstrap rendezvous to learn this process's
/// rank and the address table, and inserts that table into the address
/// vector (§4.A steps 1-5).
///
/// `accept_timeout` bounds how long a bootstrap master waits for the
/// rest of the world to connect; `None` reproduces the original's
/// indefinite hang.
pub fn start(config: Config, accept_timeout: Option<Duration>) -> Result<Instance> {
    let session = transport::Session::open(&config.home_host, config.home_port)?;
    let own_address = session.own_address()?;

    let result = bootstrap::bootstrap(&config, &own_address, accept_timeout)?;
    info!(
        "bootstrap complete: rank {}/{} address_length={}",
        result.rank,
        result.world_size,
        own_address.len()
    );

    let fi_addrs = session.insert_av(&result.address_table, result.world_size, own_address.len())?;

    let group = Group {
        mylid: result.rank,
        world_size: result.world_size,
    };

    Ok(Instance::new(group, own_address.len(), config, session, fi_addrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_bootstrap_assigns_rank_zero() {
        let mut config = Config::default();
        config.world_size = 1;
        let result = bootstrap::bootstrap(&config, &[1, 2, 3, 4], None).unwrap();
        assert_eq!(result.rank, 0);
        assert_eq!(result.world_size, 1);
        assert_eq!(result.address_table, vec![1, 2, 3, 4]);
    }
}
