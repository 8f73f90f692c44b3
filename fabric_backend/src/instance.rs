// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! `Instance`/`Group` (§3) and the environment-derived `Config` (§6).
//!
//! Grounded on the Design Note "Shared mutable module state": bundle
//! `(info, fabric, domain, ep, av, cqs, registration table)` into one
//! value owned by the returned handle instead of process-wide statics.
//! `Config` mirrors the small startup-config structs the teacher's
//! binaries build from parsed arguments (e.g. `rpcbind::
//! RpcbindServerAddress`) before constructing server state — here read
//! from environment variables instead of `clap`, per spec §6.

use std::env;

use crate::action::Rank;
use crate::transport::Session;

/// Bootstrap/runtime configuration, read once from the environment
/// variables spec §6 documents. All are optional.
#[derive(Debug, Clone)]
pub struct Config {
    pub home_host: String,
    pub home_port: u16,
    pub world_size: u32,
    pub async_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_host: "localhost".to_string(),
            home_port: 7777,
            world_size: 1,
            async_mode: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(host) = env::var("LAIK_FABRIC_HOST") {
            if !host.is_empty() {
                cfg.home_host = host;
            }
        }
        if let Ok(port) = env::var("LAIK_FABRIC_PORT") {
            if let Ok(p) = port.parse() {
                cfg.home_port = p;
            }
        }
        if let Ok(size) = env::var("LAIK_SIZE") {
            if let Ok(s) = size.parse() {
                cfg.world_size = s;
            }
        }
        // LAIK_FABRIC_SYNC: non-zero disables async lowering.
        if let Ok(sync) = env::var("LAIK_FABRIC_SYNC") {
            if let Ok(v) = sync.parse::<i64>() {
                cfg.async_mode = v == 0;
            }
        }

        cfg
    }
}

/// The process's position in the computation (`mylid`) and the overall
/// world, a thin analogue of the engine's `Group` concept restricted to
/// what this backend needs.
#[derive(Debug, Clone, Copy)]
pub struct Group {
    pub mylid: Rank,
    pub world_size: u32,
}

/// Everything the backend needs for the lifetime of the process: the
/// resolved group, the address length discovered during bootstrap, and
/// the open transport session. Immutable once constructed (spec §3).
pub struct Instance {
    pub group: Group,
    pub address_length: usize,
    pub config: Config,
    pub session: Session,

    /// `fi_addr_t` assigned by the address vector for each rank, in rank
    /// order (spec §4.A step 5: "insert the address table ... in rank
    /// order").
    pub fi_addrs: Vec<u64>,
}

impl Instance {
    pub fn new(
        group: Group,
        address_length: usize,
        config: Config,
        session: Session,
        fi_addrs: Vec<u64>,
    ) -> Self {
        Self {
            group,
            address_length,
            config,
            session,
            fi_addrs,
        }
    }

    pub fn mylid(&self) -> Rank {
        self.group.mylid
    }

    pub fn world_size(&self) -> u32 {
        self.group.world_size
    }
}
