// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Backend Vtable (§4.F): the four lifecycle entry points the engine
//! calls, plus the `log_action` hook its generic logger defers to for
//! backend-private action types.
//!
//! A Rust trait is this crate's idiomatic equivalent of the C vtable of
//! function pointers the spec describes; it is built the same way the
//! teacher bundles a small dispatch surface with owned state in
//! `rpc_protocol::server::RpcProgram<T>` (there, one `RpcProgram` per RPC
//! service; here, one `FabricBackend` per engine instance).

use crate::action::{ActionRecord, ActionSequence};
use crate::error::Result;
use crate::executor::Executor;
use crate::instance::Instance;
use crate::planner::Planner;

pub trait Backend {
    fn name(&self) -> &'static str;

    /// Called once per distinct transition plan: mutates `seq` in place
    /// per §4.D and registers its receive buffers (§4.C).
    fn prepare(&self, seq: &mut ActionSequence) -> Result<()>;

    /// Called possibly many times for a plan prepared above.
    fn exec(&self, seq: &ActionSequence) -> Result<()>;

    /// Releases the registrations `prepare` created for `seq`.
    fn cleanup(&self, seq: &mut ActionSequence) -> Result<()>;

    /// Tears down the transport session. Consumes `self` since nothing
    /// may use this backend afterward.
    fn finalize(self: Box<Self>) -> Result<()>;

    /// Returns `true` iff `record` is one of the four backend-private
    /// action types and has been logged; lets the engine's generic
    /// action logger defer to this for types it doesn't know about.
    fn log_action(&self, record: &ActionRecord) -> bool;
}

/// The `fabric` backend: one `Instance` (bootstrap + transport session)
/// and the planner configuration derived from it.
pub struct FabricBackend {
    instance: Instance,
    planner: Planner,
}

impl FabricBackend {
    pub fn new(instance: Instance) -> Self {
        let planner = Planner::new(instance.config.async_mode);
        Self { instance, planner }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl Backend for FabricBackend {
    fn name(&self) -> &'static str {
        "fabric"
    }

    fn prepare(&self, seq: &mut ActionSequence) -> Result<()> {
        self.planner.prepare(seq, &self.instance.session)
    }

    fn exec(&self, seq: &ActionSequence) -> Result<()> {
        Executor::new(&self.instance).exec(seq)
    }

    fn cleanup(&self, seq: &mut ActionSequence) -> Result<()> {
        crate::registry::release_all(seq, &self.instance.session)
    }

    fn finalize(self: Box<Self>) -> Result<()> {
        // `self.instance.session`'s `Drop` impl closes the endpoint, AV,
        // CQs, domain, and fabric handles.
        Ok(())
    }

    fn log_action(&self, record: &ActionRecord) -> bool {
        crate::executor::log_action(record)
    }
}
