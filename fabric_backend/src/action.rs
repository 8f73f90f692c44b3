// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The action data model (spec §3).
//!
//! The original engine represents a sequence as a contiguous,
//! length-prefixed byte buffer that callers walk record by record. Per the
//! "untyped action stream" design note, this rewrite replaces that walk
//! with a tagged `enum`/`Vec` pair: `ActionRecord` still carries the
//! header fields `{round, transform_id, mark}` the original format does,
//! but the type-specific payload is a Rust enum variant instead of bytes
//! following a type tag.

use std::sync::Arc;

use crate::context::{ContextRef, ReduceOp};
use crate::registry::RegistrationHandle;

pub type Rank = u32;

/// A reference to an engine-owned buffer. The engine allocates and frees
/// these outside the backend's control; the backend only ever reads or
/// writes through the pointer while a sequence referencing it is prepared.
#[derive(Clone, Copy)]
pub struct BufferRef {
    pub ptr: *mut u8,
    pub len: usize,
}

// SAFETY: buffers referenced here are owned by the engine and the backend
// never holds a `BufferRef` across a point where the engine could also be
// mutating it concurrently (§5: one executor per process per sequence,
// non-overlapping calls).
unsafe impl Send for BufferRef {}
unsafe impl Sync for BufferRef {}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferRef({:p}, len={})", self.ptr, self.len)
    }
}

impl BufferRef {
    pub fn as_slice(&self, elem_size: usize, count: usize) -> &[u8] {
        let n = elem_size * count;
        assert!(n <= self.len, "buffer too small for count*elem_size");
        unsafe { std::slice::from_raw_parts(self.ptr, n) }
    }

    pub fn as_mut_slice(&self, elem_size: usize, count: usize) -> &mut [u8] {
        let n = elem_size * count;
        assert!(n <= self.len, "buffer too small for count*elem_size");
        unsafe { std::slice::from_raw_parts_mut(self.ptr, n) }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufSend {
    pub buf: BufferRef,
    pub count: usize,
    pub to_rank: Rank,
}

#[derive(Debug, Clone, Copy)]
pub struct BufRecv {
    pub buf: BufferRef,
    pub count: usize,
    pub from_rank: Rank,
}

#[derive(Clone)]
pub struct RBufLocalReduce {
    pub buf_id: u32,
    pub offset: usize,
    pub to_buf: BufferRef,
    pub from_buf: BufferRef,
    pub count: usize,
    pub context: ContextRef,
    pub op: ReduceOp,
}

impl std::fmt::Debug for RBufLocalReduce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RBufLocalReduce")
            .field("buf_id", &self.buf_id)
            .field("offset", &self.offset)
            .field("to_buf", &self.to_buf)
            .field("from_buf", &self.from_buf)
            .field("count", &self.count)
            .field("op", &self.op)
            .finish()
    }
}

/// The type-specific payload of an action record.
///
/// `FabAsyncSend`/`FabAsyncRecv`/`FabRecvWait`/`FabSendWait` are the four
/// backend-private types introduced by the planner (§4.D); everything
/// else is produced upstream by the engine and its reused transforms.
#[derive(Debug, Clone)]
pub enum ActionKind {
    BufSend(BufSend),
    BufRecv(BufRecv),
    RBufLocalReduce(RBufLocalReduce),
    Nop,
    FabAsyncSend(BufSend),
    FabAsyncRecv(BufRecv),
    FabRecvWait { count: u32 },
    FabSendWait { count: u32 },
}

impl ActionKind {
    pub fn type_tag(&self) -> u32 {
        match self {
            Self::BufSend(_) => 1,
            Self::BufRecv(_) => 2,
            Self::RBufLocalReduce(_) => 3,
            Self::Nop => 4,
            Self::FabAsyncSend(_) => 5,
            Self::FabAsyncRecv(_) => 6,
            Self::FabRecvWait { .. } => 7,
            Self::FabSendWait { .. } => 8,
        }
    }

    pub fn is_backend_private(&self) -> bool {
        matches!(
            self,
            Self::FabAsyncSend(_) | Self::FabAsyncRecv(_) | Self::FabRecvWait { .. } | Self::FabSendWait { .. }
        )
    }
}

/// One record in an action sequence: the shared header plus a typed
/// payload.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub round: u32,
    pub transform_id: u32,
    pub mark: u32,
    pub kind: ActionKind,
}

impl ActionRecord {
    pub fn new(round: u32, kind: ActionKind) -> Self {
        Self {
            round,
            transform_id: 0,
            mark: 0,
            kind,
        }
    }

    /// An estimate of this record's size if it were still encoded as a
    /// length-prefixed blob, kept only so `ActionSequence::bytes_used_estimate`
    /// remains a meaningful, testable quantity (spec §4.D step 14) even
    /// though the in-memory representation no longer needs it for
    /// iteration.
    pub fn encoded_len_estimate(&self) -> usize {
        const HEADER: usize = 4 + 4 + 4 + 4; // type, length, round, transform_id (mark folded in)
        let payload = match &self.kind {
            ActionKind::BufSend(_) | ActionKind::FabAsyncSend(_) => 16,
            ActionKind::BufRecv(_) | ActionKind::FabAsyncRecv(_) => 16,
            ActionKind::RBufLocalReduce(_) => 32,
            ActionKind::Nop => 0,
            ActionKind::FabRecvWait { .. } | ActionKind::FabSendWait { .. } => 8,
        };
        HEADER + payload
    }
}

/// `{actions[], actionCount, bytesUsed, roundCount, buffers[], context[]}`
/// from spec §3, with `actions`/`actionCount` collapsed into one `Vec` and
/// `buffers[]` (this backend's memory registrations) given its own type.
#[derive(Debug, Default)]
pub struct ActionSequence {
    pub actions: Vec<ActionRecord>,
    pub round_count: u32,
    pub bytes_used_estimate: usize,
    pub registrations: Vec<RegistrationHandle>,
    pub context: Vec<ContextRef>,

    /// The round-skew bound `Planner::prepare` validated this sequence
    /// against while lowering it (`Planner::max_round_skew`). The
    /// executor sizes `RecvCreditRing` from this value so the ring it
    /// actually runs with is the same one the "fail loudly on overflow"
    /// check at lowering time was guarding. Zero means no planner has
    /// set it yet (e.g. a hand-built sequence in a unit test); the
    /// executor falls back to sizing from `round_count` in that case.
    pub ring_depth: usize,
}

impl ActionSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Step 14 of §4.D: recompute `actionCount`, `bytesUsed`, `roundCount`.
    pub fn recompute_stats(&mut self) {
        self.round_count = self.actions.iter().map(|a| a.round).max().unwrap_or(0);
        self.bytes_used_estimate = self.actions.iter().map(|a| a.encoded_len_estimate()).sum();
    }

    pub fn fab_recv_waits(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.actions.iter().filter_map(|a| match a.kind {
            ActionKind::FabRecvWait { count } => Some((a.round, count)),
            _ => None,
        })
    }

    pub fn fab_send_waits(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.actions.iter().filter_map(|a| match a.kind {
            ActionKind::FabSendWait { count } => Some((a.round, count)),
            _ => None,
        })
    }
}

/// Convenience constructor used throughout planner/executor tests.
pub fn context_ref(ty: impl crate::context::DataTypeContext + 'static) -> ContextRef {
    Arc::new(ty)
}
