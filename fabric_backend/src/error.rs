// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Errors that can arise while bootstrapping, preparing, or running an
/// action sequence over the fabric.
///
/// Category 2 of the error taxonomy (transient "try again" results from the
/// transport) is deliberately not a variant here: those are retried in a
/// busy loop at the call site and never surface as an `Error`.
#[derive(Debug)]
pub enum Error {
    /// No suitable provider, bind conflict at the bootstrap master, DNS
    /// failure resolving `LAIK_FABRIC_HOST`.
    Configuration(String),

    /// A non-transient failure from a fabric call, with the provider's
    /// decoded error string attached.
    Transport(String),

    /// Unknown action type, ring-depth overflow, completion count
    /// mismatch at sequence end.
    Protocol(ProtocolError),

    /// Allocation failure for action buffers or registration tables.
    ResourceExhausted(String),

    /// I/O failure during bootstrap.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(e) => write!(f, "configuration error: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::ResourceExhausted(e) => write!(f, "resource exhausted: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    /// An action record carried a type tag the executor does not
    /// recognize.
    UnknownActionType(u32),

    /// A completion arrived for a round more than `depth` rounds ahead of
    /// the round currently being waited on; the credit ring is not deep
    /// enough to hold it.
    RingDepthExceeded { offset: usize, depth: usize },

    /// `FabSendWait`/`FabRecvWait` accounted for a different number of
    /// completions than its `count` field demanded.
    CompletionCountMismatch { expected: u32, got: u32 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownActionType(t) => write!(f, "unknown action type {t}"),
            Self::RingDepthExceeded { offset, depth } => write!(
                f,
                "completion ring overflow: offset {offset} exceeds ring depth {depth}"
            ),
            Self::CompletionCountMismatch { expected, got } => write!(
                f,
                "completion count mismatch: expected {expected}, got {got}"
            ),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
