// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Stand-ins for the engine's per-data-object transition context.
//!
//! The real engine tracks element size and a reduction function per data
//! type participating in a transition (spec §6: "data-type descriptors
//! exposing elemsize and a reduction function"). This backend only needs
//! to *call* that contract, not define it, so `DataTypeContext` is a small
//! trait the engine would implement and hand us as a `ContextRef`.

use std::fmt;
use std::sync::Arc;

/// A reduction operator applied element-wise by `RBufLocalReduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
    Prod,
}

/// The scalar layout of one element, used to reinterpret the raw byte
/// buffers the engine hands us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    I32,
    I64,
    F32,
    F64,
    U8,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
            Self::U8 => 1,
        }
    }
}

/// Per-data-object context the engine supplies to a prepared sequence.
/// Exposed to the planner/executor only through this trait so the backend
/// never needs to know how the engine represents its own type registry.
pub trait DataTypeContext: fmt::Debug + Send + Sync {
    fn elem_size(&self) -> usize;

    /// Apply `op` element-wise: `dst[i] = op(dst[i], src[i])` for `count`
    /// elements, reinterpreting both buffers according to this type's
    /// layout. `dst` and `src` must each be at least `count * elem_size()`
    /// bytes.
    fn reduce(&self, op: ReduceOp, dst: &mut [u8], src: &[u8], count: usize);
}

/// Shared handle to a data-type context, cheaply cloned into every
/// `RBufLocalReduce` action that needs it.
pub type ContextRef = Arc<dyn DataTypeContext>;

/// A `DataTypeContext` for one of the built-in scalar types, sufficient
/// for tests and for engines that only move primitive numeric buffers.
#[derive(Debug, Clone, Copy)]
pub struct ScalarType(pub DType);

impl DataTypeContext for ScalarType {
    fn elem_size(&self) -> usize {
        self.0.size()
    }

    fn reduce(&self, op: ReduceOp, dst: &mut [u8], src: &[u8], count: usize) {
        let size = self.0.size();
        assert!(dst.len() >= count * size, "dst buffer too small for reduce");
        assert!(src.len() >= count * size, "src buffer too small for reduce");

        match self.0 {
            DType::I32 => reduce_typed::<i32>(op, dst, src, count, i32::from_ne_bytes, i32::to_ne_bytes),
            DType::I64 => reduce_typed::<i64>(op, dst, src, count, i64::from_ne_bytes, i64::to_ne_bytes),
            DType::F32 => reduce_typed::<f32>(op, dst, src, count, f32::from_ne_bytes, f32::to_ne_bytes),
            DType::F64 => reduce_typed::<f64>(op, dst, src, count, f64::from_ne_bytes, f64::to_ne_bytes),
            DType::U8 => {
                for i in 0..count {
                    dst[i] = apply_u8(op, dst[i], src[i]);
                }
            }
        }
    }
}

fn apply_u8(op: ReduceOp, a: u8, b: u8) -> u8 {
    match op {
        ReduceOp::Sum => a.wrapping_add(b),
        ReduceOp::Min => a.min(b),
        ReduceOp::Max => a.max(b),
        ReduceOp::Prod => a.wrapping_mul(b),
    }
}

fn reduce_typed<T, const N: usize>(
    op: ReduceOp,
    dst: &mut [u8],
    src: &[u8],
    count: usize,
    from_bytes: fn([u8; N]) -> T,
    to_bytes: fn(T) -> [u8; N],
) where
    T: Copy + PartialOrd + std::ops::Add<Output = T> + std::ops::Mul<Output = T>,
{
    for i in 0..count {
        let at = i * N;
        let mut a_bytes = [0u8; N];
        a_bytes.copy_from_slice(&dst[at..at + N]);
        let mut b_bytes = [0u8; N];
        b_bytes.copy_from_slice(&src[at..at + N]);

        let a = from_bytes(a_bytes);
        let b = from_bytes(b_bytes);

        let result = match op {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => if a < b { a } else { b },
            ReduceOp::Max => if a > b { a } else { b },
            ReduceOp::Prod => a * b,
        };

        dst[at..at + N].copy_from_slice(&to_bytes(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario S5: `RBufLocalReduce(add, toBuf=[0,0], buf=[1,2])` leaves
    /// `toBuf=[1,2]`; applying the same reduction again leaves `[2,4]`.
    #[test]
    fn local_reduce_accumulates() {
        let ty = ScalarType(DType::I64);
        let mut to_buf = vec![0i64, 0i64];
        let from_buf = vec![1i64, 2i64];

        let mut to_bytes = to_buf.iter().flat_map(|v| v.to_ne_bytes()).collect::<Vec<u8>>();
        let from_bytes = from_buf.iter().flat_map(|v| v.to_ne_bytes()).collect::<Vec<u8>>();

        ty.reduce(ReduceOp::Sum, &mut to_bytes, &from_bytes, 2);
        for (i, chunk) in to_bytes.chunks(8).enumerate() {
            to_buf[i] = i64::from_ne_bytes(chunk.try_into().unwrap());
        }
        assert_eq!(to_buf, vec![1, 2]);

        ty.reduce(ReduceOp::Sum, &mut to_bytes, &from_bytes, 2);
        for (i, chunk) in to_bytes.chunks(8).enumerate() {
            to_buf[i] = i64::from_ne_bytes(chunk.try_into().unwrap());
        }
        assert_eq!(to_buf, vec![2, 4]);
    }
}
