//! Kernel dispatch layer.
//!
//! Selects the backend for each kernel call based on the runtime's
//! preference, in priority order with a deterministic fall-through to the
//! naive reference:
//!
//! 1. `Gpu` — attempted when the `wgpu` feature is enabled and the device is
//!    available; any failure falls through.
//! 2. `Parallel` — attempted when the worker pool is available; the pool
//!    kernels themselves run naively below the size threshold.
//! 3. `Naive` — always runs.
//!
//! Callers cannot observe which path actually ran except by timing (and, for
//! the GPU, by its `f32` precision).

use super::{MapOp, ReduceOp, ZipOp, cpu, parallel};
use crate::runtime::{BackendKind, Runtime};
use crate::storage::TensorData;

pub(crate) fn map(rt: &Runtime, op: MapOp, a: &TensorData) -> TensorData {
    match rt.backend() {
        BackendKind::Gpu => {
            #[cfg(feature = "wgpu")]
            if let Some(out) = rt.with_gpu(|gpu| super::wgpu::map(gpu, op, a)) {
                return out;
            }
            cpu::map(op, a)
        }
        BackendKind::Parallel => rt
            .with_pool(|pool| parallel::map(pool, op, a))
            .unwrap_or_else(|| cpu::map(op, a)),
        BackendKind::Naive => cpu::map(op, a),
    }
}

pub(crate) fn zip(rt: &Runtime, op: ZipOp, a: &TensorData, b: &TensorData) -> TensorData {
    match rt.backend() {
        BackendKind::Gpu => {
            #[cfg(feature = "wgpu")]
            if let Some(out) = rt.with_gpu(|gpu| super::wgpu::zip(gpu, op, a, b)) {
                return out;
            }
            cpu::zip(op, a, b)
        }
        BackendKind::Parallel => rt
            .with_pool(|pool| parallel::zip(pool, op, a, b))
            .unwrap_or_else(|| cpu::zip(op, a, b)),
        BackendKind::Naive => cpu::zip(op, a, b),
    }
}

pub(crate) fn reduce(rt: &Runtime, op: ReduceOp, a: &TensorData, dim: usize) -> TensorData {
    match rt.backend() {
        BackendKind::Gpu => {
            #[cfg(feature = "wgpu")]
            if let Some(out) = rt.with_gpu(|gpu| super::wgpu::reduce(gpu, op, a, dim)) {
                return out;
            }
            cpu::reduce(op, a, dim)
        }
        BackendKind::Parallel => rt
            .with_pool(|pool| parallel::reduce(pool, op, a, dim))
            .unwrap_or_else(|| cpu::reduce(op, a, dim)),
        BackendKind::Naive => cpu::reduce(op, a, dim),
    }
}

pub(crate) fn matmul(rt: &Runtime, a: &TensorData, b: &TensorData) -> TensorData {
    match rt.backend() {
        BackendKind::Gpu => {
            #[cfg(feature = "wgpu")]
            if let Some(out) = rt.with_gpu(|gpu| super::wgpu::matmul(gpu, a, b)) {
                return out;
            }
            cpu::matmul(a, b)
        }
        BackendKind::Parallel => rt
            .with_pool(|pool| parallel::matmul(pool, a, b))
            .unwrap_or_else(|| cpu::matmul(a, b)),
        BackendKind::Naive => cpu::matmul(a, b),
    }
}
