//! Execution runtime: backend selection and process resources.
//!
//! A [`Runtime`] is the explicit execution context every tensor carries: it
//! names the preferred backend and owns the resources the non-naive backends
//! need — the worker pool and, under the `wgpu` feature, the GPU device with
//! its pipeline cache — plus the autodiff graph arena tensors record into.
//!
//! Both resources are created lazily on the first kernel call that wants
//! them. Acquisition failure is caught once, right there, and the runtime
//! degrades to the naive backend instead of surfacing the error; this is the
//! only place in the system where a failure is recovered rather than raised.
//! [`Runtime::shutdown`] releases the pool and the device deterministically
//! (worker threads and GPU handles should not wait for a garbage collector
//! that never comes); kernel calls after shutdown run naively.
//!
//! `Runtime` is a cheap clone handle: clones share the same resources and
//! the same graph.

use std::sync::{Arc, Mutex, RwLock};

use crate::ops::{MapOp, ReduceOp, ZipOp, dispatch};
#[cfg(feature = "wgpu")]
use crate::ops::wgpu::GpuContext;
use crate::storage::TensorData;
use crate::tensor::TensorGraph;

/// The three interchangeable execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Single-threaded reference kernels (default; always available).
    #[default]
    Naive,
    /// Worker-pool kernels over shared memory.
    Parallel,
    /// GPU compute-shader kernels. Without the `wgpu` feature, or when no
    /// adapter is available, this degrades to the naive backend.
    Gpu,
}

enum PoolState {
    Unset,
    Ready(rayon::ThreadPool),
    Disabled,
}

#[cfg(feature = "wgpu")]
enum GpuState {
    Unset,
    Ready(GpuContext),
    Disabled,
}

struct RuntimeInner {
    backend: BackendKind,
    pool: Mutex<PoolState>,
    #[cfg(feature = "wgpu")]
    gpu: Mutex<GpuState>,
    graph: RwLock<TensorGraph>,
}

/// Handle to an execution context. See the module docs.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// A runtime preferring the given backend.
    pub fn new(backend: BackendKind) -> Self {
        Runtime {
            inner: Arc::new(RuntimeInner {
                backend,
                pool: Mutex::new(PoolState::Unset),
                #[cfg(feature = "wgpu")]
                gpu: Mutex::new(GpuState::Unset),
                graph: RwLock::new(TensorGraph::new()),
            }),
        }
    }

    pub fn naive() -> Self {
        Self::new(BackendKind::Naive)
    }

    pub fn parallel() -> Self {
        Self::new(BackendKind::Parallel)
    }

    pub fn gpu() -> Self {
        Self::new(BackendKind::Gpu)
    }

    /// The backend this runtime prefers. Individual calls may still run
    /// naively (size threshold, unavailable resources, after `shutdown`).
    pub fn backend(&self) -> BackendKind {
        self.inner.backend
    }

    /// Whether two handles refer to the same runtime.
    pub fn same(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Releases the worker pool and the GPU device. Kernel calls made after
    /// shutdown fall back to the naive backend; recorded graph state is
    /// untouched.
    pub fn shutdown(&self) {
        *self.inner.pool.lock().unwrap_or_else(|e| e.into_inner()) = PoolState::Disabled;
        #[cfg(feature = "wgpu")]
        {
            *self.inner.gpu.lock().unwrap_or_else(|e| e.into_inner()) = GpuState::Disabled;
        }
    }

    /// Drops every recorded graph node and invalidates outstanding tensor
    /// handles (using one afterwards is a stale-handle panic).
    pub fn clear_graph(&self) {
        self.graph().write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub(crate) fn graph(&self) -> &RwLock<TensorGraph> {
        &self.inner.graph
    }

    /// Runs `f` against the worker pool, building the pool on first use.
    /// Returns `None` when the pool is disabled or could not be built.
    pub(crate) fn with_pool<R>(&self, f: impl FnOnce(&rayon::ThreadPool) -> R) -> Option<R> {
        let mut state = self.inner.pool.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, PoolState::Unset) {
            *state = match rayon::ThreadPoolBuilder::new().build() {
                Ok(pool) => PoolState::Ready(pool),
                Err(_) => PoolState::Disabled,
            };
        }
        match &*state {
            PoolState::Ready(pool) => Some(f(pool)),
            _ => None,
        }
    }

    /// Runs `f` against the GPU context, acquiring the device on first use.
    /// Returns `None` when no adapter/device is available, after `shutdown`,
    /// or when the kernel itself reports failure.
    #[cfg(feature = "wgpu")]
    pub(crate) fn with_gpu(
        &self,
        f: impl FnOnce(&GpuContext) -> Option<TensorData>,
    ) -> Option<TensorData> {
        let mut state = self.inner.gpu.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, GpuState::Unset) {
            *state = match GpuContext::new() {
                Ok(ctx) => GpuState::Ready(ctx),
                Err(_) => GpuState::Disabled,
            };
        }
        match &*state {
            GpuState::Ready(ctx) => f(ctx),
            _ => None,
        }
    }

    pub(crate) fn map(&self, op: MapOp, a: &TensorData) -> TensorData {
        dispatch::map(self, op, a)
    }

    pub(crate) fn zip(&self, op: ZipOp, a: &TensorData, b: &TensorData) -> TensorData {
        dispatch::zip(self, op, a, b)
    }

    pub(crate) fn reduce(&self, op: ReduceOp, a: &TensorData, dim: usize) -> TensorData {
        dispatch::reduce(self, op, a, dim)
    }

    pub(crate) fn matmul(&self, a: &TensorData, b: &TensorData) -> TensorData {
        dispatch::matmul(self, a, b)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::naive()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.inner.backend)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_degrades_to_naive() {
        let rt = Runtime::parallel();
        let t = TensorData::new(vec![3], vec![1.0, -2.0, 3.0]);
        let before = rt.map(MapOp::Relu, &t);
        rt.shutdown();
        let after = rt.map(MapOp::Relu, &t);
        assert_eq!(before.to_vec(), after.to_vec());
        assert_eq!(after.to_vec(), vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn clones_share_resources() {
        let rt = Runtime::naive();
        assert!(rt.same(&rt.clone()));
        assert!(!rt.same(&Runtime::naive()));
    }
}
