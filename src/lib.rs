//! gradstride: reverse-mode autodiff over strided tensors.
//!
//! A from-scratch automatic differentiation engine with two value
//! representations — [`Scalar`] and the n-dimensional strided [`Tensor`] —
//! executable on three interchangeable backends behind one kernel contract
//! (elementwise map, elementwise zip, dimensional reduce, batched matmul).
//!
//! # Features
//!
//! - Strided, broadcast-aware storage with aliasing `permute`/`view` views.
//! - Dynamic computation graphs with correct gradient accumulation,
//!   including diamond graphs and broadcast operands.
//! - A naive single-threaded reference backend, a worker-pool backend over
//!   a persistent thread pool, and (behind the `wgpu` feature) a GPU
//!   compute-shader backend — all producing numerically consistent results.
//!
//! # Goals
//!
//! - Keep every backend honest against the naive reference: same fold
//!   orders, same broadcast rules, verified agreement.
//! - Make execution resources explicit: one [`Runtime`] object owns the
//!   worker pool, the GPU device, and the graph, and tears them down
//!   deterministically.
//! - Prioritize correctness and explicitness over black-box abstraction.
//!
//! # Modules
//!
//! - [`storage`] — flat buffers, shapes, strides, broadcasting.
//! - [`ops`] — the closed op registry and the three kernel backends.
//! - [`runtime`] — backend selection and process resources.
//! - [`autodiff`] — graph arena and topological traversal.
//! - [`scalar`] / [`tensor`] — the two autodiff surfaces.
//! - [`check`] — central-difference gradient verification.
//!
//! # Example
//!
//! ```rust
//! use gradstride::{Runtime, tensor};
//!
//! let rt = Runtime::parallel();
//! let x = tensor!(rt, [[1.0, 2.0], [3.0, 4.0]]);
//! let y = tensor!(rt, [10.0, 20.0]);
//! let loss = x.add(&y).sigmoid().sum(None);
//! loss.backward();
//! let grad = x.grad().unwrap();
//! assert_eq!(grad.shape(), &[2, 2]);
//! rt.shutdown();
//! ```

pub mod autodiff;
pub mod check;
pub mod ops;
pub mod runtime;
pub mod scalar;
pub mod storage;
pub mod tensor;

pub use runtime::{BackendKind, Runtime};
pub use scalar::{Scalar, ScalarTape};
pub use storage::TensorData;
pub use tensor::Tensor;
