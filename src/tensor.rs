//! Tensor graph nodes and the public tensor surface.
//!
//! A [`Tensor`] is a handle into the runtime's computation graph: the node
//! id, the forward value, and the runtime itself. Operations compute their
//! value through the runtime's kernel dispatch, stash what their backward
//! rule will need into a context, and record a history entry — op kind,
//! context, input node ids — exactly once. Tensors created directly
//! (constructors, `tensor!`) have no history; they are the leaves, and only
//! leaves accumulate gradient.
//!
//! `backward` walks the history DAG in topological order from the root,
//! carrying a pending-gradient table. Non-leaf nodes expand their pending
//! gradient through the closed backward table into one gradient per input;
//! leaves add theirs into the `grad` slot, summing contributions from every
//! path. Where the forward pass broadcast an operand, the backward rule
//! first sums the gradient back down to the operand's own shape.
//!
//! # Example
//! ```
//! use gradstride::{Runtime, tensor};
//!
//! let rt = Runtime::naive();
//! let x = tensor!(rt, [[1.0, 2.0], [3.0, 4.0]]);
//! let loss = x.mul(&x).sum(None);
//! loss.backward();
//! assert_eq!(loss.item(), 30.0);
//! assert_eq!(x.grad().unwrap().to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
//! ```

use std::collections::HashMap;

use crate::autodiff::{Arena, NodeId, topological_order};
use crate::ops::{MapOp, ReduceOp, ZipOp};
use crate::runtime::Runtime;
use crate::storage::TensorData;

/// The closed set of graph-recorded tensor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TensorOp {
    Unary(MapOp),
    Binary(ZipOp),
    Reduce(ReduceOp, usize),
    Permute,
    View,
    MatMul,
}

/// Values stashed by an operation's forward pass for its backward rule:
/// saved operands or outputs, saved axis lists, saved operand shapes.
/// Created per application and dropped with the node.
#[derive(Default)]
struct TensorContext {
    tensors: Vec<TensorData>,
    dims: Vec<usize>,
    shapes: Vec<Vec<usize>>,
}

struct TensorHistory {
    op: TensorOp,
    ctx: TensorContext,
    inputs: Vec<NodeId>,
}

pub(crate) struct TensorNode {
    history: Option<TensorHistory>,
    grad: Option<TensorData>,
}

pub(crate) type TensorGraph = Arena<TensorNode>;

/// A value in a tensor computation graph. See the module docs.
#[derive(Clone)]
pub struct Tensor {
    id: NodeId,
    data: TensorData,
    runtime: Runtime,
}

impl Tensor {
    /// Creates a leaf tensor from a shape and flat row-major data.
    ///
    /// # Panics
    /// Panics if the data length does not match the shape product.
    pub fn new(rt: &Runtime, shape: impl Into<Vec<usize>>, data: Vec<f64>) -> Tensor {
        Self::from_data(rt, TensorData::new(shape, data))
    }

    /// Wraps existing storage as a leaf tensor.
    pub fn from_data(rt: &Runtime, data: TensorData) -> Tensor {
        Self::node(rt, data, None)
    }

    pub fn zeros(rt: &Runtime, shape: &[usize]) -> Tensor {
        Self::from_data(rt, TensorData::zeros(shape.to_vec()))
    }

    pub fn ones(rt: &Runtime, shape: &[usize]) -> Tensor {
        Self::from_data(rt, TensorData::full(shape.to_vec(), 1.0))
    }

    /// A leaf tensor of uniform random values in `[0, 1)`.
    pub fn rand(rt: &Runtime, shape: &[usize]) -> Tensor {
        let size = shape.iter().product();
        let data = (0..size).map(|_| rand::random::<f64>()).collect();
        Self::new(rt, shape.to_vec(), data)
    }

    /// A single-element leaf tensor of shape `[1]`.
    pub fn from_scalar(rt: &Runtime, value: f64) -> Tensor {
        Self::new(rt, vec![1], vec![value])
    }

    fn node(rt: &Runtime, data: TensorData, history: Option<TensorHistory>) -> Tensor {
        let id = rt
            .graph()
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(TensorNode {
                history,
                grad: None,
            });
        Tensor {
            id,
            data,
            runtime: rt.clone(),
        }
    }

    fn record(
        &self,
        data: TensorData,
        op: TensorOp,
        ctx: TensorContext,
        inputs: Vec<NodeId>,
    ) -> Tensor {
        Self::node(
            &self.runtime,
            data,
            Some(TensorHistory { op, ctx, inputs }),
        )
    }

    // === Introspection ===

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn size(&self) -> usize {
        self.data.size()
    }

    pub fn dims(&self) -> usize {
        self.data.dims()
    }

    /// The underlying strided storage view.
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// The runtime this tensor records into.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn get(&self, index: &[usize]) -> f64 {
        self.data.get(index)
    }

    /// Writes one element through to storage. Visible through every alias
    /// created by `permute`/`view`; intended for leaf tensors (external
    /// optimizers mutate parameters this way).
    pub fn set(&self, index: &[usize], value: f64) {
        self.data.set(index, value);
    }

    /// Replaces all elements, in row-major order. The optimizer bulk-update
    /// counterpart of [`Tensor::set`].
    pub fn update(&self, values: &[f64]) {
        self.data.update(values);
    }

    /// The single element of a size-1 tensor.
    ///
    /// # Panics
    /// Panics if the tensor has more than one element.
    pub fn item(&self) -> f64 {
        assert_eq!(
            self.size(),
            1,
            "item() requires a single-element tensor, got shape {:?}",
            self.shape()
        );
        self.data.to_vec()[0]
    }

    /// All elements in row-major order.
    pub fn to_vec(&self) -> Vec<f64> {
        self.data.to_vec()
    }

    /// Whether this node was created directly rather than by an operation.
    pub fn is_leaf(&self) -> bool {
        self.runtime
            .graph()
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(self.id)
            .history
            .is_none()
    }

    // === Elementwise operations ===

    fn unary(&self, op: MapOp) -> Tensor {
        let out = self.runtime.map(op, &self.data);
        let mut ctx = TensorContext::default();
        match op {
            MapOp::Id | MapOp::Neg => {}
            MapOp::Inv | MapOp::Log | MapOp::Relu => ctx.tensors.push(self.data.clone()),
            MapOp::Exp | MapOp::Sigmoid => ctx.tensors.push(out.clone()),
        }
        self.record(out, TensorOp::Unary(op), ctx, vec![self.id])
    }

    fn binary(&self, other: &Tensor, op: ZipOp) -> Tensor {
        assert!(
            self.runtime.same(&other.runtime),
            "tensors belong to different runtimes"
        );
        let out = self.runtime.zip(op, &self.data, &other.data);
        let mut ctx = TensorContext {
            shapes: vec![self.shape().to_vec(), other.shape().to_vec()],
            ..TensorContext::default()
        };
        if op == ZipOp::Mul {
            ctx.tensors = vec![self.data.clone(), other.data.clone()];
        }
        self.record(out, TensorOp::Binary(op), ctx, vec![self.id, other.id])
    }

    pub fn neg(&self) -> Tensor {
        self.unary(MapOp::Neg)
    }

    pub fn inv(&self) -> Tensor {
        self.unary(MapOp::Inv)
    }

    pub fn log(&self) -> Tensor {
        self.unary(MapOp::Log)
    }

    pub fn exp(&self) -> Tensor {
        self.unary(MapOp::Exp)
    }

    pub fn sigmoid(&self) -> Tensor {
        self.unary(MapOp::Sigmoid)
    }

    pub fn relu(&self) -> Tensor {
        self.unary(MapOp::Relu)
    }

    pub fn add(&self, other: &Tensor) -> Tensor {
        self.binary(other, ZipOp::Add)
    }

    pub fn mul(&self, other: &Tensor) -> Tensor {
        self.binary(other, ZipOp::Mul)
    }

    pub fn sub(&self, other: &Tensor) -> Tensor {
        self.add(&other.neg())
    }

    pub fn div(&self, other: &Tensor) -> Tensor {
        self.mul(&other.inv())
    }

    /// Elementwise `1.0` where `self < other`. Zero gradient to both inputs.
    pub fn lt(&self, other: &Tensor) -> Tensor {
        self.binary(other, ZipOp::Lt)
    }

    pub fn gt(&self, other: &Tensor) -> Tensor {
        other.lt(self)
    }

    /// Elementwise equality indicator. Zero gradient to both inputs.
    pub fn eq(&self, other: &Tensor) -> Tensor {
        self.binary(other, ZipOp::Eq)
    }

    // === Reductions ===

    fn reduce(&self, op: ReduceOp, dim: usize) -> Tensor {
        let out = self.runtime.reduce(op, &self.data, dim);
        let ctx = TensorContext {
            shapes: vec![self.shape().to_vec()],
            ..TensorContext::default()
        };
        self.record(out, TensorOp::Reduce(op, dim), ctx, vec![self.id])
    }

    /// Collapses the whole tensor to shape `[1]` first when `dim` is `None`.
    fn reduce_full(&self, op: ReduceOp, dim: Option<usize>) -> Tensor {
        match dim {
            Some(d) => self.reduce(op, d),
            None => self.contiguous().view(&[self.size()]).reduce(op, 0),
        }
    }

    /// Sum along `dim` (the reduced axis stays with size 1), or over all
    /// elements to shape `[1]`.
    pub fn sum(&self, dim: Option<usize>) -> Tensor {
        self.reduce_full(ReduceOp::Sum, dim)
    }

    /// Arithmetic mean along `dim` or over all elements.
    pub fn mean(&self, dim: Option<usize>) -> Tensor {
        let n = match dim {
            Some(d) => self.shape()[d],
            None => self.size(),
        };
        self.sum(dim)
            .mul(&Tensor::from_scalar(&self.runtime, 1.0 / n as f64))
    }

    /// Product fold along `dim` or over all elements; on indicator-valued
    /// tensors this is a logical "all". Zero gradient.
    pub fn all(&self, dim: Option<usize>) -> Tensor {
        self.reduce_full(ReduceOp::Prod, dim)
    }

    // === Shape operations ===

    /// Reorders dimensions. The output aliases this tensor's storage.
    ///
    /// # Panics
    /// Panics if `order` is not a permutation of `0..dims`.
    pub fn permute(&self, order: &[usize]) -> Tensor {
        let out = self.data.permute(order);
        let ctx = TensorContext {
            dims: order.to_vec(),
            ..TensorContext::default()
        };
        self.record(out, TensorOp::Permute, ctx, vec![self.id])
    }

    /// Reshapes a contiguous tensor. The output aliases this tensor's
    /// storage.
    ///
    /// # Panics
    /// Panics if the tensor is not contiguous or the element count differs.
    pub fn view(&self, shape: &[usize]) -> Tensor {
        let out = self.data.view(shape);
        let ctx = TensorContext {
            shapes: vec![self.shape().to_vec()],
            ..TensorContext::default()
        };
        self.record(out, TensorOp::View, ctx, vec![self.id])
    }

    /// Copies into canonical row-major layout (a graph-recorded identity
    /// map, so gradients pass straight through).
    pub fn contiguous(&self) -> Tensor {
        self.unary(MapOp::Id)
    }

    /// Batched matrix multiply; see the kernel contract for shapes.
    ///
    /// # Panics
    /// Panics on rank or inner-dimension mismatches.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.runtime.same(&other.runtime),
            "tensors belong to different runtimes"
        );
        let out = self.runtime.matmul(&self.data, &other.data);
        let ctx = TensorContext {
            tensors: vec![self.data.clone(), other.data.clone()],
            ..TensorContext::default()
        };
        self.record(out, TensorOp::MatMul, ctx, vec![self.id, other.id])
    }

    // === Autodiff ===

    /// The accumulated gradient of a leaf, wrapped as a fresh constant
    /// tensor.
    pub fn grad(&self) -> Option<Tensor> {
        let data = self
            .runtime
            .graph()
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(self.id)
            .grad
            .clone();
        data.map(|d| Tensor::from_data(&self.runtime, d))
    }

    /// Resets the accumulated gradient.
    pub fn zero_grad_(&self) {
        self.runtime
            .graph()
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(self.id)
            .grad = None;
    }

    /// Runs the backward pass seeded with ones.
    ///
    /// # Panics
    /// Panics unless this tensor has exactly one element; larger roots need
    /// [`Tensor::backward_with`].
    pub fn backward(&self) {
        assert_eq!(
            self.size(),
            1,
            "backward() without a seed requires a single-element tensor, got shape {:?}",
            self.shape()
        );
        self.backprop(TensorData::full(self.shape().to_vec(), 1.0));
    }

    /// Runs the backward pass with an explicit output-gradient seed.
    ///
    /// # Panics
    /// Panics if the seed's shape differs from this tensor's.
    pub fn backward_with(&self, seed: &Tensor) {
        assert_eq!(
            seed.shape(),
            self.shape(),
            "seed gradient shape {:?} does not match output shape {:?}",
            seed.shape(),
            self.shape()
        );
        self.backprop(seed.data.clone());
    }

    fn backprop(&self, seed: TensorData) {
        let rt = &self.runtime;
        let mut arena = rt.graph().write().unwrap_or_else(|e| e.into_inner());
        let order = topological_order(self.id, |id| match &arena.get(id).history {
            Some(h) => h.inputs.clone(),
            None => Vec::new(),
        });

        let mut pending: HashMap<NodeId, TensorData> = HashMap::new();
        pending.insert(self.id, seed);
        for id in order {
            let Some(grad) = pending.remove(&id) else {
                continue;
            };
            if arena.get(id).history.is_none() {
                let node = arena.get_mut(id);
                node.grad = Some(match node.grad.take() {
                    Some(existing) => rt.zip(ZipOp::Add, &existing, &grad),
                    None => grad,
                });
            } else {
                let node = arena.get(id);
                let parts = chain_rule(node, &grad, rt);
                let inputs = match &node.history {
                    Some(h) => h.inputs.clone(),
                    None => Vec::new(),
                };
                for (input, part) in inputs.into_iter().zip(parts) {
                    let next = match pending.remove(&input) {
                        Some(existing) => rt.zip(ZipOp::Add, &existing, &part),
                        None => part,
                    };
                    pending.insert(input, next);
                }
            }
        }
    }
}

/// One application of an operation's backward rule: the gradients it sends
/// to its inputs, in input order, already summed back down to each input's
/// own shape.
///
/// # Panics
/// Panics when invoked on a leaf node.
fn chain_rule(node: &TensorNode, grad: &TensorData, rt: &Runtime) -> Vec<TensorData> {
    let history = node
        .history
        .as_ref()
        .expect("chain rule invoked on a leaf node");
    let ctx = &history.ctx;
    match history.op {
        TensorOp::Unary(op) => {
            let part = match op {
                MapOp::Id => grad.clone(),
                MapOp::Neg => rt.map(MapOp::Neg, grad),
                MapOp::Inv => rt.zip(ZipOp::InvBack, &ctx.tensors[0], grad),
                MapOp::Log => rt.zip(ZipOp::LogBack, &ctx.tensors[0], grad),
                MapOp::Exp => rt.zip(ZipOp::Mul, &ctx.tensors[0], grad),
                MapOp::Sigmoid => rt.zip(ZipOp::SigmoidBack, &ctx.tensors[0], grad),
                MapOp::Relu => rt.zip(ZipOp::ReluBack, &ctx.tensors[0], grad),
            };
            vec![part]
        }
        TensorOp::Binary(ZipOp::Add) => vec![
            unbroadcast(rt, grad.clone(), &ctx.shapes[0]),
            unbroadcast(rt, grad.clone(), &ctx.shapes[1]),
        ],
        TensorOp::Binary(ZipOp::Mul) => {
            let a = &ctx.tensors[0];
            let b = &ctx.tensors[1];
            vec![
                unbroadcast(rt, rt.zip(ZipOp::Mul, b, grad), a.shape()),
                unbroadcast(rt, rt.zip(ZipOp::Mul, a, grad), b.shape()),
            ]
        }
        TensorOp::Binary(ZipOp::Lt) | TensorOp::Binary(ZipOp::Eq) => vec![
            TensorData::zeros(ctx.shapes[0].clone()),
            TensorData::zeros(ctx.shapes[1].clone()),
        ],
        TensorOp::Binary(_) => unreachable!("derivative kernels are never recorded"),
        TensorOp::Reduce(ReduceOp::Sum, _) => {
            // Broadcast the gradient back across the reduced axis.
            vec![rt.zip(ZipOp::Add, grad, &TensorData::zeros(ctx.shapes[0].clone()))]
        }
        TensorOp::Reduce(ReduceOp::Prod, _) => vec![TensorData::zeros(ctx.shapes[0].clone())],
        TensorOp::Permute => {
            let mut inverse = vec![0usize; ctx.dims.len()];
            for (i, &axis) in ctx.dims.iter().enumerate() {
                inverse[axis] = i;
            }
            vec![grad.permute(&inverse)]
        }
        TensorOp::View => vec![grad.contiguous().view(&ctx.shapes[0])],
        TensorOp::MatMul => {
            let a = &ctx.tensors[0];
            let b = &ctx.tensors[1];
            let da = rt.matmul(grad, &transpose_last(b));
            let db = rt.matmul(&transpose_last(a), grad);
            vec![
                unbroadcast(rt, da, a.shape()),
                unbroadcast(rt, db, b.shape()),
            ]
        }
    }
}

/// Sums a gradient down to an operand's pre-broadcast shape: collapse extra
/// leading dimensions entirely, then sum every dimension the operand had as
/// 1 but the gradient does not.
fn unbroadcast(rt: &Runtime, grad: TensorData, target: &[usize]) -> TensorData {
    let mut g = grad;
    while g.dims() > target.len() {
        g = rt.reduce(ReduceOp::Sum, &g, 0);
        let rest = g.shape()[1..].to_vec();
        g = g.contiguous().view(&rest);
    }
    for d in 0..target.len() {
        if target[d] == 1 && g.shape()[d] != 1 {
            g = rt.reduce(ReduceOp::Sum, &g, d);
        }
    }
    assert_eq!(
        g.shape(),
        target,
        "gradient could not be reduced to operand shape"
    );
    g
}

fn transpose_last(t: &TensorData) -> TensorData {
    match t.dims() {
        2 => t.permute(&[1, 0]),
        _ => t.permute(&[0, 2, 1]),
    }
}

impl std::ops::Add for &Tensor {
    type Output = Tensor;

    fn add(self, rhs: &Tensor) -> Tensor {
        Tensor::add(self, rhs)
    }
}

impl std::ops::Sub for &Tensor {
    type Output = Tensor;

    fn sub(self, rhs: &Tensor) -> Tensor {
        Tensor::sub(self, rhs)
    }
}

impl std::ops::Mul for &Tensor {
    type Output = Tensor;

    fn mul(self, rhs: &Tensor) -> Tensor {
        Tensor::mul(self, rhs)
    }
}

impl std::ops::Div for &Tensor {
    type Output = Tensor;

    fn div(self, rhs: &Tensor) -> Tensor {
        Tensor::div(self, rhs)
    }
}

impl std::ops::Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        Tensor::neg(self)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .field("data", &self.to_vec())
            .finish_non_exhaustive()
    }
}

/// Builds a leaf [`Tensor`] on a runtime from nested literal arrays.
///
/// # Example
/// ```
/// use gradstride::{Runtime, tensor};
///
/// let rt = Runtime::naive();
/// let t = tensor!(rt, [[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($rt:expr, $($t:tt)+) => {
        $crate::tensor::Tensor::from_data(&$rt, $crate::tensor_data!($($t)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor;

    #[test]
    fn macro_builds_leaves() {
        let rt = Runtime::naive();
        let t = tensor!(rt, [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(t.shape(), &[2, 3]);
        assert!(t.is_leaf());
        assert_eq!(t.get(&[1, 2]), 6.0);
    }

    #[test]
    fn operators_compose_with_methods() {
        let rt = Runtime::naive();
        let a = tensor!(rt, [1.0, 2.0, 3.0]);
        let b = tensor!(rt, [4.0, 5.0, 6.0]);
        assert_eq!((&a + &b).to_vec(), vec![5.0, 7.0, 9.0]);
        assert_eq!((&a - &b).to_vec(), vec![-3.0, -3.0, -3.0]);
        assert_eq!((&a * &b).to_vec(), vec![4.0, 10.0, 18.0]);
        assert_eq!((-&a).to_vec(), vec![-1.0, -2.0, -3.0]);
        let halves = (&a / &tensor!(rt, [2.0, 2.0, 2.0])).to_vec();
        assert_eq!(halves, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn operations_are_not_leaves() {
        let rt = Runtime::naive();
        let a = tensor!(rt, [1.0, 2.0]);
        let b = a.sigmoid();
        assert!(a.is_leaf());
        assert!(!b.is_leaf());
    }

    #[test]
    fn set_writes_through_permuted_alias() {
        let rt = Runtime::naive();
        let a = tensor!(rt, [[1.0, 2.0], [3.0, 4.0]]);
        let p = a.permute(&[1, 0]);
        p.set(&[0, 1], 30.0);
        assert_eq!(a.get(&[1, 0]), 30.0);
    }

    #[test]
    fn mean_divides_by_reduced_count() {
        let rt = Runtime::naive();
        let a = tensor!(rt, [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(a.mean(None).item(), 3.5);
        assert_eq!(a.mean(Some(1)).to_vec(), vec![2.0, 5.0]);
    }

    #[test]
    fn all_reduces_indicator_tensors() {
        let rt = Runtime::naive();
        let a = tensor!(rt, [1.0, 2.0, 3.0]);
        let b = tensor!(rt, [0.0, 0.0, 5.0]);
        assert_eq!(a.gt(&b).all(None).item(), 0.0);
        assert_eq!(a.gt(&Tensor::zeros(&rt, &[3])).all(None).item(), 1.0);
    }
}
