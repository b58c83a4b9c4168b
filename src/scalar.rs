//! Scalar reverse-mode autodiff.
//!
//! The scalar engine is the small sibling of the tensor engine: the same
//! arena graph, the same topological backward traversal, but with plain
//! `f64` payloads and no kernel dispatch. It exists for exactly what the
//! tensor engine is too heavy for — unit-checking gradient rules and
//! training tiny models one number at a time.
//!
//! A [`ScalarTape`] owns the graph arena; [`Scalar`] handles are cheap
//! copies of a node id plus the cached forward value. Operations between
//! scalars of different tapes panic. Every operation records its history —
//! the op kind, the values its backward rule needs, and the input node ids —
//! exactly once at construction.
//!
//! # Example
//! ```
//! use gradstride::ScalarTape;
//!
//! let tape = ScalarTape::new();
//! let x = tape.scalar(2.0);
//! let y = tape.scalar(3.0);
//! let z = x.mul(&y).sigmoid();
//! z.backward();
//! assert!(x.derivative().is_some());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::autodiff::{Arena, NodeId, topological_order};

/// The closed set of scalar operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarOp {
    Neg,
    Inv,
    Log,
    Exp,
    Sigmoid,
    Relu,
    Add,
    Mul,
    Lt,
    Eq,
}

/// Values stashed by an operation's forward pass for its backward rule.
#[derive(Debug, Default)]
struct ScalarContext {
    saved: Vec<f64>,
}

struct ScalarHistory {
    op: ScalarOp,
    ctx: ScalarContext,
    inputs: Vec<NodeId>,
}

struct ScalarNode {
    history: Option<ScalarHistory>,
    derivative: Option<f64>,
}

/// Owner of a scalar computation graph.
#[derive(Clone)]
pub struct ScalarTape {
    arena: Arc<Mutex<Arena<ScalarNode>>>,
}

impl ScalarTape {
    pub fn new() -> Self {
        ScalarTape {
            arena: Arc::new(Mutex::new(Arena::new())),
        }
    }

    /// Creates a leaf value on this tape.
    pub fn scalar(&self, value: f64) -> Scalar {
        let id = self.lock().push(ScalarNode {
            history: None,
            derivative: None,
        });
        Scalar {
            id,
            value,
            tape: self.clone(),
        }
    }

    /// Drops the whole graph. Outstanding handles become stale; using one
    /// afterwards panics.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Arena<ScalarNode>> {
        self.arena.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn same(&self, other: &ScalarTape) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena)
    }
}

impl Default for ScalarTape {
    fn default() -> Self {
        Self::new()
    }
}

/// A value in a scalar computation graph.
#[derive(Clone)]
pub struct Scalar {
    id: NodeId,
    value: f64,
    tape: ScalarTape,
}

impl Scalar {
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Whether this node was created directly rather than by an operation.
    pub fn is_leaf(&self) -> bool {
        self.tape.lock().get(self.id).history.is_none()
    }

    /// The accumulated gradient, if `backward` has reached this leaf.
    pub fn derivative(&self) -> Option<f64> {
        self.tape.lock().get(self.id).derivative
    }

    /// Resets the accumulated gradient.
    pub fn zero_grad_(&self) {
        self.tape.lock().get_mut(self.id).derivative = None;
    }

    fn record(&self, op: ScalarOp, value: f64, saved: Vec<f64>, inputs: Vec<NodeId>) -> Scalar {
        let id = self.tape.lock().push(ScalarNode {
            history: Some(ScalarHistory {
                op,
                ctx: ScalarContext { saved },
                inputs,
            }),
            derivative: None,
        });
        Scalar {
            id,
            value,
            tape: self.tape.clone(),
        }
    }

    fn binary(&self, other: &Scalar, op: ScalarOp, value: f64, saved: Vec<f64>) -> Scalar {
        assert!(
            self.tape.same(&other.tape),
            "scalars belong to different tapes"
        );
        self.record(op, value, saved, vec![self.id, other.id])
    }

    pub fn neg(&self) -> Scalar {
        self.record(ScalarOp::Neg, -self.value, vec![], vec![self.id])
    }

    pub fn inv(&self) -> Scalar {
        self.record(
            ScalarOp::Inv,
            1.0 / self.value,
            vec![self.value],
            vec![self.id],
        )
    }

    pub fn log(&self) -> Scalar {
        self.record(
            ScalarOp::Log,
            self.value.ln(),
            vec![self.value],
            vec![self.id],
        )
    }

    pub fn exp(&self) -> Scalar {
        let out = self.value.exp();
        self.record(ScalarOp::Exp, out, vec![out], vec![self.id])
    }

    pub fn sigmoid(&self) -> Scalar {
        let out = 1.0 / (1.0 + (-self.value).exp());
        self.record(ScalarOp::Sigmoid, out, vec![out], vec![self.id])
    }

    pub fn relu(&self) -> Scalar {
        self.record(
            ScalarOp::Relu,
            self.value.max(0.0),
            vec![self.value],
            vec![self.id],
        )
    }

    pub fn add(&self, other: &Scalar) -> Scalar {
        self.binary(other, ScalarOp::Add, self.value + other.value, vec![])
    }

    pub fn mul(&self, other: &Scalar) -> Scalar {
        self.binary(
            other,
            ScalarOp::Mul,
            self.value * other.value,
            vec![self.value, other.value],
        )
    }

    pub fn sub(&self, other: &Scalar) -> Scalar {
        self.add(&other.neg())
    }

    pub fn div(&self, other: &Scalar) -> Scalar {
        self.mul(&other.inv())
    }

    /// `1.0` when `self < other`, else `0.0`. Zero gradient to both inputs.
    pub fn lt(&self, other: &Scalar) -> Scalar {
        let out = if self.value < other.value { 1.0 } else { 0.0 };
        self.binary(other, ScalarOp::Lt, out, vec![])
    }

    pub fn gt(&self, other: &Scalar) -> Scalar {
        other.lt(self)
    }

    /// `1.0` when the values are equal, else `0.0`. Zero gradient.
    pub fn eq(&self, other: &Scalar) -> Scalar {
        let out = if self.value == other.value { 1.0 } else { 0.0 };
        self.binary(other, ScalarOp::Eq, out, vec![])
    }

    /// Runs the backward pass seeded with `d(out)/d(out) = 1`.
    pub fn backward(&self) {
        self.backward_with(1.0);
    }

    /// Runs the backward pass from this node with an explicit seed
    /// gradient, accumulating into every reachable leaf's `derivative`.
    pub fn backward_with(&self, seed: f64) {
        let mut arena = self.tape.lock();
        let order = topological_order(self.id, |id| match &arena.get(id).history {
            Some(h) => h.inputs.clone(),
            None => Vec::new(),
        });

        let mut pending: HashMap<NodeId, f64> = HashMap::new();
        pending.insert(self.id, seed);
        for id in order {
            let Some(grad) = pending.remove(&id) else {
                continue;
            };
            if arena.get(id).history.is_none() {
                let node = arena.get_mut(id);
                node.derivative = Some(node.derivative.unwrap_or(0.0) + grad);
            } else {
                let node = arena.get(id);
                let parts = chain_rule(node, grad);
                let inputs = match &node.history {
                    Some(h) => h.inputs.clone(),
                    None => Vec::new(),
                };
                for (input, part) in inputs.into_iter().zip(parts) {
                    *pending.entry(input).or_insert(0.0) += part;
                }
            }
        }
    }
}

/// One application of an operation's backward rule: the gradients it sends
/// to its inputs, in input order.
///
/// # Panics
/// Panics when invoked on a leaf node.
fn chain_rule(node: &ScalarNode, grad: f64) -> Vec<f64> {
    let history = node
        .history
        .as_ref()
        .expect("chain rule invoked on a leaf node");
    let saved = &history.ctx.saved;
    match history.op {
        ScalarOp::Neg => vec![-grad],
        ScalarOp::Inv => {
            let x = saved[0];
            vec![-grad / (x * x)]
        }
        ScalarOp::Log => vec![grad / saved[0]],
        ScalarOp::Exp => vec![grad * saved[0]],
        ScalarOp::Sigmoid => {
            let out = saved[0];
            vec![grad * out * (1.0 - out)]
        }
        ScalarOp::Relu => vec![if saved[0] > 0.0 { grad } else { 0.0 }],
        ScalarOp::Add => vec![grad, grad],
        ScalarOp::Mul => vec![grad * saved[1], grad * saved[0]],
        ScalarOp::Lt | ScalarOp::Eq => vec![0.0, 0.0],
    }
}

impl std::ops::Add for &Scalar {
    type Output = Scalar;

    fn add(self, rhs: &Scalar) -> Scalar {
        Scalar::add(self, rhs)
    }
}

impl std::ops::Sub for &Scalar {
    type Output = Scalar;

    fn sub(self, rhs: &Scalar) -> Scalar {
        Scalar::sub(self, rhs)
    }
}

impl std::ops::Mul for &Scalar {
    type Output = Scalar;

    fn mul(self, rhs: &Scalar) -> Scalar {
        Scalar::mul(self, rhs)
    }
}

impl std::ops::Div for &Scalar {
    type Output = Scalar;

    fn div(self, rhs: &Scalar) -> Scalar {
        Scalar::div(self, rhs)
    }
}

impl std::ops::Neg for &Scalar {
    type Output = Scalar;

    fn neg(self) -> Scalar {
        Scalar::neg(self)
    }
}

impl std::fmt::Debug for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scalar")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::central_difference;

    #[test]
    fn add_passes_gradient_through() {
        let tape = ScalarTape::new();
        let x = tape.scalar(2.0);
        let y = tape.scalar(3.0);
        let z = &x + &y;
        assert_eq!(z.value(), 5.0);
        z.backward();
        assert_eq!(x.derivative(), Some(1.0));
        assert_eq!(y.derivative(), Some(1.0));
    }

    #[test]
    fn mul_swaps_operands() {
        let tape = ScalarTape::new();
        let x = tape.scalar(2.0);
        let y = tape.scalar(3.0);
        (&x * &y).backward();
        assert_eq!(x.derivative(), Some(3.0));
        assert_eq!(y.derivative(), Some(2.0));
    }

    #[test]
    fn diamond_graph_accumulates_both_paths() {
        let tape = ScalarTape::new();
        let x = tape.scalar(4.0);
        let z = &x * &x;
        z.backward();
        assert_eq!(x.derivative(), Some(8.0));
    }

    #[test]
    fn chained_ops_match_central_difference() {
        let f = |v: &[f64]| {
            let tape = ScalarTape::new();
            let x = tape.scalar(v[0]);
            let y = tape.scalar(v[1]);
            (&x * &y).sigmoid().log().value()
        };
        let point = [0.7, -0.4];
        let numeric = central_difference(f, &point, 1e-6);

        let tape = ScalarTape::new();
        let x = tape.scalar(point[0]);
        let y = tape.scalar(point[1]);
        (&x * &y).sigmoid().log().backward();
        assert!((x.derivative().unwrap() - numeric[0]).abs() < 1e-4);
        assert!((y.derivative().unwrap() - numeric[1]).abs() < 1e-4);
    }

    #[test]
    fn relu_gates_gradient_at_zero() {
        let tape = ScalarTape::new();
        let x = tape.scalar(-1.5);
        x.relu().backward();
        assert_eq!(x.derivative(), Some(0.0));

        let y = tape.scalar(1.5);
        y.relu().backward();
        assert_eq!(y.derivative(), Some(1.0));
    }

    #[test]
    fn comparisons_carry_zero_gradient() {
        let tape = ScalarTape::new();
        let x = tape.scalar(1.0);
        let y = tape.scalar(2.0);
        let lt = x.lt(&y);
        assert_eq!(lt.value(), 1.0);
        lt.backward();
        assert_eq!(x.derivative(), Some(0.0));
        assert_eq!(y.derivative(), Some(0.0));
    }

    #[test]
    fn repeated_backward_accumulates_until_reset() {
        let tape = ScalarTape::new();
        let x = tape.scalar(3.0);
        let z = &x * &x;
        z.backward();
        z.backward();
        assert_eq!(x.derivative(), Some(12.0));
        x.zero_grad_();
        assert_eq!(x.derivative(), None);
        z.backward();
        assert_eq!(x.derivative(), Some(6.0));
    }

    #[test]
    fn cross_tape_operations_panic() {
        let a = ScalarTape::new().scalar(1.0);
        let b = ScalarTape::new().scalar(2.0);
        assert!(std::panic::catch_unwind(|| a.add(&b)).is_err());
    }
}
