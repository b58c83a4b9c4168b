//! Naive single-threaded reference kernels.
//!
//! This backend is the numeric baseline: always available, used directly by
//! the `Naive` backend, and as the transparent fallback for the pool and GPU
//! backends. The other backends must reproduce its results (the GPU within
//! `f32` tolerance).
//!
//! Each kernel walks the output ordinals `0..out_size` in row-major order,
//! decodes the ordinal into a multi-index of the output shape, broadcast-maps
//! that index into each operand, reads through the operand's strides, applies
//! the op from the closed registry, and writes into a freshly allocated
//! contiguous buffer. When an operand is contiguous and no broadcasting is
//! needed, the index decode is skipped and the flat buffer is walked
//! directly.

use super::{MapOp, ReduceOp, ZipOp};
use crate::storage::{self, TensorData};

/// Applies a unary op elementwise, producing a contiguous tensor of the same
/// shape.
pub fn map(op: MapOp, a: &TensorData) -> TensorData {
    let out_shape = a.shape().to_vec();
    let n = a.size();
    let store = a.read_storage();
    let mut out = Vec::with_capacity(n);
    if a.is_contiguous() {
        out.extend(store.iter().map(|&x| op.eval(x)));
    } else {
        let mut out_index = vec![0usize; out_shape.len()];
        let mut in_index = vec![0usize; a.dims()];
        for ordinal in 0..n {
            storage::unravel_into(ordinal, &out_shape, &mut out_index);
            storage::broadcast_index_into(&out_index, a.shape(), &mut in_index);
            out.push(op.eval(store[position(a, &in_index)]));
        }
    }
    drop(store);
    TensorData::new(out_shape, out)
}

/// Applies a binary op elementwise over the broadcast of both shapes.
///
/// # Panics
/// Panics if the shapes are not broadcast-compatible.
pub fn zip(op: ZipOp, a: &TensorData, b: &TensorData) -> TensorData {
    let out_shape = storage::shape_broadcast(a.shape(), b.shape());
    let n: usize = out_shape.iter().product();
    let a_store = a.read_storage();
    let b_store = b.read_storage();
    let mut out = Vec::with_capacity(n);
    if aligned(a, b) {
        out.extend(
            a_store
                .iter()
                .zip(b_store.iter())
                .map(|(&x, &y)| op.eval(x, y)),
        );
    } else {
        let mut out_index = vec![0usize; out_shape.len()];
        let mut a_index = vec![0usize; a.dims()];
        let mut b_index = vec![0usize; b.dims()];
        for ordinal in 0..n {
            storage::unravel_into(ordinal, &out_shape, &mut out_index);
            storage::broadcast_index_into(&out_index, a.shape(), &mut a_index);
            storage::broadcast_index_into(&out_index, b.shape(), &mut b_index);
            out.push(op.eval(
                a_store[position(a, &a_index)],
                b_store[position(b, &b_index)],
            ));
        }
    }
    drop(a_store);
    drop(b_store);
    TensorData::new(out_shape, out)
}

/// Folds one axis, keeping it in the output with size 1.
///
/// Each output cell folds the reduced axis in increasing index order,
/// starting from the op identity. That fold order is part of the kernel
/// contract shared by all backends.
///
/// # Panics
/// Panics if `dim` is out of range.
pub fn reduce(op: ReduceOp, a: &TensorData, dim: usize) -> TensorData {
    assert!(
        dim < a.dims(),
        "reduce dimension {dim} out of range for shape {:?}",
        a.shape()
    );
    let mut out_shape = a.shape().to_vec();
    out_shape[dim] = 1;
    let n: usize = out_shape.iter().product();
    let reduce_size = a.shape()[dim];
    let step = a.strides()[dim];
    let store = a.read_storage();
    let mut out = Vec::with_capacity(n);
    let mut index = vec![0usize; a.dims()];
    for ordinal in 0..n {
        storage::unravel_into(ordinal, &out_shape, &mut index);
        let base = position(a, &index);
        let mut acc = op.identity();
        for j in 0..reduce_size {
            acc = op.combine(acc, store[base + j * step]);
        }
        out.push(acc);
    }
    drop(store);
    TensorData::new(out_shape, out)
}

/// Batched matrix multiply: `A[..., m, k] x B[..., k, n] -> [..., m, n]`.
///
/// Operands may be 2-d or 3-d; 2-d operands act as batch size 1 and the
/// batch dimension broadcasts like an elementwise op. The output is 2-d only
/// when both operands are.
///
/// # Panics
/// Panics on non-2-d/3-d operands, mismatched inner dimensions, or
/// incompatible batch dimensions.
pub fn matmul(a: &TensorData, b: &TensorData) -> TensorData {
    let dims = MatmulDims::of(a, b);
    let (m, k, n, batch) = (dims.m, dims.k, dims.n, dims.batch);
    let a_store = a.read_storage();
    let b_store = b.read_storage();
    let mut out = vec![0.0f64; batch * m * n];
    for cell in 0..out.len() {
        let bi = cell / (m * n);
        let i = (cell / n) % m;
        let j = cell % n;
        let a_base = bi * dims.a_batch_stride + i * dims.a_row_stride;
        let b_base = bi * dims.b_batch_stride + j * dims.b_col_stride;
        let mut acc = 0.0;
        for l in 0..k {
            acc += a_store[a_base + l * dims.a_col_stride] * b_store[b_base + l * dims.b_row_stride];
        }
        out[cell] = acc;
    }
    drop(a_store);
    drop(b_store);
    TensorData::new(dims.out_shape, out)
}

/// Resolved dimensions and strides for one matmul call, shared by the naive
/// and worker-pool backends.
pub(crate) struct MatmulDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub batch: usize,
    pub a_batch_stride: usize,
    pub a_row_stride: usize,
    pub a_col_stride: usize,
    pub b_batch_stride: usize,
    pub b_row_stride: usize,
    pub b_col_stride: usize,
    pub out_shape: Vec<usize>,
}

impl MatmulDims {
    pub fn of(a: &TensorData, b: &TensorData) -> Self {
        assert!(
            (2..=3).contains(&a.dims()) && (2..=3).contains(&b.dims()),
            "matmul operands must be 2-d or 3-d, got shapes {:?} and {:?}",
            a.shape(),
            b.shape()
        );
        let (a_batch, a_rest) = split_batch(a);
        let (b_batch, b_rest) = split_batch(b);
        let (m, k) = (a_rest[0], a_rest[1]);
        let (k2, n) = (b_rest[0], b_rest[1]);
        assert_eq!(
            k, k2,
            "matmul inner dimensions do not match: {:?} x {:?}",
            a.shape(),
            b.shape()
        );
        let batch = storage::shape_broadcast(&[a_batch], &[b_batch])[0];
        let out_shape = if a.dims() == 2 && b.dims() == 2 {
            vec![m, n]
        } else {
            vec![batch, m, n]
        };
        MatmulDims {
            m,
            k,
            n,
            batch,
            a_batch_stride: batch_stride(a),
            a_row_stride: a.strides()[a.dims() - 2],
            a_col_stride: a.strides()[a.dims() - 1],
            b_batch_stride: batch_stride(b),
            b_row_stride: b.strides()[b.dims() - 2],
            b_col_stride: b.strides()[b.dims() - 1],
            out_shape,
        }
    }
}

fn split_batch(t: &TensorData) -> (usize, [usize; 2]) {
    let s = t.shape();
    if t.dims() == 3 {
        (s[0], [s[1], s[2]])
    } else {
        (1, [s[0], s[1]])
    }
}

fn batch_stride(t: &TensorData) -> usize {
    if t.dims() == 3 && t.shape()[0] > 1 {
        t.strides()[0]
    } else {
        0
    }
}

fn aligned(a: &TensorData, b: &TensorData) -> bool {
    a.shape() == b.shape() && a.is_contiguous() && b.is_contiguous()
}

fn position(t: &TensorData, index: &[usize]) -> usize {
    let mut pos = 0;
    for d in 0..index.len() {
        pos += index[d] * t.strides()[d];
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_data;

    #[test]
    fn map_applies_through_strides() {
        let t = tensor_data!([[1.0, 2.0], [3.0, 4.0]]).permute(&[1, 0]);
        let negated = map(MapOp::Neg, &t);
        assert_eq!(negated.to_vec(), vec![-1.0, -3.0, -2.0, -4.0]);
        assert!(negated.is_contiguous());
    }

    #[test]
    fn zip_broadcasts_row_against_matrix() {
        let a = tensor_data!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let b = tensor_data!([10.0, 20.0, 30.0]);
        let out = zip(ZipOp::Add, &a, &b);
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.to_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn zip_broadcasts_column_against_row() {
        let a = TensorData::new(vec![3, 1], vec![0.0, 10.0, 20.0]);
        let b = TensorData::new(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]);
        let out = zip(ZipOp::Add, &a, &b);
        assert_eq!(out.shape(), &[3, 4]);
        assert_eq!(
            out.to_vec(),
            vec![1.0, 2.0, 3.0, 4.0, 11.0, 12.0, 13.0, 14.0, 21.0, 22.0, 23.0, 24.0]
        );
    }

    #[test]
    fn reduce_keeps_axis_with_size_one() {
        let a = tensor_data!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let rows = reduce(ReduceOp::Sum, &a, 0);
        assert_eq!(rows.shape(), &[1, 3]);
        assert_eq!(rows.to_vec(), vec![5.0, 7.0, 9.0]);
        let cols = reduce(ReduceOp::Sum, &a, 1);
        assert_eq!(cols.shape(), &[2, 1]);
        assert_eq!(cols.to_vec(), vec![6.0, 15.0]);
    }

    #[test]
    fn matmul_2d() {
        let a = tensor_data!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let b = tensor_data!([[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]]);
        let c = matmul(&a, &b);
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.to_vec(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn matmul_broadcasts_batch() {
        let a = tensor_data!([[1.0, 0.0], [0.0, 1.0]]);
        let b = TensorData::new(vec![3, 2, 2], (0..12).map(f64::from).collect());
        let c = matmul(&a, &b);
        assert_eq!(c.shape(), &[3, 2, 2]);
        assert_eq!(c.to_vec(), b.to_vec());
    }

    #[test]
    fn matmul_rejects_inner_mismatch() {
        let a = TensorData::zeros(vec![2, 3]);
        let b = TensorData::zeros(vec![4, 2]);
        assert!(std::panic::catch_unwind(|| matmul(&a, &b)).is_err());
    }

    #[test]
    fn matmul_reads_permuted_views() {
        let a = tensor_data!([[1.0, 2.0], [3.0, 4.0]]);
        let at = a.permute(&[1, 0]);
        let b = tensor_data!([[1.0, 0.0], [0.0, 1.0]]);
        let c = matmul(&at, &b);
        assert_eq!(c.to_vec(), vec![1.0, 3.0, 2.0, 4.0]);
    }
}
