//! Worker-pool kernels.
//!
//! The same four verbs as [`super::cpu`], fanned out over a persistent
//! `rayon` pool owned by the runtime. The output ordinal range
//! `[0, out_size)` is split into one contiguous chunk per worker and every
//! chunk runs the identical sequential algorithm from the naive backend;
//! the pool's fork-join join is the barrier, so the caller never observes
//! partial results. Only op kinds from the closed registry cross into the
//! workers — each worker re-selects the arithmetic from the enum, no
//! closures travel between threads.
//!
//! Dispatch is parallel only when the output has at least
//! [`PARALLEL_THRESHOLD`] elements; below that the naive kernel runs
//! directly, and callers cannot observe which path ran except by timing.
//! When the operands are contiguous and no broadcasting is involved, the
//! chunks walk the flat buffers without decoding ordinals.

use rayon::prelude::*;

use super::{MapOp, ReduceOp, ZipOp, cpu};
use crate::storage::{self, TensorData};

/// Minimum output size for parallel dispatch.
pub const PARALLEL_THRESHOLD: usize = 4096;

fn chunk_size(n: usize, pool: &rayon::ThreadPool) -> usize {
    n.div_ceil(pool.current_num_threads().max(1)).max(1)
}

fn strided_position(t: &TensorData, index: &[usize]) -> usize {
    let mut pos = 0;
    for d in 0..index.len() {
        pos += index[d] * t.strides()[d];
    }
    pos
}

/// Parallel unary map. See [`cpu::map`] for semantics.
pub fn map(pool: &rayon::ThreadPool, op: MapOp, a: &TensorData) -> TensorData {
    let n = a.size();
    if n < PARALLEL_THRESHOLD {
        return cpu::map(op, a);
    }
    let out_shape = a.shape().to_vec();
    let mut out = vec![0.0f64; n];
    let store = a.read_storage();
    let data: &[f64] = &store;
    let chunk = chunk_size(n, pool);
    pool.install(|| {
        if a.is_contiguous() {
            out.par_chunks_mut(chunk)
                .zip(data.par_chunks(chunk))
                .for_each(|(out_chunk, in_chunk)| {
                    for (o, &x) in out_chunk.iter_mut().zip(in_chunk) {
                        *o = op.eval(x);
                    }
                });
        } else {
            let shape = &out_shape;
            out.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(chunk_index, out_chunk)| {
                    let base = chunk_index * chunk;
                    let mut out_index = vec![0usize; shape.len()];
                    let mut in_index = vec![0usize; a.dims()];
                    for (offset, o) in out_chunk.iter_mut().enumerate() {
                        storage::unravel_into(base + offset, shape, &mut out_index);
                        storage::broadcast_index_into(&out_index, a.shape(), &mut in_index);
                        *o = op.eval(data[strided_position(a, &in_index)]);
                    }
                });
        }
    });
    drop(store);
    TensorData::new(out_shape, out)
}

/// Parallel binary zip. See [`cpu::zip`] for semantics.
pub fn zip(pool: &rayon::ThreadPool, op: ZipOp, a: &TensorData, b: &TensorData) -> TensorData {
    let out_shape = storage::shape_broadcast(a.shape(), b.shape());
    let n: usize = out_shape.iter().product();
    if n < PARALLEL_THRESHOLD {
        return cpu::zip(op, a, b);
    }
    let mut out = vec![0.0f64; n];
    let a_store = a.read_storage();
    let b_store = b.read_storage();
    let a_data: &[f64] = &a_store;
    let b_data: &[f64] = &b_store;
    let chunk = chunk_size(n, pool);
    pool.install(|| {
        if a.shape() == b.shape() && a.is_contiguous() && b.is_contiguous() {
            out.par_chunks_mut(chunk)
                .zip(a_data.par_chunks(chunk).zip(b_data.par_chunks(chunk)))
                .for_each(|(out_chunk, (a_chunk, b_chunk))| {
                    for ((o, &x), &y) in out_chunk.iter_mut().zip(a_chunk).zip(b_chunk) {
                        *o = op.eval(x, y);
                    }
                });
        } else {
            let shape = &out_shape;
            out.par_chunks_mut(chunk)
                .enumerate()
                .for_each(|(chunk_index, out_chunk)| {
                    let base = chunk_index * chunk;
                    let mut out_index = vec![0usize; shape.len()];
                    let mut a_index = vec![0usize; a.dims()];
                    let mut b_index = vec![0usize; b.dims()];
                    for (offset, o) in out_chunk.iter_mut().enumerate() {
                        storage::unravel_into(base + offset, shape, &mut out_index);
                        storage::broadcast_index_into(&out_index, a.shape(), &mut a_index);
                        storage::broadcast_index_into(&out_index, b.shape(), &mut b_index);
                        *o = op.eval(
                            a_data[strided_position(a, &a_index)],
                            b_data[strided_position(b, &b_index)],
                        );
                    }
                });
        }
    });
    drop(a_store);
    drop(b_store);
    TensorData::new(out_shape, out)
}

/// Parallel reduce along one axis. See [`cpu::reduce`] for semantics; each
/// output cell still folds its axis sequentially in increasing index order,
/// only the cells are distributed over the pool.
pub fn reduce(pool: &rayon::ThreadPool, op: ReduceOp, a: &TensorData, dim: usize) -> TensorData {
    assert!(
        dim < a.dims(),
        "reduce dimension {dim} out of range for shape {:?}",
        a.shape()
    );
    let mut out_shape = a.shape().to_vec();
    out_shape[dim] = 1;
    let n: usize = out_shape.iter().product();
    if n < PARALLEL_THRESHOLD {
        return cpu::reduce(op, a, dim);
    }
    let reduce_size = a.shape()[dim];
    let step = a.strides()[dim];
    let mut out = vec![0.0f64; n];
    let store = a.read_storage();
    let data: &[f64] = &store;
    let chunk = chunk_size(n, pool);
    pool.install(|| {
        let shape = &out_shape;
        out.par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(chunk_index, out_chunk)| {
                let base = chunk_index * chunk;
                let mut index = vec![0usize; a.dims()];
                for (offset, o) in out_chunk.iter_mut().enumerate() {
                    storage::unravel_into(base + offset, shape, &mut index);
                    let cell = strided_position(a, &index);
                    let mut acc = op.identity();
                    for j in 0..reduce_size {
                        acc = op.combine(acc, data[cell + j * step]);
                    }
                    *o = acc;
                }
            });
    });
    drop(store);
    TensorData::new(out_shape, out)
}

/// Parallel batched matmul. See [`cpu::matmul`] for semantics.
pub fn matmul(pool: &rayon::ThreadPool, a: &TensorData, b: &TensorData) -> TensorData {
    let dims = cpu::MatmulDims::of(a, b);
    let (m, k, n) = (dims.m, dims.k, dims.n);
    let out_size = dims.batch * m * n;
    if out_size < PARALLEL_THRESHOLD {
        return cpu::matmul(a, b);
    }
    let a_store = a.read_storage();
    let b_store = b.read_storage();
    let a_data: &[f64] = &a_store;
    let b_data: &[f64] = &b_store;
    let mut out = vec![0.0f64; out_size];
    let chunk = chunk_size(out_size, pool);
    pool.install(|| {
        out.par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(chunk_index, out_chunk)| {
                let base = chunk_index * chunk;
                for (offset, o) in out_chunk.iter_mut().enumerate() {
                    let cell = base + offset;
                    let bi = cell / (m * n);
                    let i = (cell / n) % m;
                    let j = cell % n;
                    let a_base = bi * dims.a_batch_stride + i * dims.a_row_stride;
                    let b_base = bi * dims.b_batch_stride + j * dims.b_col_stride;
                    let mut acc = 0.0;
                    for l in 0..k {
                        acc += a_data[a_base + l * dims.a_col_stride]
                            * b_data[b_base + l * dims.b_row_stride];
                    }
                    *o = acc;
                }
            });
    });
    drop(a_store);
    drop(b_store);
    TensorData::new(dims.out_shape, out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap()
    }

    #[test]
    fn matches_naive_across_the_threshold() {
        let pool = pool();
        for n in [PARALLEL_THRESHOLD - 1, PARALLEL_THRESHOLD + 1] {
            let data: Vec<f64> = (0..n).map(|i| i as f64 * 0.25 - 7.0).collect();
            let t = TensorData::new(vec![n], data);
            let serial = cpu::map(MapOp::Sigmoid, &t);
            let threaded = map(&pool, MapOp::Sigmoid, &t);
            assert_eq!(serial.to_vec(), threaded.to_vec());
        }
    }

    #[test]
    fn broadcast_zip_matches_naive() {
        let pool = pool();
        let rows = 64;
        let cols = 80;
        let a = TensorData::new(
            vec![rows, cols],
            (0..rows * cols).map(|i| i as f64 * 0.5).collect(),
        );
        let b = TensorData::new(vec![cols], (0..cols).map(|i| i as f64).collect());
        let serial = cpu::zip(ZipOp::Add, &a, &b);
        let threaded = zip(&pool, ZipOp::Add, &a, &b);
        assert_eq!(serial.to_vec(), threaded.to_vec());
    }

    #[test]
    fn reduce_matches_naive_on_large_inputs() {
        let pool = pool();
        let a = TensorData::new(
            vec![5000, 3],
            (0..15000).map(|i| (i % 17) as f64).collect(),
        );
        let serial = cpu::reduce(ReduceOp::Sum, &a, 1);
        let threaded = reduce(&pool, ReduceOp::Sum, &a, 1);
        assert_eq!(serial.to_vec(), threaded.to_vec());
    }

    #[test]
    fn matmul_matches_naive_on_large_inputs() {
        let pool = pool();
        let a = TensorData::new(vec![80, 60], (0..4800).map(|i| (i % 13) as f64).collect());
        let b = TensorData::new(vec![60, 70], (0..4200).map(|i| (i % 11) as f64).collect());
        let serial = cpu::matmul(&a, &b);
        let threaded = matmul(&pool, &a, &b);
        assert_eq!(serial.to_vec(), threaded.to_vec());
    }
}
