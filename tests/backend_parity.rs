//! Cross-backend agreement: for identical inputs, the naive, worker-pool,
//! and (under the `wgpu` feature) GPU backends must agree within the
//! precision implied by their numeric widths.

use gradstride::{BackendKind, Runtime, Tensor};

/// Inputs straddling the parallel-dispatch threshold of 4096 elements.
const SIZES: [usize; 2] = [4095, 4097];

fn ramp(n: usize) -> Vec<f64> {
    (0..n).map(|i| (i % 101) as f64 * 0.031 - 1.5).collect()
}

fn run_elementwise(backend: BackendKind, n: usize) -> (Vec<f64>, Vec<f64>) {
    let rt = Runtime::new(backend);
    let a = Tensor::new(&rt, vec![n], ramp(n));
    let b = Tensor::new(&rt, vec![n], ramp(n).into_iter().rev().collect());
    let out = a.mul(&b).sigmoid().add(&b);
    let loss = out.sum(None);
    loss.backward();
    let grads = a.grad().unwrap().to_vec();
    rt.shutdown();
    (out.to_vec(), grads)
}

#[test]
fn parallel_matches_naive_across_the_threshold() {
    for n in SIZES {
        let (naive_out, naive_grad) = run_elementwise(BackendKind::Naive, n);
        let (pool_out, pool_grad) = run_elementwise(BackendKind::Parallel, n);
        assert_eq!(naive_out, pool_out, "forward mismatch at size {n}");
        assert_eq!(naive_grad, pool_grad, "backward mismatch at size {n}");
    }
}

#[test]
fn parallel_matches_naive_on_reductions() {
    for n in SIZES {
        let naive = Runtime::naive();
        let pool = Runtime::parallel();
        for (rows, cols) in [(n, 3), (3, n)] {
            let data = ramp(rows * cols);
            let a = Tensor::new(&naive, vec![rows, cols], data.clone());
            let b = Tensor::new(&pool, vec![rows, cols], data);
            for dim in [Some(0), Some(1), None] {
                assert_eq!(a.sum(dim).to_vec(), b.sum(dim).to_vec());
            }
        }
        pool.shutdown();
    }
}

#[test]
fn parallel_matches_naive_on_matmul() {
    let naive = Runtime::naive();
    let pool = Runtime::parallel();
    // 72x72 output = 5184 cells, above the threshold; 63x63 = 3969, below.
    for size in [63, 72] {
        let data = ramp(size * size);
        let a1 = Tensor::new(&naive, vec![size, size], data.clone());
        let a2 = Tensor::new(&pool, vec![size, size], data.clone());
        let b1 = Tensor::new(&naive, vec![size, size], data.clone());
        let b2 = Tensor::new(&pool, vec![size, size], data);
        let c1 = a1.matmul(&b1);
        let c2 = a2.matmul(&b2);
        assert_eq!(c1.to_vec(), c2.to_vec(), "matmul mismatch at {size}x{size}");
    }
    pool.shutdown();
}

#[test]
fn parallel_matches_naive_through_permuted_views() {
    let naive = Runtime::naive();
    let pool = Runtime::parallel();
    let data = ramp(4098 * 2);
    let a = Tensor::new(&naive, vec![2, 4098], data.clone());
    let b = Tensor::new(&pool, vec![2, 4098], data);
    let x = a.permute(&[1, 0]).contiguous();
    let y = b.permute(&[1, 0]).contiguous();
    assert_eq!(x.to_vec(), y.to_vec());
    pool.shutdown();
}

// The GPU computes in f32 against f64 host storage, so agreement is checked
// within a relative tolerance instead of exactly. Without an adapter the Gpu
// runtime degrades to the naive backend, and these tests still pass (they
// then compare naive with naive).
#[cfg(feature = "wgpu")]
mod gpu {
    use super::*;

    fn assert_close(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            let scale = x.abs().max(y.abs()).max(1.0);
            assert!(
                (x - y).abs() / scale < tol,
                "values {x} and {y} differ beyond {tol}"
            );
        }
    }

    #[test]
    fn gpu_matches_naive_on_elementwise_ops() {
        for n in SIZES {
            let (naive_out, naive_grad) = run_elementwise(BackendKind::Naive, n);
            let (gpu_out, gpu_grad) = run_elementwise(BackendKind::Gpu, n);
            assert_close(&naive_out, &gpu_out, 1e-3);
            assert_close(&naive_grad, &gpu_grad, 1e-3);
        }
    }

    #[test]
    fn gpu_matches_naive_on_broadcast_zip() {
        let naive = Runtime::naive();
        let gpu = Runtime::gpu();
        let a_data = ramp(6);
        let b_data = ramp(8);
        let a1 = Tensor::new(&naive, vec![3, 1, 2], a_data.clone());
        let a2 = Tensor::new(&gpu, vec![3, 1, 2], a_data);
        let b1 = Tensor::new(&naive, vec![4, 2], b_data.clone());
        let b2 = Tensor::new(&gpu, vec![4, 2], b_data);
        let c1 = a1.add(&b1);
        let c2 = a2.add(&b2);
        assert_eq!(c1.shape(), &[3, 4, 2]);
        assert_eq!(c2.shape(), &[3, 4, 2]);
        assert_close(&c1.to_vec(), &c2.to_vec(), 1e-4);
        gpu.shutdown();
    }

    #[test]
    fn gpu_matches_naive_on_reductions() {
        let naive = Runtime::naive();
        let gpu = Runtime::gpu();
        // 1000-long reduce axis exercises multiple tree-fold rounds per
        // workgroup.
        let data = ramp(1000 * 6);
        let a1 = Tensor::new(&naive, vec![6, 1000], data.clone());
        let a2 = Tensor::new(&gpu, vec![6, 1000], data);
        for dim in [Some(0), Some(1), None] {
            assert_close(&a1.sum(dim).to_vec(), &a2.sum(dim).to_vec(), 1e-3);
        }
        gpu.shutdown();
    }

    #[test]
    fn gpu_matches_naive_on_matmul() {
        let naive = Runtime::naive();
        let gpu = Runtime::gpu();
        // 33x45x29: deliberately off the 16-lane tile boundary.
        let a_data = ramp(33 * 45);
        let b_data = ramp(45 * 29);
        let a1 = Tensor::new(&naive, vec![33, 45], a_data.clone());
        let a2 = Tensor::new(&gpu, vec![33, 45], a_data);
        let b1 = Tensor::new(&naive, vec![45, 29], b_data.clone());
        let b2 = Tensor::new(&gpu, vec![45, 29], b_data);
        assert_close(&a1.matmul(&b1).to_vec(), &a2.matmul(&b2).to_vec(), 1e-3);
        gpu.shutdown();
    }

    #[test]
    fn gpu_matches_naive_on_batched_matmul() {
        let naive = Runtime::naive();
        let gpu = Runtime::gpu();
        let a_data = ramp(4 * 20 * 18);
        let b_data = ramp(18 * 20);
        let a1 = Tensor::new(&naive, vec![4, 20, 18], a_data.clone());
        let a2 = Tensor::new(&gpu, vec![4, 20, 18], a_data);
        let b1 = Tensor::new(&naive, vec![18, 20], b_data.clone());
        let b2 = Tensor::new(&gpu, vec![18, 20], b_data);
        assert_close(&a1.matmul(&b1).to_vec(), &a2.matmul(&b2).to_vec(), 1e-3);
        gpu.shutdown();
    }
}
