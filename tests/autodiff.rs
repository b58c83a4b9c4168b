use gradstride::check::{central_difference, max_abs_error};
use gradstride::{Runtime, Tensor, tensor};

const EPS: f64 = 1e-5;
const TOL: f64 = 1e-4;

/// Checks `sum(apply(x))` gradients against central differences.
fn check_unary(name: &str, shape: &[usize], point: &[f64], apply: impl Fn(&Tensor) -> Tensor) {
    let f = |v: &[f64]| {
        let rt = Runtime::naive();
        let x = Tensor::new(&rt, shape.to_vec(), v.to_vec());
        apply(&x).sum(None).item()
    };
    let numeric = central_difference(f, point, EPS);

    let rt = Runtime::naive();
    let x = Tensor::new(&rt, shape.to_vec(), point.to_vec());
    apply(&x).sum(None).backward();
    let grad = x.grad().unwrap_or_else(|| panic!("{name}: missing gradient"));
    let err = max_abs_error(&grad.to_vec(), &numeric);
    assert!(err < TOL, "{name}: gradient error {err} exceeds {TOL}");
}

/// Checks `sum(apply(a, b))` gradients for both operands against central
/// differences, covering broadcast shape pairs.
fn check_binary(
    name: &str,
    a_shape: &[usize],
    a_point: &[f64],
    b_shape: &[usize],
    b_point: &[f64],
    apply: impl Fn(&Tensor, &Tensor) -> Tensor,
) {
    let split = a_point.len();
    let joined: Vec<f64> = a_point.iter().chain(b_point.iter()).copied().collect();
    let f = |v: &[f64]| {
        let rt = Runtime::naive();
        let a = Tensor::new(&rt, a_shape.to_vec(), v[..split].to_vec());
        let b = Tensor::new(&rt, b_shape.to_vec(), v[split..].to_vec());
        apply(&a, &b).sum(None).item()
    };
    let numeric = central_difference(f, &joined, EPS);

    let rt = Runtime::naive();
    let a = Tensor::new(&rt, a_shape.to_vec(), a_point.to_vec());
    let b = Tensor::new(&rt, b_shape.to_vec(), b_point.to_vec());
    apply(&a, &b).sum(None).backward();
    let a_grad = a.grad().unwrap_or_else(|| panic!("{name}: missing a grad"));
    let b_grad = b.grad().unwrap_or_else(|| panic!("{name}: missing b grad"));
    let analytic: Vec<f64> = a_grad
        .to_vec()
        .into_iter()
        .chain(b_grad.to_vec())
        .collect();
    let err = max_abs_error(&analytic, &numeric);
    assert!(err < TOL, "{name}: gradient error {err} exceeds {TOL}");
}

#[test]
fn unary_gradients_match_central_differences() {
    let shape = [2, 3];
    let point = [0.5, -1.2, 2.0, 0.3, -0.7, 1.4];
    check_unary("neg", &shape, &point, |x| x.neg());
    check_unary("sigmoid", &shape, &point, |x| x.sigmoid());
    check_unary("exp", &shape, &point, |x| x.exp());
    check_unary("relu", &shape, &point, |x| x.relu());
    check_unary("contiguous", &shape, &point, |x| x.contiguous());

    let positive = [0.5, 1.2, 2.0, 0.3, 0.7, 1.4];
    check_unary("log", &shape, &positive, |x| x.log());
    check_unary("inv", &shape, &positive, |x| x.inv());
}

#[test]
fn binary_gradients_match_central_differences() {
    let a = [1.0, -2.0, 3.0, 0.5, 1.5, -0.5];
    let b = [0.7, 0.3, -1.1, 2.0, -0.2, 0.9];
    check_binary("add", &[2, 3], &a, &[2, 3], &b, |x, y| x.add(y));
    check_binary("mul", &[2, 3], &a, &[2, 3], &b, |x, y| x.mul(y));
    check_binary("sub", &[2, 3], &a, &[2, 3], &b, |x, y| x.sub(y));
}

#[test]
fn broadcast_gradients_match_central_differences() {
    // [2,3] against a row [3].
    let a = [1.0, -2.0, 3.0, 0.5, 1.5, -0.5];
    let row = [0.7, 0.3, -1.1];
    check_binary("add row", &[2, 3], &a, &[3], &row, |x, y| x.add(y));
    check_binary("mul row", &[2, 3], &a, &[3], &row, |x, y| x.mul(y));

    // Column [3,1] against row [1,4] -> [3,4].
    let col = [1.0, -0.5, 2.0];
    let row4 = [0.25, -1.0, 0.5, 2.0];
    check_binary("add col x row", &[3, 1], &col, &[1, 4], &row4, |x, y| x.add(y));
    check_binary("mul col x row", &[3, 1], &col, &[1, 4], &row4, |x, y| x.mul(y));
}

#[test]
fn reduce_gradients_match_central_differences() {
    let point = [1.0, -2.0, 3.0, 0.5, 1.5, -0.5];
    check_unary("sum dim 0", &[2, 3], &point, |x| x.sum(Some(0)));
    check_unary("sum dim 1", &[2, 3], &point, |x| x.sum(Some(1)));
    check_unary("sum all", &[2, 3], &point, |x| x.sum(None));
    check_unary("mean dim 1", &[2, 3], &point, |x| x.mean(Some(1)));
    check_unary("mean all", &[2, 3], &point, |x| x.mean(None));
}

#[test]
fn shape_op_gradients_match_central_differences() {
    let point = [1.0, -2.0, 3.0, 0.5, 1.5, -0.5];
    check_unary("permute", &[2, 3], &point, |x| x.permute(&[1, 0]).sigmoid());
    check_unary("view", &[2, 3], &point, |x| x.view(&[3, 2]).sigmoid());
    check_unary("permute then contiguous", &[2, 3], &point, |x| {
        x.permute(&[1, 0]).contiguous().view(&[6]).exp()
    });
}

#[test]
fn matmul_gradients_match_central_differences() {
    let a = [1.0, -2.0, 3.0, 0.5, 1.5, -0.5];
    let b = [0.7, 0.3, -1.1, 2.0, -0.2, 0.9];
    check_binary("matmul", &[2, 3], &a, &[3, 2], &b, |x, y| x.matmul(y));

    // Batched against a shared 2-d operand: the 2-d gradient sums over the
    // batch.
    let batched: Vec<f64> = (0..12).map(|i| 0.25 * f64::from(i) - 1.0).collect();
    let shared = [0.5, -0.4, 1.2, 0.8];
    check_binary("batched matmul", &[3, 2, 2], &batched, &[2, 2], &shared, |x, y| {
        x.matmul(y)
    });
}

#[test]
fn comparison_gradients_are_zero() {
    let rt = Runtime::naive();
    let a = tensor!(rt, [1.0, 5.0, 3.0]);
    let b = tensor!(rt, [2.0, 4.0, 3.0]);
    a.lt(&b).sum(None).backward();
    assert_eq!(a.grad().unwrap().to_vec(), vec![0.0; 3]);
    assert_eq!(b.grad().unwrap().to_vec(), vec![0.0; 3]);
}

#[test]
fn diamond_graph_sums_both_paths() {
    let rt = Runtime::naive();
    let x = tensor!(rt, [1.5, -2.0, 4.0]);
    x.mul(&x).sum(None).backward();
    assert_eq!(x.grad().unwrap().to_vec(), vec![3.0, -4.0, 8.0]);
}

#[test]
fn backward_accumulates_until_zeroed() {
    let rt = Runtime::naive();
    let x = tensor!(rt, [2.0, 3.0]);
    let loss = x.mul(&x).sum(None);
    loss.backward();
    assert_eq!(x.grad().unwrap().to_vec(), vec![4.0, 6.0]);
    loss.backward();
    assert_eq!(x.grad().unwrap().to_vec(), vec![8.0, 12.0]);
    x.zero_grad_();
    assert!(x.grad().is_none());
    loss.backward();
    assert_eq!(x.grad().unwrap().to_vec(), vec![4.0, 6.0]);
}

#[test]
fn backward_without_seed_requires_single_element() {
    let rt = Runtime::naive();
    let x = tensor!(rt, [1.0, 2.0]);
    let y = x.sigmoid();
    assert!(std::panic::catch_unwind(|| y.backward()).is_err());
}

#[test]
fn explicit_seed_scales_gradients() {
    let rt = Runtime::naive();
    let x = tensor!(rt, [1.0, 2.0, 3.0]);
    let y = x.mul(&x);
    let seed = tensor!(rt, [1.0, 10.0, 100.0]);
    y.backward_with(&seed);
    assert_eq!(x.grad().unwrap().to_vec(), vec![2.0, 40.0, 600.0]);
}

#[test]
fn seed_shape_mismatch_panics() {
    let rt = Runtime::naive();
    let x = tensor!(rt, [1.0, 2.0]);
    let y = x.sigmoid();
    let seed = tensor!(rt, [1.0, 2.0, 3.0]);
    assert!(std::panic::catch_unwind(|| y.backward_with(&seed)).is_err());
}

#[test]
fn only_leaves_hold_gradient() {
    let rt = Runtime::naive();
    let x = tensor!(rt, [1.0, 2.0]);
    let mid = x.sigmoid();
    mid.sum(None).backward();
    assert!(x.grad().is_some());
    assert!(mid.grad().is_none());
}

#[test]
fn unbroadcast_collapses_leading_batch_dimensions() {
    let rt = Runtime::naive();
    let a = tensor!(rt, [1.0, 2.0]);
    let b = Tensor::new(&rt, vec![3, 2], vec![1.0; 6]);
    a.add(&b).sum(None).backward();
    // a was broadcast over 3 rows, so each of its elements saw 3 paths.
    assert_eq!(a.grad().unwrap().to_vec(), vec![3.0, 3.0]);
    assert_eq!(b.grad().unwrap().to_vec(), vec![1.0; 6]);
}
