//! Strided tensor storage.
//!
//! # Storage Layout
//!
//! A [`TensorData`] is a flat `f64` buffer paired with a shape and a stride
//! vector. The element at multi-index `i` lives at storage position
//! `sum(i[d] * strides[d])`. Freshly constructed tensors are row-major
//! (C-contiguous); [`TensorData::permute`] produces views with arbitrary
//! stride order without touching the buffer.
//!
//! The buffer itself sits behind an `Arc<RwLock<..>>` so that views created
//! by `permute` and `view` alias the same storage: a write through one alias
//! is visible through all of them. Storage is freed when the last alias is
//! dropped; there is no explicit free.
//!
//! # Broadcasting
//!
//! Two shapes are broadcast-compatible when, right-aligned, every dimension
//! pair is equal or one of the pair is 1. The broadcast shape takes the
//! larger dimension at each position. [`broadcast_index_into`] maps an index
//! in the broadcast shape back into a smaller operand by dropping the extra
//! leading axes and zeroing every coordinate where the operand's dimension
//! is 1. All three compute backends share these rules.

use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Row-major strides for a shape: the last dimension is contiguous.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Broadcast two shapes together, right-aligned.
///
/// # Panics
/// Panics if the shapes are not broadcast-compatible.
pub fn shape_broadcast(a: &[usize], b: &[usize]) -> Vec<usize> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0usize; ndim];
    for d in 0..ndim {
        let da = if d < ndim - a.len() { 1 } else { a[d - (ndim - a.len())] };
        let db = if d < ndim - b.len() { 1 } else { b[d - (ndim - b.len())] };
        assert!(
            da == db || da == 1 || db == 1,
            "shapes {a:?} and {b:?} are not broadcastable"
        );
        out[d] = da.max(db);
    }
    out
}

/// Decode a flat ordinal into a multi-index of `shape`, row-major.
pub fn unravel_into(ordinal: usize, shape: &[usize], index: &mut [usize]) {
    debug_assert_eq!(shape.len(), index.len());
    let mut rem = ordinal;
    for d in (0..shape.len()).rev() {
        index[d] = rem % shape[d];
        rem /= shape[d];
    }
}

/// Map an index in a (possibly larger) broadcast shape into `shape`.
///
/// Extra leading axes of `big_index` are dropped; coordinates are zeroed
/// wherever `shape` has dimension 1.
pub fn broadcast_index_into(big_index: &[usize], shape: &[usize], index: &mut [usize]) {
    debug_assert_eq!(shape.len(), index.len());
    let offset = big_index.len() - shape.len();
    for d in 0..shape.len() {
        index[d] = if shape[d] == 1 { 0 } else { big_index[offset + d] };
    }
}

/// An N-dimensional strided view over shared flat storage.
///
/// Cloning a `TensorData` clones the view (shape and strides) but aliases
/// the underlying buffer.
#[derive(Debug, Clone)]
pub struct TensorData {
    storage: Arc<RwLock<Vec<f64>>>,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl TensorData {
    /// Creates a contiguous tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape
    /// product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f64>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        let strides = contiguous_strides(&shape);
        Self {
            storage: Arc::new(RwLock::new(data)),
            shape,
            strides,
        }
    }

    /// A tensor of the given shape filled with `value`.
    pub fn full(shape: impl Into<Vec<usize>>, value: f64) -> Self {
        let shape = shape.into();
        let size = shape.iter().product();
        Self::new(shape, vec![value; size])
    }

    /// A tensor of the given shape filled with zeros.
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        Self::full(shape, 0.0)
    }

    fn view_of(&self, shape: Vec<usize>, strides: Vec<usize>) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            shape,
            strides,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of dimensions.
    pub fn dims(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the strides are the canonical row-major strides for the shape.
    pub fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.shape)
    }

    /// Whether two views alias the same storage buffer.
    pub fn aliases(&self, other: &TensorData) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub(crate) fn read_storage(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.storage.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Storage position of a multi-index.
    ///
    /// # Panics
    /// Panics if the index has the wrong rank or a coordinate is out of
    /// range.
    pub fn position(&self, index: &[usize]) -> usize {
        assert_eq!(
            index.len(),
            self.shape.len(),
            "index {:?} has wrong rank for shape {:?}",
            index,
            self.shape
        );
        let mut pos = 0;
        for d in 0..index.len() {
            assert!(
                index[d] < self.shape[d],
                "index {:?} out of range for shape {:?}",
                index,
                self.shape
            );
            pos += index[d] * self.strides[d];
        }
        pos
    }

    /// Reads one element.
    pub fn get(&self, index: &[usize]) -> f64 {
        let pos = self.position(index);
        self.read_storage()[pos]
    }

    /// Writes one element. The write is visible through every alias of this
    /// storage.
    pub fn set(&self, index: &[usize], value: f64) {
        let pos = self.position(index);
        self.storage.write().unwrap_or_else(|e| e.into_inner())[pos] = value;
    }

    /// Replaces the whole tensor contents, in logical (row-major) order.
    ///
    /// # Panics
    /// Panics if `values` does not have exactly `size` elements.
    pub fn update(&self, values: &[f64]) {
        assert_eq!(
            values.len(),
            self.size(),
            "update with {} values on a tensor of {} elements",
            values.len(),
            self.size()
        );
        let mut store = self.storage.write().unwrap_or_else(|e| e.into_inner());
        if self.is_contiguous() {
            store.copy_from_slice(values);
            return;
        }
        let mut index = vec![0usize; self.dims()];
        for (ordinal, &v) in values.iter().enumerate() {
            unravel_into(ordinal, &self.shape, &mut index);
            let mut pos = 0;
            for d in 0..index.len() {
                pos += index[d] * self.strides[d];
            }
            store[pos] = v;
        }
    }

    /// The elements in logical (row-major) order.
    pub fn to_vec(&self) -> Vec<f64> {
        let store = self.read_storage();
        if self.is_contiguous() {
            return store.clone();
        }
        let n = self.size();
        let mut out = Vec::with_capacity(n);
        let mut index = vec![0usize; self.dims()];
        for ordinal in 0..n {
            unravel_into(ordinal, &self.shape, &mut index);
            let mut pos = 0;
            for d in 0..index.len() {
                pos += index[d] * self.strides[d];
            }
            out.push(store[pos]);
        }
        out
    }

    /// Reorders the dimensions, returning a view that aliases this storage.
    ///
    /// `order` must be a permutation of `0..dims`; the new view has
    /// `shape[i] = old_shape[order[i]]` and likewise for strides.
    ///
    /// # Panics
    /// Panics on a wrong-length order, an out-of-range axis ("invalid
    /// dimension"), or a repeated axis ("duplicate dimension").
    pub fn permute(&self, order: &[usize]) -> TensorData {
        assert_eq!(
            order.len(),
            self.dims(),
            "permutation {:?} has wrong length for shape {:?}",
            order,
            self.shape
        );
        let mut seen = vec![false; self.dims()];
        for &axis in order {
            assert!(
                axis < self.dims(),
                "invalid dimension {axis} in permutation {order:?}"
            );
            assert!(
                !seen[axis],
                "duplicate dimension {axis} in permutation {order:?}"
            );
            seen[axis] = true;
        }
        let shape = order.iter().map(|&a| self.shape[a]).collect();
        let strides = order.iter().map(|&a| self.strides[a]).collect();
        self.view_of(shape, strides)
    }

    /// Reinterprets a contiguous tensor under a new shape, aliasing this
    /// storage.
    ///
    /// # Panics
    /// Panics if the tensor is not contiguous or the new shape has a
    /// different element count.
    pub fn view(&self, shape: &[usize]) -> TensorData {
        assert!(
            self.is_contiguous(),
            "cannot view a non-contiguous tensor (shape {:?}, strides {:?})",
            self.shape,
            self.strides
        );
        assert_eq!(
            shape.iter().product::<usize>(),
            self.size(),
            "view shape {:?} is incompatible with {} elements",
            shape,
            self.size()
        );
        let strides = contiguous_strides(shape);
        self.view_of(shape.to_vec(), strides)
    }

    /// Returns an aliasing clone when already contiguous, otherwise copies
    /// the elements into a fresh canonical-layout tensor.
    pub fn contiguous(&self) -> TensorData {
        if self.is_contiguous() {
            self.clone()
        } else {
            TensorData::new(self.shape.clone(), self.to_vec())
        }
    }
}

/// Builds a [`TensorData`] from nested literal arrays.
///
/// Supports arbitrary nesting depth as long as sublists are uniform in
/// shape.
///
/// # Example
/// ```
/// use gradstride::tensor_data;
/// let t = tensor_data!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape(), &[2, 2]);
/// ```
#[macro_export]
macro_rules! tensor_data {
    ($lit:literal) => {
        $crate::storage::TensorData::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor_data!($inner) ),+ ];
        let first_shape = children[0].shape().to_vec();
        assert!(children.iter().all(|c| c.shape() == first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].size());
        for c in &children { data.extend(c.to_vec()); }
        $crate::storage::TensorData::new(shape, data)
    }};
}
