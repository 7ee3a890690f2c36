//! Tensor handles exchanged with the host engine
//!
//! A [`Tensor`] is a cloneable handle: clones share one identity and one
//! value. The host re-evaluates a tensor each training step by assigning a
//! new value of the same shape; factors read the current value whenever they
//! update their statistics. Identity (not value) is what factor
//! deduplication keys on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::{Array, Array2, ArrayD, Dimension, IxDyn};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::error::{KfacError, Result};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a tensor handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        Self(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id
    pub fn get(self) -> u64 {
        self.0
    }
}

struct TensorInner {
    id: TensorId,
    value: RwLock<ArrayD<f64>>,
}

/// Shared handle to a host tensor value
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl Tensor {
    /// Wrap a value in a new handle with a fresh identity
    pub fn new(value: ArrayD<f64>) -> Self {
        Self {
            inner: Arc::new(TensorInner {
                id: TensorId::next(),
                value: RwLock::new(value),
            }),
        }
    }

    /// Build from a shape and row-major data
    pub fn from_shape_vec(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        let got = data.len();
        let value = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            KfacError::shape_mismatch("tensor data", shape.to_vec(), vec![got])
        })?;
        Ok(Self::new(value))
    }

    /// Zero-filled tensor
    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(ArrayD::zeros(IxDyn(shape)))
    }

    /// Identity of this handle
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// Current shape
    pub fn shape(&self) -> Vec<usize> {
        self.inner.value.read().shape().to_vec()
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.inner.value.read().ndim()
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.inner.value.read().len()
    }

    /// True if the tensor holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current value
    pub fn value(&self) -> ArrayD<f64> {
        self.inner.value.read().clone()
    }

    /// Borrow the current value
    pub fn read(&self) -> RwLockReadGuard<'_, ArrayD<f64>> {
        self.inner.value.read()
    }

    /// Replace the value; the shape must not change.
    pub fn assign(&self, value: ArrayD<f64>) -> Result<()> {
        let mut guard = self.inner.value.write();
        if guard.shape() != value.shape() {
            return Err(KfacError::shape_mismatch(
                "tensor assign",
                guard.shape().to_vec(),
                value.shape().to_vec(),
            ));
        }
        *guard = value;
        Ok(())
    }

    /// True if both handles refer to the same tensor
    pub fn same_as(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<D: Dimension> From<Array<f64, D>> for Tensor {
    fn from(value: Array<f64, D>) -> Self {
        Self::new(value.into_dyn())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id().get())
            .field("shape", &self.shape())
            .finish()
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

/// A layer input: dense activations or one-hot indices into a vocabulary
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Dense activations, `[batch, features]` (or `[features]` for a single
    /// example, or `[batch, steps.., features]`)
    Dense(Tensor),
    /// Integer indices, `[batch]` or `[batch, k]`; each example is the
    /// multi-hot vector `Σ_j onehot(indices[n, j], depth)`
    OneHot {
        /// Index tensor, entries are non-negative integers stored as f64
        indices: Tensor,
        /// Vocabulary size
        depth: usize,
    },
}

impl Input {
    /// One-hot input; fails on a zero vocabulary.
    pub fn one_hot(indices: Tensor, depth: usize) -> Result<Self> {
        if depth == 0 {
            return Err(KfacError::invalid_argument("depth", "vocabulary size must be > 0"));
        }
        Ok(Self::OneHot { indices, depth })
    }

    /// Underlying tensor handle
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Dense(t) => t,
            Self::OneHot { indices, .. } => indices,
        }
    }

    /// True for one-hot inputs
    pub fn is_one_hot(&self) -> bool {
        matches!(self, Self::OneHot { .. })
    }

    /// Number of examples
    pub fn batch_size(&self) -> usize {
        let shape = self.tensor().shape();
        match (self, shape.len()) {
            (Self::Dense(_), 0 | 1) => 1,
            (_, 0) => 1,
            _ => shape[0],
        }
    }

    /// Width of one example's feature vector
    pub fn feature_dim(&self) -> usize {
        match self {
            Self::Dense(t) => t.shape().last().copied().unwrap_or(1),
            Self::OneHot { depth, .. } => *depth,
        }
    }

    /// Shape beyond the batch dimension that must agree across towers
    pub(crate) fn signature(&self) -> Vec<usize> {
        match self {
            Self::Dense(t) => {
                let shape = t.shape();
                if shape.len() <= 1 {
                    shape
                } else {
                    shape[1..].to_vec()
                }
            }
            Self::OneHot { depth, .. } => vec![*depth],
        }
    }
}

impl From<Tensor> for Input {
    fn from(tensor: Tensor) -> Self {
        Self::Dense(tensor)
    }
}

/// Rows of a `[rows, cols]` matrix given by index, the rest implicitly zero
#[derive(Debug, Clone, PartialEq)]
pub struct SparseRows {
    indices: Vec<usize>,
    values: Array2<f64>,
    dense_shape: [usize; 2],
}

impl SparseRows {
    /// Validated sparse update
    pub fn new(indices: Vec<usize>, values: Array2<f64>, dense_shape: [usize; 2]) -> Result<Self> {
        if values.nrows() != indices.len() {
            return Err(KfacError::invalid_argument(
                "values",
                format!(
                    "{} value rows for {} indices",
                    values.nrows(),
                    indices.len()
                ),
            ));
        }
        if values.ncols() != dense_shape[1] {
            return Err(KfacError::invalid_argument(
                "values",
                format!(
                    "rows have {} columns, dense shape has {}",
                    values.ncols(),
                    dense_shape[1]
                ),
            ));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= dense_shape[0]) {
            return Err(KfacError::invalid_argument(
                "indices",
                format!("index {bad} out of range for {} rows", dense_shape[0]),
            ));
        }
        Ok(Self {
            indices,
            values,
            dense_shape,
        })
    }

    /// Row indices
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Row values, one per index
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Shape of the dense equivalent
    pub fn dense_shape(&self) -> [usize; 2] {
        self.dense_shape
    }

    /// Same dense equivalent with each index kept once, in order of first
    /// appearance.
    pub fn coalesce(&self) -> Self {
        let mut indices: Vec<usize> = Vec::with_capacity(self.indices.len());
        let mut slot = vec![usize::MAX; self.dense_shape[0]];
        for &idx in &self.indices {
            if slot[idx] == usize::MAX {
                slot[idx] = indices.len();
                indices.push(idx);
            }
        }
        let mut values = Array2::<f64>::zeros((indices.len(), self.dense_shape[1]));
        for (row, &idx) in self.values.outer_iter().zip(self.indices.iter()) {
            let mut target = values.row_mut(slot[idx]);
            target += &row;
        }
        Self {
            indices,
            values,
            dense_shape: self.dense_shape,
        }
    }

    /// Dense equivalent; duplicate indices are summed.
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::<f64>::zeros((self.dense_shape[0], self.dense_shape[1]));
        for (row, &idx) in self.values.outer_iter().zip(self.indices.iter()) {
            let mut target = dense.row_mut(idx);
            target += &row;
        }
        dense
    }
}
