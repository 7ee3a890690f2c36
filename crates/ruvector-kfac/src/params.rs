//! Layer parameter layouts and packing helpers
//!
//! A block's parameters are either a single weight tensor or a weight/bias
//! pair. Blocks flatten them in two ways:
//!
//! - **Column** form: every tensor flattened row-major and concatenated,
//!   used by the naive blocks that treat the layer as one flat vector.
//! - **2-D** form: the weight reshaped to `[-1, out]` with the bias appended
//!   as a final row, matching the bias-augmented input statistics of the
//!   Kronecker-factored blocks.

use ndarray::{concatenate, Array1, Array2, ArrayD, ArrayView1, Axis, IxDyn};

use crate::error::{KfacError, Result};
use crate::tensor::Tensor;

/// Weight, or weight and bias, of one layer
#[derive(Debug, Clone, PartialEq)]
pub enum Params<T = ArrayD<f64>> {
    /// Weight only
    Weight(T),
    /// Weight followed by bias
    WeightAndBias(T, T),
}

impl<T> Params<T> {
    /// Weight component
    pub fn weight(&self) -> &T {
        match self {
            Self::Weight(w) | Self::WeightAndBias(w, _) => w,
        }
    }

    /// Bias component, if any
    pub fn bias(&self) -> Option<&T> {
        match self {
            Self::Weight(_) => None,
            Self::WeightAndBias(_, b) => Some(b),
        }
    }

    /// True when a bias is present
    pub fn has_bias(&self) -> bool {
        matches!(self, Self::WeightAndBias(..))
    }

    /// Number of tensors (1 or 2)
    pub fn len(&self) -> usize {
        if self.has_bias() {
            2
        } else {
            1
        }
    }

    /// Always false; a layer has at least a weight.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Components in order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        std::iter::once(self.weight()).chain(self.bias())
    }

    /// Apply `f` to every component, keeping the layout.
    pub fn map<U, F: FnMut(&T) -> U>(&self, mut f: F) -> Params<U> {
        match self {
            Self::Weight(w) => Params::Weight(f(w)),
            Self::WeightAndBias(w, b) => Params::WeightAndBias(f(w), f(b)),
        }
    }

    /// Fallible [`map`](Self::map).
    pub fn try_map<U, F: FnMut(&T) -> Result<U>>(&self, mut f: F) -> Result<Params<U>> {
        Ok(match self {
            Self::Weight(w) => Params::Weight(f(w)?),
            Self::WeightAndBias(w, b) => Params::WeightAndBias(f(w)?, f(b)?),
        })
    }

    /// Build from a list of one or two components.
    pub fn from_vec(mut parts: Vec<T>) -> Result<Self> {
        match parts.len() {
            1 => Ok(Self::Weight(parts.remove(0))),
            2 => {
                let bias = parts.remove(1);
                Ok(Self::WeightAndBias(parts.remove(0), bias))
            }
            n => Err(KfacError::invalid_argument(
                "params",
                format!("expected weight or weight and bias, got {n} tensors"),
            )),
        }
    }
}

/// Anything with a shape a parameter layout can be taken from
pub trait Shaped {
    /// Shape as a vector of dimensions
    fn shape_vec(&self) -> Vec<usize>;
}

impl Shaped for ArrayD<f64> {
    fn shape_vec(&self) -> Vec<usize> {
        self.shape().to_vec()
    }
}

impl Shaped for Tensor {
    fn shape_vec(&self) -> Vec<usize> {
        self.shape()
    }
}

impl Shaped for Vec<usize> {
    fn shape_vec(&self) -> Vec<usize> {
        self.clone()
    }
}

impl<T: Shaped> Params<T> {
    /// Shapes of the components
    pub fn shapes(&self) -> Params<Vec<usize>> {
        self.map(Shaped::shape_vec)
    }

    /// Total number of scalar parameters
    pub fn num_elements(&self) -> usize {
        self.iter()
            .map(|t| t.shape_vec().iter().product::<usize>())
            .sum()
    }
}

impl Params<Tensor> {
    /// Current values of the parameter tensors
    pub fn values(&self) -> Params<ArrayD<f64>> {
        self.map(Tensor::value)
    }

    /// Tensor handles in order
    pub fn tensors(&self) -> Vec<Tensor> {
        self.iter().cloned().collect()
    }
}

/// Flatten and concatenate all components into one column.
pub fn tensors_to_column(params: &Params) -> Array1<f64> {
    let data: Vec<f64> = params.iter().flat_map(|t| t.iter().copied()).collect();
    Array1::from(data)
}

/// Split a column back into tensors shaped like `like`.
pub fn column_to_tensors<T: Shaped>(like: &Params<T>, column: &ArrayView1<f64>) -> Result<Params> {
    let expected = like.num_elements();
    if column.len() != expected {
        return Err(KfacError::shape_mismatch(
            "column to tensors",
            vec![expected],
            vec![column.len()],
        ));
    }
    let mut offset = 0;
    like.try_map(|t| {
        let shape = t.shape_vec();
        let size: usize = shape.iter().product();
        let slice = column.slice(ndarray::s![offset..offset + size]).to_vec();
        offset += size;
        ArrayD::from_shape_vec(IxDyn(&shape), slice)
            .map_err(|e| KfacError::invalid_argument("column", e.to_string()))
    })
}

/// Reshape layer parameters to `[rows, out]`: the weight as `[-1, out]`,
/// the bias (if any) appended as the last row.
pub fn layer_params_to_mat2d(params: &Params) -> Result<Array2<f64>> {
    let weight = params.weight();
    let cols = match weight.shape().last() {
        Some(&c) if c > 0 => c,
        _ => {
            return Err(KfacError::invalid_argument(
                "weight",
                format!("cannot reshape weight of shape {:?}", weight.shape()),
            ))
        }
    };
    let rows = weight.len() / cols;
    let weight_2d = weight
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, cols))
        .map_err(|e| KfacError::invalid_argument("weight", e.to_string()))?;

    match params.bias() {
        None => Ok(weight_2d),
        Some(bias) => {
            if bias.len() != cols {
                return Err(KfacError::shape_mismatch(
                    "layer bias",
                    vec![cols],
                    bias.shape().to_vec(),
                ));
            }
            let bias_row = Array2::from_shape_vec((1, cols), bias.iter().copied().collect())
                .map_err(|e| KfacError::invalid_argument("bias", e.to_string()))?;
            concatenate(Axis(0), &[weight_2d.view(), bias_row.view()])
                .map_err(|e| KfacError::invalid_argument("params", e.to_string()))
        }
    }
}

/// Inverse of [`layer_params_to_mat2d`], shaping the result like `like`.
pub fn mat2d_to_layer_params<T: Shaped>(like: &Params<T>, mat: &Array2<f64>) -> Result<Params> {
    let shapes = like.shapes();
    let weight_shape = shapes.weight();
    let weight_len: usize = weight_shape.iter().product();
    let cols = mat.ncols();
    let expected_rows = weight_len / cols.max(1) + usize::from(like.has_bias());
    if cols == 0 || mat.nrows() != expected_rows || weight_len % cols != 0 {
        return Err(KfacError::shape_mismatch(
            "mat2d to layer params",
            vec![expected_rows, cols],
            vec![mat.nrows(), mat.ncols()],
        ));
    }

    let weight_rows = weight_len / cols;
    let weight_data: Vec<f64> = mat
        .slice(ndarray::s![..weight_rows, ..])
        .iter()
        .copied()
        .collect();
    let weight = ArrayD::from_shape_vec(IxDyn(weight_shape), weight_data)
        .map_err(|e| KfacError::invalid_argument("weight", e.to_string()))?;

    match shapes.bias() {
        None => Ok(Params::Weight(weight)),
        Some(bias_shape) => {
            let bias_data = mat.row(weight_rows).to_vec();
            let bias = ArrayD::from_shape_vec(IxDyn(bias_shape), bias_data)
                .map_err(|e| KfacError::invalid_argument("bias", e.to_string()))?;
            Ok(Params::WeightAndBias(weight, bias))
        }
    }
}
