//! Second-moment kernels behind the factor estimates
//!
//! Every function returns an *unnormalized* sum together with the count it
//! should be divided by; the factor combines towers before normalizing.

use ndarray::{Array2, Array3, ArrayD, Axis};

use crate::error::{KfacError, Result};
use crate::tensor::Tensor;

use super::RowSource;

/// Sum of second moments over rows and the number of rows it covers
#[derive(Debug, Clone)]
pub(crate) struct RowMoment {
    pub sum: Array2<f64>,
    pub rows: usize,
}

/// View a dense value as examples `[batch, locations, features]`.
///
/// Rank 0 and 1 values are a single example; rank 2 is `[batch, features]`;
/// higher ranks fold every middle dimension into locations.
pub(crate) fn dense_examples(value: &ArrayD<f64>) -> Result<Array3<f64>> {
    let shape = value.shape();
    let (batch, locations, features) = match shape.len() {
        0 => (1, 1, 1),
        1 => (1, 1, shape[0]),
        2 => (shape[0], 1, shape[1]),
        n => (shape[0], shape[1..n - 1].iter().product(), shape[n - 1]),
    };
    value
        .as_standard_layout()
        .into_owned()
        .into_shape((batch, locations, features))
        .map_err(|e| KfacError::invalid_argument("tensor", e.to_string()))
}

/// Parse one-hot indices into per-example `(index, count)` lists.
pub(crate) fn one_hot_counts(indices: &ArrayD<f64>, depth: usize) -> Result<Vec<Vec<(usize, f64)>>> {
    let per_example: Vec<Vec<f64>> = match indices.ndim() {
        0 => vec![indices.iter().copied().collect()],
        1 => indices.iter().map(|&i| vec![i]).collect(),
        2 => indices
            .outer_iter()
            .map(|row| row.iter().copied().collect())
            .collect(),
        _ => {
            return Err(KfacError::invalid_argument(
                "indices",
                format!(
                    "one-hot indices must be [batch] or [batch, k], got shape {:?}",
                    indices.shape()
                ),
            ))
        }
    };

    per_example
        .into_iter()
        .map(|row| {
            let mut counts: Vec<(usize, f64)> = Vec::with_capacity(row.len());
            for raw in row {
                if raw < 0.0 || raw.fract() != 0.0 || raw >= depth as f64 {
                    return Err(KfacError::invalid_argument(
                        "indices",
                        format!("{raw} is not a valid index into a vocabulary of {depth}"),
                    ));
                }
                let idx = raw as usize;
                match counts.iter_mut().find(|(i, _)| *i == idx) {
                    Some((_, c)) => *c += 1.0,
                    None => counts.push((idx, 1.0)),
                }
            }
            Ok(counts)
        })
        .collect()
}

/// Append a constant-1 feature to every example.
pub(crate) fn append_bias(examples: Array3<f64>) -> Array3<f64> {
    let (b, l, d) = examples.dim();
    let mut out = Array3::<f64>::ones((b, l, d + 1));
    out.slice_mut(ndarray::s![.., .., ..d]).assign(&examples);
    out
}

/// `Σ rᵀr` (or `Σ r²` as a column when `diagonal`) over the rows of a source.
pub(crate) fn row_moment(source: &RowSource, has_bias: bool, diagonal: bool) -> Result<RowMoment> {
    if let RowSource::OneHot { indices, depth } = source {
        return one_hot_moment(&indices.read(), *depth, has_bias, diagonal);
    }

    let mut examples = source.examples()?;
    if has_bias {
        examples = append_bias(examples);
    }
    let (b, l, d) = examples.dim();
    let rows = examples
        .into_shape((b * l, d))
        .map_err(|e| KfacError::invalid_argument("rows", e.to_string()))?;

    let sum = if diagonal {
        rows.mapv(|x| x * x)
            .sum_axis(Axis(0))
            .insert_axis(Axis(1))
    } else {
        rows.t().dot(&rows)
    };
    Ok(RowMoment { sum, rows: b * l })
}

fn one_hot_moment(indices: &ArrayD<f64>, depth: usize, has_bias: bool, diagonal: bool) -> Result<RowMoment> {
    let counts = one_hot_counts(indices, depth)?;
    let dim = depth + usize::from(has_bias);
    let mut sum = if diagonal {
        Array2::<f64>::zeros((dim, 1))
    } else {
        Array2::<f64>::zeros((dim, dim))
    };

    for example in &counts {
        if diagonal {
            for &(i, ci) in example {
                sum[[i, 0]] += ci * ci;
            }
            if has_bias {
                sum[[depth, 0]] += 1.0;
            }
            continue;
        }
        for &(i, ci) in example {
            for &(j, cj) in example {
                sum[[i, j]] += ci * cj;
            }
            if has_bias {
                sum[[i, depth]] += ci;
                sum[[depth, i]] += ci;
            }
        }
        if has_bias {
            sum[[depth, depth]] += 1.0;
        }
    }

    Ok(RowMoment {
        sum,
        rows: counts.len(),
    })
}

/// Per-example `(Σ_loc a_loc ⊗ g_loc)²`, summed over examples.
///
/// Returns the `[in(+1), out]` sum and the batch size.
pub(crate) fn layer_diagonal_sum(inputs: &RowSource, grads: &Tensor, has_bias: bool) -> Result<(Array2<f64>, usize)> {
    let mut acts = inputs.examples()?;
    if has_bias {
        acts = append_bias(acts);
    }
    let outs = dense_examples(&grads.read())?;

    let (b, l, din) = acts.dim();
    let (gb, gl, dout) = outs.dim();
    if (b, l) != (gb, gl) {
        return Err(KfacError::shape_mismatch(
            "layer diagonal examples",
            vec![b, l, dout],
            vec![gb, gl, dout],
        ));
    }

    let mut sum = Array2::<f64>::zeros((din, dout));
    for (a, g) in acts.outer_iter().zip(outs.outer_iter()) {
        let per_example = a.t().dot(&g);
        sum.zip_mut_with(&per_example, |s, &x| *s += x * x);
    }
    Ok((sum, b))
}

/// `g gᵀ` (or `g²` as a column) for the concatenated flattened gradients.
pub(crate) fn gradient_moment(grads: &[Tensor], diagonal: bool) -> Array2<f64> {
    let flat: Vec<f64> = grads
        .iter()
        .flat_map(|g| g.read().iter().copied().collect::<Vec<_>>())
        .collect();
    let n = flat.len();
    if diagonal {
        return Array2::from_shape_fn((n, 1), |(i, _)| flat[i] * flat[i]);
    }
    Array2::from_shape_fn((n, n), |(i, j)| flat[i] * flat[j])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array, IxDyn};

    #[test]
    fn test_dense_examples_ranks() {
        let v = Array::<f64, _>::zeros(IxDyn(&[3]));
        assert_eq!(dense_examples(&v).unwrap().dim(), (1, 1, 3));
        let v = Array::<f64, _>::zeros(IxDyn(&[4, 3]));
        assert_eq!(dense_examples(&v).unwrap().dim(), (4, 1, 3));
        let v = Array::<f64, _>::zeros(IxDyn(&[2, 5, 4, 3]));
        assert_eq!(dense_examples(&v).unwrap().dim(), (2, 20, 3));
    }

    #[test]
    fn test_one_hot_counts_multi_hot() {
        let idx = array![[0.0, 0.0], [1.0, 4.0]].into_dyn();
        let counts = one_hot_counts(&idx, 5).unwrap();
        assert_eq!(counts[0], vec![(0, 2.0)]);
        assert_eq!(counts[1], vec![(1, 1.0), (4, 1.0)]);
        assert!(one_hot_counts(&array![[5.0]].into_dyn(), 5).is_err());
        assert!(one_hot_counts(&array![[0.5]].into_dyn(), 5).is_err());
    }

    #[test]
    fn test_one_hot_moment_matches_dense() {
        let idx = array![[0.0, 1.0], [1.0, 2.0], [2.0, 2.0]];
        let dense = array![
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 1.0],
            [0.0, 0.0, 2.0]
        ];
        let hot = RowSource::OneHot {
            indices: Tensor::from(idx),
            depth: 3,
        };
        let plain = RowSource::Dense(Tensor::from(dense));
        for (bias, diag) in [(false, false), (true, false), (false, true), (true, true)] {
            let a = row_moment(&hot, bias, diag).unwrap();
            let b = row_moment(&plain, bias, diag).unwrap();
            assert_eq!(a.rows, b.rows);
            assert_eq!(a.sum, b.sum);
        }
    }

    #[test]
    fn test_layer_diagonal_sums_locations_first() {
        // one example, two locations
        let inputs = RowSource::Dense(Tensor::from(
            Array::from_shape_vec(IxDyn(&[1, 2, 1]), vec![1.0, 2.0]).unwrap(),
        ));
        let grads = Tensor::from(Array::from_shape_vec(IxDyn(&[1, 2, 1]), vec![3.0, 1.0]).unwrap());
        let (sum, batch) = layer_diagonal_sum(&inputs, &grads, false).unwrap();
        assert_eq!(batch, 1);
        // (1*3 + 2*1)^2
        assert_eq!(sum[[0, 0]], 25.0);
    }

    #[test]
    fn test_gradient_moment() {
        let grads = vec![Tensor::from(array![1.0, 2.0]), Tensor::from(array![3.0])];
        let full = gradient_moment(&grads, false);
        assert_eq!(full[[0, 2]], 3.0);
        assert_eq!(full[[2, 2]], 9.0);
        let diag = gradient_moment(&grads, true);
        assert_eq!(diag.column(0).to_vec(), vec![1.0, 4.0, 9.0]);
    }
}
