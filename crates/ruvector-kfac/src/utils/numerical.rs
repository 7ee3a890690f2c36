//! Dense linear algebra on `ndarray` matrices
//!
//! Pure Rust, no BLAS/LAPACK. Every solve goes through a Cholesky
//! factorization, so inputs are expected to be symmetric positive-definite
//! (covariances after damping).

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::{KfacError, Result};

/// Dimension of a square matrix, or a shape error.
pub fn square_dim(matrix: &ArrayView2<f64>, context: &str) -> Result<usize> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(KfacError::shape_mismatch(
            context,
            vec![rows, rows],
            vec![rows, cols],
        ));
    }
    Ok(rows)
}

/// Cholesky factorization: returns lower-triangular `L` with `A = LLᵀ`.
pub fn cholesky(matrix: &ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = square_dim(matrix, "cholesky")?;
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = matrix[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }

            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return Err(KfacError::numerical(format!(
                        "matrix not positive definite (pivot {i} = {sum:.3e})"
                    )));
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    Ok(l)
}

/// Solve `LLᵀ X = B` given the Cholesky factor `L`.
pub fn cholesky_solve(l: &Array2<f64>, b: &ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = l.nrows();
    if b.nrows() != n {
        return Err(KfacError::shape_mismatch(
            "cholesky solve right-hand side",
            vec![n, b.ncols()],
            vec![b.nrows(), b.ncols()],
        ));
    }

    let mut x = b.to_owned();
    for mut col in x.axis_iter_mut(Axis(1)) {
        // Forward substitution: L y = b
        for i in 0..n {
            let mut sum = col[i];
            for k in 0..i {
                sum -= l[[i, k]] * col[k];
            }
            col[i] = sum / l[[i, i]];
        }
        // Back substitution: Lᵀ x = y
        for i in (0..n).rev() {
            let mut sum = col[i];
            for k in (i + 1)..n {
                sum -= l[[k, i]] * col[k];
            }
            col[i] = sum / l[[i, i]];
        }
    }

    Ok(x)
}

/// Solve `A X = B` for symmetric positive-definite `A`.
pub fn spd_solve(a: &ArrayView2<f64>, b: &ArrayView2<f64>) -> Result<Array2<f64>> {
    let l = cholesky(a)?;
    cholesky_solve(&l, b)
}

/// Inverse of a symmetric positive-definite matrix.
pub fn spd_inverse(a: &ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = square_dim(a, "spd inverse")?;
    let l = cholesky(a)?;
    let mut inv = cholesky_solve(&l, &Array2::<f64>::eye(n).view())?;
    symmetrize(&mut inv);
    Ok(inv)
}

/// Replace `A` by `(A + Aᵀ) / 2`.
pub fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows().min(matrix.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[[i, j]] + matrix[[j, i]]);
            matrix[[i, j]] = avg;
            matrix[[j, i]] = avg;
        }
    }
}

/// `A + damping·I`
pub fn add_to_diagonal(matrix: &ArrayView2<f64>, damping: f64) -> Result<Array2<f64>> {
    let n = square_dim(matrix, "add to diagonal")?;
    let mut damped = matrix.to_owned();
    for i in 0..n {
        damped[[i, i]] += damping;
    }
    Ok(damped)
}

/// Dense Kronecker product `A ⊗ B`, row-major block layout.
pub fn kronecker_product(a: &ArrayView2<f64>, b: &ArrayView2<f64>) -> Array2<f64> {
    let (ar, ac) = a.dim();
    let (br, bc) = b.dim();
    let mut out = Array2::<f64>::zeros((ar * br, ac * bc));
    for i in 0..ar {
        for j in 0..ac {
            let scale = a[[i, j]];
            if scale == 0.0 {
                continue;
            }
            let mut block = out.slice_mut(ndarray::s![i * br..(i + 1) * br, j * bc..(j + 1) * bc]);
            block.scaled_add(scale, b);
        }
    }
    out
}

/// Elementwise reciprocal of `values + damping`, failing on non-positive entries.
pub fn damped_reciprocal(values: &Array1<f64>, damping: f64) -> Result<Array1<f64>> {
    let mut out = Array1::<f64>::zeros(values.len());
    for (i, &v) in values.iter().enumerate() {
        let damped = v + damping;
        if damped <= 0.0 || !damped.is_finite() {
            return Err(KfacError::numerical(format!(
                "diagonal entry {i} is not positive after damping ({damped:.3e})"
            )));
        }
        out[i] = 1.0 / damped;
    }
    Ok(out)
}

/// Largest absolute entrywise difference between two matrices of equal shape.
pub fn max_abs_diff(a: &ArrayView2<f64>, b: &ArrayView2<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_cholesky_reconstructs() {
        let a = array![[4.0, 2.0, 0.4], [2.0, 5.0, 1.0], [0.4, 1.0, 3.0]];
        let l = cholesky(&a.view()).unwrap();
        let rebuilt = l.dot(&l.t());
        assert!(max_abs_diff(&a.view(), &rebuilt.view()) < 1e-12);
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(
            cholesky(&a.view()),
            Err(KfacError::Numerical { .. })
        ));
    }

    #[test]
    fn test_cholesky_rejects_non_square() {
        let a = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            cholesky(&a.view()),
            Err(KfacError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_spd_inverse_of_identity_scaled() {
        let a = Array2::<f64>::eye(3) * 2.0;
        let inv = spd_inverse(&a.view()).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(inv[[i, i]], 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_spd_solve() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let b = array![[3.0], [5.0]];
        let x = spd_solve(&a.view(), &b.view()).unwrap();
        // 2x + y = 3, x + 3y = 5  =>  x = 0.8, y = 1.4
        assert_abs_diff_eq!(x[[0, 0]], 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(x[[1, 0]], 1.4, epsilon = 1e-12);
    }

    #[test]
    fn test_kronecker_product_layout() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let b = array![[0.0, 1.0], [1.0, 0.0]];
        let k = kronecker_product(&a.view(), &b.view());
        assert_eq!(k.dim(), (4, 4));
        assert_eq!(k[[0, 1]], 1.0);
        assert_eq!(k[[0, 3]], 2.0);
        assert_eq!(k[[3, 0]], 0.0);
        assert_eq!(k[[3, 2]], 4.0);
    }

    #[test]
    fn test_damped_reciprocal() {
        let v = array![1.0, 3.0];
        let r = damped_reciprocal(&v, 1.0).unwrap();
        assert_abs_diff_eq!(r[0], 0.5);
        assert_abs_diff_eq!(r[1], 0.25);
        assert!(damped_reciprocal(&array![0.0], 0.0).is_err());
    }
}
