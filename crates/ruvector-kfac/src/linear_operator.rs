//! Linear operators over curvature factors
//!
//! A small closed family of square operators that Fisher blocks use to talk
//! about factor statistics without caring how they are stored:
//!
//! - `Diagonal(d)`: `diag(d)`
//! - `FullMatrix(M)`: a dense square matrix
//! - `KroneckerProduct(A, B)`: `A ⊗ B`, never materialized for products,
//!   solves or traces
//!
//! ## Vectorization convention
//!
//! Vectors are row-major vectorizations. For `x = vec_r(X)` with `X` of shape
//! `[dim(A), dim(B)]`:
//!
//! ```text
//! (A ⊗ B) x = vec_r(A · X · Bᵀ)
//! (A ⊗ B)⁻¹ x = vec_r(A⁻¹ · X · B⁻ᵀ)
//! trace(A ⊗ B) = trace(A) · trace(B)
//! ```

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{KfacError, Result};
use crate::utils::{cholesky, cholesky_solve, damped_reciprocal, kronecker_product, spd_inverse};

/// Square linear operator
#[derive(Debug, Clone, PartialEq)]
pub enum LinearOperator {
    /// Diagonal matrix given by its diagonal entries
    Diagonal(Array1<f64>),
    /// Dense square matrix
    FullMatrix(Array2<f64>),
    /// Kronecker product `A ⊗ B`
    KroneckerProduct(Box<LinearOperator>, Box<LinearOperator>),
}

impl LinearOperator {
    /// Diagonal operator
    pub fn diagonal(diag: Array1<f64>) -> Result<Self> {
        if diag.is_empty() {
            return Err(KfacError::invalid_argument(
                "diag",
                "diagonal operator needs at least one entry",
            ));
        }
        Ok(Self::Diagonal(diag))
    }

    /// Dense operator; fails unless `matrix` is square and non-empty.
    pub fn full(matrix: Array2<f64>) -> Result<Self> {
        let (rows, cols) = matrix.dim();
        if rows != cols || rows == 0 {
            return Err(KfacError::shape_mismatch(
                "full matrix operator",
                vec![rows.max(1), rows.max(1)],
                vec![rows, cols],
            ));
        }
        Ok(Self::FullMatrix(matrix))
    }

    /// Kronecker product `left ⊗ right`.
    pub fn kronecker(left: LinearOperator, right: LinearOperator) -> Result<Self> {
        for (name, op) in [("left", &left), ("right", &right)] {
            if op.domain_dimension() == 0 {
                return Err(KfacError::shape_mismatch(
                    format!("kronecker {name} operand"),
                    vec![1, 1],
                    vec![0, 0],
                ));
            }
        }
        Ok(Self::KroneckerProduct(Box::new(left), Box::new(right)))
    }

    /// Side length of the (square) operator
    pub fn domain_dimension(&self) -> usize {
        match self {
            Self::Diagonal(d) => d.len(),
            Self::FullMatrix(m) => m.nrows(),
            Self::KroneckerProduct(a, b) => a.domain_dimension() * b.domain_dimension(),
        }
    }

    /// Operator shape `[n, n]`
    pub fn shape(&self) -> [usize; 2] {
        let n = self.domain_dimension();
        [n, n]
    }

    /// Sum of the diagonal
    pub fn trace(&self) -> f64 {
        match self {
            Self::Diagonal(d) => d.sum(),
            Self::FullMatrix(m) => m.diag().sum(),
            Self::KroneckerProduct(a, b) => a.trace() * b.trace(),
        }
    }

    /// Materialize the operator as a dense matrix.
    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Self::Diagonal(d) => Array2::from_diag(d),
            Self::FullMatrix(m) => m.clone(),
            Self::KroneckerProduct(a, b) => {
                kronecker_product(&a.to_dense().view(), &b.to_dense().view())
            }
        }
    }

    /// Transposed operator
    pub fn transpose(&self) -> Self {
        match self {
            Self::Diagonal(d) => Self::Diagonal(d.clone()),
            Self::FullMatrix(m) => Self::FullMatrix(m.t().to_owned()),
            Self::KroneckerProduct(a, b) => {
                Self::KroneckerProduct(Box::new(a.transpose()), Box::new(b.transpose()))
            }
        }
    }

    /// `M · X` where `X` has `domain_dimension()` rows.
    pub fn matmul(&self, x: &ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check_rows(x, "matmul")?;
        match self {
            Self::Diagonal(d) => {
                let mut out = x.to_owned();
                for (mut row, &scale) in out.axis_iter_mut(Axis(0)).zip(d.iter()) {
                    row *= scale;
                }
                Ok(out)
            }
            Self::FullMatrix(m) => Ok(m.dot(x)),
            Self::KroneckerProduct(a, b) => {
                kronecker_columns(a, b, x, |op, m| op.matmul(m))
            }
        }
    }

    /// `X · M` where `X` has `domain_dimension()` columns.
    pub fn matmul_right(&self, x: &ArrayView2<f64>) -> Result<Array2<f64>> {
        let xt = x.t();
        Ok(self.transpose().matmul(&xt)?.reversed_axes())
    }

    /// `M · x` for a vector `x`.
    pub fn matvec(&self, x: &ArrayView1<f64>) -> Result<Array1<f64>> {
        let column = x.view().insert_axis(Axis(1));
        Ok(self.matmul(&column)?.remove_axis(Axis(1)))
    }

    /// `M⁻¹ · B` for symmetric positive-definite operators.
    pub fn solve(&self, b: &ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check_rows(b, "solve")?;
        match self {
            Self::Diagonal(d) => {
                let inv = damped_reciprocal(d, 0.0)?;
                Self::Diagonal(inv).matmul(b)
            }
            Self::FullMatrix(m) => {
                let l = cholesky(&m.view())?;
                cholesky_solve(&l, b)
            }
            Self::KroneckerProduct(a, bop) => {
                kronecker_columns(a, bop, b, |op, m| op.solve(m))
            }
        }
    }

    /// `M⁻¹ · b` for a vector `b`.
    pub fn solve_vec(&self, b: &ArrayView1<f64>) -> Result<Array1<f64>> {
        let column = b.view().insert_axis(Axis(1));
        Ok(self.solve(&column)?.remove_axis(Axis(1)))
    }

    /// Explicit inverse, keeping the operator structure.
    pub fn inverse(&self) -> Result<Self> {
        match self {
            Self::Diagonal(d) => Ok(Self::Diagonal(damped_reciprocal(d, 0.0)?)),
            Self::FullMatrix(m) => Ok(Self::FullMatrix(spd_inverse(&m.view())?)),
            Self::KroneckerProduct(a, b) => Ok(Self::KroneckerProduct(
                Box::new(a.inverse()?),
                Box::new(b.inverse()?),
            )),
        }
    }

    /// Dense sub-block `M[rows, cols]`.
    pub fn entries(&self, rows: &[usize], cols: &[usize]) -> Result<Array2<f64>> {
        let n = self.domain_dimension();
        if let Some(&bad) = rows.iter().chain(cols.iter()).find(|&&i| i >= n) {
            return Err(KfacError::invalid_argument(
                "indices",
                format!("index {bad} out of range for operator of dimension {n}"),
            ));
        }
        let mut out = Array2::<f64>::zeros((rows.len(), cols.len()));
        match self {
            Self::Diagonal(d) => {
                for (r, &i) in rows.iter().enumerate() {
                    for (c, &j) in cols.iter().enumerate() {
                        if i == j {
                            out[[r, c]] = d[i];
                        }
                    }
                }
            }
            Self::FullMatrix(m) => {
                for (r, &i) in rows.iter().enumerate() {
                    for (c, &j) in cols.iter().enumerate() {
                        out[[r, c]] = m[[i, j]];
                    }
                }
            }
            Self::KroneckerProduct(a, b) => {
                let nb = b.domain_dimension();
                for (r, &i) in rows.iter().enumerate() {
                    for (c, &j) in cols.iter().enumerate() {
                        let ai = a.entries(&[i / nb], &[j / nb])?[[0, 0]];
                        let bi = b.entries(&[i % nb], &[j % nb])?[[0, 0]];
                        out[[r, c]] = ai * bi;
                    }
                }
            }
        }
        Ok(out)
    }

    fn check_rows(&self, x: &ArrayView2<f64>, op: &str) -> Result<()> {
        let n = self.domain_dimension();
        if x.nrows() != n {
            return Err(KfacError::shape_mismatch(
                format!("linear operator {op}"),
                vec![n, x.ncols()],
                vec![x.nrows(), x.ncols()],
            ));
        }
        Ok(())
    }
}

/// Apply `(A ⊗ B)`-structured `f` to each column of `x` via `A·X·Bᵀ`.
fn kronecker_columns<F>(
    a: &LinearOperator,
    b: &LinearOperator,
    x: &ArrayView2<f64>,
    f: F,
) -> Result<Array2<f64>>
where
    F: Fn(&LinearOperator, &ArrayView2<f64>) -> Result<Array2<f64>>,
{
    let (da, db) = (a.domain_dimension(), b.domain_dimension());
    let mut out = Array2::<f64>::zeros(x.dim());
    for (j, col) in x.axis_iter(Axis(1)).enumerate() {
        let mat = col
            .to_owned()
            .into_shape((da, db))
            .map_err(|e| KfacError::invalid_argument("vector", e.to_string()))?;
        // A · X, then (B · (A·X)ᵀ)ᵀ = A·X·Bᵀ
        let left = f(a, &mat.view())?;
        let both = f(b, &left.t())?.reversed_axes();
        for (dst, src) in out.column_mut(j).iter_mut().zip(both.iter()) {
            *dst = *src;
        }
    }
    Ok(out)
}
