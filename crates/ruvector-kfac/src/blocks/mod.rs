//! Fisher blocks
//!
//! A Fisher block approximates the curvature of one layer's parameters and
//! can multiply a parameter-shaped value by that approximation or by its
//! damped inverse.
//!
//! | Block                           | Approximation                         |
//! |---------------------------------|---------------------------------------|
//! | [`NaiveFullFB`]                 | full `E[g gᵀ]` over all parameters    |
//! | [`NaiveDiagonalFB`]             | `diag E[g gᵀ]`                        |
//! | [`FullyConnectedDiagonalFB`]    | per-weight `E[(a ⊗ g)²]`              |
//! | [`FullyConnectedKFACBasicFB`]   | `A ⊗ G`                               |
//! | [`FullyConnectedSeriesFB`]      | `T · (A ⊗ G)` over sequence steps     |
//! | [`FullyConnectedMultiIndepFB`]  | `uses · (A ⊗ G)` over independent uses |
//! | [`ConvDiagonalFB`]              | per-weight `E[(Σ_loc p ⊗ g)²]`         |
//! | [`ConvKFCBasicFB`]              | `locations · (A ⊗ G)` over patches    |
//! | [`DepthwiseConvKFCBasicFB`]     | conv block on the embedded kernel     |
//!
//! Every block moves through two phases. While `Open` it accepts towers;
//! `instantiate_factors` binds factors from the registry and freezes the
//! towers. Products need the `Instantiated` phase, and `multiply_inverse`
//! additionally needs an inverse update to have run on the block's factors.

mod conv;
mod fully_connected;
mod naive;

pub use conv::{ConvDiagonalFB, ConvKFCBasicFB, DepthwiseConvKFCBasicFB};
pub use fully_connected::{
    FullyConnectedDiagonalFB, FullyConnectedKFACBasicFB, FullyConnectedMultiIndepFB,
    FullyConnectedSeriesFB,
};
pub use naive::{NaiveDiagonalFB, NaiveFullFB};

use ndarray::Array2;

use crate::damping::{normalize_damping, Damping, FactorSide};
use crate::error::{check_damping, KfacError, Result};
use crate::factors::FactorRef;
use crate::linear_operator::LinearOperator;
use crate::params::Params;
use crate::tensor::{Input, SparseRows, Tensor};
use crate::utils::kronecker_product;

/// Curvature block of one layer
pub trait FisherBlock: Send + Sync {
    /// Short block name for logs
    fn name(&self) -> &'static str;

    /// Number of towers registered so far
    fn num_registered_towers(&self) -> usize;

    /// Tensors the host must differentiate the loss with respect to, grouped
    /// `[tower][use]`. Naive blocks return a single group of parameters.
    fn tensors_to_compute_grads(&self) -> Vec<Vec<Tensor>>;

    /// Bind factors. `grads[source]` has the structure of
    /// [`tensors_to_compute_grads`](Self::tensors_to_compute_grads) and holds
    /// one gradient per tensor.
    fn instantiate_factors(&mut self, grads: &[Vec<Vec<Tensor>>], damping: f64) -> Result<()>;

    /// Register the dampings this block reads inverses at on its factors.
    fn register_inverse(&self) -> Result<()>;

    /// Undamped block times `params`
    fn multiply(&self, params: &Params) -> Result<Params>;

    /// `(block + damping·I)⁻¹` times `params`
    fn multiply_inverse(&self, params: &Params) -> Result<Params>;

    /// Damped inverse times a row-sparse value, computed on the touched rows
    /// only. Only embedding-style blocks support this.
    fn multiply_inverse_sparse(&self, _vector: &SparseRows) -> Result<SparseRows> {
        Err(KfacError::invalid_argument(
            "vector",
            format!("{} does not support sparse products", self.name()),
        ))
    }

    /// Dense approximation, row-major over the flattened parameters
    fn full_fisher_block(&self) -> Result<Array2<f64>>;

    /// Factors bound to this block (empty before instantiation)
    fn factors(&self) -> Vec<FactorRef>;

    /// Damping given at instantiation
    fn damping(&self) -> Option<f64>;
}

/// Two-phase block state
#[derive(Debug)]
pub(crate) enum Phase<B> {
    Open,
    Instantiated(B),
}

impl<B> Phase<B> {
    pub(crate) fn bound(&self, op: &str) -> Result<&B> {
        match self {
            Self::Instantiated(b) => Ok(b),
            Self::Open => Err(KfacError::not_initialized(format!(
                "{op} called before instantiate_factors"
            ))),
        }
    }

    pub(crate) fn ensure_open(&self, op: &str) -> Result<()> {
        match self {
            Self::Open => Ok(()),
            Self::Instantiated(_) => Err(KfacError::not_initialized(format!(
                "{op} called after instantiate_factors"
            ))),
        }
    }
}

/// One registered tower: per-use inputs and outputs
#[derive(Debug, Clone)]
pub(crate) struct Tower {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Tensor>,
    pub weight: f64,
}

/// Registered towers with shape consistency checks
#[derive(Debug, Default)]
pub(crate) struct Towers {
    towers: Vec<Tower>,
}

impl Towers {
    pub(crate) fn push(&mut self, tower: Tower) -> Result<()> {
        if tower.inputs.is_empty() || tower.inputs.len() != tower.outputs.len() {
            return Err(KfacError::shape_mismatch(
                "tower uses",
                vec![tower.inputs.len().max(1); 2],
                vec![tower.inputs.len(), tower.outputs.len()],
            ));
        }
        if !tower.weight.is_finite() || tower.weight <= 0.0 {
            return Err(KfacError::invalid_argument(
                "weight",
                format!("tower weight must be positive, got {}", tower.weight),
            ));
        }
        if let Some(first) = self.towers.first() {
            if first.inputs.len() != tower.inputs.len() {
                return Err(KfacError::shape_mismatch(
                    "tower uses",
                    vec![first.inputs.len()],
                    vec![tower.inputs.len()],
                ));
            }
            for (a, b) in first.inputs.iter().zip(&tower.inputs) {
                if a.is_one_hot() != b.is_one_hot() || a.signature() != b.signature() {
                    return Err(KfacError::shape_mismatch(
                        "tower inputs",
                        a.signature(),
                        b.signature(),
                    ));
                }
            }
            for (a, b) in first.outputs.iter().zip(&tower.outputs) {
                let (sa, sb) = (tail(&a.shape()), tail(&b.shape()));
                if sa != sb {
                    return Err(KfacError::shape_mismatch("tower outputs", sa, sb));
                }
            }
        }
        self.towers.push(tower);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.towers.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Tower> {
        self.towers.iter()
    }

    pub(crate) fn first(&self) -> Result<&Tower> {
        self.towers
            .first()
            .ok_or_else(|| KfacError::not_initialized("no towers registered"))
    }

    pub(crate) fn outputs(&self) -> Vec<Vec<Tensor>> {
        self.towers.iter().map(|t| t.outputs.clone()).collect()
    }

    /// Regroup `grads[source][tower][use]` as `[tower][use][source]`,
    /// checking arity and that each gradient matches its output's shape.
    pub(crate) fn regroup_grads(&self, grads: &[Vec<Vec<Tensor>>]) -> Result<Vec<Vec<Vec<Tensor>>>> {
        regroup(grads, &self.outputs())
    }
}

fn tail(shape: &[usize]) -> Vec<usize> {
    if shape.len() <= 1 {
        shape.to_vec()
    } else {
        shape[1..].to_vec()
    }
}

/// Regroup `grads[source][group][item]` as `[group][item][source]`, checking
/// it against the expected tensors.
pub(crate) fn regroup(grads: &[Vec<Vec<Tensor>>], expected: &[Vec<Tensor>]) -> Result<Vec<Vec<Vec<Tensor>>>> {
    if grads.is_empty() {
        return Err(KfacError::shape_mismatch(
            "gradient sources",
            vec![1],
            vec![0],
        ));
    }
    let mut out: Vec<Vec<Vec<Tensor>>> = expected
        .iter()
        .map(|group| vec![Vec::with_capacity(grads.len()); group.len()])
        .collect();

    for source in grads {
        if source.len() != expected.len() {
            return Err(KfacError::shape_mismatch(
                "gradient groups",
                vec![expected.len()],
                vec![source.len()],
            ));
        }
        for ((group, want), slot) in source.iter().zip(expected).zip(out.iter_mut()) {
            if group.len() != want.len() {
                return Err(KfacError::shape_mismatch(
                    "gradients per group",
                    vec![want.len()],
                    vec![group.len()],
                ));
            }
            for ((grad, target), items) in group.iter().zip(want).zip(slot.iter_mut()) {
                if grad.shape() != target.shape() {
                    return Err(KfacError::shape_mismatch(
                        "gradient",
                        target.shape(),
                        grad.shape(),
                    ));
                }
                items.push(grad.clone());
            }
        }
    }
    Ok(out)
}

/// Reject a parameter layout that disagrees with the block's bias flag.
pub(crate) fn check_bias(params: &Params, has_bias: bool, block: &str) -> Result<()> {
    if params.has_bias() != has_bias {
        return Err(KfacError::invalid_argument(
            "params",
            format!(
                "{block} was built {} a bias but got {}",
                if has_bias { "with" } else { "without" },
                if params.has_bias() { "weight and bias" } else { "weight only" }
            ),
        ));
    }
    Ok(())
}

/// Reject params whose kernel or bias shape differs from the layer's, even
/// when the element counts agree. The weight may be the kernel itself or its
/// 2-D form `[Π kernel[..-1], out]`.
pub(crate) fn check_kernel(params: &Params, kernel: &[usize], block: &str) -> Result<()> {
    let out = kernel.last().copied().unwrap_or(0);
    let rows: usize = kernel[..kernel.len().saturating_sub(1)].iter().product();
    let weight = params.weight().shape();
    let weight_ok = weight == kernel || weight == [rows, out];
    let bias_ok = params.bias().map_or(true, |b| b.shape() == [out]);
    if weight_ok && bias_ok {
        return Ok(());
    }
    let mut expected = kernel.to_vec();
    if params.has_bias() {
        expected.push(out);
    }
    Err(KfacError::shape_mismatch(
        format!("{block} params"),
        expected,
        params.shapes().iter().flatten().copied().collect::<Vec<_>>(),
    ))
}

/// Kronecker-factored curvature `renorm · (A ⊗ G)` shared by the dense,
/// series, multi-use and convolutional blocks.
///
/// Values are handled as `[dim A, dim G]` matrices:
///
/// ```text
/// multiply(V)         = renorm · A V G
/// multiply_inverse(V) = A_d⁻¹ V G_d⁻¹ / renorm
/// ```
///
/// where `A_d`, `G_d` are damped with the π-tracenorm split of
/// `damping / renorm`.
#[derive(Debug)]
pub(crate) struct KroneckerCore {
    input: FactorRef,
    output: FactorRef,
    input_damping: Damping,
    output_damping: Damping,
    damping: f64,
    renorm: f64,
}

impl KroneckerCore {
    pub(crate) fn new(input: FactorRef, output: FactorRef, damping: f64, renorm: usize) -> Result<Self> {
        check_damping(damping)?;
        let normalized = normalize_damping(damping, renorm)?;
        let input_id = input.read().id();
        let output_id = output.read().id();
        Ok(Self {
            input_damping: Damping::PiAdjusted {
                total: normalized,
                side: FactorSide::Left,
                partner: output_id,
            },
            output_damping: Damping::PiAdjusted {
                total: normalized,
                side: FactorSide::Right,
                partner: input_id,
            },
            input,
            output,
            damping,
            renorm: renorm as f64,
        })
    }

    pub(crate) fn damping(&self) -> f64 {
        self.damping
    }

    pub(crate) fn factors(&self) -> Vec<FactorRef> {
        vec![self.input.clone(), self.output.clone()]
    }

    pub(crate) fn register_inverse(&self) -> Result<()> {
        let (input_id, output_id) = (self.input.read().id(), self.output.read().id());
        {
            let mut input = self.input.write();
            input.link_partner(output_id, &self.output);
            input.register_damping(self.input_damping)?;
        }
        let mut output = self.output.write();
        output.link_partner(input_id, &self.input);
        output.register_damping(self.output_damping)
    }

    pub(crate) fn multiply(&self, value: &Array2<f64>) -> Result<Array2<f64>> {
        let a = self.input.read().get_cov_as_linear_operator()?;
        let g = self.output.read().get_cov_as_linear_operator()?;
        let left = a.matmul(&value.view())?;
        Ok(g.matmul_right(&left.view())? * self.renorm)
    }

    pub(crate) fn multiply_inverse(&self, value: &Array2<f64>) -> Result<Array2<f64>> {
        let a_inv = self.input.read().get_inverse(&self.input_damping)?;
        let g_inv = self.output.read().get_inverse(&self.output_damping)?;
        let left = a_inv.matmul(&value.view())?;
        Ok(g_inv.matmul_right(&left.view())? / self.renorm)
    }

    /// Rows `idx` of `A_d⁻¹ V G_d⁻¹ / renorm` for `V` zero outside `idx`,
    /// which only needs the `[idx, idx]` sub-block of `A_d⁻¹`.
    ///
    /// A diagonal `A_d⁻¹` scales every value row on its own, so repeated
    /// indices are kept. Otherwise repeated indices are merged first.
    pub(crate) fn multiply_inverse_rows(&self, vector: &SparseRows) -> Result<SparseRows> {
        let a_inv = self.input.read().get_inverse(&self.input_damping)?;
        let g_inv = self.output.read().get_inverse(&self.output_damping)?;
        let expected = [a_inv.domain_dimension(), g_inv.domain_dimension()];
        if vector.dense_shape() != expected {
            return Err(KfacError::shape_mismatch(
                "sparse vector",
                expected.to_vec(),
                vector.dense_shape().to_vec(),
            ));
        }

        let (indices, left) = match &a_inv {
            LinearOperator::Diagonal(diag) => {
                let mut left = vector.values().clone();
                for (mut row, &i) in left.outer_iter_mut().zip(vector.indices()) {
                    row *= diag[i];
                }
                (vector.indices().to_vec(), left)
            }
            _ => {
                let merged = vector.coalesce();
                let sub = a_inv.entries(merged.indices(), merged.indices())?;
                let left = sub.dot(merged.values());
                (merged.indices().to_vec(), left)
            }
        };
        let values = g_inv.matmul_right(&left.view())? / self.renorm;
        SparseRows::new(indices, values, vector.dense_shape())
    }

    pub(crate) fn full(&self) -> Result<Array2<f64>> {
        let a = self.input.read().get_cov_as_linear_operator()?.to_dense();
        let g = self.output.read().get_cov_as_linear_operator()?.to_dense();
        Ok(kronecker_product(&a.view(), &g.view()) * self.renorm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tower(input: Tensor, output: Tensor) -> Tower {
        Tower {
            inputs: vec![Input::Dense(input)],
            outputs: vec![output],
            weight: 1.0,
        }
    }

    #[test]
    fn test_towers_allow_batch_to_vary() {
        let mut towers = Towers::default();
        towers
            .push(tower(Tensor::zeros(&[4, 3]), Tensor::zeros(&[4, 2])))
            .unwrap();
        towers
            .push(tower(Tensor::zeros(&[2, 3]), Tensor::zeros(&[2, 2])))
            .unwrap();
        let err = towers
            .push(tower(Tensor::zeros(&[2, 5]), Tensor::zeros(&[2, 2])))
            .unwrap_err();
        assert!(matches!(err, KfacError::ShapeMismatch { .. }));
        assert_eq!(towers.len(), 2);
    }

    #[test]
    fn test_regroup_grads() {
        let out_a = Tensor::zeros(&[2, 1]);
        let out_b = Tensor::zeros(&[3, 1]);
        let expected = vec![vec![out_a.clone()], vec![out_b.clone()]];
        let s1 = vec![vec![Tensor::zeros(&[2, 1])], vec![Tensor::zeros(&[3, 1])]];
        let s2 = vec![vec![Tensor::zeros(&[2, 1])], vec![Tensor::zeros(&[3, 1])]];
        let grouped = regroup(&[s1.clone(), s2], &expected).unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[1][0].len(), 2);
        assert_eq!(grouped[0][0][0], s1[0][0]);

        let bad = vec![vec![Tensor::zeros(&[2, 1])]];
        assert!(matches!(
            regroup(&[bad], &expected),
            Err(KfacError::ShapeMismatch { .. })
        ));
        let wrong_shape = vec![vec![Tensor::zeros(&[2, 2])], vec![Tensor::zeros(&[3, 1])]];
        assert!(regroup(&[wrong_shape], &expected).is_err());
        assert!(regroup(&[], &expected).is_err());
    }

    #[test]
    fn test_phase() {
        let phase: Phase<u8> = Phase::Open;
        assert!(matches!(
            phase.bound("multiply"),
            Err(KfacError::NotInitialized { .. })
        ));
        assert!(phase.ensure_open("register").is_ok());
        let phase = Phase::Instantiated(3u8);
        assert_eq!(*phase.bound("multiply").unwrap(), 3);
        assert!(phase.ensure_open("register").is_err());
    }

    #[test]
    fn test_check_bias() {
        let p = Params::Weight(array![[1.0]].into_dyn());
        assert!(check_bias(&p, false, "block").is_ok());
        assert!(check_bias(&p, true, "block").is_err());
    }
}
