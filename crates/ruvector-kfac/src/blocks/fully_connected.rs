//! Blocks for dense (fully-connected) layers
//!
//! Parameters are handled in their 2-D form `[in(+1), out]`: the weight
//! with the bias appended as the last row, which lines up with the
//! bias-augmented input statistics.

use ndarray::{Array1, Array2};
use tracing::debug;

use crate::damping::Damping;
use crate::error::{check_damping, KfacError, Result};
use crate::factors::{FactorKind, FactorRef, FactorSpec, FactorTower, RowSource};
use crate::params::{layer_params_to_mat2d, mat2d_to_layer_params, Params};
use crate::patches::ConvGeometry;
use crate::registry::FactorRegistry;
use crate::tensor::{Input, SparseRows, Tensor};

use super::{check_bias, FisherBlock, KroneckerCore, Phase, Tower, Towers};

#[derive(Debug)]
pub(super) struct DiagonalBound {
    factor: FactorRef,
    damping: f64,
}

/// Per-weight diagonal block over a layer's `(input, output gradient)` pairs.
/// Dense layers read input rows directly; convolutions read patches.
#[derive(Debug)]
pub(super) struct LayerDiagonalCore {
    registry: FactorRegistry,
    kind: FactorKind,
    has_bias: bool,
    geometry: Option<ConvGeometry>,
    towers: Towers,
    phase: Phase<DiagonalBound>,
}

impl LayerDiagonalCore {
    pub(super) fn new(
        registry: &FactorRegistry,
        kind: FactorKind,
        has_bias: bool,
        geometry: Option<ConvGeometry>,
    ) -> Self {
        Self {
            registry: registry.clone(),
            kind,
            has_bias,
            geometry,
            towers: Towers::default(),
            phase: Phase::Open,
        }
    }

    pub(super) fn has_bias(&self) -> bool {
        self.has_bias
    }

    pub(super) fn set_geometry(&mut self, geometry: ConvGeometry) -> Result<()> {
        if self.towers.first().is_ok() {
            return Err(KfacError::not_initialized(
                "geometry must be set before registering towers",
            ));
        }
        self.geometry = Some(geometry);
        Ok(())
    }

    pub(super) fn towers(&self) -> &Towers {
        &self.towers
    }

    pub(super) fn register(&mut self, inputs: Input, outputs: Tensor, weight: f64) -> Result<()> {
        self.phase.ensure_open("register_additional_tower")?;
        self.towers.push(Tower {
            inputs: vec![inputs],
            outputs: vec![outputs],
            weight,
        })
    }

    fn row_source(&self, input: &Input) -> RowSource {
        match self.geometry {
            Some(geometry) => RowSource::Patches {
                input: input.tensor().clone(),
                geometry,
            },
            None => RowSource::from(input.clone()),
        }
    }

    pub(super) fn instantiate(&mut self, grads: &[Vec<Vec<Tensor>>], damping: f64) -> Result<()> {
        self.phase.ensure_open("instantiate_factors")?;
        check_damping(damping)?;
        self.towers.first()?;
        let grouped = self.towers.regroup_grads(grads)?;

        let mut spec = FactorSpec::new(self.kind).with_bias(self.has_bias);
        for (tower, per_use) in self.towers.iter().zip(grouped) {
            spec = spec.with_tower(FactorTower::Layer {
                inputs: self.row_source(&tower.inputs[0]),
                grads: per_use.concat(),
                weight: tower.weight,
            });
        }
        let factor = self.registry.make_or_get_factor(spec)?;
        debug!(kind = ?self.kind, towers = self.towers.len(), damping, "diagonal block instantiated");
        self.phase = Phase::Instantiated(DiagonalBound { factor, damping });
        Ok(())
    }

    fn layer_mat(&self, params: &Params, block: &str) -> Result<Array2<f64>> {
        check_bias(params, self.has_bias, block)?;
        layer_params_to_mat2d(params)
    }

    pub(super) fn multiply(&self, params: &Params, block: &str) -> Result<Params> {
        let bound = self.phase.bound("multiply")?;
        let mat = self.layer_mat(params, block)?;
        let cov = bound.factor.read().get_cov()?;
        if cov.dim() != mat.dim() {
            return Err(KfacError::shape_mismatch(
                format!("{block} params"),
                cov.shape().to_vec(),
                mat.shape().to_vec(),
            ));
        }
        mat2d_to_layer_params(params, &(mat * &cov))
    }

    pub(super) fn multiply_inverse(&self, params: &Params, block: &str) -> Result<Params> {
        let bound = self.phase.bound("multiply_inverse")?;
        let mat = self.layer_mat(params, block)?;
        let inverse = bound
            .factor
            .read()
            .get_inverse(&Damping::Constant(bound.damping))?;
        let flat: Array1<f64> = mat.iter().copied().collect();
        let out = inverse.matvec(&flat.view())?;
        let out = Array2::from_shape_vec(mat.dim(), out.to_vec())
            .map_err(|e| KfacError::invalid_argument("params", e.to_string()))?;
        mat2d_to_layer_params(params, &out)
    }

    pub(super) fn register_inverse(&self) -> Result<()> {
        let bound = self.phase.bound("register_inverse")?;
        bound
            .factor
            .write()
            .register_damping(Damping::Constant(bound.damping))
    }

    pub(super) fn full_fisher_block(&self) -> Result<Array2<f64>> {
        let bound = self.phase.bound("full_fisher_block")?;
        let cov = bound.factor.read().get_cov_as_linear_operator()?;
        Ok(cov.to_dense())
    }

    pub(super) fn factors(&self) -> Vec<FactorRef> {
        match &self.phase {
            Phase::Instantiated(b) => vec![b.factor.clone()],
            Phase::Open => Vec::new(),
        }
    }

    pub(super) fn damping(&self) -> Option<f64> {
        match &self.phase {
            Phase::Instantiated(b) => Some(b.damping),
            Phase::Open => None,
        }
    }
}

/// Diagonal approximation of a dense layer's Fisher block.
///
/// Each weight `w[i, j]` gets the variance `E[(a_i g_j)²]` of its per-example
/// gradient, with `a` the (bias-augmented) input and `g` the output gradient.
/// Inputs with extra middle dimensions (e.g. sequences) are summed per
/// example before squaring.
#[derive(Debug)]
pub struct FullyConnectedDiagonalFB {
    inner: LayerDiagonalCore,
}

impl FullyConnectedDiagonalFB {
    /// New block; `has_bias` selects the `Params` layout it accepts.
    pub fn new(registry: &FactorRegistry, has_bias: bool) -> Self {
        Self {
            inner: LayerDiagonalCore::new(
                registry,
                FactorKind::FullyConnectedDiagonal,
                has_bias,
                None,
            ),
        }
    }

    /// Whether the layer has a bias
    pub fn has_bias(&self) -> bool {
        self.inner.has_bias()
    }

    /// Add a tower with weight 1.
    pub fn register_additional_tower(&mut self, inputs: impl Into<Input>, outputs: Tensor) -> Result<()> {
        self.inner.register(inputs.into(), outputs, 1.0)
    }

    /// Add a tower whose examples count `weight` times.
    pub fn register_additional_tower_with_weight(
        &mut self,
        inputs: impl Into<Input>,
        outputs: Tensor,
        weight: f64,
    ) -> Result<()> {
        self.inner.register(inputs.into(), outputs, weight)
    }
}

impl FisherBlock for FullyConnectedDiagonalFB {
    fn name(&self) -> &'static str {
        "FullyConnectedDiagonalFB"
    }

    fn num_registered_towers(&self) -> usize {
        self.inner.towers().len()
    }

    fn tensors_to_compute_grads(&self) -> Vec<Vec<Tensor>> {
        self.inner.towers().outputs()
    }

    fn instantiate_factors(&mut self, grads: &[Vec<Vec<Tensor>>], damping: f64) -> Result<()> {
        self.inner.instantiate(grads, damping)
    }

    fn register_inverse(&self) -> Result<()> {
        self.inner.register_inverse()
    }

    fn multiply(&self, params: &Params) -> Result<Params> {
        self.inner.multiply(params, self.name())
    }

    fn multiply_inverse(&self, params: &Params) -> Result<Params> {
        self.inner.multiply_inverse(params, self.name())
    }

    fn full_fisher_block(&self) -> Result<Array2<f64>> {
        self.inner.full_fisher_block()
    }

    fn factors(&self) -> Vec<FactorRef> {
        self.inner.factors()
    }

    fn damping(&self) -> Option<f64> {
        self.inner.damping()
    }
}

/// How a tower's inputs map to layer uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Uses {
    /// One input/output pair per tower
    Single,
    /// One tensor per use
    PerTensor,
    /// One tensor whose rows pool every use; the count only rescales
    Folded(usize),
}

/// Kronecker-factored dense layer over one or more uses per tower
#[derive(Debug)]
struct FcKfacCore {
    registry: FactorRegistry,
    has_bias: bool,
    diagonal_input: bool,
    uses: Uses,
    step_weights: Option<Vec<f64>>,
    towers: Towers,
    phase: Phase<KroneckerCore>,
}

impl FcKfacCore {
    fn new(registry: &FactorRegistry, has_bias: bool, uses: Uses) -> Self {
        Self {
            registry: registry.clone(),
            has_bias,
            diagonal_input: false,
            uses,
            step_weights: None,
            towers: Towers::default(),
            phase: Phase::Open,
        }
    }

    fn num_uses(&self) -> usize {
        match self.uses {
            Uses::Single => 1,
            Uses::Folded(n) => n,
            Uses::PerTensor => self
                .step_weights
                .as_ref()
                .map(Vec::len)
                .or_else(|| self.towers.first().ok().map(|t| t.inputs.len()))
                .unwrap_or(0),
        }
    }

    fn register(&mut self, inputs: Vec<Input>, outputs: Vec<Tensor>, weight: f64) -> Result<()> {
        self.phase.ensure_open("register_additional_tower")?;
        let single = matches!(self.uses, Uses::Single | Uses::Folded(_));
        if single && (inputs.len() != 1 || outputs.len() != 1) {
            return Err(KfacError::shape_mismatch(
                "tower tensors",
                vec![1, 1],
                vec![inputs.len(), outputs.len()],
            ));
        }
        if let Some(steps) = &self.step_weights {
            if steps.len() != inputs.len() {
                return Err(KfacError::shape_mismatch(
                    "sequence steps",
                    vec![steps.len()],
                    vec![inputs.len()],
                ));
            }
        }
        self.towers.push(Tower {
            inputs,
            outputs,
            weight,
        })
    }

    fn step_weight(&self, step: usize) -> f64 {
        self.step_weights
            .as_ref()
            .and_then(|w| w.get(step).copied())
            .unwrap_or(1.0)
    }

    fn instantiate(&mut self, grads: &[Vec<Vec<Tensor>>], damping: f64) -> Result<()> {
        self.phase.ensure_open("instantiate_factors")?;
        check_damping(damping)?;
        self.towers.first()?;
        let grouped = self.towers.regroup_grads(grads)?;

        let mut input_spec = FactorSpec::new(FactorKind::FullyConnectedInput)
            .with_bias(self.has_bias)
            .with_diagonal(self.diagonal_input);
        let mut output_spec = FactorSpec::new(FactorKind::FullyConnectedOutput);
        for (tower, per_use) in self.towers.iter().zip(grouped) {
            for (step, (input, sources)) in tower.inputs.iter().zip(per_use).enumerate() {
                let weight = tower.weight * self.step_weight(step);
                input_spec = input_spec.with_tower(FactorTower::Rows {
                    sources: vec![RowSource::from(input.clone())],
                    weight,
                });
                output_spec = output_spec.with_tower(FactorTower::Rows {
                    sources: sources.into_iter().map(RowSource::Dense).collect(),
                    weight,
                });
            }
        }

        let input = self.registry.make_or_get_factor(input_spec)?;
        let output = self.registry.make_or_get_factor(output_spec)?;
        let uses = self.num_uses();
        debug!(uses, damping, diagonal_input = self.diagonal_input, "kronecker dense block instantiated");
        self.phase = Phase::Instantiated(KroneckerCore::new(input, output, damping, uses)?);
        Ok(())
    }

    fn multiply(&self, params: &Params, block: &str) -> Result<Params> {
        let core = self.phase.bound("multiply")?;
        check_bias(params, self.has_bias, block)?;
        let out = core.multiply(&layer_params_to_mat2d(params)?)?;
        mat2d_to_layer_params(params, &out)
    }

    fn multiply_inverse(&self, params: &Params, block: &str) -> Result<Params> {
        let core = self.phase.bound("multiply_inverse")?;
        check_bias(params, self.has_bias, block)?;
        let out = core.multiply_inverse(&layer_params_to_mat2d(params)?)?;
        mat2d_to_layer_params(params, &out)
    }

    fn multiply_inverse_sparse(&self, vector: &SparseRows) -> Result<SparseRows> {
        self.phase
            .bound("multiply_inverse")?
            .multiply_inverse_rows(vector)
    }

    fn factors(&self) -> Vec<FactorRef> {
        match &self.phase {
            Phase::Instantiated(core) => core.factors(),
            Phase::Open => Vec::new(),
        }
    }

    fn damping(&self) -> Option<f64> {
        match &self.phase {
            Phase::Instantiated(core) => Some(core.damping()),
            Phase::Open => None,
        }
    }
}

macro_rules! kronecker_dense_block {
    ($name:ident, sparse) => {
        kronecker_dense_block!(@impl $name, {
            fn multiply_inverse_sparse(&self, vector: &SparseRows) -> Result<SparseRows> {
                self.inner.multiply_inverse_sparse(vector)
            }
        });
    };
    ($name:ident) => {
        kronecker_dense_block!(@impl $name, {});
    };
    (@impl $name:ident, { $($extra:tt)* }) => {
        impl FisherBlock for $name {
            fn name(&self) -> &'static str {
                stringify!($name)
            }

            fn num_registered_towers(&self) -> usize {
                self.inner.towers.len()
            }

            fn tensors_to_compute_grads(&self) -> Vec<Vec<Tensor>> {
                self.inner.towers.outputs()
            }

            fn instantiate_factors(&mut self, grads: &[Vec<Vec<Tensor>>], damping: f64) -> Result<()> {
                self.inner.instantiate(grads, damping)
            }

            fn register_inverse(&self) -> Result<()> {
                self.inner.phase.bound("register_inverse")?.register_inverse()
            }

            fn multiply(&self, params: &Params) -> Result<Params> {
                self.inner.multiply(params, self.name())
            }

            fn multiply_inverse(&self, params: &Params) -> Result<Params> {
                self.inner.multiply_inverse(params, self.name())
            }

            $($extra)*

            fn full_fisher_block(&self) -> Result<Array2<f64>> {
                self.inner.phase.bound("full_fisher_block")?.full()
            }

            fn factors(&self) -> Vec<FactorRef> {
                self.inner.factors()
            }

            fn damping(&self) -> Option<f64> {
                self.inner.damping()
            }
        }
    };
}

/// K-FAC block of a dense layer: `E[a aᵀ] ⊗ E[g gᵀ]`.
///
/// Inputs may be dense or one-hot. With
/// [`with_diagonal_approx_for_input`](Self::with_diagonal_approx_for_input)
/// only the diagonal of the input factor is kept, which for one-hot inputs
/// is the per-token frequency; such blocks also take row-sparse values in
/// [`multiply_inverse_sparse`](FisherBlock::multiply_inverse_sparse).
#[derive(Debug)]
pub struct FullyConnectedKFACBasicFB {
    inner: FcKfacCore,
}

impl FullyConnectedKFACBasicFB {
    /// New block; `has_bias` selects the `Params` layout it accepts.
    pub fn new(registry: &FactorRegistry, has_bias: bool) -> Self {
        Self {
            inner: FcKfacCore::new(registry, has_bias, Uses::Single),
        }
    }

    /// Keep only the diagonal of the input factor.
    pub fn with_diagonal_approx_for_input(mut self, diagonal: bool) -> Self {
        self.inner.diagonal_input = diagonal;
        self
    }

    /// Whether the layer has a bias
    pub fn has_bias(&self) -> bool {
        self.inner.has_bias
    }

    /// Add a tower with weight 1.
    pub fn register_additional_tower(&mut self, inputs: impl Into<Input>, outputs: Tensor) -> Result<()> {
        self.inner.register(vec![inputs.into()], vec![outputs], 1.0)
    }

    /// Add a tower whose examples count `weight` times.
    pub fn register_additional_tower_with_weight(
        &mut self,
        inputs: impl Into<Input>,
        outputs: Tensor,
        weight: f64,
    ) -> Result<()> {
        self.inner.register(vec![inputs.into()], vec![outputs], weight)
    }
}

kronecker_dense_block!(FullyConnectedKFACBasicFB, sparse);

/// K-FAC block of a dense layer applied at every step of a sequence.
///
/// Each step contributes its rows as extra examples of both factors, and the
/// block is `T · (A ⊗ G)` for `T` steps. Steps can be weighted with
/// [`with_step_weights`](Self::with_step_weights).
#[derive(Debug)]
pub struct FullyConnectedSeriesFB {
    inner: FcKfacCore,
}

impl FullyConnectedSeriesFB {
    /// New block; `has_bias` selects the `Params` layout it accepts.
    pub fn new(registry: &FactorRegistry, has_bias: bool) -> Self {
        Self {
            inner: FcKfacCore::new(registry, has_bias, Uses::PerTensor),
        }
    }

    /// Weight each step's examples. The length fixes the number of steps.
    pub fn with_step_weights(mut self, weights: Vec<f64>) -> Result<Self> {
        if weights.is_empty() || weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            return Err(KfacError::invalid_argument(
                "step_weights",
                format!("need at least one positive weight, got {weights:?}"),
            ));
        }
        if let Ok(first) = self.inner.towers.first() {
            if first.inputs.len() != weights.len() {
                return Err(KfacError::shape_mismatch(
                    "sequence steps",
                    vec![first.inputs.len()],
                    vec![weights.len()],
                ));
            }
        }
        self.inner.step_weights = Some(weights);
        Ok(self)
    }

    /// Number of steps `T` (0 before the first tower)
    pub fn num_timesteps(&self) -> usize {
        self.inner.num_uses()
    }

    /// Add a tower: one `(input, output)` pair per step.
    pub fn register_additional_tower(&mut self, inputs: Vec<Tensor>, outputs: Vec<Tensor>) -> Result<()> {
        self.register_additional_tower_with_weight(inputs, outputs, 1.0)
    }

    /// Add a weighted tower.
    pub fn register_additional_tower_with_weight(
        &mut self,
        inputs: Vec<Tensor>,
        outputs: Vec<Tensor>,
        weight: f64,
    ) -> Result<()> {
        let inputs = inputs.into_iter().map(Input::Dense).collect();
        self.inner.register(inputs, outputs, weight)
    }
}

kronecker_dense_block!(FullyConnectedSeriesFB);

/// K-FAC block of a dense layer used several times per example, each use
/// treated as an independent sample: `uses · (A ⊗ G)`.
///
/// Uses are registered either as one tensor per use, or (after
/// [`with_num_uses`](Self::with_num_uses)) as a single tensor whose rows
/// pool every use.
#[derive(Debug)]
pub struct FullyConnectedMultiIndepFB {
    inner: FcKfacCore,
}

impl FullyConnectedMultiIndepFB {
    /// New block; `has_bias` selects the `Params` layout it accepts.
    pub fn new(registry: &FactorRegistry, has_bias: bool) -> Self {
        Self {
            inner: FcKfacCore::new(registry, has_bias, Uses::PerTensor),
        }
    }

    /// Keep only the diagonal of the input factor.
    pub fn with_diagonal_approx_for_input(mut self, diagonal: bool) -> Self {
        self.inner.diagonal_input = diagonal;
        self
    }

    /// Take towers as single tensors stacking `num_uses` uses.
    pub fn with_num_uses(mut self, num_uses: usize) -> Result<Self> {
        if num_uses == 0 {
            return Err(KfacError::invalid_argument("num_uses", "must be > 0"));
        }
        if self.inner.towers.first().is_ok() {
            return Err(KfacError::not_initialized(
                "with_num_uses must be set before registering towers",
            ));
        }
        self.inner.uses = Uses::Folded(num_uses);
        Ok(self)
    }

    /// Number of uses (0 before the first tower in per-tensor mode)
    pub fn num_uses(&self) -> usize {
        self.inner.num_uses()
    }

    /// Add a tower: one input and output per use, or a single stacked pair.
    pub fn register_additional_tower(&mut self, inputs: Vec<Input>, outputs: Vec<Tensor>) -> Result<()> {
        self.inner.register(inputs, outputs, 1.0)
    }

    /// Add a weighted tower.
    pub fn register_additional_tower_with_weight(
        &mut self,
        inputs: Vec<Input>,
        outputs: Vec<Tensor>,
        weight: f64,
    ) -> Result<()> {
        self.inner.register(inputs, outputs, weight)
    }
}

kronecker_dense_block!(FullyConnectedMultiIndepFB, sparse);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FactorConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};

    fn registry() -> FactorRegistry {
        FactorRegistry::with_config(FactorConfig::identity_init()).unwrap()
    }

    fn squared(t: &Tensor) -> Tensor {
        Tensor::new(t.value().mapv(|x| x * x))
    }

    #[test]
    fn test_tensors_to_compute_grads() {
        let outputs = Tensor::from(array![3.0, 4.0]);
        let mut block = FullyConnectedKFACBasicFB::new(&registry(), false);
        block
            .register_additional_tower(Tensor::from(array![1.0, 2.0]), outputs.clone())
            .unwrap();
        assert_eq!(block.tensors_to_compute_grads(), vec![vec![outputs]]);
    }

    #[test]
    fn test_identity_start_multiply_inverse() {
        let inputs = Tensor::from(array![[1.0, 2.0], [3.0, 4.0]]);
        let outputs = Tensor::from(array![[3.0, 4.0], [5.0, 6.0]]);
        let mut block = FullyConnectedKFACBasicFB::new(&registry(), false);
        block
            .register_additional_tower(inputs, outputs.clone())
            .unwrap();
        block
            .instantiate_factors(&[vec![vec![squared(&outputs)]]], 0.5)
            .unwrap();
        for f in block.factors() {
            f.write().instantiate_cov_variables().unwrap();
        }
        block.register_inverse().unwrap();
        for f in block.factors() {
            f.write().make_inverse_update().unwrap();
        }

        let v = Params::Weight(array![[2.0, 3.0], [4.0, 5.0]].into_dyn());
        let out = block.multiply_inverse(&v).unwrap();
        let expected = array![[0.686291, 1.029437], [1.372583, 1.715729]].into_dyn();
        for (a, b) in out.weight().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_bias_layout_enforced() {
        let inputs = Tensor::from(array![[1.0, 2.0]]);
        let outputs = Tensor::from(array![[3.0]]);
        let mut block = FullyConnectedKFACBasicFB::new(&registry(), true);
        block
            .register_additional_tower(inputs, outputs.clone())
            .unwrap();
        block
            .instantiate_factors(&[vec![vec![outputs.clone()]]], 0.0)
            .unwrap();
        let weight_only = Params::Weight(Array2::<f64>::zeros((2, 1)).into_dyn());
        assert!(matches!(
            block.multiply(&weight_only),
            Err(KfacError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_folded_uses_accept_any_row_count() {
        let vocab_size = 5;
        let mut block = FullyConnectedMultiIndepFB::new(&registry(), false)
            .with_diagonal_approx_for_input(true)
            .with_num_uses(2)
            .unwrap();
        let inputs = Input::one_hot(Tensor::from(array![[0.0, 1.0], [1.0, 2.0], [2.0, 3.0]]), vocab_size).unwrap();
        let outputs = Tensor::from(array![[0.0], [1.0], [2.0]]);
        block
            .register_additional_tower(vec![inputs], vec![outputs.clone()])
            .unwrap();
        block
            .instantiate_factors(&[vec![vec![squared(&outputs)]]], 0.0)
            .unwrap();
        assert_eq!(block.num_uses(), 2);
        assert_eq!(block.factors().len(), 2);

        let err = FullyConnectedMultiIndepFB::new(&registry(), false)
            .with_num_uses(2)
            .unwrap()
            .register_additional_tower(
                vec![Input::Dense(Tensor::zeros(&[3, 2])), Input::Dense(Tensor::zeros(&[3, 2]))],
                vec![Tensor::zeros(&[3, 1]), Tensor::zeros(&[3, 1])],
            )
            .unwrap_err();
        assert!(matches!(err, KfacError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_series_counts_steps() {
        let registry = registry();
        let mut block = FullyConnectedSeriesFB::new(&registry, true);
        let steps: Vec<Tensor> = (0..3).map(|_| Tensor::zeros(&[2, 2])).collect();
        let outs: Vec<Tensor> = (0..3).map(|_| Tensor::zeros(&[2, 2])).collect();
        block.register_additional_tower(steps, outs.clone()).unwrap();
        assert_eq!(block.num_timesteps(), 3);
        assert_eq!(block.tensors_to_compute_grads(), vec![outs.clone()]);
        block.instantiate_factors(&[vec![outs]], 0.5).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(block.factors()[0].read().num_towers(), 3);
    }
}
