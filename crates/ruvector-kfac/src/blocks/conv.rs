//! Blocks for convolution layers (NHWC, kernels `[kh, kw, cin, cout]`)

use ndarray::{Array2, Array4, ArrayD, Ix4};
use tracing::debug;

use crate::error::{check_damping, KfacError, Result};
use crate::factors::{FactorKind, FactorRef, FactorSpec, FactorTower, RowSource};
use crate::params::{layer_params_to_mat2d, mat2d_to_layer_params, Params};
use crate::patches::{spatial_dims, ConvGeometry, Padding};
use crate::registry::FactorRegistry;
use crate::tensor::{Input, Tensor};

use super::fully_connected::LayerDiagonalCore;
use super::{check_bias, check_kernel, FisherBlock, KroneckerCore, Phase, Tower, Towers};

/// Check a tower against the kernel and return its output locations.
fn check_conv_tower(kernel: &[usize], geometry: &ConvGeometry, inputs: &Tensor, outputs: &Tensor) -> Result<usize> {
    let (cin, cout) = match kernel {
        [.., cin, cout] => (*cin, *cout),
        _ => return Err(KfacError::invalid_argument("params", "kernel rank too small")),
    };
    let in_shape = inputs.shape();
    let (h, w, c) = spatial_dims(&in_shape)?;
    if c != cin {
        return Err(KfacError::shape_mismatch("conv input channels", vec![cin], vec![c]));
    }
    let (oh, ow) = geometry.output_size(h, w)?;
    let expected = if in_shape.len() == 4 {
        vec![in_shape[0], oh, ow, cout]
    } else {
        vec![in_shape[0], ow, cout]
    };
    let got = outputs.shape();
    if got != expected {
        return Err(KfacError::shape_mismatch("conv outputs", expected, got));
    }
    Ok(oh * ow)
}

fn kernel_rank_matches(kernel: &[usize], inputs: &Tensor) -> Result<()> {
    let rank = inputs.ndim();
    if kernel.len() != rank {
        return Err(KfacError::shape_mismatch(
            "conv input rank",
            vec![kernel.len()],
            vec![rank],
        ));
    }
    Ok(())
}

/// Diagonal approximation of a convolution's Fisher block.
///
/// Per example the kernel gradient `Σ_loc patch_loc ⊗ g_loc` is squared
/// elementwise, then averaged over examples. A bias is treated as an extra
/// constant-1 patch entry.
#[derive(Debug)]
pub struct ConvDiagonalFB {
    inner: LayerDiagonalCore,
    kernel: Vec<usize>,
    geometry: ConvGeometry,
}

impl ConvDiagonalFB {
    /// Block for the kernel (and optional bias) in `params`, unit strides.
    pub fn new(registry: &FactorRegistry, params: &Params<Tensor>, padding: Padding) -> Result<Self> {
        let kernel = params.weight().shape();
        let geometry = ConvGeometry::from_kernel_shape(&kernel, padding)?;
        let mut inner =
            LayerDiagonalCore::new(registry, FactorKind::ConvDiagonal, params.has_bias(), None);
        inner.set_geometry(geometry)?;
        Ok(Self {
            inner,
            kernel,
            geometry,
        })
    }

    /// Set strides `[height, width]`; only before towers are registered.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Result<Self> {
        self.geometry = self.geometry.with_strides(strides)?;
        self.inner.set_geometry(self.geometry)?;
        Ok(self)
    }

    /// Convolution geometry
    pub fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    /// Add a tower with weight 1.
    pub fn register_additional_tower(&mut self, inputs: Tensor, outputs: Tensor) -> Result<()> {
        self.register_additional_tower_with_weight(inputs, outputs, 1.0)
    }

    /// Add a tower whose examples count `weight` times.
    pub fn register_additional_tower_with_weight(
        &mut self,
        inputs: Tensor,
        outputs: Tensor,
        weight: f64,
    ) -> Result<()> {
        kernel_rank_matches(&self.kernel, &inputs)?;
        check_conv_tower(&self.kernel, &self.geometry, &inputs, &outputs)?;
        self.inner.register(Input::Dense(inputs), outputs, weight)
    }
}

impl FisherBlock for ConvDiagonalFB {
    fn name(&self) -> &'static str {
        "ConvDiagonalFB"
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
        check_kernel(params, &self.kernel, self.name())?;
        self.inner.multiply(params, self.name())
    }

    fn multiply_inverse(&self, params: &Params) -> Result<Params> {
        check_kernel(params, &self.kernel, self.name())?;
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

/// Kronecker-factored convolution shared by the plain and depthwise blocks
#[derive(Debug)]
struct ConvKfcCore {
    registry: FactorRegistry,
    kernel: Vec<usize>,
    has_bias: bool,
    geometry: ConvGeometry,
    towers: Towers,
    num_locations: Option<usize>,
    phase: Phase<KroneckerCore>,
}

impl ConvKfcCore {
    fn new(registry: &FactorRegistry, kernel: Vec<usize>, has_bias: bool, padding: Padding) -> Result<Self> {
        Ok(Self {
            registry: registry.clone(),
            geometry: ConvGeometry::from_kernel_shape(&kernel, padding)?,
            kernel,
            has_bias,
            towers: Towers::default(),
            num_locations: None,
            phase: Phase::Open,
        })
    }

    fn set_strides(&mut self, strides: [usize; 2]) -> Result<()> {
        if self.towers.first().is_ok() {
            return Err(KfacError::not_initialized(
                "strides must be set before registering towers",
            ));
        }
        self.geometry = self.geometry.with_strides(strides)?;
        Ok(())
    }

    fn register(&mut self, inputs: Tensor, outputs: Tensor, weight: f64) -> Result<()> {
        self.phase.ensure_open("register_additional_tower")?;
        kernel_rank_matches(&self.kernel, &inputs)?;
        let locations = check_conv_tower(&self.kernel, &self.geometry, &inputs, &outputs)?;
        self.towers.push(Tower {
            inputs: vec![Input::Dense(inputs)],
            outputs: vec![outputs],
            weight,
        })?;
        self.num_locations.get_or_insert(locations);
        Ok(())
    }

    fn instantiate(&mut self, grads: &[Vec<Vec<Tensor>>], damping: f64) -> Result<()> {
        self.phase.ensure_open("instantiate_factors")?;
        check_damping(damping)?;
        let locations = self
            .num_locations
            .ok_or_else(|| KfacError::not_initialized("no towers registered"))?;
        let grouped = self.towers.regroup_grads(grads)?;

        let mut input_spec = FactorSpec::new(FactorKind::ConvInput).with_bias(self.has_bias);
        let mut output_spec = FactorSpec::new(FactorKind::ConvOutput);
        for (tower, per_use) in self.towers.iter().zip(grouped) {
            input_spec = input_spec.with_tower(FactorTower::Rows {
                sources: vec![RowSource::Patches {
                    input: tower.inputs[0].tensor().clone(),
                    geometry: self.geometry,
                }],
                weight: tower.weight,
            });
            output_spec = output_spec.with_tower(FactorTower::Rows {
                sources: per_use.concat().into_iter().map(RowSource::Dense).collect(),
                weight: tower.weight,
            });
        }

        let input = self.registry.make_or_get_factor(input_spec)?;
        let output = self.registry.make_or_get_factor(output_spec)?;
        debug!(locations, damping, geometry = ?self.geometry, "kronecker conv block instantiated");
        self.phase = Phase::Instantiated(KroneckerCore::new(input, output, damping, locations)?);
        Ok(())
    }

    fn apply(&self, params: &Params, block: &str, inverse: bool) -> Result<Params> {
        let op = if inverse { "multiply_inverse" } else { "multiply" };
        let core = self.phase.bound(op)?;
        check_bias(params, self.has_bias, block)?;
        check_kernel(params, &self.kernel, block)?;
        let mat = layer_params_to_mat2d(params)?;
        let out = if inverse {
            core.multiply_inverse(&mat)?
        } else {
            core.multiply(&mat)?
        };
        mat2d_to_layer_params(params, &out)
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

/// K-FAC block of a convolution (KFC).
///
/// The input factor is the second moment of im2col patches over all
/// locations, the output factor that of per-location output gradients, and
/// the block is `locations · (A ⊗ G)` with damping normalized by the number
/// of output locations per example.
#[derive(Debug)]
pub struct ConvKFCBasicFB {
    inner: ConvKfcCore,
}

impl ConvKFCBasicFB {
    /// Block for the kernel (and optional bias) in `params`, unit strides.
    pub fn new(registry: &FactorRegistry, params: &Params<Tensor>, padding: Padding) -> Result<Self> {
        Ok(Self {
            inner: ConvKfcCore::new(registry, params.weight().shape(), params.has_bias(), padding)?,
        })
    }

    /// Set strides `[height, width]`; only before towers are registered.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Result<Self> {
        self.inner.set_strides(strides)?;
        Ok(self)
    }

    /// Whether the layer has a bias
    pub fn has_bias(&self) -> bool {
        self.inner.has_bias
    }

    /// Convolution geometry
    pub fn geometry(&self) -> ConvGeometry {
        self.inner.geometry
    }

    /// Output locations per example (known after the first tower)
    pub fn num_locations(&self) -> Option<usize> {
        self.inner.num_locations
    }

    /// Add a tower with weight 1.
    pub fn register_additional_tower(&mut self, inputs: Tensor, outputs: Tensor) -> Result<()> {
        self.inner.register(inputs, outputs, 1.0)
    }

    /// Add a tower whose examples count `weight` times.
    pub fn register_additional_tower_with_weight(
        &mut self,
        inputs: Tensor,
        outputs: Tensor,
        weight: f64,
    ) -> Result<()> {
        self.inner.register(inputs, outputs, weight)
    }
}

impl FisherBlock for ConvKFCBasicFB {
    fn name(&self) -> &'static str {
        "ConvKFCBasicFB"
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
        self.inner.apply(params, self.name(), false)
    }

    fn multiply_inverse(&self, params: &Params) -> Result<Params> {
        self.inner.apply(params, self.name(), true)
    }

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

/// K-FAC block of a depthwise convolution.
///
/// A depthwise kernel `[kh, kw, cin, m]` is the conv kernel
/// `[kh, kw, cin, cin·m]` that is zero except at `[.., c, c·m + k]`. The
/// block applies [`ConvKFCBasicFB`] statistics of that kernel: values are
/// embedded, multiplied, and the depthwise entries read back.
#[derive(Debug)]
pub struct DepthwiseConvKFCBasicFB {
    inner: ConvKfcCore,
    multiplier: usize,
}

impl DepthwiseConvKFCBasicFB {
    /// Block for a depthwise kernel `[kh, kw, cin, m]` (bias `[cin·m]`).
    pub fn new(registry: &FactorRegistry, params: &Params<Tensor>, padding: Padding) -> Result<Self> {
        let shape = params.weight().shape();
        let &[kh, kw, cin, m] = shape.as_slice() else {
            return Err(KfacError::invalid_argument(
                "params",
                format!("depthwise kernels are [kh, kw, cin, m], got {shape:?}"),
            ));
        };
        Ok(Self {
            inner: ConvKfcCore::new(registry, vec![kh, kw, cin, cin * m], params.has_bias(), padding)?,
            multiplier: m,
        })
    }

    /// Set strides `[height, width]`; only before towers are registered.
    pub fn with_strides(mut self, strides: [usize; 2]) -> Result<Self> {
        self.inner.set_strides(strides)?;
        Ok(self)
    }

    /// Channel multiplier `m`
    pub fn channel_multiplier(&self) -> usize {
        self.multiplier
    }

    /// Add a tower: inputs `[b, h, w, cin]`, outputs `[b, oh, ow, cin·m]`.
    pub fn register_additional_tower(&mut self, inputs: Tensor, outputs: Tensor) -> Result<()> {
        self.inner.register(inputs, outputs, 1.0)
    }

    /// Add a tower whose examples count `weight` times.
    pub fn register_additional_tower_with_weight(
        &mut self,
        inputs: Tensor,
        outputs: Tensor,
        weight: f64,
    ) -> Result<()> {
        self.inner.register(inputs, outputs, weight)
    }

    fn embed(&self, params: &Params) -> Result<Params> {
        let m = self.multiplier;
        let weight = params
            .weight()
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| KfacError::invalid_argument("params", e.to_string()))?;
        let (kh, kw, cin, got_m) = weight.dim();
        if got_m != m || self.inner.kernel[..3] != [kh, kw, cin] {
            return Err(KfacError::shape_mismatch(
                "depthwise kernel",
                vec![self.inner.kernel[0], self.inner.kernel[1], self.inner.kernel[2], m],
                vec![kh, kw, cin, got_m],
            ));
        }
        let mut full = Array4::<f64>::zeros((kh, kw, cin, cin * m));
        for ((i, j, c, k), &v) in weight.indexed_iter() {
            full[[i, j, c, c * m + k]] = v;
        }
        let full = full.into_dyn();
        Ok(match params.bias() {
            Some(b) => Params::WeightAndBias(full, b.clone()),
            None => Params::Weight(full),
        })
    }

    fn extract(&self, embedded: Params) -> Result<Params> {
        let m = self.multiplier;
        let full = embedded
            .weight()
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|e| KfacError::invalid_argument("params", e.to_string()))?;
        let (kh, kw, cin, _) = full.dim();
        let weight: ArrayD<f64> =
            Array4::from_shape_fn((kh, kw, cin, m), |(i, j, c, k)| full[[i, j, c, c * m + k]])
                .into_dyn();
        Ok(match embedded.bias() {
            Some(b) => Params::WeightAndBias(weight, b.clone()),
            None => Params::Weight(weight),
        })
    }
}

impl FisherBlock for DepthwiseConvKFCBasicFB {
    fn name(&self) -> &'static str {
        "DepthwiseConvKFCBasicFB"
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
        self.inner.phase.bound("multiply")?;
        let out = self.inner.apply(&self.embed(params)?, self.name(), false)?;
        self.extract(out)
    }

    fn multiply_inverse(&self, params: &Params) -> Result<Params> {
        self.inner.phase.bound("multiply_inverse")?;
        let out = self.inner.apply(&self.embed(params)?, self.name(), true)?;
        self.extract(out)
    }

    /// Block of the embedded conv kernel, over `kh·kw·cin·cin·m (+cin·m)`
    /// parameters.
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
