//! Covariance factors
//!
//! A [`Factor`] owns one moving-average second-moment statistic, built from
//! the towers registered on it, and a cache of damped inverses keyed by
//! [`Damping`]. Factors are created and deduplicated by the
//! [`FactorRegistry`](crate::FactorRegistry) and shared between blocks as
//! [`FactorRef`] handles.
//!
//! ## Lifecycle
//!
//! 1. Created from a [`FactorSpec`] (towers fixed at creation, more may be
//!    added until the first covariance update)
//! 2. `instantiate_cov_variables` / `instantiate_inv_variables` allocate the
//!    accumulator and inverse slots (the update methods do this on demand)
//! 3. `make_covariance_update` folds the current tower values into the
//!    moving average
//! 4. `make_inverse_update` recomputes every stale inverse slot
//!
//! ## Storage
//!
//! | Layout        | Stored as        | Operator                       |
//! |---------------|------------------|--------------------------------|
//! | `Full(n)`     | `[n, n]`         | `FullMatrix`                   |
//! | `Diagonal(n)` | `[n, 1]`         | `Diagonal`                     |
//! | `Elementwise` | `[rows, cols]`   | `Diagonal` of the row-major flattening |

mod moving_average;
pub(crate) mod statistics;

pub use moving_average::MovingAverage;
pub(crate) use moving_average::check_ema;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ndarray::{Array1, Array2, Array3, ArrayView2};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::FactorConfig;
use crate::damping::{compute_pi_adjusted_damping, Damping, DampingKey, FactorSide};
use crate::error::{check_damping, KfacError, Result};
use crate::linear_operator::LinearOperator;
use crate::patches::{spatial_dims, ConvGeometry, Padding};
use crate::tensor::{Input, Tensor};
use crate::utils::{add_to_diagonal, damped_reciprocal, spd_inverse};

use statistics::{dense_examples, gradient_moment, layer_diagonal_sum, one_hot_counts, row_moment};

/// Shared handle to a factor
pub type FactorRef = Arc<RwLock<Factor>>;

static NEXT_FACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a factor within the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactorId(u64);

impl FactorId {
    fn next() -> Self {
        Self(NEXT_FACTOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "factor#{}", self.0)
    }
}

/// Statistic a factor estimates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FactorKind {
    /// `E[g gᵀ]` of the flattened parameter gradient
    NaiveFull,
    /// `E[g²]` of the flattened parameter gradient
    NaiveDiagonal,
    /// Per-weight `E[(a ⊗ g)²]` of a dense layer
    FullyConnectedDiagonal,
    /// Per-weight `E[(Σ_loc patch ⊗ g)²]` of a convolution
    ConvDiagonal,
    /// `E[a aᵀ]` of dense-layer inputs
    FullyConnectedInput,
    /// `E[s sᵀ]` of dense-layer output gradients
    FullyConnectedOutput,
    /// `E[p pᵀ]` over convolution patches
    ConvInput,
    /// `E[s sᵀ]` over per-location convolution output gradients
    ConvOutput,
}

impl FactorKind {
    fn accepts(self, tower: &FactorTower) -> bool {
        use FactorKind::*;
        matches!(
            (self, tower),
            (NaiveFull | NaiveDiagonal, FactorTower::Gradients { .. })
                | (FullyConnectedDiagonal | ConvDiagonal, FactorTower::Layer { .. })
                | (
                    FullyConnectedInput | FullyConnectedOutput | ConvInput | ConvOutput,
                    FactorTower::Rows { .. }
                )
        )
    }

    fn uses_bias(self) -> bool {
        use FactorKind::*;
        matches!(
            self,
            FullyConnectedDiagonal | ConvDiagonal | FullyConnectedInput | ConvInput
        )
    }
}

/// Source of example rows for a statistic
#[derive(Debug, Clone, PartialEq)]
pub enum RowSource {
    /// Dense values; see [`Input::Dense`]
    Dense(Tensor),
    /// Multi-hot rows over a vocabulary; see [`Input::OneHot`]
    OneHot {
        /// Index tensor
        indices: Tensor,
        /// Vocabulary size
        depth: usize,
    },
    /// im2col patches of an NHWC convolution input
    Patches {
        /// Convolution input
        input: Tensor,
        /// Geometry the patches are extracted with
        geometry: ConvGeometry,
    },
}

impl From<Input> for RowSource {
    fn from(input: Input) -> Self {
        match input {
            Input::Dense(t) => Self::Dense(t),
            Input::OneHot { indices, depth } => Self::OneHot { indices, depth },
        }
    }
}

impl From<Tensor> for RowSource {
    fn from(tensor: Tensor) -> Self {
        Self::Dense(tensor)
    }
}

impl RowSource {
    /// Underlying tensor handle
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Dense(t) => t,
            Self::OneHot { indices, .. } => indices,
            Self::Patches { input, .. } => input,
        }
    }

    /// Width of one row
    pub fn feature_dim(&self) -> Result<usize> {
        match self {
            Self::Dense(t) => Ok(t.shape().last().copied().unwrap_or(1)),
            Self::OneHot { depth, .. } => Ok(*depth),
            Self::Patches { input, geometry } => {
                let (_, _, channels) = spatial_dims(&input.shape())?;
                Ok(geometry.patch_dim(channels))
            }
        }
    }

    /// Examples `[batch, locations, features]` of the current value
    pub fn examples(&self) -> Result<Array3<f64>> {
        match self {
            Self::Dense(t) => dense_examples(&t.read()),
            Self::OneHot { indices, depth } => {
                let counts = one_hot_counts(&indices.read(), *depth)?;
                let mut out = Array3::<f64>::zeros((counts.len(), 1, *depth));
                for (n, example) in counts.iter().enumerate() {
                    for &(i, c) in example {
                        out[[n, 0, i]] = c;
                    }
                }
                Ok(out)
            }
            Self::Patches { input, geometry } => geometry.extract_patches(&input.read()),
        }
    }

    fn key_parts(&self, parts: &mut Vec<u64>) {
        match self {
            Self::Dense(t) => parts.extend([0, t.id().get()]),
            Self::OneHot { indices, depth } => {
                parts.extend([1, indices.id().get(), *depth as u64]);
            }
            Self::Patches { input, geometry } => {
                let padding = match geometry.padding {
                    Padding::Same => 0,
                    Padding::Valid => 1,
                };
                parts.extend([
                    2,
                    input.id().get(),
                    geometry.kernel[0] as u64,
                    geometry.kernel[1] as u64,
                    geometry.strides[0] as u64,
                    geometry.strides[1] as u64,
                    padding,
                ]);
            }
        }
    }
}

/// One tower's contribution to a factor
#[derive(Debug, Clone, PartialEq)]
pub enum FactorTower {
    /// Parameter gradients of independent loss samples; each source holds
    /// one gradient per parameter tensor
    Gradients {
        /// Gradient sources
        sources: Vec<Vec<Tensor>>,
        /// Number of examples the gradients were taken over
        batch_size: usize,
    },
    /// Layer inputs with the output gradient of each source
    Layer {
        /// Layer inputs
        inputs: RowSource,
        /// Output gradients, one per source
        grads: Vec<Tensor>,
        /// Tower weight
        weight: f64,
    },
    /// Rows whose second moment is summed over sources
    Rows {
        /// Row sources (inputs, or one output gradient per source)
        sources: Vec<RowSource>,
        /// Tower weight
        weight: f64,
    },
}

impl FactorTower {
    fn weight(&self) -> f64 {
        match self {
            Self::Gradients { .. } => 1.0,
            Self::Layer { weight, .. } | Self::Rows { weight, .. } => *weight,
        }
    }

    fn key_parts(&self) -> Vec<u64> {
        let mut parts = Vec::new();
        match self {
            Self::Gradients {
                sources,
                batch_size,
            } => {
                parts.extend([0, *batch_size as u64]);
                for source in sources {
                    parts.push(source.len() as u64);
                    parts.extend(source.iter().map(|t| t.id().get()));
                }
            }
            Self::Layer {
                inputs,
                grads,
                weight,
            } => {
                parts.extend([1, weight.to_bits()]);
                inputs.key_parts(&mut parts);
                parts.extend(grads.iter().map(|t| t.id().get()));
            }
            Self::Rows { sources, weight } => {
                parts.extend([2, weight.to_bits()]);
                for source in sources {
                    source.key_parts(&mut parts);
                }
            }
        }
        parts
    }
}

/// Canonical identity used to share factors between blocks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FactorKey {
    kind: FactorKind,
    has_bias: bool,
    diagonal: bool,
    towers: Vec<Vec<u64>>,
}

impl FactorKey {
    /// Statistic kind
    pub fn kind(&self) -> FactorKind {
        self.kind
    }
}

/// Everything needed to create (or find) a factor
#[derive(Debug, Clone, PartialEq)]
pub struct FactorSpec {
    /// Statistic kind
    pub kind: FactorKind,
    /// Append a constant-1 feature (input-side kinds only)
    pub has_bias: bool,
    /// Keep only the diagonal (`Rows` kinds only)
    pub diagonal: bool,
    /// Initial towers
    pub towers: Vec<FactorTower>,
}

impl FactorSpec {
    /// Spec with no towers
    pub fn new(kind: FactorKind) -> Self {
        Self {
            kind,
            has_bias: false,
            diagonal: false,
            towers: Vec::new(),
        }
    }

    /// Set the bias flag
    pub fn with_bias(mut self, has_bias: bool) -> Self {
        self.has_bias = has_bias;
        self
    }

    /// Set the diagonal flag
    pub fn with_diagonal(mut self, diagonal: bool) -> Self {
        self.diagonal = diagonal;
        self
    }

    /// Add a tower
    pub fn with_tower(mut self, tower: FactorTower) -> Self {
        self.towers.push(tower);
        self
    }

    /// Canonical key
    pub fn key(&self) -> FactorKey {
        FactorKey {
            kind: self.kind,
            has_bias: self.has_bias,
            diagonal: self.diagonal,
            towers: self.towers.iter().map(FactorTower::key_parts).collect(),
        }
    }
}

/// Storage shape of a factor's statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovLayout {
    /// Dense `[n, n]`
    Full(usize),
    /// Diagonal of an `[n, n]` matrix, stored `[n, 1]`
    Diagonal(usize),
    /// One variance per entry of a `[rows, cols]` parameter matrix
    Elementwise(usize, usize),
}

impl CovLayout {
    /// Shape of the stored value
    pub fn storage_shape(&self) -> (usize, usize) {
        match *self {
            Self::Full(n) => (n, n),
            Self::Diagonal(n) => (n, 1),
            Self::Elementwise(r, c) => (r, c),
        }
    }

    /// Side length of the operator the statistic represents
    pub fn dimension(&self) -> usize {
        match *self {
            Self::Full(n) | Self::Diagonal(n) => n,
            Self::Elementwise(r, c) => r * c,
        }
    }

    fn initial(&self, zero: bool) -> Array2<f64> {
        let shape = self.storage_shape();
        match (self, zero) {
            (_, true) => Array2::zeros(shape),
            (Self::Full(n), false) => Array2::eye(*n),
            (_, false) => Array2::ones(shape),
        }
    }

    fn operator(&self, value: Array2<f64>) -> Result<LinearOperator> {
        match self {
            Self::Full(_) => LinearOperator::full(value),
            _ => LinearOperator::diagonal(flatten(&value)),
        }
    }

    fn identity_inverse(&self) -> LinearOperator {
        match *self {
            Self::Full(n) => LinearOperator::FullMatrix(Array2::eye(n)),
            _ => LinearOperator::Diagonal(Array1::ones(self.dimension())),
        }
    }

    fn damped_inverse(&self, value: &Array2<f64>, damping: f64) -> Result<LinearOperator> {
        match self {
            Self::Full(_) => {
                let damped = add_to_diagonal(&value.view(), damping)?;
                Ok(LinearOperator::FullMatrix(spd_inverse(&damped.view())?))
            }
            _ => Ok(LinearOperator::Diagonal(damped_reciprocal(
                &flatten(value),
                damping,
            )?)),
        }
    }
}

fn flatten(value: &Array2<f64>) -> Array1<f64> {
    value.iter().copied().collect()
}

#[derive(Debug, Clone)]
struct InverseSlot {
    operator: LinearOperator,
    /// Covariance generation the slot was computed from; `None` for a seed
    source_generation: Option<u64>,
    damping_value: f64,
}

/// Moving-average covariance statistic with cached damped inverses
pub struct Factor {
    id: FactorId,
    key: FactorKey,
    config: FactorConfig,
    layout: Option<CovLayout>,
    towers: Vec<FactorTower>,
    cov: Option<MovingAverage>,
    generation: u64,
    dampings: Vec<Damping>,
    partners: HashMap<FactorId, Weak<RwLock<Factor>>>,
    inverses: HashMap<DampingKey, InverseSlot>,
    inverses_instantiated: bool,
}

impl fmt::Debug for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factor")
            .field("id", &self.id)
            .field("kind", &self.key.kind)
            .field("layout", &self.layout)
            .field("towers", &self.towers.len())
            .field("generation", &self.generation)
            .field("dampings", &self.dampings)
            .finish()
    }
}

impl Factor {
    /// Create a factor from a spec; every tower in the spec is registered.
    pub fn new(spec: FactorSpec, config: FactorConfig) -> Result<Self> {
        config.validate()?;
        if spec.towers.is_empty() {
            return Err(KfacError::invalid_argument(
                "towers",
                "a factor needs at least one tower",
            ));
        }
        if spec.has_bias && !spec.kind.uses_bias() {
            return Err(KfacError::invalid_argument(
                "has_bias",
                format!("{:?} factors have no bias feature", spec.kind),
            ));
        }

        let key = spec.key();
        let mut factor = Self {
            id: FactorId::next(),
            key,
            config,
            layout: None,
            towers: Vec::new(),
            cov: None,
            generation: 0,
            dampings: Vec::new(),
            partners: HashMap::new(),
            inverses: HashMap::new(),
            inverses_instantiated: false,
        };
        for tower in spec.towers {
            factor.register_tower(tower)?;
        }
        FactorConfig::mark_factor_created();
        Ok(factor)
    }

    /// Identity of this factor
    pub fn id(&self) -> FactorId {
        self.id
    }

    /// Key this factor was created under
    pub fn key(&self) -> &FactorKey {
        &self.key
    }

    /// Statistic kind
    pub fn kind(&self) -> FactorKind {
        self.key.kind
    }

    /// Storage layout, known once a tower is registered
    pub fn layout(&self) -> Option<CovLayout> {
        self.layout
    }

    /// Number of registered towers
    pub fn num_towers(&self) -> usize {
        self.towers.len()
    }

    /// Number of covariance updates applied so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Dampings inverses are maintained for
    pub fn registered_dampings(&self) -> &[Damping] {
        &self.dampings
    }

    /// Configuration the factor was created with
    pub fn config(&self) -> &FactorConfig {
        &self.config
    }

    /// Add a tower. Its feature dimensions must match earlier towers, and no
    /// covariance update may have run yet.
    pub fn register_tower(&mut self, tower: FactorTower) -> Result<()> {
        if self.generation > 0 {
            return Err(KfacError::not_initialized(format!(
                "{}: towers are frozen after the first covariance update",
                self.id
            )));
        }
        if !self.key.kind.accepts(&tower) {
            return Err(KfacError::invalid_argument(
                "tower",
                format!("{:?} factors cannot take this tower type", self.key.kind),
            ));
        }
        let weight = tower.weight();
        if !weight.is_finite() || weight < 0.0 {
            return Err(KfacError::invalid_argument(
                "weight",
                format!("tower weight must be finite and non-negative, got {weight}"),
            ));
        }

        let layout = self.tower_layout(&tower)?;
        if let Some(existing) = self.layout {
            if existing != layout {
                let (er, ec) = existing.storage_shape();
                let (gr, gc) = layout.storage_shape();
                return Err(KfacError::shape_mismatch(
                    format!("{} tower", self.id),
                    vec![er, ec],
                    vec![gr, gc],
                ));
            }
        }
        self.layout = Some(layout);
        self.towers.push(tower);
        debug!(
            factor = %self.id,
            kind = ?self.key.kind,
            towers = self.towers.len(),
            "registered factor tower"
        );
        Ok(())
    }

    fn tower_layout(&self, tower: &FactorTower) -> Result<CovLayout> {
        let bias = usize::from(self.key.has_bias);
        match tower {
            FactorTower::Gradients {
                sources,
                batch_size,
            } => {
                let first = sources.first().ok_or_else(|| {
                    KfacError::invalid_argument("sources", "need at least one gradient source")
                })?;
                if *batch_size == 0 {
                    return Err(KfacError::invalid_argument("batch_size", "must be > 0"));
                }
                let shapes: Vec<Vec<usize>> = first.iter().map(Tensor::shape).collect();
                for source in sources.iter().skip(1) {
                    let other: Vec<Vec<usize>> = source.iter().map(Tensor::shape).collect();
                    if other != shapes {
                        return Err(KfacError::shape_mismatch(
                            "gradient sources",
                            shapes.concat(),
                            other.concat(),
                        ));
                    }
                }
                let n: usize = first.iter().map(Tensor::len).sum();
                Ok(match self.key.kind {
                    FactorKind::NaiveDiagonal => CovLayout::Diagonal(n),
                    _ => CovLayout::Full(n),
                })
            }
            FactorTower::Layer { inputs, grads, .. } => {
                let first = grads.first().ok_or_else(|| {
                    KfacError::invalid_argument("grads", "need at least one gradient source")
                })?;
                let shape = first.shape();
                if let Some(bad) = grads.iter().find(|g| g.shape() != shape) {
                    return Err(KfacError::shape_mismatch(
                        "gradient sources",
                        shape,
                        bad.shape(),
                    ));
                }
                let cols = shape.last().copied().unwrap_or(1);
                Ok(CovLayout::Elementwise(inputs.feature_dim()? + bias, cols))
            }
            FactorTower::Rows { sources, .. } => {
                let first = sources.first().ok_or_else(|| {
                    KfacError::invalid_argument("sources", "need at least one row source")
                })?;
                let dim = first.feature_dim()?;
                for source in sources.iter().skip(1) {
                    let other = source.feature_dim()?;
                    if other != dim {
                        return Err(KfacError::shape_mismatch(
                            "row sources",
                            vec![dim],
                            vec![other],
                        ));
                    }
                }
                Ok(if self.key.diagonal {
                    CovLayout::Diagonal(dim + bias)
                } else {
                    CovLayout::Full(dim + bias)
                })
            }
        }
    }

    fn require_layout(&self) -> Result<CovLayout> {
        self.layout
            .ok_or_else(|| KfacError::not_initialized(format!("{} has no towers", self.id)))
    }

    /// Allocate the covariance accumulator if it does not exist yet.
    pub fn instantiate_cov_variables(&mut self) -> Result<()> {
        if self.cov.is_some() {
            return Ok(());
        }
        let layout = self.require_layout()?;
        let at_zero = self.config.init_covariances_at_zero;
        let initial_weight = if at_zero { 0.0 } else { 1.0 };
        self.cov = Some(MovingAverage::new(
            layout.initial(at_zero),
            initial_weight,
            self.config.zero_debias,
        ));
        Ok(())
    }

    /// Allocate inverse slots for every registered damping. Unless inverses
    /// start at zero, the slots are seeded with the identity and are readable
    /// immediately.
    pub fn instantiate_inv_variables(&mut self) -> Result<()> {
        let layout = self.require_layout()?;
        self.inverses_instantiated = true;
        if self.config.init_inverses_at_zero {
            return Ok(());
        }
        for damping in &self.dampings {
            self.inverses
                .entry(damping.key())
                .or_insert_with(|| InverseSlot {
                    operator: layout.identity_inverse(),
                    source_generation: None,
                    damping_value: damping.total(),
                });
        }
        Ok(())
    }

    /// Maintain an inverse at `damping` from now on.
    pub fn register_damping(&mut self, damping: Damping) -> Result<()> {
        check_damping(damping.total())?;
        if let Damping::PiAdjusted { partner, .. } = damping {
            if partner == self.id {
                return Err(KfacError::invalid_argument(
                    "damping",
                    "a factor cannot be its own pi-tracenorm partner",
                ));
            }
        }
        let key = damping.key();
        if self.dampings.iter().any(|d| d.key() == key) {
            return Ok(());
        }
        self.dampings.push(damping);
        if self.inverses_instantiated {
            self.instantiate_inv_variables()?;
        }
        Ok(())
    }

    /// Remember `partner` so pi-adjusted dampings can read its covariance.
    pub(crate) fn link_partner(&mut self, partner_id: FactorId, partner: &FactorRef) {
        self.partners.insert(partner_id, Arc::downgrade(partner));
    }

    /// Fold the current tower values into the moving average:
    /// `cov ← decay·cov + weight·estimate`.
    pub fn make_covariance_update(&mut self, ema_decay: f64, ema_weight: f64) -> Result<()> {
        let estimate = self.compute_estimate()?;
        self.apply_estimate(&estimate.view(), ema_decay, ema_weight)
    }

    /// Fold an estimate from [`compute_estimate`](Self::compute_estimate).
    pub(crate) fn apply_estimate(&mut self, estimate: &ArrayView2<f64>, ema_decay: f64, ema_weight: f64) -> Result<()> {
        self.instantiate_cov_variables()?;
        self.fold(estimate, ema_decay, ema_weight)?;
        trace!(
            factor = %self.id,
            generation = self.generation,
            ema_decay,
            ema_weight,
            "covariance updated"
        );
        Ok(())
    }

    /// Fold an explicit value into the moving average.
    pub fn add_to_cov(&mut self, value: &ArrayView2<f64>, ema_decay: f64, ema_weight: f64) -> Result<()> {
        self.instantiate_cov_variables()?;
        self.fold(value, ema_decay, ema_weight)
    }

    fn fold(&mut self, value: &ArrayView2<f64>, decay: f64, weight: f64) -> Result<()> {
        let cov = self
            .cov
            .as_mut()
            .ok_or_else(|| KfacError::not_instantiated("covariance accumulator"))?;
        cov.add_to_average(value, decay, weight)?;
        self.generation += 1;
        Ok(())
    }

    /// New estimate from the current tower values, normalized by the total
    /// weighted example count.
    pub(crate) fn compute_estimate(&self) -> Result<Array2<f64>> {
        let layout = self.require_layout()?;
        let has_bias = self.key.has_bias;
        let diagonal = matches!(layout, CovLayout::Diagonal(_));
        let mut sum = Array2::<f64>::zeros(layout.storage_shape());
        let mut normalizer = 0.0;

        for tower in &self.towers {
            match tower {
                FactorTower::Gradients {
                    sources,
                    batch_size,
                } => {
                    for source in sources {
                        sum += &gradient_moment(source, diagonal);
                    }
                    normalizer += *batch_size as f64;
                }
                FactorTower::Layer {
                    inputs,
                    grads,
                    weight,
                } => {
                    let mut batch = 0;
                    for grad in grads {
                        let (part, b) = layer_diagonal_sum(inputs, grad, has_bias)?;
                        sum.scaled_add(*weight, &part);
                        batch = b;
                    }
                    normalizer += weight * batch as f64;
                }
                FactorTower::Rows { sources, weight } => {
                    let mut rows = 0;
                    for (i, source) in sources.iter().enumerate() {
                        let moment = row_moment(source, has_bias, diagonal)?;
                        sum.scaled_add(*weight, &moment.sum);
                        if i == 0 {
                            rows = moment.rows;
                        }
                    }
                    normalizer += weight * rows as f64;
                }
            }
        }

        if normalizer <= 0.0 {
            return Err(KfacError::invalid_argument(
                "towers",
                format!("{} has zero total example weight", self.id),
            ));
        }
        sum /= normalizer;
        Ok(sum)
    }

    /// Current covariance in storage layout.
    pub fn get_cov(&self) -> Result<Array2<f64>> {
        self.cov
            .as_ref()
            .ok_or_else(|| {
                KfacError::not_instantiated(format!("{} covariance not instantiated", self.id))
            })?
            .value()
    }

    /// Current covariance as an operator.
    pub fn get_cov_as_linear_operator(&self) -> Result<LinearOperator> {
        let layout = self.require_layout()?;
        layout.operator(self.get_cov()?)
    }

    /// Covariance used by partners for the pi-tracenorm split. Falls back to
    /// the initial value while the accumulator is unreadable.
    pub(crate) fn pi_statistic(&self) -> Result<LinearOperator> {
        let layout = self.require_layout()?;
        let value = match &self.cov {
            Some(cov) => cov.value().unwrap_or_else(|_| cov.raw_value().clone()),
            None => layout.initial(self.config.init_covariances_at_zero),
        };
        layout.operator(value)
    }

    /// Damped inverse for a registered damping.
    pub fn get_inverse(&self, damping: &Damping) -> Result<LinearOperator> {
        let key = damping.key();
        if !self.dampings.iter().any(|d| d.key() == key) {
            return Err(KfacError::not_initialized(format!(
                "{}: damping {damping:?} was never registered",
                self.id
            )));
        }
        self.inverses
            .get(&key)
            .map(|slot| slot.operator.clone())
            .ok_or_else(|| {
                KfacError::not_instantiated(format!(
                    "{}: inverse not computed yet; run an inverse update first",
                    self.id
                ))
            })
    }

    /// Recompute stale inverses, reading pi-tracenorm partners through their
    /// handles.
    ///
    /// Takes a read lock on each partner while the caller holds this
    /// factor's write lock; updating two partnered factors from different
    /// threads this way can deadlock. Use
    /// [`FactorRegistry::make_inverse_updates`](crate::FactorRegistry::make_inverse_updates)
    /// for batched updates.
    pub fn make_inverse_update(&mut self) -> Result<()> {
        let mut stats = HashMap::new();
        for damping in &self.dampings {
            if let Damping::PiAdjusted { partner, .. } = damping {
                if stats.contains_key(partner) {
                    continue;
                }
                let handle = self
                    .partners
                    .get(partner)
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| {
                        KfacError::not_initialized(format!(
                            "{}: partner {partner} is not linked",
                            self.id
                        ))
                    })?;
                let stat = handle.read().pi_statistic()?;
                stats.insert(*partner, stat);
            }
        }
        self.make_inverse_update_from(&stats)
    }

    /// Recompute stale inverses given partner covariances by id.
    ///
    /// A slot is stale when the covariance changed since it was computed or
    /// its resolved damping moved. All new inverses are computed before any
    /// slot is replaced.
    pub fn make_inverse_update_from(&mut self, partner_stats: &HashMap<FactorId, LinearOperator>) -> Result<()> {
        if self.dampings.is_empty() {
            return Ok(());
        }
        let layout = self.require_layout()?;
        self.instantiate_cov_variables()?;
        self.inverses_instantiated = true;
        let value = self.get_cov()?;
        let own = layout.operator(value.clone())?;

        let mut fresh = Vec::new();
        for damping in &self.dampings {
            let resolved = self.resolve_damping(damping, &own, partner_stats)?;
            let key = damping.key();
            let stale = match self.inverses.get(&key) {
                Some(slot) => {
                    slot.source_generation != Some(self.generation)
                        || slot.damping_value != resolved
                }
                None => true,
            };
            if stale {
                fresh.push((
                    key,
                    InverseSlot {
                        operator: layout.damped_inverse(&value, resolved)?,
                        source_generation: Some(self.generation),
                        damping_value: resolved,
                    },
                ));
            }
        }

        debug!(
            factor = %self.id,
            recomputed = fresh.len(),
            registered = self.dampings.len(),
            "inverse update"
        );
        for (key, slot) in fresh {
            self.inverses.insert(key, slot);
        }
        Ok(())
    }

    fn resolve_damping(
        &self,
        damping: &Damping,
        own: &LinearOperator,
        partner_stats: &HashMap<FactorId, LinearOperator>,
    ) -> Result<f64> {
        match *damping {
            Damping::Constant(value) => Ok(value),
            Damping::PiAdjusted {
                total,
                side,
                partner,
            } => {
                let other = partner_stats.get(&partner).ok_or_else(|| {
                    KfacError::not_initialized(format!(
                        "{}: no covariance available for partner {partner}",
                        self.id
                    ))
                })?;
                Ok(match side {
                    FactorSide::Left => compute_pi_adjusted_damping(own, other, total)?.0,
                    FactorSide::Right => compute_pi_adjusted_damping(other, own, total)?.1,
                })
            }
        }
    }
}
