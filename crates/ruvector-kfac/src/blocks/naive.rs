//! Blocks that treat a layer's parameters as one flat vector

use ndarray::Array2;
use tracing::debug;

use crate::damping::Damping;
use crate::error::{check_damping, KfacError, Result};
use crate::factors::{FactorKind, FactorRef, FactorSpec, FactorTower};
use crate::params::{column_to_tensors, tensors_to_column, Params};
use crate::registry::FactorRegistry;
use crate::tensor::Tensor;

use super::{regroup, FisherBlock, Phase};

#[derive(Debug)]
struct Bound {
    factor: FactorRef,
    damping: f64,
}

impl Bound {
    fn constant(&self) -> Damping {
        Damping::Constant(self.damping)
    }
}

/// Shared state of the two naive blocks
#[derive(Debug)]
struct NaiveCore {
    kind: FactorKind,
    registry: FactorRegistry,
    params: Params<Tensor>,
    batch_sizes: Vec<usize>,
    phase: Phase<Bound>,
}

impl NaiveCore {
    fn new(kind: FactorKind, registry: &FactorRegistry, params: Params<Tensor>) -> Self {
        Self {
            kind,
            registry: registry.clone(),
            params,
            batch_sizes: Vec::new(),
            phase: Phase::Open,
        }
    }

    fn register_additional_tower(&mut self, batch_size: usize) -> Result<()> {
        self.phase.ensure_open("register_additional_tower")?;
        if batch_size == 0 {
            return Err(KfacError::invalid_argument("batch_size", "must be > 0"));
        }
        self.batch_sizes.push(batch_size);
        Ok(())
    }

    fn instantiate_factors(&mut self, grads: &[Vec<Vec<Tensor>>], damping: f64) -> Result<()> {
        self.phase.ensure_open("instantiate_factors")?;
        check_damping(damping)?;
        if self.batch_sizes.is_empty() {
            return Err(KfacError::not_initialized(
                "instantiate_factors needs at least one registered tower",
            ));
        }
        regroup(grads, &[self.params.tensors()])?;

        let sources = grads.iter().map(|source| source[0].clone()).collect();
        let spec = FactorSpec::new(self.kind).with_tower(FactorTower::Gradients {
            sources,
            batch_size: self.batch_sizes.iter().sum(),
        });
        let factor = self.registry.make_or_get_factor(spec)?;
        debug!(kind = ?self.kind, damping, "naive block instantiated");
        self.phase = Phase::Instantiated(Bound { factor, damping });
        Ok(())
    }

    fn check_layout(&self, params: &Params) -> Result<()> {
        let expected = self.params.shapes();
        let got = params.shapes();
        if expected != got {
            return Err(KfacError::shape_mismatch(
                "naive block params",
                expected.iter().flatten().copied().collect::<Vec<_>>(),
                got.iter().flatten().copied().collect::<Vec<_>>(),
            ));
        }
        Ok(())
    }

    fn multiply(&self, params: &Params) -> Result<Params> {
        let bound = self.phase.bound("multiply")?;
        self.check_layout(params)?;
        let cov = bound.factor.read().get_cov_as_linear_operator()?;
        let out = cov.matvec(&tensors_to_column(params).view())?;
        column_to_tensors(params, &out.view())
    }

    fn multiply_inverse(&self, params: &Params) -> Result<Params> {
        let bound = self.phase.bound("multiply_inverse")?;
        self.check_layout(params)?;
        let inv = bound.factor.read().get_inverse(&bound.constant())?;
        let out = inv.matvec(&tensors_to_column(params).view())?;
        column_to_tensors(params, &out.view())
    }

    fn register_inverse(&self) -> Result<()> {
        let bound = self.phase.bound("register_inverse")?;
        bound.factor.write().register_damping(bound.constant())
    }

    fn full_fisher_block(&self) -> Result<Array2<f64>> {
        let bound = self.phase.bound("full_fisher_block")?;
        let cov = bound.factor.read().get_cov_as_linear_operator()?;
        Ok(cov.to_dense())
    }

    fn factors(&self) -> Vec<FactorRef> {
        match &self.phase {
            Phase::Instantiated(b) => vec![b.factor.clone()],
            Phase::Open => Vec::new(),
        }
    }

    fn damping(&self) -> Option<f64> {
        match &self.phase {
            Phase::Instantiated(b) => Some(b.damping),
            Phase::Open => None,
        }
    }
}

macro_rules! naive_block {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name(NaiveCore);

        impl $name {
            /// Block over `params`; towers are added with
            /// [`register_additional_tower`](Self::register_additional_tower).
            pub fn new(registry: &FactorRegistry, params: Params<Tensor>) -> Self {
                Self(NaiveCore::new($kind, registry, params))
            }

            /// Record a tower of `batch_size` examples.
            pub fn register_additional_tower(&mut self, batch_size: usize) -> Result<()> {
                self.0.register_additional_tower(batch_size)
            }

            /// Parameters this block covers
            pub fn params(&self) -> &Params<Tensor> {
                &self.0.params
            }
        }

        impl FisherBlock for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn num_registered_towers(&self) -> usize {
                self.0.batch_sizes.len()
            }

            fn tensors_to_compute_grads(&self) -> Vec<Vec<Tensor>> {
                vec![self.0.params.tensors()]
            }

            fn instantiate_factors(&mut self, grads: &[Vec<Vec<Tensor>>], damping: f64) -> Result<()> {
                self.0.instantiate_factors(grads, damping)
            }

            fn register_inverse(&self) -> Result<()> {
                self.0.register_inverse()
            }

            fn multiply(&self, params: &Params) -> Result<Params> {
                self.0.multiply(params)
            }

            fn multiply_inverse(&self, params: &Params) -> Result<Params> {
                self.0.multiply_inverse(params)
            }

            fn full_fisher_block(&self) -> Result<Array2<f64>> {
                self.0.full_fisher_block()
            }

            fn factors(&self) -> Vec<FactorRef> {
                self.0.factors()
            }

            fn damping(&self) -> Option<f64> {
                self.0.damping()
            }
        }
    };
}

naive_block!(
    /// Full `E[g gᵀ]` over the concatenated flattened parameters.
    ///
    /// Only practical for small layers: the factor is `n × n` for `n`
    /// parameters.
    NaiveFullFB,
    FactorKind::NaiveFull,
    "NaiveFullFB"
);

naive_block!(
    /// Diagonal `E[g²]` of the flattened parameters
    NaiveDiagonalFB,
    FactorKind::NaiveDiagonal,
    "NaiveDiagonalFB"
);
