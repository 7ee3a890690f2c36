//! Factor registry
//!
//! Blocks never construct factors directly: they describe the factor they
//! need with a [`FactorSpec`] and the registry returns the existing factor
//! with the same [`FactorKey`] or creates one. Blocks sharing tensors (for
//! example two heads reading the same layer inputs) therefore share
//! statistics and inverses.
//!
//! The registry also drives batched updates over every factor it owns,
//! in parallel with `rayon`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::debug;

use crate::config::FactorConfig;
use crate::error::Result;
use crate::factors::{check_ema, Factor, FactorKey, FactorRef, FactorSpec};

#[derive(Default)]
struct Entries {
    order: Vec<FactorRef>,
    by_key: HashMap<FactorKey, FactorRef>,
}

/// Owner of all factors of a model; cheap to clone (clones share state)
#[derive(Clone)]
pub struct FactorRegistry {
    config: FactorConfig,
    entries: Arc<Mutex<Entries>>,
}

impl Default for FactorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FactorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactorRegistry")
            .field("config", &self.config)
            .field("factors", &self.len())
            .finish()
    }
}

impl FactorRegistry {
    /// Registry using the process-wide config (or the default)
    pub fn new() -> Self {
        Self {
            config: FactorConfig::global(),
            entries: Arc::new(Mutex::new(Entries::default())),
        }
    }

    /// Registry with an explicit config
    pub fn with_config(config: FactorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            entries: Arc::new(Mutex::new(Entries::default())),
        })
    }

    /// Configuration handed to every factor
    pub fn config(&self) -> FactorConfig {
        self.config
    }

    /// Return the factor registered under `spec.key()`, creating it if needed.
    pub fn make_or_get_factor(&self, spec: FactorSpec) -> Result<FactorRef> {
        let key = spec.key();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.by_key.get(&key) {
            debug!(kind = ?key.kind(), "reusing existing factor");
            return Ok(Arc::clone(existing));
        }

        let factor = Factor::new(spec, self.config)?;
        debug!(
            factor = %factor.id(),
            kind = ?factor.kind(),
            layout = ?factor.layout(),
            "created factor"
        );
        let handle = Arc::new(RwLock::new(factor));
        entries.by_key.insert(key, Arc::clone(&handle));
        entries.order.push(Arc::clone(&handle));
        Ok(handle)
    }

    /// All factors in creation order
    pub fn get_factors(&self) -> Vec<FactorRef> {
        self.entries.lock().order.clone()
    }

    /// Number of distinct factors
    pub fn len(&self) -> usize {
        self.entries.lock().order.len()
    }

    /// True if no factor was created yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Covariance update of every factor with the given EMA decay and weight.
    ///
    /// Every estimate is computed before any accumulator changes, so an
    /// error leaves all factors at their previous value.
    pub fn make_covariance_updates(&self, ema_decay: f64, ema_weight: f64) -> Result<()> {
        check_ema(ema_decay, ema_weight)?;
        let factors = self.get_factors();
        debug!(factors = factors.len(), ema_decay, "batched covariance update");
        let estimates = factors
            .par_iter()
            .map(|f| f.read().compute_estimate())
            .collect::<Result<Vec<_>>>()?;

        factors
            .par_iter()
            .zip(estimates.par_iter())
            .map(|(f, estimate)| f.write().apply_estimate(&estimate.view(), ema_decay, ema_weight))
            .collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    /// Covariance update with the configured decay `d` and weight `1 - d`.
    pub fn make_covariance_updates_default(&self) -> Result<()> {
        let decay = self.config.default_ema_decay;
        self.make_covariance_updates(decay, 1.0 - decay)
    }

    /// Inverse update of every factor.
    ///
    /// Runs in two phases so no factor is locked for writing while another
    /// one reads it: first every covariance is snapshotted under read locks,
    /// then each factor recomputes its inverses against the snapshot.
    pub fn make_inverse_updates(&self) -> Result<()> {
        let factors = self.get_factors();
        let snapshot = factors
            .par_iter()
            .map(|f| {
                let guard = f.read();
                Ok((guard.id(), guard.pi_statistic()?))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        factors
            .par_iter()
            .map(|f| f.write().make_inverse_update_from(&snapshot))
            .collect::<Result<Vec<()>>>()?;
        debug!(factors = factors.len(), "batched inverse update");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damping::Damping;
    use crate::factors::{FactorKind, FactorTower, RowSource};
    use crate::tensor::Tensor;
    use ndarray::array;

    fn spec(t: &Tensor) -> FactorSpec {
        FactorSpec::new(FactorKind::FullyConnectedOutput).with_tower(FactorTower::Rows {
            sources: vec![RowSource::Dense(t.clone())],
            weight: 1.0,
        })
    }

    #[test]
    fn test_dedup_by_key() {
        let registry = FactorRegistry::with_config(FactorConfig::identity_init()).unwrap();
        let t = Tensor::from(array![[1.0, 2.0]]);
        let a = registry.make_or_get_factor(spec(&t)).unwrap();
        let b = registry.make_or_get_factor(spec(&t)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        let other = Tensor::from(array![[1.0, 2.0]]);
        registry.make_or_get_factor(spec(&other)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_clones_share_factors() {
        let registry = FactorRegistry::with_config(FactorConfig::default()).unwrap();
        let alias = registry.clone();
        let t = Tensor::from(array![[1.0]]);
        registry.make_or_get_factor(spec(&t)).unwrap();
        assert_eq!(alias.get_factors().len(), 1);
    }

    #[test]
    fn test_batched_updates() {
        let registry = FactorRegistry::with_config(FactorConfig::default()).unwrap();
        let t = Tensor::from(array![[2.0, 0.0], [0.0, 2.0]]);
        let f = registry.make_or_get_factor(spec(&t)).unwrap();
        f.write().register_damping(Damping::Constant(1.0)).unwrap();

        registry.make_covariance_updates_default().unwrap();
        registry.make_inverse_updates().unwrap();

        let inv = f.read().get_inverse(&Damping::Constant(1.0)).unwrap();
        // debiased cov = diag(2, 2)
        assert!((inv.trace() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_failed_covariance_update_leaves_every_factor() {
        let registry = FactorRegistry::with_config(FactorConfig::identity_init()).unwrap();
        let dense = Tensor::from(array![[2.0, 0.0], [0.0, 2.0]]);
        let first = registry.make_or_get_factor(spec(&dense)).unwrap();
        let indices = Tensor::from(array![[0.0], [1.0]]);
        let hot = FactorSpec::new(FactorKind::FullyConnectedInput).with_tower(FactorTower::Rows {
            sources: vec![RowSource::OneHot {
                indices: indices.clone(),
                depth: 3,
            }],
            weight: 1.0,
        });
        registry.make_or_get_factor(hot).unwrap();
        registry.make_covariance_updates(0.0, 1.0).unwrap();
        let before = first.read().get_cov().unwrap();
        let generation = first.read().generation();

        assert!(registry.make_covariance_updates(-0.5, 1.0).is_err());
        indices.assign(array![[0.0], [7.0]].into_dyn()).unwrap();
        assert!(registry.make_covariance_updates(0.5, 0.5).is_err());

        for factor in registry.get_factors() {
            assert_eq!(factor.read().generation(), generation);
        }
        assert_eq!(first.read().get_cov().unwrap(), before);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = FactorConfig::default().with_default_ema_decay(-0.1);
        assert!(FactorRegistry::with_config(config).is_err());
    }
}
