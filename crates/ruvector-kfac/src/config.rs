//! Numeric configuration for covariance factors
//!
//! The three toggles alter how accumulators start and are read. They are
//! fixed for the lifetime of a [`FactorRegistry`](crate::FactorRegistry): a
//! registry copies its config once and hands it to every factor it creates.
//!
//! A process-wide default can be installed with
//! [`FactorConfig::install_global`], at most once and only before any factor
//! exists.

use std::sync::OnceLock;

use parking_lot::{const_mutex, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{KfacError, Result};

static GLOBAL_CONFIG: OnceLock<FactorConfig> = OnceLock::new();
/// Set once the first factor exists; held while the global config is installed
static FACTORS_CREATED: Mutex<bool> = const_mutex(false);

/// Configuration shared by all factors of a registry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorConfig {
    /// Start covariance accumulators at zero instead of identity (ones for
    /// diagonal factors)
    pub init_covariances_at_zero: bool,
    /// Divide accumulators by their total weight when read, removing the
    /// cold-start bias of a zero-initialized moving average
    pub zero_debias: bool,
    /// Leave inverse slots unreadable until the first inverse update instead
    /// of seeding them with the identity
    pub init_inverses_at_zero: bool,
    /// Decay used by [`FactorRegistry::make_covariance_updates_default`](crate::FactorRegistry::make_covariance_updates_default)
    pub default_ema_decay: f64,
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            init_covariances_at_zero: true,
            zero_debias: true,
            init_inverses_at_zero: true,
            default_ema_decay: 0.95,
        }
    }
}

impl FactorConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// All three toggles off: covariances start at identity, reads are not
    /// debiased and inverse slots start at identity.
    pub fn identity_init() -> Self {
        Self {
            init_covariances_at_zero: false,
            zero_debias: false,
            init_inverses_at_zero: false,
            ..Self::default()
        }
    }

    /// Set whether covariances start at zero
    pub fn with_init_covariances_at_zero(mut self, value: bool) -> Self {
        self.init_covariances_at_zero = value;
        self
    }

    /// Set zero-debiasing of accumulator reads
    pub fn with_zero_debias(mut self, value: bool) -> Self {
        self.zero_debias = value;
        self
    }

    /// Set whether inverse slots start unreadable
    pub fn with_init_inverses_at_zero(mut self, value: bool) -> Self {
        self.init_inverses_at_zero = value;
        self
    }

    /// Set the default EMA decay
    pub fn with_default_ema_decay(mut self, decay: f64) -> Self {
        self.default_ema_decay = decay;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_ema_decay) {
            return Err(KfacError::invalid_argument(
                "default_ema_decay",
                format!("must be in [0, 1], got {}", self.default_ema_decay),
            ));
        }
        Ok(())
    }

    /// Install `self` as the process-wide default.
    ///
    /// Fails if a global config was already installed or if any factor has
    /// already been created in this process. Factor creation waits on the
    /// same lock, so no factor can appear between the check and the install.
    pub fn install_global(self) -> Result<()> {
        self.validate()?;
        let created = FACTORS_CREATED.lock();
        if *created {
            return Err(KfacError::invalid_argument(
                "global_config",
                "factors already exist; global constants must be set before any factor is created",
            ));
        }
        GLOBAL_CONFIG.set(self).map_err(|_| {
            KfacError::invalid_argument("global_config", "global constants were already set")
        })
    }

    /// The installed process-wide config, or the default.
    pub fn global() -> Self {
        GLOBAL_CONFIG.get().copied().unwrap_or_default()
    }

    pub(crate) fn mark_factor_created() {
        *FACTORS_CREATED.lock() = true;
    }
}
