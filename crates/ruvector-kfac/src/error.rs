//! Error types for ruvector-kfac

use thiserror::Error;

/// Result type alias for ruvector-kfac operations
pub type Result<T> = std::result::Result<T, KfacError>;

/// Errors raised by Fisher blocks, factors and linear operators.
///
/// Every error is reported at the call that detects it. Nothing is retried
/// inside the crate and no accumulator is left half-written.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KfacError {
    /// Incompatible tensor, tower or parameter shapes
    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Shape actually received
        got: Vec<usize>,
    },

    /// Operation called outside the phase that allows it
    #[error("Not initialized: {message}")]
    NotInitialized {
        /// Description of the out-of-order call
        message: String,
    },

    /// Covariance or inverse read before it was first produced
    #[error("Not instantiated: {message}")]
    NotInstantiated {
        /// Description of the missing value
        message: String,
    },

    /// Invalid argument value
    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// Argument name
        name: String,
        /// Reason why it's invalid
        reason: String,
    },

    /// Dense factorization or solve failed
    #[error("Numerical error: {message}")]
    Numerical {
        /// Description of the failure
        message: String,
    },
}

impl KfacError {
    /// Create a shape mismatch error
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<Vec<usize>>,
        got: impl Into<Vec<usize>>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create a not initialized error
    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::NotInitialized {
            message: message.into(),
        }
    }

    /// Create a not instantiated error
    pub fn not_instantiated(message: impl Into<String>) -> Self {
        Self::NotInstantiated {
            message: message.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a numerical error
    pub fn numerical(message: impl Into<String>) -> Self {
        Self::Numerical {
            message: message.into(),
        }
    }

    /// True for errors caused by calling operations in the wrong order
    pub fn is_ordering_error(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized { .. } | Self::NotInstantiated { .. }
        )
    }
}

/// Validate a damping value: finite and non-negative.
pub(crate) fn check_damping(damping: f64) -> Result<()> {
    if !damping.is_finite() || damping < 0.0 {
        return Err(KfacError::invalid_argument(
            "damping",
            format!("must be finite and non-negative, got {damping}"),
        ));
    }
    Ok(())
}
