//! Damping for Kronecker-factored blocks
//!
//! Adding `λ·I` to `A ⊗ B` destroys the Kronecker structure. K-FAC instead
//! damps each factor separately, `(A + π·√λ·I) ⊗ (B + √λ/π·I)`, where the
//! π-tracenorm heuristic balances the two factors by their average
//! eigenvalue:
//!
//! ```text
//! π = sqrt( (trace(A) / dim(A)) / (trace(B) / dim(B)) )
//! ```
//!
//! ## References
//!
//! - Martens & Grosse (2015), section 6.3: "Factored Tikhonov regularization"

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{check_damping, KfacError, Result};
use crate::factors::FactorId;
use crate::linear_operator::LinearOperator;

/// Which side of a Kronecker product a factor sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FactorSide {
    /// `A` in `A ⊗ B` (the input covariance)
    Left,
    /// `B` in `A ⊗ B` (the output-gradient covariance)
    Right,
}

/// Damping a factor inverse is computed with
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Damping {
    /// Add `λ` to the diagonal
    Constant(f64),
    /// This factor's share of `total` under the π-tracenorm split against
    /// `partner`, resolved from both covariances at inverse-update time
    PiAdjusted {
        /// Damping of the whole Kronecker product
        total: f64,
        /// Side this factor occupies
        side: FactorSide,
        /// The other factor of the product
        partner: FactorId,
    },
}

impl Damping {
    /// Damping of the whole block this entry was derived from
    pub fn total(&self) -> f64 {
        match self {
            Self::Constant(v) => *v,
            Self::PiAdjusted { total, .. } => *total,
        }
    }

    pub(crate) fn key(&self) -> DampingKey {
        match *self {
            Self::Constant(v) => DampingKey::Constant(v.to_bits()),
            Self::PiAdjusted {
                total,
                side,
                partner,
            } => DampingKey::PiAdjusted(total.to_bits(), side, partner),
        }
    }
}

/// Hashable identity of a [`Damping`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DampingKey {
    Constant(u64),
    PiAdjusted(u64, FactorSide, FactorId),
}

/// π-tracenorm of two Kronecker factors.
///
/// Computed as `sqrt(trace(A)·dim(B) / (trace(B)·dim(A)))`, which equals the
/// ratio of normalized traces. Returns `1.0` when either trace is zero or the
/// ratio is not finite, so the damping split degrades to an even split.
pub fn compute_pi_tracenorm(left: &LinearOperator, right: &LinearOperator) -> f64 {
    let left_norm = left.trace() * right.domain_dimension() as f64;
    let right_norm = right.trace() * left.domain_dimension() as f64;

    if left_norm <= 0.0 || right_norm <= 0.0 {
        warn!(
            left_norm,
            right_norm, "degenerate trace norm, splitting damping evenly"
        );
        return 1.0;
    }

    let pi = (left_norm / right_norm).sqrt();
    if pi.is_finite() && pi > 0.0 {
        pi
    } else {
        warn!(pi, "non-finite pi, splitting damping evenly");
        1.0
    }
}

/// Split `damping` into `(π·√λ, √λ/π)` for the left and right factors.
pub fn compute_pi_adjusted_damping(
    left: &LinearOperator,
    right: &LinearOperator,
    damping: f64,
) -> Result<(f64, f64)> {
    check_damping(damping)?;
    let root = damping.sqrt();
    let pi = compute_pi_tracenorm(left, right);
    Ok((root * pi, root / pi))
}

/// Divide `damping` by the number of replications (locations, uses or steps)
/// a block's curvature is renormalized by.
pub fn normalize_damping(damping: f64, num_replications: usize) -> Result<f64> {
    check_damping(damping)?;
    if num_replications == 0 {
        return Err(KfacError::invalid_argument(
            "num_replications",
            "must be > 0",
        ));
    }
    Ok(damping / num_replications as f64)
}
