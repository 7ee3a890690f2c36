//! Exponential moving average accumulator
//!
//! ```text
//! value        ← decay · value        + weight · x
//! total_weight ← decay · total_weight + weight
//! ```
//!
//! With zero-debiasing enabled, reads return `value / total_weight`. For the
//! canonical `weight = 1 - decay` this is the usual `1 / (1 - decay^t)` bias
//! correction of an average started at zero; with `decay = 1 - 1/t` and
//! `weight = 1/t` it is a plain running mean.

use ndarray::{Array2, ArrayView2};

use crate::error::{KfacError, Result};

/// Reject an EMA decay or weight that is negative or not finite.
pub(crate) fn check_ema(decay: f64, weight: f64) -> Result<()> {
    if !decay.is_finite() || !weight.is_finite() || decay < 0.0 || weight < 0.0 {
        return Err(KfacError::invalid_argument(
            "ema",
            format!("decay and weight must be finite and non-negative, got ({decay}, {weight})"),
        ));
    }
    Ok(())
}

/// Moving average of a matrix-valued statistic
#[derive(Debug, Clone, PartialEq)]
pub struct MovingAverage {
    value: Array2<f64>,
    total_weight: f64,
    zero_debias: bool,
}

impl MovingAverage {
    /// Accumulator starting at `initial`. `initial_weight` is the weight the
    /// starting value carries in debiased reads (0 for a zero start).
    pub fn new(initial: Array2<f64>, initial_weight: f64, zero_debias: bool) -> Self {
        Self {
            value: initial,
            total_weight: initial_weight,
            zero_debias,
        }
    }

    /// Fold `x` into the average.
    pub fn add_to_average(&mut self, x: &ArrayView2<f64>, decay: f64, weight: f64) -> Result<()> {
        if x.dim() != self.value.dim() {
            let (r, c) = self.value.dim();
            return Err(KfacError::shape_mismatch(
                "moving average update",
                vec![r, c],
                x.shape().to_vec(),
            ));
        }
        check_ema(decay, weight)?;

        self.value *= decay;
        self.value.scaled_add(weight, x);
        self.total_weight = decay * self.total_weight + weight;
        Ok(())
    }

    /// Current (debiased if configured) value.
    pub fn value(&self) -> Result<Array2<f64>> {
        if !self.zero_debias {
            return Ok(self.value.clone());
        }
        if self.total_weight <= 0.0 {
            return Err(KfacError::not_instantiated(
                "moving average has no weight yet; run a covariance update first",
            ));
        }
        Ok(&self.value / self.total_weight)
    }

    /// Stored value without debiasing
    pub fn raw_value(&self) -> &Array2<f64> {
        &self.value
    }

    /// Accumulated weight
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Whether reads are debiased
    pub fn is_debiased(&self) -> bool {
        self.zero_debias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_plain_ema() {
        let mut avg = MovingAverage::new(Array2::eye(2), 1.0, false);
        avg.add_to_average(&(Array2::eye(2) * 3.0).view(), 0.5, 0.5)
            .unwrap();
        let v = avg.value().unwrap();
        assert_abs_diff_eq!(v[[0, 0]], 2.0);
        assert_abs_diff_eq!(v[[0, 1]], 0.0);
    }

    #[test]
    fn test_replace_outright() {
        let mut avg = MovingAverage::new(Array2::eye(2), 1.0, false);
        let x = array![[4.0, 1.0], [1.0, 2.0]];
        avg.add_to_average(&x.view(), 0.0, 1.0).unwrap();
        assert_eq!(avg.value().unwrap(), x);
    }

    #[test]
    fn test_debiased_read_removes_zero_start() {
        let mut avg = MovingAverage::new(Array2::zeros((1, 1)), 0.0, true);
        assert!(matches!(
            avg.value(),
            Err(KfacError::NotInstantiated { .. })
        ));

        let decay = 0.9;
        for _ in 0..3 {
            avg.add_to_average(&array![[5.0]].view(), decay, 1.0 - decay)
                .unwrap();
        }
        // A constant input is recovered exactly after debiasing
        assert_abs_diff_eq!(avg.value().unwrap()[[0, 0]], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(avg.total_weight(), 1.0 - decay.powi(3), epsilon = 1e-12);
    }

    #[test]
    fn test_shape_checked() {
        let mut avg = MovingAverage::new(Array2::zeros((2, 2)), 0.0, true);
        assert!(avg
            .add_to_average(&Array2::zeros((3, 3)).view(), 0.5, 0.5)
            .is_err());
        assert_eq!(avg.total_weight(), 0.0);
    }
}
