//! Gaussian jitter proposals with a per-component log/linear mask

use rand::Rng;
use rand_distr::StandardNormal;

use super::Proposer;
use crate::core_types::{LogConstraint, ParameterVector};
use crate::error::{CalibrationError, Result};

/// Adds `N(0, scale_j)` noise to each component
///
/// Components flagged in the [`LogConstraint`] move multiplicatively,
/// `exp(ln x + s·z)`, which keeps them strictly positive. All others move additively.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianJitter {
    scale: Vec<f64>,
    log_constraint: LogConstraint,
}

impl GaussianJitter {
    /// Per-component scales
    ///
    /// A single scale is broadcast to every component.
    ///
    /// # Errors
    /// Returns `Configuration` if a scale is negative or non-finite, or if the scale and
    /// mask lengths disagree
    pub fn new(scale: Vec<f64>, log_constraint: LogConstraint) -> Result<Self> {
        if scale.is_empty() {
            return Err(CalibrationError::Configuration(
                "perturbation scale must have at least one entry".into(),
            ));
        }
        if let Some(bad) = scale.iter().find(|s| !(s.is_finite() && **s >= 0.0)) {
            return Err(CalibrationError::Configuration(format!(
                "perturbation scale must be finite and non-negative, got {bad}"
            )));
        }
        if scale.len() > 1 && !log_constraint.is_empty() && scale.len() != log_constraint.len() {
            return Err(CalibrationError::Configuration(format!(
                "{} perturbation scales but log constraint covers {} components",
                scale.len(),
                log_constraint.len()
            )));
        }
        Ok(Self {
            scale,
            log_constraint,
        })
    }

    /// Scale for component `j`
    #[inline]
    pub fn scale(&self, j: usize) -> f64 {
        if self.scale.len() == 1 {
            self.scale[0]
        } else {
            self.scale.get(j).copied().unwrap_or(0.0)
        }
    }

    /// The log/linear mask
    pub fn log_constraint(&self) -> &LogConstraint {
        &self.log_constraint
    }
}

impl Proposer for GaussianJitter {
    fn propose<R: Rng + ?Sized>(&self, theta: &ParameterVector, rng: &mut R) -> ParameterVector {
        let mut out = theta.clone();
        for (j, x) in out.iter_mut().enumerate() {
            let z: f64 = rng.sample(StandardNormal);
            let s = self.scale(j);
            if self.log_constraint.is_log(j) {
                // ln is undefined here; leave it for the scorer to reject
                if *x > 0.0 {
                    *x = (x.ln() + s * z).exp();
                }
            } else {
                *x += s * z;
            }
        }
        out
    }
}
