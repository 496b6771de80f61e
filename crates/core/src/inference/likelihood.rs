//! GP marginal likelihood of a candidate parameter vector
//!
//! The same evaluator feeds both particle weighting and the MCMC acceptance ratio, so
//! the two paths always agree on what a candidate's likelihood is.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::Scorer;
use crate::core_types::{ParameterVector, LENGTH_SCALE};
use crate::error::{CalibrationError, Result};
use crate::gp::{FittedGp, GaussianProcessSurrogate, TrainingSetBuilder};

/// Noise and scaling settings for the surrogate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurrogateSettings {
    /// Measurement error standard deviation; observed rows get `sigma_y²` noise
    pub sigma_y: f64,
    /// Regularisation variance on simulated rows
    pub nugget: f64,
    /// Model-bias scaling, used as the kernel output-scale divisor
    pub lambda_e: f64,
}

impl Default for SurrogateSettings {
    fn default() -> Self {
        Self {
            sigma_y: 0.5,
            nugget: 1e-9,
            lambda_e: 1.0,
        }
    }
}

/// Scores candidates against one window's fixed training context
#[derive(Debug, Clone)]
pub struct LikelihoodEvaluator {
    builder: TrainingSetBuilder,
    settings: SurrogateSettings,
}

impl LikelihoodEvaluator {
    /// Create an evaluator for a training context
    pub fn new(builder: TrainingSetBuilder, settings: SurrogateSettings) -> Self {
        Self { builder, settings }
    }

    /// Training context
    pub fn builder(&self) -> &TrainingSetBuilder {
        &self.builder
    }

    /// Noise settings
    pub fn settings(&self) -> &SurrogateSettings {
        &self.settings
    }

    /// Fit the surrogate for `theta`, whose final component is the kernel length-scale
    ///
    /// # Errors
    /// Shape problems surface as `Configuration`; numerical failures as `GpFitFailure`
    /// carrying `theta`
    pub fn fit(&self, theta: &ParameterVector) -> Result<FittedGp> {
        let set = self.builder.build(theta)?;
        let length_scale = theta[theta.len() - 1];
        let wrap = |source| CalibrationError::GpFitFailure {
            parameters: theta.iter().copied().collect(),
            source,
        };
        GaussianProcessSurrogate::new(length_scale, self.settings.lambda_e)
            .map_err(wrap)?
            .fit_training_set(&set, self.settings.nugget, self.settings.sigma_y)
            .map_err(wrap)
    }

    /// Log marginal likelihood of `theta`
    ///
    /// # Errors
    /// See [`LikelihoodEvaluator::fit`]
    pub fn log_marginal_likelihood(&self, theta: &ParameterVector) -> Result<f64> {
        let lml = self.fit(theta)?.log_marginal_likelihood();
        trace!(
            length_scale = theta.get(LENGTH_SCALE).copied().unwrap_or(f64::NAN),
            lml,
            "scored particle"
        );
        Ok(lml)
    }
}

impl Scorer for LikelihoodEvaluator {
    fn log_marginal_likelihood(&self, theta: &ParameterVector) -> Result<f64> {
        LikelihoodEvaluator::log_marginal_likelihood(self, theta)
    }
}

/// One-shot `logML(theta_star) - logML(theta)` over an explicit training context
///
/// # Arguments
/// * `x_model` / `x_data` - Simulation and observation coordinates
/// * `y_model` - Simulated outputs, one row per design candidate
/// * `y_data` - Observed outputs, one row per observation set
/// * `t_model` - Design candidates
/// * `theta` / `theta_star` - Current and proposed vectors (length-scale last)
///
/// # Errors
/// Propagates configuration errors and either GP fit failure
pub fn log_likelihood_ratio(
    x_model: &DVector<f64>,
    x_data: &DVector<f64>,
    y_model: &DMatrix<f64>,
    y_data: &DMatrix<f64>,
    t_model: &DMatrix<f64>,
    theta: &ParameterVector,
    theta_star: &ParameterVector,
    sigma_y: f64,
    nugget: f64,
    lambda_e: f64,
) -> Result<f64> {
    let builder = TrainingSetBuilder::new(
        x_model.clone(),
        x_data.clone(),
        y_model.clone(),
        y_data.clone(),
        t_model.clone(),
    )?;
    let evaluator = LikelihoodEvaluator::new(
        builder,
        SurrogateSettings {
            sigma_y,
            nugget,
            lambda_e,
        },
    );
    evaluator.log_likelihood_ratio(theta, theta_star)
}
