//! Gaussian process regressor with per-row (heteroscedastic) noise
//!
//! Fitting is a single Cholesky factorisation of `K + diag(noise)`. There is no
//! hyperparameter optimisation and no random restarts, so repeated fits of the same
//! inputs are bit-identical.

use std::f64::consts::PI;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use super::kernel::ScaledRbf;
use super::training::TrainingSet;
use crate::error::GpFitError;

/// Unfitted surrogate: a kernel waiting for training data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianProcessSurrogate {
    kernel: ScaledRbf,
}

impl GaussianProcessSurrogate {
    /// Create a surrogate with length-scale `ℓ` and output-scale divisor `α`
    ///
    /// # Errors
    /// Returns an error if either hyperparameter is non-positive or non-finite
    pub fn new(length_scale: f64, output_scale_divisor: f64) -> Result<Self, GpFitError> {
        Ok(Self {
            kernel: ScaledRbf::new(length_scale, output_scale_divisor)?,
        })
    }

    /// Kernel in use
    pub fn kernel(&self) -> &ScaledRbf {
        &self.kernel
    }

    /// Fit to raw training arrays
    ///
    /// # Arguments
    /// * `train_x` - Inputs, one row per training point
    /// * `train_y` - Outputs
    /// * `noise` - Per-row noise variance added to the kernel diagonal
    ///
    /// # Errors
    /// Fails on shape mismatches, non-finite values, or a covariance that is not
    /// positive definite. Never returns a model with a NaN marginal likelihood.
    pub fn fit(
        &self,
        train_x: &DMatrix<f64>,
        train_y: &DVector<f64>,
        noise: &DVector<f64>,
    ) -> Result<FittedGp, GpFitError> {
        let n = train_x.nrows();
        if train_y.len() != n || noise.len() != n {
            return Err(GpFitError::ShapeMismatch {
                inputs: n,
                outputs: if train_y.len() == n { noise.len() } else { train_y.len() },
            });
        }
        check_finite("inputs", train_x.row_iter().map(|r| r.iter().all(|v| v.is_finite())))?;
        check_finite("outputs", train_y.iter().map(|v| v.is_finite()))?;
        check_finite("noise", noise.iter().map(|v| v.is_finite() && *v >= 0.0))?;

        let mut k = self.kernel.covariance(train_x);
        for i in 0..n {
            k[(i, i)] += noise[i];
        }

        let chol = Cholesky::new(k).ok_or(GpFitError::NotPositiveDefinite { size: n })?;
        let alpha = chol.solve(train_y);

        let data_fit = -0.5 * train_y.dot(&alpha);
        let log_det_half: f64 = chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum();
        let lml = data_fit - log_det_half - 0.5 * n as f64 * (2.0 * PI).ln();

        if !lml.is_finite() {
            return Err(GpFitError::NotPositiveDefinite { size: n });
        }

        Ok(FittedGp {
            kernel: self.kernel,
            train_x: train_x.clone(),
            chol,
            alpha,
            log_marginal_likelihood: lml,
        })
    }

    /// Fit to a pooled [`TrainingSet`] using its nugget / `sigma_y²` noise split
    ///
    /// # Errors
    /// See [`GaussianProcessSurrogate::fit`]
    pub fn fit_training_set(
        &self,
        set: &TrainingSet,
        nugget: f64,
        sigma_y: f64,
    ) -> Result<FittedGp, GpFitError> {
        self.fit(set.inputs(), set.outputs(), &set.noise_vector(nugget, sigma_y))
    }
}

fn check_finite(what: &'static str, rows: impl Iterator<Item = bool>) -> Result<(), GpFitError> {
    for (row, ok) in rows.enumerate() {
        if !ok {
            return Err(GpFitError::NonFiniteInput { what, row });
        }
    }
    Ok(())
}

/// A fitted surrogate
#[derive(Debug, Clone)]
pub struct FittedGp {
    kernel: ScaledRbf,
    train_x: DMatrix<f64>,
    chol: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    log_marginal_likelihood: f64,
}

impl FittedGp {
    /// `log p(y | X, θ) = -½ yᵀ K⁻¹ y - Σ ln Lᵢᵢ - n/2 ln 2π`
    pub fn log_marginal_likelihood(&self) -> f64 {
        self.log_marginal_likelihood
    }

    /// Number of training rows
    pub fn len(&self) -> usize {
        self.train_x.nrows()
    }

    /// Whether the model was fitted to zero rows
    pub fn is_empty(&self) -> bool {
        self.train_x.nrows() == 0
    }

    /// Posterior mean and variance at each row of `x`
    ///
    /// Variance excludes observation noise and is floored at zero.
    pub fn predict(&self, x: &DMatrix<f64>) -> (DVector<f64>, DVector<f64>) {
        let k_star = self.kernel.cross_covariance(x, &self.train_x);
        let mean = &k_star * &self.alpha;

        let v = self.chol.solve(&k_star.transpose());
        let prior_var = ScaledRbf::VARIANCE;
        let var = DVector::from_fn(x.nrows(), |i, _| {
            let reduction = k_star.row(i).dot(&v.column(i).transpose());
            (prior_var - reduction).max(0.0)
        });
        (mean, var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn toy() -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let x = DMatrix::from_row_slice(4, 2, &[0.0, 0.1, 0.3, 0.4, 0.6, 0.2, 0.9, 0.8]);
        let y = DVector::from_vec(vec![0.2, -0.1, 0.4, 1.0]);
        let noise = DVector::from_vec(vec![1e-9, 1e-9, 0.25, 0.25]);
        (x, y, noise)
    }

    #[test]
    fn test_fit_is_idempotent() {
        let (x, y, noise) = toy();
        let gp = GaussianProcessSurrogate::new(0.3, 1.0).unwrap();
        let a = gp.fit(&x, &y, &noise).unwrap().log_marginal_likelihood();
        let b = gp.fit(&x, &y, &noise).unwrap().log_marginal_likelihood();
        assert_eq!(a, b);
        assert!(a.is_finite());
    }

    #[test]
    fn test_single_point_matches_closed_form() {
        // n = 1: lml = -y²/(2s) - ½ ln s - ½ ln 2π with s = 1 + noise; α leaves k(x, x) alone
        let x = DMatrix::from_row_slice(1, 1, &[0.0]);
        let y = DVector::from_vec(vec![0.7]);
        let noise = DVector::from_vec(vec![0.25]);
        let fitted = GaussianProcessSurrogate::new(0.5, 2.0)
            .unwrap()
            .fit(&x, &y, &noise)
            .unwrap();
        let s: f64 = 1.0 + 0.25;
        let expected = -0.49 / (2.0 * s) - 0.5 * s.ln() - 0.5 * (2.0 * PI).ln();
        assert_relative_eq!(fitted.log_marginal_likelihood(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_duplicate_rows_without_noise_are_singular() {
        let x = DMatrix::from_row_slice(2, 1, &[0.5, 0.5]);
        let y = DVector::from_vec(vec![1.0, 1.0]);
        let noise = DVector::zeros(2);
        let err = GaussianProcessSurrogate::new(0.3, 1.0)
            .unwrap()
            .fit(&x, &y, &noise)
            .unwrap_err();
        assert_eq!(err, GpFitError::NotPositiveDefinite { size: 2 });
    }

    #[test]
    fn test_nan_output_is_reported() {
        let (x, mut y, noise) = toy();
        y[2] = f64::NAN;
        let err = GaussianProcessSurrogate::new(0.3, 1.0)
            .unwrap()
            .fit(&x, &y, &noise)
            .unwrap_err();
        assert_eq!(
            err,
            GpFitError::NonFiniteInput {
                what: "outputs",
                row: 2
            }
        );
    }

    #[test]
    fn test_shape_mismatch() {
        let (x, y, _) = toy();
        let err = GaussianProcessSurrogate::new(0.3, 1.0)
            .unwrap()
            .fit(&x, &y, &DVector::zeros(3))
            .unwrap_err();
        assert!(matches!(err, GpFitError::ShapeMismatch { inputs: 4, outputs: 3 }));
    }

    #[test]
    fn test_prediction_interpolates_noise_free_points() {
        let x = DMatrix::from_row_slice(3, 1, &[0.0, 0.5, 1.0]);
        let y = DVector::from_vec(vec![0.0, 1.0, 0.0]);
        let noise = DVector::from_element(3, 1e-10);
        let fitted = GaussianProcessSurrogate::new(0.3, 1.0)
            .unwrap()
            .fit(&x, &y, &noise)
            .unwrap();
        let (mean, var) = fitted.predict(&DMatrix::from_row_slice(1, 1, &[0.5]));
        assert_relative_eq!(mean[0], 1.0, epsilon = 1e-6);
        assert!(var[0] < 1e-6);
    }
}
