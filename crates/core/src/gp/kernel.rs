//! Stationary squared-exponential kernel with a fixed isotropic length-scale
//!
//! `k(a, b) = exp(-0.5 · |a - b|² / ℓ²) / α`, with `k(x, x) = 1` on the diagonal of `K(X, X)`
//!
//! The length-scale `ℓ` is not optimised: it is the final component of the candidate
//! parameter vector being scored. `α` is the output-scale divisor; the likelihood
//! evaluator passes the model-bias scaling `λ_e` here. Only the correlation between
//! distinct rows is divided by `α`, the self-covariance stays normalised.

use nalgebra::{DMatrix, RowDVector};

use crate::error::GpFitError;

/// Isotropic radial-basis kernel scaled by `1 / α`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledRbf {
    length_scale: f64,
    output_scale_divisor: f64,
}

impl ScaledRbf {
    /// Prior variance `k(x, x)`, unscaled by `α`
    pub const VARIANCE: f64 = 1.0;

    /// Create a kernel
    ///
    /// # Errors
    /// Rejects non-finite or non-positive length-scales and divisors
    pub fn new(length_scale: f64, output_scale_divisor: f64) -> Result<Self, GpFitError> {
        if !(length_scale.is_finite() && length_scale > 0.0) {
            return Err(GpFitError::InvalidLengthScale(length_scale));
        }
        if !(output_scale_divisor.is_finite() && output_scale_divisor > 0.0) {
            return Err(GpFitError::InvalidOutputScale(output_scale_divisor));
        }
        Ok(Self {
            length_scale,
            output_scale_divisor,
        })
    }

    /// Kernel length-scale `ℓ`
    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }

    /// Output-scale divisor `α`
    pub fn output_scale_divisor(&self) -> f64 {
        self.output_scale_divisor
    }

    /// Kernel value for a squared Euclidean distance
    #[inline]
    pub fn from_sq_distance(&self, d2: f64) -> f64 {
        (-0.5 * d2 / (self.length_scale * self.length_scale)).exp() / self.output_scale_divisor
    }

    /// Kernel value between two input rows
    #[inline]
    pub fn eval(&self, a: &RowDVector<f64>, b: &RowDVector<f64>) -> f64 {
        self.from_sq_distance((a - b).norm_squared())
    }

    /// Symmetric covariance `K(X, X)`
    pub fn covariance(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        let n = x.nrows();
        let rows: Vec<RowDVector<f64>> = x.row_iter().map(|r| r.into_owned()).collect();
        let mut k = DMatrix::zeros(n, n);
        for i in 0..n {
            k[(i, i)] = Self::VARIANCE;
            for j in 0..i {
                let v = self.eval(&rows[i], &rows[j]);
                k[(i, j)] = v;
                k[(j, i)] = v;
            }
        }
        k
    }

    /// Cross covariance `K(A, B)` with one row per row of `a`
    pub fn cross_covariance(&self, a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
        let b_rows: Vec<RowDVector<f64>> = b.row_iter().map(|r| r.into_owned()).collect();
        let mut k = DMatrix::zeros(a.nrows(), b.nrows());
        for (i, ra) in a.row_iter().enumerate() {
            let ra = ra.into_owned();
            for (j, rb) in b_rows.iter().enumerate() {
                k[(i, j)] = self.eval(&ra, rb);
            }
        }
        k
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rejects_bad_hyperparameters() {
        assert_eq!(
            ScaledRbf::new(0.0, 1.0).unwrap_err(),
            GpFitError::InvalidLengthScale(0.0)
        );
        assert!(ScaledRbf::new(f64::NAN, 1.0).is_err());
        assert!(ScaledRbf::new(0.2, -1.0).is_err());
    }

    #[test]
    fn test_kernel_decays_with_distance() {
        let k = ScaledRbf::new(0.5, 2.0).unwrap();
        assert_relative_eq!(k.from_sq_distance(0.0), 0.5);
        assert_relative_eq!(k.from_sq_distance(0.25), 0.5 * (-0.5_f64).exp());
        assert!(k.from_sq_distance(4.0) < k.from_sq_distance(1.0));
    }

    #[test]
    fn test_covariance_is_symmetric_with_unit_diagonal() {
        let x = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 0.5, 0.1, 1.0, 0.9]);
        let k = ScaledRbf::new(0.3, 1.0).unwrap().covariance(&x);
        for i in 0..3 {
            assert_relative_eq!(k[(i, i)], 1.0);
            for j in 0..3 {
                assert_relative_eq!(k[(i, j)], k[(j, i)]);
            }
        }
    }

    #[test]
    fn test_divisor_scales_off_diagonal_only() {
        let x = DMatrix::from_row_slice(2, 1, &[0.0, 0.5]);
        let k = ScaledRbf::new(0.5, 2.0).unwrap().covariance(&x);
        assert_relative_eq!(k[(0, 0)], 1.0);
        assert_relative_eq!(k[(1, 1)], 1.0);
        assert_relative_eq!(k[(0, 1)], 0.5 * (-0.5_f64).exp());
    }

    #[test]
    fn test_cross_covariance_matches_covariance() {
        let x = DMatrix::from_row_slice(2, 1, &[0.0, 0.4]);
        let kernel = ScaledRbf::new(0.3, 1.0).unwrap();
        assert_eq!(kernel.cross_covariance(&x, &x), kernel.covariance(&x));
    }
}
