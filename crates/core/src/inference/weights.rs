//! Importance weights and resampling
//!
//! Weights are normalised in the log domain: `w_i = exp(l_i - max l) / Σ exp(l_j - max l)`.
//! This equals `ml_i / Σ ml` whenever the raw sum is representable, and still works
//! when every `exp(l_i)` underflows to zero.

use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};

/// Resampling scheme used after reweighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingMethod {
    /// `N` independent categorical draws
    #[default]
    Multinomial,
    /// One uniform offset and `N` evenly spaced pointers, lower variance
    Systematic,
}

impl ResamplingMethod {
    /// Draw `n` indices with probabilities `weights`
    ///
    /// # Errors
    /// Returns `DegenerateWeights` if the weights cannot form a distribution
    pub fn resample<R: Rng + ?Sized>(
        self,
        weights: &[f64],
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        match self {
            Self::Multinomial => multinomial_resample(weights, n, rng),
            Self::Systematic => systematic_resample(weights, n, rng),
        }
    }
}

/// Normalise raw (linear) likelihoods to a probability vector
///
/// # Errors
/// Returns `DegenerateWeights` if any value is negative or NaN, or the sum is zero or
/// non-finite
pub fn normalize_weights(raw: &[f64]) -> Result<Vec<f64>> {
    if let Some(i) = raw.iter().position(|w| w.is_nan() || *w < 0.0) {
        return Err(CalibrationError::DegenerateWeights(format!(
            "likelihood {i} is {}",
            raw[i]
        )));
    }
    let sum: f64 = raw.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return Err(CalibrationError::DegenerateWeights(format!(
            "sum of {} likelihoods is {sum}",
            raw.len()
        )));
    }
    Ok(raw.iter().map(|w| w / sum).collect())
}

/// Normalise log likelihoods to a probability vector with the log-sum-exp shift
///
/// `-inf` entries get weight zero.
///
/// # Errors
/// Returns `DegenerateWeights` if any entry is NaN or `+inf`, or if every entry is `-inf`
pub fn normalize_log_weights(log_ml: &[f64]) -> Result<Vec<f64>> {
    if let Some(i) = log_ml.iter().position(|l| l.is_nan() || *l == f64::INFINITY) {
        return Err(CalibrationError::DegenerateWeights(format!(
            "log likelihood {i} is {}",
            log_ml[i]
        )));
    }
    let max = log_ml.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return Err(CalibrationError::DegenerateWeights(format!(
            "all {} particles have zero likelihood",
            log_ml.len()
        )));
    }
    let shifted: Vec<f64> = log_ml.iter().map(|l| (l - max).exp()).collect();
    normalize_weights(&shifted)
}

/// Effective sample size `1 / Σ w²` of a normalised weight vector
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq > 0.0 {
        1.0 / sum_sq
    } else {
        0.0
    }
}

/// `n` independent categorical draws
///
/// # Errors
/// Returns `DegenerateWeights` if the weights are empty, all zero, or invalid
pub fn multinomial_resample<R: Rng + ?Sized>(
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Result<Vec<usize>> {
    let dist = WeightedIndex::new(weights)
        .map_err(|e| CalibrationError::DegenerateWeights(format!("cannot resample: {e}")))?;
    Ok((0..n).map(|_| dist.sample(rng)).collect())
}

/// Systematic resampling with a single uniform offset
///
/// Zero-weight particles are never selected.
///
/// # Errors
/// Returns `DegenerateWeights` if the weights are empty or sum to zero
pub fn systematic_resample<R: Rng + ?Sized>(
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Result<Vec<usize>> {
    let total: f64 = weights.iter().sum();
    if weights.is_empty() || !(total.is_finite() && total > 0.0) {
        return Err(CalibrationError::DegenerateWeights(format!(
            "cannot resample {} weights summing to {total}",
            weights.len()
        )));
    }
    let last_positive = weights.iter().rposition(|&w| w > 0.0).unwrap_or(0);
    let step = total / n as f64;
    let u0 = rng.random::<f64>() * step;

    let mut indices = Vec::with_capacity(n);
    let mut cumulative = weights[0];
    let mut j = 0;
    for i in 0..n {
        let pointer = u0 + i as f64 * step;
        while (cumulative <= pointer || weights[j] <= 0.0) && j < last_positive {
            j += 1;
            cumulative += weights[j];
        }
        indices.push(j);
    }
    Ok(indices)
}
