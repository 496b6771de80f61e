//! Prior distributions over calibration parameters
//!
//! Fresh populations are drawn through the prior quantile function (inverse CDF of an
//! open-interval uniform). The log density used by the MCMC acceptance rule is Gaussian
//! in the space each component is perturbed in: `ln x` for log-constrained components,
//! `x` otherwise.

use rand::distr::Open01;
use rand::{Rng, RngCore};
use statrs::distribution::{Continuous, ContinuousCDF, Normal};

use super::proposal::GaussianJitter;
use super::Proposer;
use crate::core_types::{LogConstraint, ParameterVector, ParticlePopulation};
use crate::error::{CalibrationError, Result};

/// A prior over parameter vectors
pub trait Prior: Send + Sync {
    /// Number of components in each draw
    fn dim(&self) -> usize;

    /// One draw from the prior
    fn sample(&self, rng: &mut dyn RngCore) -> ParameterVector;

    /// Joint log density of `theta`
    ///
    /// Returns `f64::NEG_INFINITY` (never NaN) when `theta` is outside the support, e.g. a
    /// non-positive value in a log-constrained component.
    fn log_density(&self, theta: &ParameterVector, log_constraint: &LogConstraint) -> f64;

    /// `n` independent draws stacked into a population
    ///
    /// # Errors
    /// Returns `Configuration` if `n` is zero
    fn sample_population(&self, n: usize, rng: &mut dyn RngCore) -> Result<ParticlePopulation> {
        let draws: Vec<ParameterVector> = (0..n).map(|_| self.sample(rng)).collect();
        ParticlePopulation::from_vectors(&draws)
    }
}

/// Marginal prior of one component
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentPrior {
    /// Gaussian on the linear scale
    Normal {
        /// Mean
        mean: f64,
        /// Standard deviation
        sd: f64,
    },
    /// Log-normal: `ln x ~ N(mu, sigma)`
    LogNormal {
        /// Log-space location
        mu: f64,
        /// Log-space scale
        sigma: f64,
    },
}

impl ComponentPrior {
    /// Gaussian with the given mean and standard deviation
    ///
    /// # Errors
    /// Returns `Configuration` if `sd` is not strictly positive or either value is NaN
    pub fn normal(mean: f64, sd: f64) -> Result<Self> {
        Normal::new(mean, sd)
            .map(|_| Self::Normal { mean, sd })
            .map_err(|e| CalibrationError::Configuration(format!("invalid normal prior: {e}")))
    }

    /// Log-normal with log-space location `mu` and scale `sigma`
    ///
    /// # Errors
    /// Returns `Configuration` if `sigma` is not strictly positive or either value is NaN
    pub fn log_normal(mu: f64, sigma: f64) -> Result<Self> {
        Normal::new(mu, sigma)
            .map(|_| Self::LogNormal { mu, sigma })
            .map_err(|e| CalibrationError::Configuration(format!("invalid log-normal prior: {e}")))
    }

    /// Inverse CDF at `u ∈ (0, 1)`
    pub fn quantile(&self, u: f64) -> f64 {
        match *self {
            Self::Normal { mean, sd } => Normal::new(mean, sd).map_or(f64::NAN, |d| d.inverse_cdf(u)),
            Self::LogNormal { mu, sigma } => {
                Normal::new(mu, sigma).map_or(f64::NAN, |d| d.inverse_cdf(u).exp())
            }
        }
    }

    /// Mean and standard deviation of the Gaussian approximation in linear or log space
    fn gaussian_moments(&self, log_space: bool) -> (f64, f64) {
        match (*self, log_space) {
            (Self::Normal { mean, sd }, false) => (mean, sd),
            // delta method: ln X ≈ N(ln μ, σ/μ)
            (Self::Normal { mean, sd }, true) => (mean.ln(), sd / mean),
            (Self::LogNormal { mu, sigma }, true) => (mu, sigma),
            (Self::LogNormal { mu, sigma }, false) => {
                let s2 = sigma * sigma;
                let mean = (mu + 0.5 * s2).exp();
                let sd = ((s2.exp() - 1.0) * (2.0 * mu + s2).exp()).sqrt();
                (mean, sd)
            }
        }
    }

    /// Log density of `x` under the Gaussian approximation in the chosen space
    pub fn ln_density(&self, x: f64, log_space: bool) -> f64 {
        if x.is_nan() {
            return f64::NEG_INFINITY;
        }
        let value = if log_space {
            if x <= 0.0 {
                return f64::NEG_INFINITY;
            }
            x.ln()
        } else {
            x
        };
        let (mean, sd) = self.gaussian_moments(log_space);
        Normal::new(mean, sd).map_or(f64::NEG_INFINITY, |n| n.ln_pdf(value))
    }
}

/// Independent per-component prior
#[derive(Debug, Clone, PartialEq)]
pub struct IndependentPrior {
    components: Vec<ComponentPrior>,
}

impl IndependentPrior {
    /// Build from component marginals
    ///
    /// # Errors
    /// Returns `Configuration` if no components are given
    pub fn new(components: Vec<ComponentPrior>) -> Result<Self> {
        if components.is_empty() {
            return Err(CalibrationError::Configuration(
                "prior needs at least one component".into(),
            ));
        }
        Ok(Self { components })
    }

    /// ACH ~ N(0.5, 0.15), IAS ~ N(0.5, 0.15), length-scale ~ LogNormal(-1.5, 0.25)
    ///
    /// # Errors
    /// Never fails in practice; the constants are valid
    pub fn calibration_default() -> Result<Self> {
        Self::new(vec![
            ComponentPrior::normal(0.5, 0.15)?,
            ComponentPrior::normal(0.5, 0.15)?,
            ComponentPrior::log_normal(-1.5, 0.25)?,
        ])
    }

    /// Marginal of component `j`
    pub fn component(&self, j: usize) -> Option<&ComponentPrior> {
        self.components.get(j)
    }
}

impl Prior for IndependentPrior {
    fn dim(&self) -> usize {
        self.components.len()
    }

    fn sample(&self, rng: &mut dyn RngCore) -> ParameterVector {
        ParameterVector::from_iterator(
            self.components.len(),
            self.components.iter().map(|c| c.quantile(rng.sample(Open01))),
        )
    }

    fn log_density(&self, theta: &ParameterVector, log_constraint: &LogConstraint) -> f64 {
        if theta.len() != self.components.len() {
            return f64::NEG_INFINITY;
        }
        self.components
            .iter()
            .zip(theta.iter())
            .enumerate()
            .map(|(j, (c, &x))| c.ln_density(x, log_constraint.is_log(j)))
            .sum()
    }
}

/// Prior that resumes from a previously persisted posterior
///
/// Draws pick a random particle from the stored population and rejuvenate it with the
/// supplied jitter. Densities come from the base prior, which the stored population was
/// ultimately derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumedPosteriorPrior {
    particles: ParticlePopulation,
    jitter: GaussianJitter,
    base: IndependentPrior,
}

impl ResumedPosteriorPrior {
    /// Wrap a stored population
    ///
    /// # Errors
    /// Returns `Configuration` if the population is empty or its width differs from the
    /// base prior
    pub fn new(
        particles: ParticlePopulation,
        jitter: GaussianJitter,
        base: IndependentPrior,
    ) -> Result<Self> {
        if particles.is_empty() {
            return Err(CalibrationError::Configuration(
                "cannot resume from an empty posterior".into(),
            ));
        }
        if particles.dim() != base.dim() {
            return Err(CalibrationError::Configuration(format!(
                "stored posterior has {} components but the prior has {}",
                particles.dim(),
                base.dim()
            )));
        }
        Ok(Self {
            particles,
            jitter,
            base,
        })
    }

    /// The stored population draws are taken from
    pub fn particles(&self) -> &ParticlePopulation {
        &self.particles
    }
}

impl Prior for ResumedPosteriorPrior {
    fn dim(&self) -> usize {
        self.particles.dim()
    }

    fn sample(&self, rng: &mut dyn RngCore) -> ParameterVector {
        let i = rng.random_range(0..self.particles.len());
        self.jitter.propose(&self.particles.particle(i), rng)
    }

    fn log_density(&self, theta: &ParameterVector, log_constraint: &LogConstraint) -> f64 {
        self.base.log_density(theta, log_constraint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, DVector};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_prior_draws_look_right() {
        let prior = IndependentPrior::calibration_default().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let pop = prior.sample_population(5000, &mut rng).unwrap();
        let mean = |v: Vec<f64>| v.iter().sum::<f64>() / v.len() as f64;

        assert_eq!(pop.dim(), 3);
        assert!((mean(pop.component(0)) - 0.5).abs() < 0.01);
        assert!((mean(pop.component(1)) - 0.5).abs() < 0.01);
        assert!(pop.component(2).iter().all(|&l| l > 0.0));
        let log_mean = mean(pop.component(2).iter().map(|l| l.ln()).collect());
        assert!((log_mean + 1.5).abs() < 0.02, "log mean {log_mean}");
    }

    #[test]
    fn test_log_density_is_neg_inf_outside_support() {
        let prior = IndependentPrior::calibration_default().unwrap();
        let mask = LogConstraint::calibration_default();
        let bad = DVector::from_vec(vec![0.5, 0.5, -0.1]);
        let d = prior.log_density(&bad, &mask);
        assert!(d.is_infinite() && d < 0.0);

        let zero = DVector::from_vec(vec![0.5, 0.5, 0.0]);
        assert_eq!(prior.log_density(&zero, &mask), f64::NEG_INFINITY);

        let nan = DVector::from_vec(vec![f64::NAN, 0.5, 0.2]);
        assert_eq!(prior.log_density(&nan, &mask), f64::NEG_INFINITY);
    }

    #[test]
    fn test_log_density_matches_gaussian_in_log_space() {
        let c = ComponentPrior::log_normal(-1.5, 0.25).unwrap();
        let x: f64 = 0.2;
        let z = (x.ln() + 1.5) / 0.25;
        let expected = -0.5 * z * z - (0.25 * (2.0 * std::f64::consts::PI).sqrt()).ln();
        assert_relative_eq!(c.ln_density(x, true), expected, epsilon = 1e-10);
    }

    #[test]
    fn test_invalid_component_rejected() {
        assert!(ComponentPrior::normal(0.5, 0.0).is_err());
        assert!(ComponentPrior::log_normal(0.0, -1.0).is_err());
        assert!(IndependentPrior::new(vec![]).is_err());
    }

    #[test]
    fn test_resumed_prior_draws_near_stored_particles() {
        let stored = ParticlePopulation::new(DMatrix::from_row_slice(
            2,
            3,
            &[0.2, 0.8, 0.1, 0.25, 0.75, 0.12],
        ));
        let jitter = GaussianJitter::new(vec![0.05], LogConstraint::calibration_default()).unwrap();
        let prior = ResumedPosteriorPrior::new(
            stored,
            jitter,
            IndependentPrior::calibration_default().unwrap(),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let pop = prior.sample_population(2000, &mut rng).unwrap();
        let ach_mean = pop.component(0).iter().sum::<f64>() / 2000.0;
        assert!((ach_mean - 0.225).abs() < 0.01, "ach mean {ach_mean}");
        assert!(pop.component(2).iter().all(|&l| l > 0.0));
    }

    #[test]
    fn test_resumed_prior_scores_with_base_density() {
        let base = IndependentPrior::calibration_default().unwrap();
        let stored = ParticlePopulation::new(DMatrix::from_element(4, 3, 0.9));
        let jitter = GaussianJitter::new(vec![0.05], LogConstraint::calibration_default()).unwrap();
        let prior = ResumedPosteriorPrior::new(stored, jitter, base.clone()).unwrap();
        let mask = LogConstraint::calibration_default();
        // far from the stored particles, so only the base prior explains the value
        let theta = DVector::from_vec(vec![0.3, 0.6, 0.2]);
        assert_relative_eq!(prior.log_density(&theta, &mask), base.log_density(&theta, &mask));
        let outside = DVector::from_vec(vec![0.3, 0.6, -0.2]);
        assert_eq!(prior.log_density(&outside, &mask), f64::NEG_INFINITY);
    }

    #[test]
    fn test_resumed_prior_rejects_width_mismatch() {
        let stored = ParticlePopulation::new(DMatrix::from_element(3, 2, 0.5));
        let jitter = GaussianJitter::new(vec![0.05], LogConstraint::calibration_default()).unwrap();
        let err = ResumedPosteriorPrior::new(
            stored,
            jitter,
            IndependentPrior::calibration_default().unwrap(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "Configuration");
    }
}
