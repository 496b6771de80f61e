//! Bayesian inference over calibration parameters
//!
//! Two strategies share the same primitives:
//!
//! - [`particle_filter`]: importance-weighted resampling of a whole population per window
//! - [`annealing`]: single-chain Metropolis-Hastings / simulated annealing
//!
//! Both score candidates through a [`Scorer`] (GP log marginal likelihood) and move
//! through parameter space with a [`Proposer`] (Gaussian jitter, log-space where flagged).

pub mod annealing;
pub mod likelihood;
pub mod particle_filter;
pub mod prior;
pub mod proposal;
pub mod weights;

use rand::Rng;

use crate::core_types::{ParameterVector, ParticlePopulation};
use crate::error::Result;

pub use annealing::{metropolis_hastings, sim_annealing, AnnealingSchedule, McmcChain};
pub use likelihood::{log_likelihood_ratio, LikelihoodEvaluator, SurrogateSettings};
pub use particle_filter::{CalibrationState, GpFailurePolicy, ParticleFilter};
pub use prior::{ComponentPrior, IndependentPrior, Prior, ResumedPosteriorPrior};
pub use proposal::GaussianJitter;
pub use weights::{
    effective_sample_size, normalize_log_weights, normalize_weights, ResamplingMethod,
};

/// Scores a candidate parameter vector against the current window's training context
///
/// Implementations must be deterministic: the same vector always gets the same score.
pub trait Scorer: Send + Sync {
    /// Log marginal likelihood of `theta`
    ///
    /// `Ok(f64::NEG_INFINITY)` is a valid answer meaning "zero likelihood".
    ///
    /// # Errors
    /// Returns `GpFitFailure` when the surrogate cannot be fitted for `theta`
    fn log_marginal_likelihood(&self, theta: &ParameterVector) -> Result<f64>;

    /// `logML(theta_star) - logML(theta)`
    ///
    /// # Errors
    /// Propagates either fit failure
    fn log_likelihood_ratio(
        &self,
        theta: &ParameterVector,
        theta_star: &ParameterVector,
    ) -> Result<f64> {
        Ok(self.log_marginal_likelihood(theta_star)? - self.log_marginal_likelihood(theta)?)
    }
}

/// Generates perturbed candidates from a current state
pub trait Proposer {
    /// Perturb a single parameter vector
    fn propose<R: Rng + ?Sized>(&self, theta: &ParameterVector, rng: &mut R) -> ParameterVector;

    /// Perturb every particle of a population independently
    fn perturb_population<R: Rng + ?Sized>(
        &self,
        population: &ParticlePopulation,
        rng: &mut R,
    ) -> Result<ParticlePopulation> {
        let moved: Vec<ParameterVector> = population
            .particles()
            .iter()
            .map(|p| self.propose(p, rng))
            .collect();
        ParticlePopulation::from_vectors(&moved)
    }
}
