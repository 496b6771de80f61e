//! Sequential importance resampling over calibration parameters
//!
//! One call to [`ParticleFilter::sequential_update`] is one calibration window:
//!
//! 1. build the prior population (fresh prior draws, or the previous posterior with
//!    Gaussian jitter),
//! 2. score every particle with the GP marginal likelihood (in parallel),
//! 3. normalise to weights, failing loudly on degeneracy,
//! 4. resample with replacement,
//! 5. clip ACH and IAS into `[0, 1]`.
//!
//! State is explicit: the filter itself is immutable configuration, and every step
//! consumes a [`CalibrationState`] and returns the next one.

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::prior::Prior;
use super::proposal::GaussianJitter;
use super::weights::{effective_sample_size, normalize_log_weights, ResamplingMethod};
use super::{Proposer, Scorer};
use crate::core_types::{ParticlePopulation, UNIT_CLIPPED};
use crate::error::{CalibrationError, Result};

/// What to do when a single particle's GP cannot be fitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpFailurePolicy {
    /// Log the offending vector and give the particle zero weight
    #[default]
    ZeroWeight,
    /// Abort the step
    Abort,
}

/// Everything one calibration step produced
///
/// `prior`, `ml_samples`, `log_ml_samples`, `weights` and `indices` are diagnostics for
/// the step just completed. `posterior` seeds the next step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Population before reweighting
    pub prior: Option<ParticlePopulation>,
    /// Population after resampling and clipping
    pub posterior: Option<ParticlePopulation>,
    /// Raw marginal likelihoods `exp(lml)`
    pub ml_samples: Vec<f64>,
    /// Log marginal likelihoods, `-inf` for failed fits
    pub log_ml_samples: Vec<f64>,
    /// Normalised weights
    pub weights: Vec<f64>,
    /// Resampled indices into `prior`
    pub indices: Vec<usize>,
}

impl CalibrationState {
    /// State before the first window
    pub fn initial() -> Self {
        Self::default()
    }

    /// Whether a posterior exists to seed the next window
    pub fn has_posterior(&self) -> bool {
        self.posterior.is_some()
    }

    /// Effective sample size of the last weighting
    pub fn effective_sample_size(&self) -> f64 {
        effective_sample_size(&self.weights)
    }
}

/// Particle filter configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleFilter {
    n_particles: usize,
    jitter: GaussianJitter,
    policy: GpFailurePolicy,
    resampling: ResamplingMethod,
}

impl ParticleFilter {
    /// Filter resampling `n_particles` per step, rejuvenating with `jitter`
    ///
    /// # Errors
    /// Returns `Configuration` if `n_particles` is zero
    pub fn new(n_particles: usize, jitter: GaussianJitter) -> Result<Self> {
        if n_particles == 0 {
            return Err(CalibrationError::Configuration(
                "particle count must be positive".into(),
            ));
        }
        Ok(Self {
            n_particles,
            jitter,
            policy: GpFailurePolicy::default(),
            resampling: ResamplingMethod::default(),
        })
    }

    /// Set the GP failure policy
    pub fn with_policy(mut self, policy: GpFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the resampling scheme
    pub fn with_resampling(mut self, resampling: ResamplingMethod) -> Self {
        self.resampling = resampling;
        self
    }

    /// Particles drawn per step
    pub fn n_particles(&self) -> usize {
        self.n_particles
    }

    /// Rejuvenation proposal
    pub fn jitter(&self) -> &GaussianJitter {
        &self.jitter
    }

    /// Prior population for the next step
    ///
    /// Fresh prior draws on the first window, otherwise the previous posterior perturbed
    /// by the jitter (log-space for flagged components).
    ///
    /// # Errors
    /// Propagates population construction errors
    pub fn prepare_prior<R: Rng>(
        &self,
        state: &CalibrationState,
        prior: &dyn Prior,
        rng: &mut R,
    ) -> Result<ParticlePopulation> {
        match &state.posterior {
            Some(previous) => self.jitter.perturb_population(previous, rng),
            None => prior.sample_population(self.n_particles, rng),
        }
    }

    /// Run one full calibration step
    ///
    /// # Errors
    /// `DegenerateWeights` if no particle has positive likelihood; `GpFitFailure` under
    /// [`GpFailurePolicy::Abort`]; any scorer configuration error
    pub fn sequential_update<S: Scorer, R: Rng>(
        &self,
        state: &CalibrationState,
        prior: &dyn Prior,
        scorer: &S,
        rng: &mut R,
    ) -> Result<CalibrationState> {
        let particles = self.prepare_prior(state, prior, rng)?;
        self.update_population(particles, scorer, rng)
    }

    /// Score, weight and resample a given prior population
    ///
    /// # Errors
    /// See [`ParticleFilter::sequential_update`]
    pub fn update_population<S: Scorer, R: Rng + ?Sized>(
        &self,
        particles: ParticlePopulation,
        scorer: &S,
        rng: &mut R,
    ) -> Result<CalibrationState> {
        let log_ml = self.score(&particles, scorer)?;
        let weights = normalize_log_weights(&log_ml)?;
        let indices = self.resampling.resample(&weights, self.n_particles, rng)?;

        let mut posterior = particles.select(&indices);
        posterior.clip_unit_interval(&UNIT_CLIPPED);

        debug!(
            particles = particles.len(),
            resampled = indices.len(),
            ess = effective_sample_size(&weights),
            "resampled population"
        );

        Ok(CalibrationState {
            ml_samples: log_ml.iter().map(|l| l.exp()).collect(),
            log_ml_samples: log_ml,
            weights,
            indices,
            prior: Some(particles),
            posterior: Some(posterior),
        })
    }

    /// Log marginal likelihood of every particle, computed on the rayon pool
    ///
    /// # Errors
    /// Propagates scorer errors, except GP fit failures under
    /// [`GpFailurePolicy::ZeroWeight`]
    pub fn score<S: Scorer>(&self, particles: &ParticlePopulation, scorer: &S) -> Result<Vec<f64>> {
        let policy = self.policy;
        (0..particles.len())
            .into_par_iter()
            .map(|i| {
                let theta = particles.particle(i);
                match scorer.log_marginal_likelihood(&theta) {
                    Ok(lml) => Ok(lml),
                    Err(CalibrationError::GpFitFailure { parameters, source })
                        if policy == GpFailurePolicy::ZeroWeight =>
                    {
                        warn!(particle = i, ?parameters, %source, "GP fit failed, assigning zero weight");
                        Ok(f64::NEG_INFINITY)
                    }
                    Err(e) => Err(e),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{LogConstraint, ParameterVector};
    use crate::error::GpFitError;
    use crate::inference::prior::IndependentPrior;
    use nalgebra::{DMatrix, DVector};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Looks up a fixed likelihood by exact vector match
    struct TableScorer(Vec<(Vec<f64>, f64)>);

    impl Scorer for TableScorer {
        fn log_marginal_likelihood(&self, theta: &ParameterVector) -> Result<f64> {
            let key: Vec<f64> = theta.iter().copied().collect();
            self.0
                .iter()
                .find(|(v, _)| *v == key)
                .map(|(_, ml)| ml.ln())
                .ok_or_else(|| CalibrationError::Configuration(format!("unknown particle {key:?}")))
        }
    }

    /// Likelihood peaked at ACH = 0.3
    struct PeakScorer;

    impl Scorer for PeakScorer {
        fn log_marginal_likelihood(&self, theta: &ParameterVector) -> Result<f64> {
            if theta[2] <= 0.0 {
                return Err(CalibrationError::GpFitFailure {
                    parameters: theta.iter().copied().collect(),
                    source: GpFitError::InvalidLengthScale(theta[2]),
                });
            }
            Ok(-((theta[0] - 0.3) / 0.05).powi(2))
        }
    }

    fn three_particles() -> ParticlePopulation {
        ParticlePopulation::from_vectors(&[
            DVector::from_vec(vec![0.5, 0.5, 1.0]),
            DVector::from_vec(vec![2.0, 2.0, 1.0]),
            DVector::from_vec(vec![-1.0, -1.0, 1.0]),
        ])
        .unwrap()
    }

    fn table() -> TableScorer {
        TableScorer(vec![
            (vec![0.5, 0.5, 1.0], 10.0),
            (vec![2.0, 2.0, 1.0], 0.0),
            (vec![-1.0, -1.0, 1.0], 0.0),
        ])
    }

    fn zero_jitter_filter(n: usize) -> ParticleFilter {
        ParticleFilter::new(
            n,
            GaussianJitter::new(vec![0.0], LogConstraint::calibration_default()).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_point_mass_collapses_population() {
        let filter = zero_jitter_filter(3);
        let mut rng = StdRng::seed_from_u64(42);
        let state = filter
            .update_population(three_particles(), &table(), &mut rng)
            .unwrap();

        assert_eq!(state.weights, vec![1.0, 0.0, 0.0]);
        assert_eq!(state.indices, vec![0, 0, 0]);
        assert_eq!(state.ml_samples[1], 0.0);
        let posterior = state.posterior.unwrap();
        for i in 0..3 {
            assert_eq!(posterior.particle(i).as_slice(), &[0.5, 0.5, 1.0]);
        }
    }

    #[test]
    fn test_sequential_update_reuses_previous_posterior() {
        let filter = zero_jitter_filter(3);
        let prior = IndependentPrior::calibration_default().unwrap();
        let previous = CalibrationState {
            posterior: Some(three_particles()),
            ..CalibrationState::initial()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let state = filter
            .sequential_update(&previous, &prior, &table(), &mut rng)
            .unwrap();
        assert_eq!(state.prior.as_ref(), Some(&three_particles()));
        assert!(state
            .posterior
            .unwrap()
            .particles()
            .iter()
            .all(|p| p.as_slice() == [0.5, 0.5, 1.0]));
    }

    #[test]
    fn test_all_zero_likelihood_is_degenerate() {
        let filter = zero_jitter_filter(3);
        let scorer = TableScorer(vec![
            (vec![0.5, 0.5, 1.0], 0.0),
            (vec![2.0, 2.0, 1.0], 0.0),
            (vec![-1.0, -1.0, 1.0], 0.0),
        ]);
        let mut rng = StdRng::seed_from_u64(0);
        let err = filter
            .update_population(three_particles(), &scorer, &mut rng)
            .unwrap_err();
        assert_eq!(err.kind(), "DegenerateWeights");
    }

    #[test]
    fn test_gp_failure_policy() {
        let pop = ParticlePopulation::new(DMatrix::from_row_slice(
            2,
            3,
            &[0.3, 0.5, 0.2, 0.3, 0.5, -0.2],
        ));
        let mut rng = StdRng::seed_from_u64(0);

        let lenient = zero_jitter_filter(4);
        let state = lenient
            .update_population(pop.clone(), &PeakScorer, &mut rng)
            .unwrap();
        assert_eq!(state.weights, vec![1.0, 0.0]);
        assert_eq!(state.log_ml_samples[1], f64::NEG_INFINITY);

        let strict = zero_jitter_filter(4).with_policy(GpFailurePolicy::Abort);
        let err = strict
            .update_population(pop, &PeakScorer, &mut rng)
            .unwrap_err();
        assert_eq!(err.kind(), "GPFitFailure");
    }

    #[test]
    fn test_fresh_prior_concentrates_on_peak() {
        let filter = ParticleFilter::new(
            400,
            GaussianJitter::new(vec![0.05, 0.05, 0.05], LogConstraint::calibration_default())
                .unwrap(),
        )
        .unwrap()
        .with_resampling(ResamplingMethod::Systematic);
        let prior = IndependentPrior::calibration_default().unwrap();
        let mut rng = StdRng::seed_from_u64(17);

        let mut state = CalibrationState::initial();
        for _ in 0..3 {
            state = filter
                .sequential_update(&state, &prior, &PeakScorer, &mut rng)
                .unwrap();
        }
        let ach = state.posterior.unwrap().component(0);
        let mean = ach.iter().sum::<f64>() / ach.len() as f64;
        assert_eq!(ach.len(), 400);
        assert!((mean - 0.3).abs() < 0.05, "posterior ACH mean {mean}");
    }

    #[test]
    fn test_zero_particles_rejected() {
        let jitter = GaussianJitter::new(vec![0.05], LogConstraint::default()).unwrap();
        assert!(ParticleFilter::new(0, jitter).is_err());
    }

    /// Scores by a hash of the vector so every particle gets some finite likelihood
    struct SmoothScorer;

    impl Scorer for SmoothScorer {
        fn log_marginal_likelihood(&self, theta: &ParameterVector) -> Result<f64> {
            Ok(-(theta[0] * 3.0).sin().abs() - theta[1].cos().abs())
        }
    }

    proptest! {
        #[test]
        fn prop_posterior_respects_domain(
            rows in prop::collection::vec((-3.0f64..3.0, -3.0f64..3.0, 1e-3f64..5.0), 1..30),
            seed in any::<u64>(),
        ) {
            let flat: Vec<f64> = rows.iter().flat_map(|&(a, b, c)| [a, b, c]).collect();
            let pop = ParticlePopulation::new(DMatrix::from_row_slice(rows.len(), 3, &flat));
            let filter = zero_jitter_filter(rows.len());
            let mut rng = StdRng::seed_from_u64(seed);
            let state = filter.update_population(pop, &SmoothScorer, &mut rng).unwrap();

            let sum: f64 = state.weights.iter().sum();
            prop_assert!((sum - 1.0).abs() < 1e-9);
            let posterior = state.posterior.unwrap();
            for p in posterior.particles() {
                prop_assert!((0.0..=1.0).contains(&p[0]));
                prop_assert!((0.0..=1.0).contains(&p[1]));
                prop_assert!(p[2] > 0.0);
            }
        }
    }
}
