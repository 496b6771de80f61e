//! Single-chain Metropolis-Hastings and simulated annealing
//!
//! At iteration `i` (1-based) a proposal `θ*` is accepted iff
//!
//! `ln u ≤ min(0, (ΔlogML + Δlog prior) / exp(-T·(i+1)/n))`
//!
//! so the acceptance ratio is sharpened as the chain progresses. `T = 0` is plain
//! Metropolis-Hastings. Proposals outside prior support are rejected explicitly and
//! counted; they never reach the likelihood.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::particle_filter::CalibrationState;
use super::prior::Prior;
use super::{Proposer, Scorer};
use crate::core_types::{LogConstraint, ParameterVector, ParticlePopulation};
use crate::error::{CalibrationError, Result};

/// Length and temperature of a chain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnealingSchedule {
    /// Annealing temperature `T`; zero disables annealing
    pub temperature: f64,
    /// Number of proposals
    pub n_iter: usize,
    /// Leading samples discarded, counting the initial prior draw
    pub burn: usize,
}

/// Output of a chain
#[derive(Debug, Clone, PartialEq)]
pub struct McmcChain {
    samples: ParticlePopulation,
    accepted: usize,
    out_of_support: usize,
    n_iter: usize,
}

impl McmcChain {
    /// Retained samples, one per row
    pub fn samples(&self) -> &ParticlePopulation {
        &self.samples
    }

    /// Accepted proposals
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Proposals rejected because the prior density was zero
    pub fn out_of_support(&self) -> usize {
        self.out_of_support
    }

    /// Fraction of proposals accepted
    pub fn acceptance_rate(&self) -> f64 {
        if self.n_iter == 0 {
            0.0
        } else {
            self.accepted as f64 / self.n_iter as f64
        }
    }

    /// Use the chain as a calibration posterior
    pub fn into_state(self) -> CalibrationState {
        CalibrationState {
            posterior: Some(self.samples),
            ..CalibrationState::initial()
        }
    }
}

/// Simulated annealing chain started from a prior draw
///
/// The current state's log marginal likelihood is cached between iterations, so each
/// proposal costs one GP fit. The difference is the same log-likelihood ratio the
/// [`Scorer`] reports.
///
/// # Errors
/// `Configuration` if `burn` exceeds the chain length; scorer errors on the initial
/// draw. A GP fit failure on a proposal rejects that proposal.
pub fn sim_annealing<S, P, R>(
    schedule: &AnnealingSchedule,
    prior: &dyn Prior,
    proposer: &P,
    log_constraint: &LogConstraint,
    scorer: &S,
    rng: &mut R,
) -> Result<McmcChain>
where
    S: Scorer,
    P: Proposer,
    R: Rng,
{
    let AnnealingSchedule {
        temperature,
        n_iter,
        burn,
    } = *schedule;
    if burn > n_iter {
        return Err(CalibrationError::Configuration(format!(
            "burn-in of {burn} leaves no samples from a chain of {}",
            n_iter + 1
        )));
    }

    let mut current = prior.sample(rng);
    let mut current_lml = scorer.log_marginal_likelihood(&current)?;
    let mut current_lp = prior.log_density(&current, log_constraint);

    let mut chain: Vec<ParameterVector> = Vec::with_capacity(n_iter + 1);
    chain.push(current.clone());
    let mut accepted = 0;
    let mut out_of_support = 0;

    for i in 1..=n_iter {
        let proposal = proposer.propose(&current, rng);
        let proposal_lp = prior.log_density(&proposal, log_constraint);

        let accept = if proposal_lp == f64::NEG_INFINITY {
            out_of_support += 1;
            false
        } else {
            match scorer.log_marginal_likelihood(&proposal) {
                Ok(proposal_lml) => {
                    let ratio = if proposal_lml == current_lml {
                        0.0
                    } else {
                        proposal_lml - current_lml
                    };
                    let cooling = (-temperature * (i + 1) as f64 / n_iter as f64).exp();
                    let log_alpha = ((ratio + proposal_lp - current_lp) / cooling).min(0.0);
                    let u: f64 = rng.random();
                    if u.ln() <= log_alpha {
                        current_lml = proposal_lml;
                        true
                    } else {
                        false
                    }
                }
                Err(CalibrationError::GpFitFailure { parameters, source }) => {
                    warn!(iteration = i, ?parameters, %source, "GP fit failed, rejecting proposal");
                    false
                }
                Err(e) => return Err(e),
            }
        };

        if accept {
            current = proposal;
            current_lp = proposal_lp;
            accepted += 1;
        }
        chain.push(current.clone());
    }

    debug!(
        n_iter,
        accepted,
        out_of_support,
        temperature,
        "chain finished"
    );

    Ok(McmcChain {
        samples: ParticlePopulation::from_vectors(&chain[burn..])?,
        accepted,
        out_of_support,
        n_iter,
    })
}

/// Metropolis-Hastings: [`sim_annealing`] at zero temperature
///
/// # Errors
/// See [`sim_annealing`]
pub fn metropolis_hastings<S, P, R>(
    n_iter: usize,
    burn: usize,
    prior: &dyn Prior,
    proposer: &P,
    log_constraint: &LogConstraint,
    scorer: &S,
    rng: &mut R,
) -> Result<McmcChain>
where
    S: Scorer,
    P: Proposer,
    R: Rng,
{
    let schedule = AnnealingSchedule {
        temperature: 0.0,
        n_iter,
        burn,
    };
    sim_annealing(&schedule, prior, proposer, log_constraint, scorer, rng)
}
