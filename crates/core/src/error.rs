//! Error taxonomy for the calibration engine
//!
//! Every fatal condition the engine can hit maps onto one `CalibrationError` variant.
//! Failures raised inside the window controller are additionally wrapped in a
//! [`RunError`] that records where in the run they happened, so a failed run can be
//! reproduced from the message alone.

use std::fmt;

use thiserror::Error;

/// Why a single Gaussian process covariance fit failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GpFitError {
    /// A training input, output, or noise entry was NaN or infinite
    #[error("non-finite value in {what} at row {row}")]
    NonFiniteInput {
        /// Which array carried the value (`inputs`, `outputs`, `noise`)
        what: &'static str,
        /// Offending row
        row: usize,
    },

    /// Cholesky factorisation failed: the covariance is singular or indefinite
    #[error("covariance matrix of size {size} is not positive definite")]
    NotPositiveDefinite {
        /// Number of training rows
        size: usize,
    },

    /// Kernel length-scale must be finite and strictly positive
    #[error("kernel length-scale must be finite and positive, got {0}")]
    InvalidLengthScale(f64),

    /// Kernel output-scale divisor must be finite and strictly positive
    #[error("kernel output-scale divisor must be finite and positive, got {0}")]
    InvalidOutputScale(f64),

    /// Input and output row counts disagree
    #[error("training inputs have {inputs} rows but outputs have {outputs}")]
    ShapeMismatch {
        /// Rows in the input matrix
        inputs: usize,
        /// Rows in the output vector (or noise vector)
        outputs: usize,
    },
}

/// Errors produced by the calibration engine
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Not enough weather or monitored rows to build a window
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    /// The simulator returned malformed or non-finite output
    #[error("simulation failure: {0}")]
    SimulationFailure(String),

    /// A Gaussian process fit failed for a specific parameter vector
    #[error("GP fit failed for parameters {parameters:?}: {source}")]
    GpFitFailure {
        /// The particle whose surrogate could not be fitted
        parameters: Vec<f64>,
        /// Underlying numerical failure
        #[source]
        source: GpFitError,
    },

    /// Importance weights are all zero or non-finite
    #[error("degenerate importance weights: {0}")]
    DegenerateWeights(String),

    /// Ground-truth observation missing with nothing to carry forward
    #[error("missing observation: {0}")]
    MissingObservation(String),

    /// Inconsistent dimensions or invalid option values
    #[error("configuration error: {0}")]
    Configuration(String),

    /// File or CSV I/O failed while reading inputs or persisting results
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl CalibrationError {
    /// Short machine-friendly name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DataUnavailable(_) => "DataUnavailable",
            Self::SimulationFailure(_) => "SimulationFailure",
            Self::GpFitFailure { .. } => "GPFitFailure",
            Self::DegenerateWeights(_) => "DegenerateWeights",
            Self::MissingObservation(_) => "MissingObservation",
            Self::Configuration(_) => "Configuration",
            Self::Persistence(_) => "Persistence",
        }
    }
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(err: csv::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Hour bounds of a calibration window, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    /// First hour of weather fed to the simulator
    pub start_hour: usize,
    /// Hour whose observation is the ground truth for this step
    pub end_hour: usize,
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start_hour, self.end_hour)
    }
}

/// A calibration run failure with enough context to reproduce it
#[derive(Debug, Error)]
#[error(
    "calibration step {step} failed during {phase} (window {window}, {particles} particles): {kind}: {source}",
    kind = .source.kind()
)]
pub struct RunError {
    /// Zero-based calibration step
    pub step: usize,
    /// Controller phase that was executing
    pub phase: &'static str,
    /// Window bounds of the failing step
    pub window: WindowBounds,
    /// Particle population size
    pub particles: usize,
    /// Underlying failure
    #[source]
    pub source: CalibrationError,
}

/// Convenience alias used across the crate
pub type Result<T, E = CalibrationError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_reports_step_and_kind() {
        let err = RunError {
            step: 3,
            phase: "CALIBRATING",
            window: WindowBounds {
                start_hour: 37,
                end_hour: 276,
            },
            particles: 1000,
            source: CalibrationError::DegenerateWeights("sum of likelihoods is 0".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("step 3"), "{msg}");
        assert!(msg.contains("[37, 276]"), "{msg}");
        assert!(msg.contains("1000 particles"), "{msg}");
        assert!(msg.contains("DegenerateWeights"), "{msg}");
    }

    #[test]
    fn test_gp_fit_failure_carries_parameters() {
        let err = CalibrationError::GpFitFailure {
            parameters: vec![0.5, 0.5, 0.2],
            source: GpFitError::NotPositiveDefinite { size: 63 },
        };
        assert_eq!(err.kind(), "GPFitFailure");
        assert!(err.to_string().contains("0.2"));
    }
}
