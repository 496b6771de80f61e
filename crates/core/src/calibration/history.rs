//! Ground-truth observations used at each calibration step
//!
//! Missing observations are replaced by the last value used, so the history never
//! holds NaN.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CalibrationError, Result};

/// The observation a step was calibrated against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Calibration step
    pub step: usize,
    /// Relative humidity fraction used as ground truth
    pub value: f64,
    /// Whether `value` was carried over because the observation was missing
    pub carried_forward: bool,
}

/// Append-only sequence of ground-truth values, one per step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataPointHistory {
    points: Vec<DataPoint>,
    bootstrap: Option<f64>,
}

impl DataPointHistory {
    /// Empty history; a missing first observation is fatal
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty history that substitutes `value` for a missing first observation
    pub fn with_bootstrap(value: f64) -> Self {
        Self {
            points: Vec::new(),
            bootstrap: Some(value),
        }
    }

    /// Record the observation for `step`, carrying the previous value over a NaN
    ///
    /// # Errors
    /// `MissingObservation` if `observed` is not finite and there is neither a previous
    /// value nor a bootstrap value
    pub fn record(&mut self, step: usize, observed: f64) -> Result<DataPoint> {
        let point = if observed.is_finite() {
            DataPoint {
                step,
                value: observed,
                carried_forward: false,
            }
        } else {
            let value = self
                .last()
                .map(|p| p.value)
                .or(self.bootstrap)
                .ok_or_else(|| {
                    CalibrationError::MissingObservation(format!(
                        "no observation at step {step} and no earlier value to carry forward"
                    ))
                })?;
            warn!(step, value, "observation missing, carrying previous value forward");
            DataPoint {
                step,
                value,
                carried_forward: true,
            }
        };
        self.points.push(point);
        Ok(point)
    }

    /// Most recent entry
    pub fn last(&self) -> Option<&DataPoint> {
        self.points.last()
    }

    /// All entries in step order
    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    /// Values in step order
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Number of recorded steps
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carries_last_value_over_gaps() {
        let mut history = DataPointHistory::new();
        history.record(0, 0.71).unwrap();
        let second = history.record(1, f64::NAN).unwrap();
        assert!(second.carried_forward);
        history.record(2, f64::NAN).unwrap();
        history.record(3, 0.64).unwrap();
        assert_eq!(history.values(), vec![0.71, 0.71, 0.71, 0.64]);
    }

    #[test]
    fn test_first_missing_is_fatal_without_bootstrap() {
        let mut history = DataPointHistory::new();
        let err = history.record(0, f64::NAN).unwrap_err();
        assert_eq!(err.kind(), "MissingObservation");
        assert!(history.is_empty());
    }

    #[test]
    fn test_bootstrap_only_covers_first_gap() {
        let mut history = DataPointHistory::with_bootstrap(0.5);
        assert_eq!(history.record(0, f64::NAN).unwrap().value, 0.5);
        history.record(1, 0.8).unwrap();
        assert_eq!(history.record(2, f64::NAN).unwrap().value, 0.8);
    }
}
