//! Run configuration
//!
//! [`CalibrationConfig`] gathers every option a calibration run recognises. Defaults
//! reproduce the production settings; a JSON file may override any subset of them and
//! the command line overrides the file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core_types::{LogConstraint, PARAMETER_DIM};
use crate::error::{CalibrationError, Result};
use crate::inference::{GaussianJitter, GpFailurePolicy, ResamplingMethod, SurrogateSettings};
use crate::psychrometrics::Standardizer;
use crate::simulation::SimulationConfig;

/// Options of a calibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Measurement error standard deviation
    pub sigma_y: f64,
    /// Regularisation variance of simulated GP rows
    pub nugget: f64,
    /// Model-bias scaling of the GP kernel
    pub lambda_e: f64,
    /// Days of weather requested from the data source
    pub num_weather_days: usize,
    /// Days of aligned weather/monitored history kept for the run
    pub delta_days: usize,
    /// Days of weather fed to the simulator per window
    pub calibration_window_days: usize,
    /// Number of calibration steps
    pub num_data_points: usize,
    /// Hours between consecutive steps
    pub delta_h: usize,
    /// Window end hour of the first step
    pub first_hour: usize,
    /// Standardisation mean of relative humidity
    pub ym: f64,
    /// Standardisation standard deviation of relative humidity
    pub ystd: f64,
    /// Monitored sensor providing ground truth
    pub sensor_id: u32,
    /// Particle population size
    pub num_particles: usize,
    /// Per-component perturbation scale
    pub perturbation_scale: Vec<f64>,
    /// Per-component log-space flag (0 or 1)
    pub log_constraint: Vec<u8>,
    /// Coordinates of simulated outputs
    pub x_model: Vec<f64>,
    /// Coordinates of observed outputs
    pub x_data: Vec<f64>,
    /// Seed for every random draw of the run; entropy when absent
    pub seed: Option<u64>,
    /// Ground truth used when the first step has no observation
    pub bootstrap_data_point: Option<f64>,
    /// Handling of a particle whose GP fit fails
    pub gp_failure_policy: GpFailurePolicy,
    /// Resampling scheme
    pub resampling: ResamplingMethod,
    /// Simulator settings
    pub simulation: SimulationConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            sigma_y: 0.5,
            nugget: 1e-9,
            lambda_e: 1.0,
            num_weather_days: 25,
            delta_days: 20,
            calibration_window_days: 10,
            num_data_points: 21,
            delta_h: 12,
            first_hour: 240,
            ym: 0.6456,
            ystd: 0.0675,
            sensor_id: 27,
            num_particles: 1000,
            perturbation_scale: vec![0.05, 0.05, 0.05],
            log_constraint: vec![0, 0, 1],
            x_model: vec![0.5],
            x_data: vec![0.0, 0.5, 1.0],
            seed: None,
            bootstrap_data_point: None,
            gp_failure_policy: GpFailurePolicy::default(),
            resampling: ResamplingMethod::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl CalibrationConfig {
    /// Load a (possibly partial) JSON configuration file
    ///
    /// # Errors
    /// `Persistence` if the file cannot be read, `Configuration` if it does not parse
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            CalibrationError::Configuration(format!("{}: {e}", path.display()))
        })
    }

    /// Hours of weather per simulation window
    pub fn window_hours(&self) -> usize {
        self.calibration_window_days * 24
    }

    /// Hours of aligned history the run works on; the history holds one more row
    pub fn history_hours(&self) -> usize {
        self.delta_days * 24
    }

    /// Window end hour of the final step
    pub fn last_hour(&self) -> usize {
        self.first_hour + self.num_data_points.saturating_sub(1) * self.delta_h
    }

    /// GP noise settings
    pub fn surrogate_settings(&self) -> SurrogateSettings {
        SurrogateSettings {
            sigma_y: self.sigma_y,
            nugget: self.nugget,
            lambda_e: self.lambda_e,
        }
    }

    /// Relative humidity standardisation
    pub fn standardizer(&self) -> Standardizer {
        Standardizer {
            mean: self.ym,
            std: self.ystd,
        }
    }

    /// Log-space perturbation mask
    pub fn log_mask(&self) -> LogConstraint {
        LogConstraint::from_flags(&self.log_constraint)
    }

    /// Particle perturbation kernel
    ///
    /// # Errors
    /// See [`GaussianJitter::new`]
    pub fn jitter(&self) -> Result<GaussianJitter> {
        GaussianJitter::new(self.perturbation_scale.clone(), self.log_mask())
    }

    /// Reject inconsistent settings before any data is touched
    ///
    /// # Errors
    /// `Configuration` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(CalibrationError::Configuration(msg));

        if !(self.sigma_y.is_finite() && self.sigma_y > 0.0) {
            return bad(format!("sigma_y must be positive, got {}", self.sigma_y));
        }
        if !(self.nugget.is_finite() && self.nugget >= 0.0) {
            return bad(format!("nugget must be non-negative, got {}", self.nugget));
        }
        if !(self.lambda_e.is_finite() && self.lambda_e > 0.0) {
            return bad(format!("lambda_e must be positive, got {}", self.lambda_e));
        }
        if !(self.ystd.is_finite() && self.ystd > 0.0) || !self.ym.is_finite() {
            return bad(format!(
                "standardisation needs finite ym and positive ystd, got {} / {}",
                self.ym, self.ystd
            ));
        }
        if self.num_particles == 0 {
            return bad("num_particles must be at least 1".into());
        }
        if self.num_data_points == 0 {
            return bad("num_data_points must be at least 1".into());
        }
        if self.delta_h == 0 && self.num_data_points > 1 {
            return bad("delta_h must be positive when more than one step is run".into());
        }
        if self.calibration_window_days == 0 {
            return bad("calibration_window_days must be at least 1".into());
        }
        if self.delta_days > self.num_weather_days {
            return bad(format!(
                "delta_days ({}) exceeds num_weather_days ({})",
                self.delta_days, self.num_weather_days
            ));
        }
        if self.first_hour + 1 < self.window_hours() {
            return bad(format!(
                "first window ending at hour {} cannot hold {} hours of weather",
                self.first_hour,
                self.window_hours()
            ));
        }
        if self.last_hour() > self.history_hours() {
            return bad(format!(
                "final step ends at hour {} but only {} hours of history are kept",
                self.last_hour(),
                self.history_hours()
            ));
        }
        if self.log_constraint.len() != PARAMETER_DIM || self.log_constraint.iter().any(|f| *f > 1)
        {
            return bad(format!(
                "log_constraint must hold {PARAMETER_DIM} flags of 0 or 1, got {:?}",
                self.log_constraint
            ));
        }
        if !self.log_mask().is_log(PARAMETER_DIM - 1) {
            return bad("the length-scale component must be perturbed in log space".into());
        }
        if self.perturbation_scale.len() != 1 && self.perturbation_scale.len() != PARAMETER_DIM {
            return bad(format!(
                "perturbation_scale must hold 1 or {PARAMETER_DIM} values, got {}",
                self.perturbation_scale.len()
            ));
        }
        if self.x_model.is_empty() || self.x_data.is_empty() {
            return bad("x_model and x_data need at least one coordinate each".into());
        }
        if let Some(dp) = self.bootstrap_data_point {
            if !(0.0..=1.0).contains(&dp) {
                return bad(format!(
                    "bootstrap_data_point is a relative humidity fraction, got {dp}"
                ));
            }
        }
        self.jitter()?;
        self.simulation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CalibrationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.window_hours(), 240);
        assert_eq!(config.last_hour(), 480);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"num_particles": 50, "seed": 7, "simulation": {{"substeps": 20}}}}"#)
            .unwrap();
        let config = CalibrationConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.num_particles, 50);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.simulation.substeps, 20);
        assert_eq!(config.sigma_y, 0.5);
        config.validate().unwrap();
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = CalibrationConfig::from_json_file(file.path()).unwrap_err();
        assert_eq!(err.kind(), "Configuration");
    }

    #[test]
    fn test_rejects_window_before_start_of_history() {
        let config = CalibrationConfig {
            first_hour: 100,
            ..CalibrationConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), "Configuration");
    }

    #[test]
    fn test_rejects_steps_past_history() {
        let config = CalibrationConfig {
            num_data_points: 30,
            ..CalibrationConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("hours of history"));
    }

    #[test]
    fn test_rejects_linear_length_scale() {
        let config = CalibrationConfig {
            log_constraint: vec![0, 0, 0],
            ..CalibrationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
