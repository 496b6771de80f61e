//! Tunnel simulator interface and reference model
//!
//! The calibration engine only needs one thing from a simulator: given a window of
//! weather and a batch of candidate parameters, return hourly state trajectories for
//! every candidate. [`Simulator`] is that seam; [`TunnelModel`] is the physics-based
//! implementation used in production.

pub mod climate;
pub mod config;
pub mod physics;
pub mod tunnel;

pub use climate::ClimateGrid;
pub use config::{LightingSchedule, SimulationConfig, TunnelGeometry};
pub use tunnel::TunnelModel;

use nalgebra::{DMatrix, DVector};

use crate::core_types::{HourlySeries, Kelvin};
use crate::error::{CalibrationError, Result};
use crate::psychrometrics::sat_conc;

/// Number of state channels produced per candidate
pub const STATE_COUNT: usize = 12;
/// Channel holding air temperature (K)
pub const AIR_TEMPERATURE: usize = 1;
/// Channel holding absolute humidity of the air (kg/m³)
pub const AIR_HUMIDITY: usize = 11;

/// Batch simulator over a weather window
///
/// Implementations must be deterministic for a given input: the controller never
/// retries a failed simulation.
pub trait Simulator: Send + Sync {
    /// Simulate hours `[h1, h2]` for every row of `parameters`
    ///
    /// `parameters` rows are `[ACH (1/h), IAS (m/s)]`, optionally followed by
    /// `[dehumidifiers, lighting shift (h)]`. `latest_hour_of_day` anchors the lighting
    /// schedule to wall-clock time.
    ///
    /// # Errors
    /// `DataUnavailable` when the weather does not cover the window, `Configuration`
    /// for malformed parameters, `SimulationFailure` when a trajectory diverges
    fn simulate(
        &self,
        h1: usize,
        h2: usize,
        parameters: &DMatrix<f64>,
        weather: &HourlySeries,
        latest_hour_of_day: f64,
        config: &SimulationConfig,
    ) -> Result<SimulationResults>;
}

/// Hourly trajectories of every state channel, one column per candidate
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationResults {
    channels: Vec<DMatrix<f64>>,
}

impl SimulationResults {
    /// Wrap per-channel `hours × candidates` matrices
    ///
    /// # Errors
    /// `SimulationFailure` unless there are exactly [`STATE_COUNT`] channels of equal
    /// shape
    pub fn from_channels(channels: Vec<DMatrix<f64>>) -> Result<Self> {
        if channels.len() != STATE_COUNT {
            return Err(CalibrationError::SimulationFailure(format!(
                "expected {STATE_COUNT} output channels, got {}",
                channels.len()
            )));
        }
        let shape = channels[0].shape();
        if let Some(bad) = channels.iter().position(|c| c.shape() != shape) {
            return Err(CalibrationError::SimulationFailure(format!(
                "channel {bad} has shape {:?}, expected {shape:?}",
                channels[bad].shape()
            )));
        }
        Ok(Self { channels })
    }

    /// Results carrying only the two air channels; every other channel is zero
    ///
    /// # Errors
    /// See [`SimulationResults::from_channels`]
    pub fn from_air(temperature: DMatrix<f64>, humidity: DMatrix<f64>) -> Result<Self> {
        let (rows, cols) = temperature.shape();
        let mut channels = vec![DMatrix::zeros(rows, cols); STATE_COUNT];
        channels[AIR_TEMPERATURE] = temperature;
        channels[AIR_HUMIDITY] = humidity;
        Self::from_channels(channels)
    }

    /// Number of hourly rows
    pub fn hours(&self) -> usize {
        self.channels[0].nrows()
    }

    /// Number of candidate columns
    pub fn candidates(&self) -> usize {
        self.channels[0].ncols()
    }

    /// One state channel
    pub fn channel(&self, index: usize) -> Option<&DMatrix<f64>> {
        self.channels.get(index)
    }

    /// Air temperature (K)
    pub fn air_temperature(&self) -> &DMatrix<f64> {
        &self.channels[AIR_TEMPERATURE]
    }

    /// Absolute humidity of the air (kg/m³)
    pub fn absolute_humidity(&self) -> &DMatrix<f64> {
        &self.channels[AIR_HUMIDITY]
    }

    /// Relative humidity (fraction) at every hour, `Cw / sat_conc(T)`
    pub fn relative_humidity(&self) -> DMatrix<f64> {
        self.absolute_humidity()
            .zip_map(self.air_temperature(), |cw, t| cw / sat_conc(Kelvin::new(t)))
    }

    /// Relative humidity (fraction) at the final hour, one entry per candidate
    ///
    /// # Errors
    /// `SimulationFailure` if the results have no rows
    pub fn final_relative_humidity(&self) -> Result<DVector<f64>> {
        let last = self.hours().checked_sub(1).ok_or_else(|| {
            CalibrationError::SimulationFailure("simulation returned no time steps".into())
        })?;
        let t = self.air_temperature().row(last);
        let cw = self.absolute_humidity().row(last);
        Ok(DVector::from_iterator(
            self.candidates(),
            cw.iter()
                .zip(t.iter())
                .map(|(&cw, &t)| cw / sat_conc(Kelvin::new(t))),
        ))
    }

    /// Reject results whose air channels hold NaN or infinite values
    ///
    /// # Errors
    /// `SimulationFailure` naming the first offending channel, hour and candidate
    pub fn validate(&self) -> Result<()> {
        for channel in [AIR_TEMPERATURE, AIR_HUMIDITY] {
            let m = &self.channels[channel];
            if let Some((idx, v)) = m.iter().enumerate().find(|(_, v)| !v.is_finite()) {
                let (hour, candidate) = (idx % m.nrows(), idx / m.nrows());
                return Err(CalibrationError::SimulationFailure(format!(
                    "channel {channel} is {v} at hour {hour} for candidate {candidate}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_final_relative_humidity() {
        let t = DMatrix::from_element(3, 2, 293.15);
        let cw = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 0.0, 0.0, 0.01, 0.005]);
        let results = SimulationResults::from_air(t, cw).unwrap();
        let rh = results.final_relative_humidity().unwrap();
        let sat = sat_conc(Kelvin::new(293.15));
        assert_relative_eq!(rh[0], 0.01 / sat);
        assert_relative_eq!(rh[1], 0.005 / sat);
    }

    #[test]
    fn test_validate_locates_nan() {
        let t = DMatrix::from_element(2, 2, 293.0);
        let mut cw = DMatrix::from_element(2, 2, 0.01);
        cw[(1, 1)] = f64::NAN;
        let err = SimulationResults::from_air(t, cw).unwrap().validate().unwrap_err();
        assert_eq!(err.kind(), "SimulationFailure");
        assert!(err.to_string().contains("hour 1 for candidate 1"), "{err}");
    }

    #[test]
    fn test_channel_count_checked() {
        let err = SimulationResults::from_channels(vec![DMatrix::zeros(1, 1); 3]).unwrap_err();
        assert_eq!(err.kind(), "SimulationFailure");
    }
}
