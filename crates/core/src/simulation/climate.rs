//! External climate on the integration grid
//!
//! Hourly weather for a window is gap-filled, then linearly interpolated onto a grid
//! with one sample every `time_step` seconds. The model reads the sample at or before
//! the current time.

use crate::core_types::{fill_gaps, HourlySeries};
use crate::error::{CalibrationError, Result};

/// External temperature (°C) and relative humidity (%) at fixed time steps
#[derive(Debug, Clone, PartialEq)]
pub struct ClimateGrid {
    time_step: f64,
    temperature: Vec<f64>,
    relative_humidity: Vec<f64>,
}

impl ClimateGrid {
    /// Interpolate weather rows `[h1, h2]` onto a `time_step`-second grid
    ///
    /// The grid starts at hour `h1` and ends at hour `h2` inclusive.
    ///
    /// # Errors
    /// `DataUnavailable` if the weather does not cover the window or a column is
    /// entirely missing; `Configuration` for a non-positive time step
    pub fn from_hourly(weather: &HourlySeries, h1: usize, h2: usize, time_step: f64) -> Result<Self> {
        if !(time_step.is_finite() && time_step > 0.0) {
            return Err(CalibrationError::Configuration(format!(
                "integration time step must be positive, got {time_step}"
            )));
        }
        let window = weather.slice(h1, h2)?;
        let temperature = fill_gaps(window.temperature())?;
        let relative_humidity = fill_gaps(window.relative_humidity())?;

        let span = (h2 - h1) as f64 * 3600.0;
        let samples = (span / time_step).floor() as usize + 1;
        let lerp = |hourly: &[f64], t: f64| -> f64 {
            let x = t / 3600.0;
            let i = (x.floor() as usize).min(hourly.len() - 1);
            if i + 1 >= hourly.len() {
                return hourly[hourly.len() - 1];
            }
            let frac = x - i as f64;
            hourly[i] + frac * (hourly[i + 1] - hourly[i])
        };

        Ok(Self {
            time_step,
            temperature: (0..samples).map(|k| lerp(&temperature, k as f64 * time_step)).collect(),
            relative_humidity: (0..samples)
                .map(|k| lerp(&relative_humidity, k as f64 * time_step))
                .collect(),
        })
    }

    /// Build directly from grid samples
    ///
    /// # Errors
    /// `Configuration` if the columns differ in length or are empty, or the step is not
    /// positive
    pub fn from_samples(time_step: f64, temperature: Vec<f64>, relative_humidity: Vec<f64>) -> Result<Self> {
        if !(time_step.is_finite() && time_step > 0.0) {
            return Err(CalibrationError::Configuration(format!(
                "integration time step must be positive, got {time_step}"
            )));
        }
        if temperature.is_empty() || temperature.len() != relative_humidity.len() {
            return Err(CalibrationError::Configuration(format!(
                "climate grid needs equal, non-empty columns ({} vs {})",
                temperature.len(),
                relative_humidity.len()
            )));
        }
        Ok(Self {
            time_step,
            temperature,
            relative_humidity,
        })
    }

    /// Grid spacing in seconds
    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    /// Number of grid samples
    pub fn len(&self) -> usize {
        self.temperature.len()
    }

    /// Whether the grid is empty
    pub fn is_empty(&self) -> bool {
        self.temperature.is_empty()
    }

    /// Seconds covered by the grid
    pub fn duration(&self) -> f64 {
        (self.len().saturating_sub(1)) as f64 * self.time_step
    }

    /// Temperature (°C) and relative humidity (%) in force `elapsed` seconds into the
    /// window, clamped to the final sample
    #[inline]
    pub fn at(&self, elapsed: f64) -> (f64, f64) {
        let n = ((elapsed / self.time_step).floor().max(0.0) as usize).min(self.len() - 1);
        (self.temperature[n], self.relative_humidity[n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn weather(t: Vec<f64>) -> HourlySeries {
        let start = NaiveDate::from_ymd_opt(2021, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let rh = vec![70.0; t.len()];
        HourlySeries::new(start, t, rh).unwrap()
    }

    #[test]
    fn test_interpolates_between_hours() {
        let grid = ClimateGrid::from_hourly(&weather(vec![0.0, 6.0, 12.0, 18.0]), 1, 3, 600.0).unwrap();
        assert_eq!(grid.len(), 13);
        assert_relative_eq!(grid.at(0.0).0, 6.0);
        assert_relative_eq!(grid.at(1800.0).0, 9.0);
        assert_relative_eq!(grid.at(7200.0).0, 18.0);
        assert_relative_eq!(grid.at(1e9).0, 18.0);
        assert_relative_eq!(grid.at(3000.0).1, 70.0);
    }

    #[test]
    fn test_gaps_are_filled() {
        let grid =
            ClimateGrid::from_hourly(&weather(vec![10.0, f64::NAN, 14.0]), 0, 2, 3600.0).unwrap();
        assert_relative_eq!(grid.at(3600.0).0, 12.0);
    }

    #[test]
    fn test_window_past_end_is_unavailable() {
        let err = ClimateGrid::from_hourly(&weather(vec![1.0; 5]), 2, 9, 600.0).unwrap_err();
        assert_eq!(err.kind(), "DataUnavailable");
    }
}
