//! Shared fixtures for integration tests

#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use nalgebra::DMatrix;
use tunnel_calib_core::core_types::Kelvin;
use tunnel_calib_core::psychrometrics::sat_conc;
use tunnel_calib_core::{
    CalibrationConfig, HourlySeries, Result, SimulationConfig, SimulationResults, Simulator,
};

/// Route engine traces to the test output; `RUST_LOG=debug cargo test` shows them
#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Constant 20 °C air whose relative humidity rises linearly with ACH
///
/// A candidate with ACH `a` ends the window at `0.5 + 0.03·a` relative humidity.
pub struct LinearHumiditySimulator;

impl Simulator for LinearHumiditySimulator {
    fn simulate(
        &self,
        h1: usize,
        h2: usize,
        parameters: &DMatrix<f64>,
        _weather: &HourlySeries,
        _latest_hour_of_day: f64,
        _config: &SimulationConfig,
    ) -> Result<SimulationResults> {
        let hours = h2 - h1 + 1;
        let n = parameters.nrows();
        let sat = sat_conc(Kelvin::new(293.15));
        SimulationResults::from_air(
            DMatrix::from_element(hours, n, 293.15),
            DMatrix::from_fn(hours, n, |_, j| (0.5 + 0.03 * parameters[(j, 0)]) * sat),
        )
    }
}

pub fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 6, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// Hourly series of `rows` rows at 12 °C and `rh` percent
pub fn flat_series(rows: usize, rh: f64) -> HourlySeries {
    HourlySeries::new(start(), vec![12.0; rows], vec![rh; rows]).unwrap()
}

/// Small, fast run: two-day history, one-day windows, steps every six hours
pub fn small_config(steps: usize) -> CalibrationConfig {
    CalibrationConfig {
        num_particles: 30,
        num_weather_days: 2,
        delta_days: 2,
        calibration_window_days: 1,
        first_hour: 24,
        delta_h: 6,
        num_data_points: steps,
        seed: Some(11),
        ..CalibrationConfig::default()
    }
}
