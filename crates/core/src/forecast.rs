//! Forward simulation from calibrated posteriors
//!
//! The last calibration window is re-simulated and extended into the future for four
//! parameter sets:
//!
//! | run      | ACH       | IAS       | dehumidifiers      | lighting shift |
//! |----------|-----------|-----------|--------------------|----------------|
//! | mean     | mean      | mean      | 1                  | 0              |
//! | scenario | scenario  | mean      | scenario / 2       | scenario       |
//! | upper    | 95%       | 5%        | 1                  | 0              |
//! | lower    | 5%        | 95%       | 1                  | 0              |
//!
//! Dehumidifier counts are halved because half the farm is modelled.

use std::fs;
use std::path::Path;

use chrono::{Duration, NaiveDateTime};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::DesignMatrix;
use crate::config::CalibrationConfig;
use crate::core_types::units::CELSIUS_KELVIN_OFFSET;
use crate::core_types::{HourlySeries, ParticlePopulation};
use crate::error::{CalibrationError, Result};
use crate::simulation::Simulator;

/// Quantile of the lower band
pub const LOWER_QUANTILE: f64 = 0.05;
/// Quantile of the upper band
pub const UPPER_QUANTILE: f64 = 0.95;

/// Mean and 5%/95% quantiles of one physical parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Sample mean
    pub mean: f64,
    /// 5% quantile
    pub lower: f64,
    /// 95% quantile
    pub upper: f64,
}

impl Band {
    /// Summarise samples; `None` when empty
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        Some(Self {
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
            lower: quantile(&sorted, LOWER_QUANTILE),
            upper: quantile(&sorted, UPPER_QUANTILE),
        })
    }
}

/// Linear interpolation between order statistics of sorted data
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let below = position.floor() as usize;
    let above = (below + 1).min(sorted.len() - 1);
    let frac = position - below as f64;
    sorted[below] + frac * (sorted[above] - sorted[below])
}

/// Physical ACH/IAS bands of one calibration step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    /// Air changes per hour
    pub ach: Band,
    /// Internal air speed (m/s)
    pub ias: Band,
}

/// Per-step physical summaries of a sequence of posteriors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSummary {
    /// One entry per calibration step, in step order
    pub steps: Vec<StepSummary>,
}

impl PosteriorSummary {
    /// Summarise normalised posteriors in the units of `design`
    ///
    /// # Errors
    /// `Configuration` if a posterior is empty
    pub fn from_posteriors(design: &DesignMatrix, posteriors: &[&ParticlePopulation]) -> Result<Self> {
        let steps = posteriors
            .iter()
            .enumerate()
            .map(|(step, population)| {
                let physical = design.denormalize_population(population);
                let column = |j: usize| physical.column(j).iter().copied().collect::<Vec<_>>();
                match (Band::from_samples(&column(0)), Band::from_samples(&column(1))) {
                    (Some(ach), Some(ias)) => Ok(StepSummary { ach, ias }),
                    _ => Err(CalibrationError::Configuration(format!(
                        "posterior of step {step} has no particles"
                    ))),
                }
            })
            .collect::<Result<_>>()?;
        Ok(Self { steps })
    }

    /// Summary of the final step
    pub fn last(&self) -> Option<&StepSummary> {
        self.steps.last()
    }
}

/// Operator what-if settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Air changes per hour
    pub ventilation_rate: f64,
    /// Dehumidifiers in the whole farm
    pub num_dehumidifiers: u32,
    /// Hours the lighting schedule is moved by
    pub lighting_shift_hours: f64,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            ventilation_rate: 1.0,
            num_dehumidifiers: 2,
            lighting_shift_hours: -3.0,
        }
    }
}

/// The four parameter sets simulated per forecast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastRun {
    /// Posterior means, business-as-usual operation
    Mean,
    /// Posterior means under the operator [`Scenario`]
    Scenario,
    /// ACH 95% and IAS 5%
    Upper,
    /// ACH 5% and IAS 95%
    Lower,
}

impl ForecastRun {
    /// Runs in column order
    pub const ALL: [ForecastRun; 4] = [Self::Mean, Self::Scenario, Self::Upper, Self::Lower];

    /// Column name in the forecast CSVs
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Scenario => "scenario",
            Self::Upper => "upper",
            Self::Lower => "lower",
        }
    }

    fn column(self) -> usize {
        self as usize
    }
}

/// Hourly temperature (°C) and relative humidity (%) per [`ForecastRun`]
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    /// Timestamp of row 0
    pub start: NaiveDateTime,
    /// First row past the observed weather
    pub horizon_row: usize,
    /// `hours × 4`, columns ordered as [`ForecastRun::ALL`]
    pub temperature: DMatrix<f64>,
    /// `hours × 4`, columns ordered as [`ForecastRun::ALL`]
    pub relative_humidity: DMatrix<f64>,
}

impl Forecast {
    /// Number of hourly rows
    pub fn len(&self) -> usize {
        self.temperature.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.temperature.nrows() == 0
    }

    /// Timestamp of `row`
    pub fn timestamp(&self, row: usize) -> NaiveDateTime {
        self.start + Duration::hours(row as i64)
    }

    /// Temperature series of `run`
    pub fn temperature(&self, run: ForecastRun) -> Vec<f64> {
        self.temperature.column(run.column()).iter().copied().collect()
    }

    /// Relative humidity series of `run`
    pub fn relative_humidity(&self, run: ForecastRun) -> Vec<f64> {
        self.relative_humidity.column(run.column()).iter().copied().collect()
    }

    /// Write `forecast_T.csv` and `forecast_RH.csv` into `dir`
    ///
    /// # Errors
    /// `Persistence` on I/O or CSV errors
    pub fn write_csv(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for (name, table) in [
            ("forecast_T.csv", &self.temperature),
            ("forecast_RH.csv", &self.relative_humidity),
        ] {
            let mut writer = csv::Writer::from_path(dir.join(name))?;
            let mut header = vec!["timestamp".to_string(), "forecast".to_string()];
            header.extend(ForecastRun::ALL.iter().map(|r| r.as_str().to_string()));
            writer.write_record(&header)?;
            for row in 0..table.nrows() {
                let mut record = vec![
                    self.timestamp(row).to_string(),
                    u8::from(row >= self.horizon_row).to_string(),
                ];
                record.extend(table.row(row).iter().map(f64::to_string));
                writer.write_record(&record)?;
            }
            writer.flush()?;
        }
        Ok(())
    }
}

/// Runs the four forecast parameter sets through a simulator
pub struct Forecaster<'a, S: Simulator> {
    simulator: &'a S,
    config: &'a CalibrationConfig,
}

impl<'a, S: Simulator> Forecaster<'a, S> {
    /// Forecaster using the calibration window length and hour alignment of `config`
    pub fn new(simulator: &'a S, config: &'a CalibrationConfig) -> Self {
        Self { simulator, config }
    }

    /// Parameter matrix, one row per [`ForecastRun`]: `[ACH, IAS, dehumidifiers, shift]`
    pub fn parameter_sets(summary: &StepSummary, scenario: &Scenario) -> DMatrix<f64> {
        let scenario_dehumidifiers = f64::from(scenario.num_dehumidifiers / 2);
        DMatrix::from_row_slice(
            4,
            4,
            &[
                summary.ach.mean, summary.ias.mean, 1.0, 0.0,
                scenario.ventilation_rate, summary.ias.mean, scenario_dehumidifiers, scenario.lighting_shift_hours,
                summary.ach.upper, summary.ias.lower, 1.0, 0.0,
                summary.ach.lower, summary.ias.upper, 1.0, 0.0,
            ],
        )
    }

    /// Simulate the final calibration window extended by `forecast_hours`
    ///
    /// Future weather comes from `forecast_weather` where it reaches past the history;
    /// any remaining hours repeat the last day of the extended weather.
    ///
    /// # Errors
    /// `Configuration` with no calibrated steps, `DataUnavailable` if the history does
    /// not cover the final window, simulator errors otherwise
    pub fn run(
        &self,
        history: &HourlySeries,
        forecast_weather: Option<&HourlySeries>,
        summary: &PosteriorSummary,
        scenario: &Scenario,
        forecast_hours: usize,
    ) -> Result<Forecast> {
        let last = summary.last().ok_or_else(|| {
            CalibrationError::Configuration("forecast needs at least one calibrated step".into())
        })?;
        let h2 = self.config.last_hour();
        let h1 = (h2 + 1).saturating_sub(self.config.window_hours());

        let weather = extend_weather(&history.slice(0, h2)?, forecast_weather, forecast_hours)?;
        let end = h2 + forecast_hours;
        let parameters = Self::parameter_sets(last, scenario);
        info!(
            h1,
            h2,
            forecast_hours,
            ach_mean = last.ach.mean,
            ias_mean = last.ias.mean,
            "running forecast"
        );

        let results = self.simulator.simulate(
            h1,
            end,
            &parameters,
            &weather,
            history.latest_hour_of_day(),
            &self.config.simulation,
        )?;
        results.validate()?;

        let temperature = results.air_temperature().map(|t| t - CELSIUS_KELVIN_OFFSET);
        let relative_humidity = results.relative_humidity() * 100.0;

        Ok(Forecast {
            start: weather.timestamp(h1),
            horizon_row: h2 - h1 + 1,
            temperature,
            relative_humidity,
        })
    }
}

/// `history` followed by `forecast_hours` more hours of weather
///
/// Forecast rows overlapping the history are dropped; the history wins.
fn extend_weather(
    history: &HourlySeries,
    forecast: Option<&HourlySeries>,
    forecast_hours: usize,
) -> Result<HourlySeries> {
    let target = history.len() + forecast_hours;
    let mut weather = history.clone();

    if let Some(forecast) = forecast.filter(|f| !f.is_empty()) {
        let next = history.end() + Duration::hours(1);
        if forecast.start() > next {
            return Err(CalibrationError::DataUnavailable(format!(
                "forecast weather starts at {} but the history ends at {}",
                forecast.start(),
                history.end()
            )));
        }
        let skip = (next - forecast.start()).num_hours() as usize;
        if skip < forecast.len() {
            let take = (forecast.len() - skip).min(forecast_hours);
            weather.extend(&forecast.slice(skip, skip + take - 1)?)?;
        }
    }

    while weather.len() < target {
        let day = weather.len().min(24);
        let from = weather.len() - day;
        let take = day.min(target - weather.len());
        let repeat = weather.slice(from, from + take - 1)?;
        let shifted = HourlySeries::new(
            weather.end() + Duration::hours(1),
            repeat.temperature().to_vec(),
            repeat.relative_humidity().to_vec(),
        )?;
        weather.extend(&shifted)?;
    }
    Ok(weather)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::Kelvin;
    use crate::psychrometrics::sat_conc;
    use crate::simulation::{SimulationConfig, SimulationResults};
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    /// Air temperature follows ACH, humidity fixed at 50 %
    struct EchoSimulator;

    impl Simulator for EchoSimulator {
        fn simulate(
            &self,
            h1: usize,
            h2: usize,
            parameters: &DMatrix<f64>,
            weather: &HourlySeries,
            _latest_hour_of_day: f64,
            _config: &SimulationConfig,
        ) -> Result<SimulationResults> {
            assert!(weather.len() > h2);
            let hours = h2 - h1 + 1;
            let n = parameters.nrows();
            let t = DMatrix::from_fn(hours, n, |_, j| 283.15 + parameters[(j, 0)]);
            let cw = t.map(|t| 0.5 * sat_conc(Kelvin::new(t)));
            SimulationResults::from_air(t, cw)
        }
    }

    fn history(rows: usize) -> HourlySeries {
        let start = NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let temperature = (0..rows).map(|h| (h % 24) as f64).collect();
        HourlySeries::new(start, temperature, vec![70.0; rows]).unwrap()
    }

    fn config() -> CalibrationConfig {
        CalibrationConfig {
            calibration_window_days: 1,
            first_hour: 24,
            delta_h: 12,
            num_data_points: 3,
            delta_days: 3,
            num_weather_days: 3,
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn test_band_matches_linear_quantiles() {
        let samples: Vec<f64> = (0..=100).map(f64::from).collect();
        let band = Band::from_samples(&samples).unwrap();
        assert_relative_eq!(band.mean, 50.0);
        assert_relative_eq!(band.lower, 5.0);
        assert_relative_eq!(band.upper, 95.0);
        assert!(Band::from_samples(&[]).is_none());
    }

    #[test]
    fn test_summary_is_in_physical_units() {
        let design = DesignMatrix::full_factorial(2, 2).unwrap();
        let posterior = ParticlePopulation::new(DMatrix::from_row_slice(
            2,
            3,
            &[0.0, 1.0, 0.2, 1.0, 0.0, 0.2],
        ));
        let summary = PosteriorSummary::from_posteriors(&design, &[&posterior]).unwrap();
        let last = summary.last().unwrap();
        assert_relative_eq!(last.ach.mean, 5.5);
        assert_relative_eq!(last.ias.mean, 0.475);
        assert!(last.ach.lower < last.ach.upper);
    }

    #[test]
    fn test_scenario_halves_dehumidifiers() {
        let band = Band { mean: 4.0, lower: 2.0, upper: 8.0 };
        let summary = StepSummary { ach: band, ias: Band { mean: 0.4, lower: 0.2, upper: 0.6 } };
        let scenario = Scenario { ventilation_rate: 6.0, num_dehumidifiers: 5, lighting_shift_hours: 2.0 };
        let m = Forecaster::<EchoSimulator>::parameter_sets(&summary, &scenario);
        assert_eq!(m.row(1).iter().copied().collect::<Vec<_>>(), vec![6.0, 0.4, 2.0, 2.0]);
        assert_eq!((m[(2, 0)], m[(2, 1)]), (8.0, 0.2));
        assert_eq!((m[(3, 0)], m[(3, 1)]), (2.0, 0.6));
    }

    #[test]
    fn test_weather_extension_repeats_last_day() {
        let extended = extend_weather(&history(48), None, 30).unwrap();
        assert_eq!(extended.len(), 78);
        assert_eq!(extended.temperature()[48], 0.0);
        assert_eq!(extended.temperature()[71], 23.0);
        assert_eq!(extended.temperature()[77], 5.0);
    }

    #[test]
    fn test_forecast_weather_takes_precedence_after_history() {
        let base = history(48);
        let forecast = HourlySeries::new(base.timestamp(40), vec![-5.0; 20], vec![90.0; 20]).unwrap();
        let extended = extend_weather(&base, Some(&forecast), 24).unwrap();
        assert_eq!(extended.len(), 72);
        assert_eq!(extended.temperature()[47], 23.0);
        assert_eq!(extended.temperature()[48], -5.0);
        assert_eq!(extended.temperature()[59], -5.0);
        // forecast exhausted after 12 hours, then the last day repeats
        assert_eq!(extended.temperature()[60], 12.0);
    }

    #[test]
    fn test_forecast_bands() {
        let config = config();
        let design = DesignMatrix::full_factorial(2, 2).unwrap();
        let posterior = ParticlePopulation::new(DMatrix::from_row_slice(
            3,
            3,
            &[0.0, 0.5, 0.2, 0.5, 0.5, 0.2, 1.0, 0.5, 0.2],
        ));
        let summary = PosteriorSummary::from_posteriors(&design, &[&posterior]).unwrap();
        let forecaster = Forecaster::new(&EchoSimulator, &config);
        let forecast = forecaster
            .run(&history(73), None, &summary, &Scenario::default(), 24)
            .unwrap();

        // window [25, 48] plus 24 forecast hours
        assert_eq!(forecast.len(), 48);
        assert_eq!(forecast.horizon_row, 24);
        assert_eq!(forecast.start, history(73).timestamp(25));
        let mean = forecast.temperature(ForecastRun::Mean);
        let upper = forecast.temperature(ForecastRun::Upper);
        let lower = forecast.temperature(ForecastRun::Lower);
        assert_relative_eq!(mean[0], 10.0 + 5.5, epsilon = 1e-9);
        assert!(lower[0] < mean[0] && mean[0] < upper[0]);
        assert_relative_eq!(forecast.temperature(ForecastRun::Scenario)[0], 11.0, epsilon = 1e-9);
        for rh in forecast.relative_humidity(ForecastRun::Scenario) {
            assert_relative_eq!(rh, 50.0, epsilon = 1e-9);
        }

        let dir = tempfile::tempdir().unwrap();
        forecast.write_csv(dir.path()).unwrap();
        let table = std::fs::read_to_string(dir.path().join("forecast_T.csv")).unwrap();
        assert_eq!(table.lines().next(), Some("timestamp,forecast,mean,scenario,upper,lower"));
        assert_eq!(table.lines().count(), 49);
    }
}
