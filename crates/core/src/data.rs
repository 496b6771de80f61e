//! Weather and monitored sensor feeds
//!
//! A [`DataSource`] hands back raw readings at whatever resolution the feed has; the
//! calibration works on the hourly, aligned pair produced by [`load_aligned`].

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime};
use tracing::{debug, info};

use crate::config::CalibrationConfig;
use crate::core_types::{align_windows, resample_hourly, Celsius, ClimateReading, HourlySeries};
use crate::error::{CalibrationError, Result};

/// Sensor feeds arrive every ten minutes
pub const READINGS_PER_HOUR: usize = 6;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M",
];

/// Supplier of historical climate readings
pub trait DataSource {
    /// External weather over the last `days` days, at most `rows` readings
    ///
    /// # Errors
    /// `DataUnavailable` when the feed has nothing in range, `Persistence` on I/O errors
    fn weather_window(&self, days: usize, rows: usize) -> Result<Vec<ClimateReading>>;

    /// Tunnel readings of `sensor_id` over the last `days` days, at most `rows` readings
    ///
    /// # Errors
    /// As [`DataSource::weather_window`]
    fn monitored_window(
        &self,
        days: usize,
        rows: usize,
        sensor_id: u32,
    ) -> Result<Vec<ClimateReading>>;
}

/// Readings from two CSV exports
///
/// Weather rows are `DateTime,T_e,RH_e`. Monitored rows are `DateTime,T_i,RH_i` with an
/// optional fourth `sensor_id` column; rows of other sensors are skipped. A header row
/// is tolerated but not required, and empty or `nan` cells become NaN.
#[derive(Debug, Clone)]
pub struct CsvDataSource {
    weather: PathBuf,
    monitored: PathBuf,
}

impl CsvDataSource {
    /// Source over a weather export and a monitored-sensor export; files are read on
    /// each request
    pub fn new(weather: impl Into<PathBuf>, monitored: impl Into<PathBuf>) -> Self {
        Self {
            weather: weather.into(),
            monitored: monitored.into(),
        }
    }

    fn read(path: &Path, sensor_id: Option<u32>) -> Result<Vec<ClimateReading>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut readings = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let field = |i: usize| record.get(i).unwrap_or("");
            if field(0).eq_ignore_ascii_case("datetime") {
                continue;
            }
            let context = |what: &str| {
                CalibrationError::DataUnavailable(format!(
                    "{} line {}: {what}",
                    path.display(),
                    line + 1
                ))
            };
            if let Some(wanted) = sensor_id {
                if !field(3).is_empty() {
                    let sensor: u32 = field(3)
                        .parse()
                        .map_err(|_| context("sensor id is not an integer"))?;
                    if sensor != wanted {
                        continue;
                    }
                }
            }
            let timestamp =
                parse_timestamp(field(0)).ok_or_else(|| context("unrecognised timestamp"))?;
            let temperature = parse_value(field(1)).ok_or_else(|| context("bad temperature"))?;
            let relative_humidity =
                parse_value(field(2)).ok_or_else(|| context("bad relative humidity"))?;
            readings.push(ClimateReading {
                timestamp,
                temperature: Celsius::new(temperature),
                relative_humidity,
            });
        }
        readings.sort_by_key(|r| r.timestamp);
        Ok(readings)
    }
}

impl DataSource for CsvDataSource {
    fn weather_window(&self, days: usize, rows: usize) -> Result<Vec<ClimateReading>> {
        let readings = Self::read(&self.weather, None)?;
        trailing_window(readings, days, rows, "weather")
    }

    fn monitored_window(
        &self,
        days: usize,
        rows: usize,
        sensor_id: u32,
    ) -> Result<Vec<ClimateReading>> {
        let readings = Self::read(&self.monitored, Some(sensor_id))?;
        trailing_window(readings, days, rows, "monitored")
    }
}

/// Parse the timestamp formats seen in sensor exports; offsets are dropped after
/// conversion to UTC
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
}

fn parse_value(text: &str) -> Option<f64> {
    if text.is_empty() || text.eq_ignore_ascii_case("nan") {
        return Some(f64::NAN);
    }
    text.parse().ok()
}

/// Keep readings from the last `days` days, then at most the last `rows` of them
fn trailing_window(
    readings: Vec<ClimateReading>,
    days: usize,
    rows: usize,
    name: &str,
) -> Result<Vec<ClimateReading>> {
    let latest = readings
        .last()
        .map(|r| r.timestamp)
        .ok_or_else(|| CalibrationError::DataUnavailable(format!("{name} feed is empty")))?;
    let days = i64::try_from(days).map_err(|_| {
        CalibrationError::Configuration(format!("{days} days is out of range"))
    })?;
    let since = latest - Duration::days(days);
    let mut window: Vec<ClimateReading> =
        readings.into_iter().filter(|r| r.timestamp >= since).collect();
    if window.len() > rows {
        window.drain(..window.len() - rows);
    }
    debug!(name, readings = window.len(), %latest, "selected trailing window");
    Ok(window)
}

/// Hourly weather and monitored series over the common trailing `delta_days`
///
/// Hour `h` of both series is the same instant; the series hold `delta_days·24 + 1`
/// rows.
///
/// # Errors
/// `DataUnavailable` if either feed is empty or too short for the window
pub fn load_aligned(
    source: &dyn DataSource,
    config: &CalibrationConfig,
) -> Result<(HourlySeries, HourlySeries)> {
    let rows = config.num_weather_days * 24 * READINGS_PER_HOUR;
    let weather = source.weather_window(config.num_weather_days, rows)?;
    let monitored = source.monitored_window(config.num_weather_days, rows, config.sensor_id)?;

    let delta_days = u32::try_from(config.delta_days).map_err(|_| {
        CalibrationError::Configuration(format!("delta_days {} is out of range", config.delta_days))
    })?;
    let (weather, monitored) = align_windows(
        &resample_hourly(&weather)?,
        &resample_hourly(&monitored)?,
        delta_days,
    )?;
    info!(
        hours = weather.len(),
        start = %weather.start(),
        end = %weather.end(),
        sensor = config.sensor_id,
        "loaded aligned climate history"
    );
    Ok((weather, monitored))
}
