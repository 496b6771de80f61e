//! Hourly time series of weather and monitored tunnel conditions
//!
//! Raw feeds arrive at roughly ten-minute resolution with gaps. Everything downstream
//! works on a dense hourly grid where hour `h` of a window is row `h`, and gaps are NaN.

use chrono::{Duration, DurationRound, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::core_types::units::Celsius;
use crate::error::{CalibrationError, Result};

/// One reading of temperature and relative humidity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClimateReading {
    /// Reading timestamp (timezone already normalised away)
    pub timestamp: NaiveDateTime,
    /// Air temperature
    pub temperature: Celsius,
    /// Relative humidity in percent (0-100), NaN when missing
    pub relative_humidity: f64,
}

/// Dense hourly series, row `h` is `start + h` hours
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlySeries {
    start: NaiveDateTime,
    temperature: Vec<f64>,
    relative_humidity: Vec<f64>,
}

impl HourlySeries {
    /// Build from column vectors
    ///
    /// # Errors
    /// Returns `Configuration` if the columns differ in length
    pub fn new(
        start: NaiveDateTime,
        temperature: Vec<f64>,
        relative_humidity: Vec<f64>,
    ) -> Result<Self> {
        if temperature.len() != relative_humidity.len() {
            return Err(CalibrationError::Configuration(format!(
                "hourly series columns differ in length: {} temperatures, {} humidities",
                temperature.len(),
                relative_humidity.len()
            )));
        }
        Ok(Self {
            start,
            temperature,
            relative_humidity,
        })
    }

    /// Number of hourly rows
    #[inline]
    pub fn len(&self) -> usize {
        self.temperature.len()
    }

    /// Whether the series has no rows
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.temperature.is_empty()
    }

    /// Timestamp of row 0
    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Timestamp of the final row
    pub fn end(&self) -> NaiveDateTime {
        self.start + Duration::hours(self.len().saturating_sub(1) as i64)
    }

    /// Timestamp of row `hour`
    pub fn timestamp(&self, hour: usize) -> NaiveDateTime {
        self.start + Duration::hours(hour as i64)
    }

    /// Temperature column in °C
    pub fn temperature(&self) -> &[f64] {
        &self.temperature
    }

    /// Relative humidity column in percent
    pub fn relative_humidity(&self) -> &[f64] {
        &self.relative_humidity
    }

    /// Relative humidity at `hour` as a fraction, NaN if missing or out of range
    pub fn relative_humidity_fraction(&self, hour: usize) -> f64 {
        self.relative_humidity
            .get(hour)
            .map_or(f64::NAN, |rh| rh / 100.0)
    }

    /// Hour of day (0-23) of the final row, fed to the lighting schedule
    pub fn latest_hour_of_day(&self) -> f64 {
        use chrono::Timelike;
        f64::from(self.end().hour())
    }

    /// Rows `[from, to]` inclusive as a new series
    ///
    /// # Errors
    /// Returns `DataUnavailable` if the range runs past the end of the series
    pub fn slice(&self, from: usize, to: usize) -> Result<Self> {
        if from > to || to >= self.len() {
            return Err(CalibrationError::DataUnavailable(format!(
                "requested hours [{from}, {to}] but series has {} rows",
                self.len()
            )));
        }
        Ok(Self {
            start: self.timestamp(from),
            temperature: self.temperature[from..=to].to_vec(),
            relative_humidity: self.relative_humidity[from..=to].to_vec(),
        })
    }

    /// Append rows from `other`, which must start the hour after this series ends
    ///
    /// # Errors
    /// Returns `Configuration` if the series are not contiguous
    pub fn extend(&mut self, other: &HourlySeries) -> Result<()> {
        if !self.is_empty() && other.start != self.end() + Duration::hours(1) {
            return Err(CalibrationError::Configuration(format!(
                "cannot append series starting {} to series ending {}",
                other.start,
                self.end()
            )));
        }
        self.temperature.extend_from_slice(&other.temperature);
        self.relative_humidity
            .extend_from_slice(&other.relative_humidity);
        Ok(())
    }
}

/// Average readings into a dense hourly grid
///
/// Each output row is the mean of the non-NaN readings whose timestamp falls in that
/// hour. Hours with no readings between the first and last are NaN.
///
/// # Errors
/// Returns `DataUnavailable` if `readings` is empty
pub fn resample_hourly(readings: &[ClimateReading]) -> Result<HourlySeries> {
    let hour = Duration::hours(1);
    let floor = |ts: NaiveDateTime| ts.duration_trunc(hour).unwrap_or(ts);

    let first = readings
        .iter()
        .map(|r| floor(r.timestamp))
        .min()
        .ok_or_else(|| CalibrationError::DataUnavailable("no readings to resample".into()))?;
    let last = readings
        .iter()
        .map(|r| floor(r.timestamp))
        .max()
        .unwrap_or(first);

    let rows = (last - first).num_hours() as usize + 1;
    let mut t_sum = vec![0.0; rows];
    let mut t_n = vec![0_u32; rows];
    let mut rh_sum = vec![0.0; rows];
    let mut rh_n = vec![0_u32; rows];

    for r in readings {
        let idx = (floor(r.timestamp) - first).num_hours() as usize;
        if r.temperature.is_finite() {
            t_sum[idx] += *r.temperature;
            t_n[idx] += 1;
        }
        if r.relative_humidity.is_finite() {
            rh_sum[idx] += r.relative_humidity;
            rh_n[idx] += 1;
        }
    }

    let mean = |sum: &[f64], n: &[u32]| -> Vec<f64> {
        sum.iter()
            .zip(n)
            .map(|(&s, &c)| if c == 0 { f64::NAN } else { s / f64::from(c) })
            .collect()
    };

    HourlySeries::new(first, mean(&t_sum, &t_n), mean(&rh_sum, &rh_n))
}

/// Restrict two hourly series to their common trailing window
///
/// The window ends at the earlier of the two final timestamps and starts `delta_days`
/// before it. Both returned series are re-indexed from that start so hour `h` refers
/// to the same instant in each.
///
/// # Errors
/// Returns `DataUnavailable` if either series does not cover the window start
pub fn align_windows(
    weather: &HourlySeries,
    monitored: &HourlySeries,
    delta_days: u32,
) -> Result<(HourlySeries, HourlySeries)> {
    let latest = weather.end().min(monitored.end());
    let start = latest - Duration::days(i64::from(delta_days));

    let cut = |series: &HourlySeries, name: &str| -> Result<HourlySeries> {
        if series.start() > start {
            return Err(CalibrationError::DataUnavailable(format!(
                "{name} series starts at {} but the window needs data from {start}",
                series.start()
            )));
        }
        let from = (start - series.start()).num_hours() as usize;
        let to = (latest - series.start()).num_hours() as usize;
        series.slice(from, to)
    };

    Ok((cut(weather, "weather")?, cut(monitored, "monitored")?))
}

/// Fill NaN gaps by linear interpolation between neighbouring finite values
///
/// Leading and trailing gaps take the nearest finite value.
///
/// # Errors
/// Returns `DataUnavailable` if every value is NaN
pub fn fill_gaps(values: &[f64]) -> Result<Vec<f64>> {
    let known: Vec<usize> = (0..values.len())
        .filter(|&i| values[i].is_finite())
        .collect();
    let (first, last) = match (known.first(), known.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => {
            return Err(CalibrationError::DataUnavailable(
                "series has no finite values to interpolate from".into(),
            ))
        }
    };

    let mut out = values.to_vec();
    for v in &mut out[..first] {
        *v = values[first];
    }
    for v in &mut out[last + 1..] {
        *v = values[last];
    }
    for pair in known.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let span = (b - a) as f64;
        for i in a + 1..b {
            let frac = (i - a) as f64 / span;
            out[i] = values[a] + frac * (values[b] - values[a]);
        }
    }
    Ok(out)
}
