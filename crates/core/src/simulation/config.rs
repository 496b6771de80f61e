//! Tunnel geometry, equipment schedule and integration settings
//!
//! Everything here is fixed for a run. The calibrated quantities (ventilation rate and
//! internal air speed) arrive per candidate through the parameter matrix instead.

use serde::{Deserialize, Serialize};

use super::STATE_COUNT;
use crate::error::{CalibrationError, Result};

/// Physical dimensions of the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelGeometry {
    /// Air volume (m³)
    pub volume: f64,
    /// Cover area (m²)
    pub cover_area: f64,
    /// Floor area (m²)
    pub floor_area: f64,
    /// Tray area (m²)
    pub tray_area: f64,
    /// Lamp area (m²)
    pub light_area: f64,
    /// Fraction of the tray area occupied by crop
    pub growing_fraction: f64,
    /// Leaf area index of the crop
    pub leaf_area_index: f64,
}

impl Default for TunnelGeometry {
    fn default() -> Self {
        Self {
            volume: 175.0,
            cover_area: 147.0,
            floor_area: 120.0,
            tray_area: 184.0,
            light_area: 63.0,
            growing_fraction: 0.31,
            leaf_area_index: 2.0,
        }
    }
}

impl TunnelGeometry {
    /// Crop area (m²)
    #[inline]
    pub fn vegetation_area(&self) -> f64 {
        self.growing_fraction * self.tray_area
    }

    /// Mat area (m²); the mat covers the trays
    #[inline]
    pub fn mat_area(&self) -> f64 {
        self.tray_area
    }
}

/// Grow-light and ambient-light timetable
///
/// Hours are hour-of-day. Grow lights run from midnight until `off_hour + shift_hours`
/// and again after `on_hour + shift_hours`; ambient lights run between
/// `ambient_from_hour` and `ambient_until_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingSchedule {
    /// Electrical power of the grow lights (W)
    pub lamp_power: f64,
    /// Fraction of lamp power released as sensible heat
    pub heat_fraction: f64,
    /// Fraction of lamp power reaching the crop as light
    pub light_fraction: f64,
    /// Scale applied to lamp output (dimming)
    pub lighting_factor: f64,
    /// Ambient light power (W)
    pub ambient_power: f64,
    /// Lamp surface temperature while on (°C)
    pub lamp_temperature: f64,
    /// Hour at which the morning lighting period ends
    pub off_hour: f64,
    /// Hour at which the evening lighting period starts
    pub on_hour: f64,
    /// Start of the ambient lighting period
    pub ambient_from_hour: f64,
    /// End of the ambient lighting period
    pub ambient_until_hour: f64,
    /// Offset applied to the grow-light periods (hours)
    pub shift_hours: f64,
}

impl Default for LightingSchedule {
    fn default() -> Self {
        Self {
            lamp_power: 15_360.0,
            heat_fraction: 0.5,
            light_fraction: 0.5,
            lighting_factor: 1.0,
            ambient_power: 500.0,
            lamp_temperature: 25.0,
            off_hour: 8.01,
            on_hour: 15.01,
            ambient_from_hour: 8.01,
            ambient_until_hour: 16.01,
            shift_hours: 0.0,
        }
    }
}

impl LightingSchedule {
    /// Whether the grow lights are on at `day_hour` with an extra `shift`
    #[inline]
    pub fn lamps_on(&self, day_hour: f64, shift: f64) -> bool {
        let shift = self.shift_hours + shift;
        (day_hour > -0.01 && day_hour < self.off_hour + shift) || day_hour > self.on_hour + shift
    }

    /// Whether the ambient lights are on at `day_hour`
    #[inline]
    pub fn ambient_on(&self, day_hour: f64) -> bool {
        day_hour > self.ambient_from_hour && day_hour < self.ambient_until_hour
    }
}

/// Settings for one simulator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Weather sampling interval (s)
    pub time_step: f64,
    /// Integration sub-steps per weather interval
    pub substeps: usize,
    /// Tunnel dimensions
    pub geometry: TunnelGeometry,
    /// Lighting timetable
    pub lighting: LightingSchedule,
    /// Number of dehumidifiers running, used when the parameter matrix has no
    /// dehumidifier column
    pub dehumidifiers: f64,
    /// Power of one dehumidifier (W)
    pub dehumidifier_power: f64,
    /// State at the start of every window, in channel order
    pub initial_state: [f64; STATE_COUNT],
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_step: 600.0,
            substeps: 30,
            geometry: TunnelGeometry::default(),
            lighting: LightingSchedule::default(),
            dehumidifiers: 2.0,
            dehumidifier_power: 700.0,
            initial_state: [
                293.0, 295.0, 297.0, 297.0, 297.0, 293.0, 295.0, 292.0, 291.0, 289.0, 287.0,
                0.012,
            ],
        }
    }
}

impl SimulationConfig {
    /// Integration step length (s)
    #[inline]
    pub fn integration_step(&self) -> f64 {
        self.time_step / self.substeps as f64
    }

    /// Check the settings before a run
    ///
    /// # Errors
    /// `Configuration` when the time step does not divide an hour, there are no
    /// sub-steps, or a geometric quantity is not positive
    pub fn validate(&self) -> Result<()> {
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(CalibrationError::Configuration(format!(
                "time step must be positive, got {}",
                self.time_step
            )));
        }
        let per_hour = 3600.0 / self.time_step;
        if (per_hour - per_hour.round()).abs() > 1e-9 {
            return Err(CalibrationError::Configuration(format!(
                "time step of {} s does not divide an hour",
                self.time_step
            )));
        }
        if self.substeps == 0 {
            return Err(CalibrationError::Configuration(
                "at least one integration sub-step is required".into(),
            ));
        }
        let g = &self.geometry;
        let positive = [
            ("volume", g.volume),
            ("cover_area", g.cover_area),
            ("floor_area", g.floor_area),
            ("tray_area", g.tray_area),
            ("light_area", g.light_area),
            ("leaf_area_index", g.leaf_area_index),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, v)| !(v.is_finite() && *v > 0.0)) {
            return Err(CalibrationError::Configuration(format!(
                "geometry.{name} must be positive, got {value}"
            )));
        }
        if !(g.growing_fraction > 0.0 && g.growing_fraction < 1.0) {
            return Err(CalibrationError::Configuration(format!(
                "geometry.growing_fraction must lie in (0, 1), got {}",
                g.growing_fraction
            )));
        }
        if self.initial_state.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::Configuration(
                "initial state contains a non-finite value".into(),
            ));
        }
        Ok(())
    }
}
