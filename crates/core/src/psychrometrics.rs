//! Moisture relations shared by the simulator and the window controller

use serde::{Deserialize, Serialize};

use crate::core_types::units::{Kelvin, CELSIUS_KELVIN_OFFSET};

/// Saturation water-vapour concentration of air (kg/m³) at temperature `t`
///
/// Empirical fit used by the tunnel model: specific humidity at saturation times a
/// linearised air density.
#[inline]
pub fn sat_conc(t: Kelvin) -> f64 {
    let tc = *t - CELSIUS_KELVIN_OFFSET;
    let spec_hum = (11.56 - 4030.0 / (tc + 235.0)).exp();
    let air_dens = -0.0046 * tc + 1.2978;
    spec_hum * air_dens
}

/// Relative humidity (fraction) from absolute concentration `cw` (kg/m³) at `t`
#[inline]
pub fn relative_humidity(cw: f64, t: Kelvin) -> f64 {
    cw / sat_conc(t)
}

/// Absolute concentration (kg/m³) from relative humidity fraction at `t`
#[inline]
pub fn absolute_humidity(rh: f64, t: Kelvin) -> f64 {
    rh * sat_conc(t)
}

/// Fixed empirical standardisation `(x - mean) / std`
///
/// The constants are domain calibration values, never re-estimated from the data being
/// standardised.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    /// Empirical mean (`ym`)
    pub mean: f64,
    /// Empirical standard deviation (`ystd`)
    pub std: f64,
}

impl Standardizer {
    /// Standardise a single value
    #[inline]
    pub fn apply(&self, x: f64) -> f64 {
        (x - self.mean) / self.std
    }

    /// Undo [`Standardizer::apply`]
    #[inline]
    pub fn invert(&self, z: f64) -> f64 {
        z * self.std + self.mean
    }
}

impl Default for Standardizer {
    fn default() -> Self {
        Self {
            mean: 0.6456,
            std: 0.0675,
        }
    }
}
