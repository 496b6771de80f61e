//! Lumped energy and moisture balance of a growing tunnel
//!
//! Twelve states are integrated per candidate:
//!
//! | channel | state |
//! |---------|-------|
//! | 0 | cover temperature |
//! | 1 | internal air temperature |
//! | 2 | vegetation temperature |
//! | 3 | growing-mat temperature |
//! | 4 | tray temperature |
//! | 5 | floor temperature |
//! | 6-10 | temperatures of the five cover conduction layers |
//! | 11 | vapour concentration of the internal air |
//!
//! Temperatures are Kelvin, vapour concentration kg/m³. External climate is held
//! constant over each weather interval and the system is advanced with classic RK4 on
//! sub-steps of that interval. The steel layer of the cover is the stiffest part of the
//! system, so sub-steps much longer than ~40 s will diverge.

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::debug;

use super::climate::ClimateGrid;
use super::config::SimulationConfig;
use super::physics::{
    conduction, convection, grashof_reynolds, nusselt_sherwood, radiation, Surface,
    AIR_CONDUCTIVITY, LEWIS_NUMBER,
};
use super::{SimulationResults, Simulator, STATE_COUNT};
use crate::core_types::units::CELSIUS_KELVIN_OFFSET;
use crate::core_types::{HourlySeries, Kelvin};
use crate::error::{CalibrationError, Result};
use crate::psychrometrics::sat_conc;

// ============================================================================
// AIR AND WATER
// ============================================================================

const AIR_SPECIFIC_HEAT: f64 = 1003.2;
const LATENT_HEAT: f64 = 2_437_000.0;
const GAS_CONSTANT: f64 = 8.314;
const ATMOSPHERIC_PRESSURE: f64 = 1.013e5;
const WATER_MOLAR_MASS: f64 = 0.018;
const AIR_MOLAR_MASS: f64 = 0.029;
const AVOGADRO: f64 = 6.022_14e23;
/// Mean energy of a photosynthetically active photon (J)
const PHOTON_ENERGY: f64 = 3.6368e-19;

// ============================================================================
// SURFACES
// ============================================================================

/// Areal heat capacity of the cover (J/m²·K)
const COVER_HEAT_CAPACITY: f64 = 7932.5;
/// Areal heat capacity of the floor (J/m²·K)
const FLOOR_HEAT_CAPACITY: f64 = 302_400.0;
/// Areal heat capacity of the trays (J/m²·K)
const TRAY_HEAT_CAPACITY: f64 = 12_525.0;
const VEGETATION_SPECIFIC_HEAT: f64 = 3500.0;
/// Vegetation mass per unit area (kg/m²)
const VEGETATION_SURFACE_DENSITY: f64 = 1.212;
/// Fraction of the mat pore space holding water
const MAT_SATURATION: f64 = 0.5;
const MAT_HEAT_CAPACITY: f64 = 17_104.0 * MAT_SATURATION + 304.0 * (1.0 - MAT_SATURATION);

/// Critical dimensions for convection (m)
const COVER_DIMENSION: f64 = 2.0;
const FLOOR_DIMENSION: f64 = 1.3;
const VEGETATION_DIMENSION: f64 = 0.1;
const MAT_DIMENSION: f64 = 0.1;
const TRAY_DIMENSION: f64 = 1.0;

/// Share of the exposed mat exchanging sensible heat; the rest evaporates
const MAT_CONVECTIVE_SHARE: f64 = 0.6;
const MAT_EVAPORATIVE_SHARE: f64 = 0.4;

// ============================================================================
// CONDUCTION
// ============================================================================

/// Cover layers from the inside out: conductivity, thickness, specific heat, density
const COVER_LAYERS: [(f64, f64, f64, f64); 6] = [
    (0.03, 0.005, 1670.0, 950.0),
    (55.0, 0.02, 456.0, 7920.0),
    (1.1, 0.05, 880.0, 2400.0),
    (1.41, 0.15, 1200.0, 1800.0),
    (1.41, 0.3, 1200.0, 1800.0),
    (1.41, 0.6, 1200.0, 1800.0),
];
/// Deep ground temperature beneath the cover layers (°C)
const SUBSOIL_TEMPERATURE: f64 = 14.0;
const FLOOR_CONDUCTIVITY: f64 = 0.8;
const FLOOR_THICKNESS: f64 = 0.15;
const TRAY_CONDUCTIVITY: f64 = 0.25;
const MAT_THICKNESS: f64 = 0.01;

// ============================================================================
// CROP
// ============================================================================

/// Aerodynamic resistance of the canopy (s/m)
const CANOPY_AERODYNAMIC_RESISTANCE: f64 = 100.0;

/// Pairwise view factors between the radiating surfaces
#[derive(Debug, Clone, Copy)]
struct ViewFactors {
    c_f: f64,
    f_c: f64,
    c_v: f64,
    c_m: f64,
    c_l: f64,
    l_c: f64,
    l_v: f64,
    l_m: f64,
    l_p: f64,
    p_f: f64,
    p_v: f64,
    p_m: f64,
    p_l: f64,
    v_c: f64,
    v_p: f64,
    v_m: f64,
    v_l: f64,
    m_c: f64,
    m_p: f64,
    m_v: f64,
    m_l: f64,
    f_p: f64,
}

impl ViewFactors {
    fn new(growing_fraction: f64) -> Self {
        let g = growing_fraction;
        Self {
            c_f: 0.6875,
            f_c: 1.6 / 2.6,
            c_v: g / 3.2,
            c_m: (1.0 - g) / 3.2,
            c_l: 0.0,
            l_c: 0.125,
            l_v: 0.25,
            l_m: 0.25,
            l_p: 0.375,
            p_f: 0.25,
            p_v: 0.75 * g,
            p_m: 0.75 * (1.0 - g),
            p_l: 0.0,
            v_c: 0.125,
            v_p: 0.375,
            v_m: 0.5,
            v_l: 0.0,
            m_c: (1.0 - g) / 4.0,
            m_p: (1.0 - g) * 0.75,
            m_v: g,
            m_l: 0.0,
            f_p: 1.0 / 2.6,
        }
    }
}

/// Radiating surfaces of the tunnel
#[derive(Debug, Clone, Copy)]
struct Surfaces {
    cover: Surface,
    floor: Surface,
    vegetation: Surface,
    mat: Surface,
    tray: Surface,
    lights: Surface,
}

/// Per-candidate inputs that stay fixed during integration
#[derive(Debug, Clone, Copy)]
struct Controls {
    /// Air changes per second
    ventilation: f64,
    /// Internal air speed (m/s)
    air_speed: f64,
    dehumidifiers: f64,
    lighting_shift: f64,
}

/// Derivative of the twelve-state system for one candidate
struct Balance<'a> {
    config: &'a SimulationConfig,
    surfaces: Surfaces,
    views: ViewFactors,
    controls: Controls,
}

impl<'a> Balance<'a> {
    fn new(config: &'a SimulationConfig, controls: Controls) -> Self {
        let g = &config.geometry;
        let surface = |emissivity, reflectivity, area| Surface {
            emissivity,
            reflectivity,
            area,
        };
        Self {
            config,
            surfaces: Surfaces {
                cover: surface(0.9, 0.1, g.cover_area),
                floor: surface(0.9, 0.1, g.floor_area),
                vegetation: surface(0.9, 0.1, g.vegetation_area()),
                mat: surface(0.95, 0.05, g.mat_area()),
                tray: surface(0.95, 0.05, g.tray_area),
                lights: surface(1.0, 0.0, g.light_area),
            },
            views: ViewFactors::new(g.growing_fraction),
            controls,
        }
    }

    /// Time derivative of `z` at absolute time `t` (s) under external temperature
    /// `t_ext` (K) and vapour concentration `cw_ext`
    #[allow(clippy::too_many_lines)]
    fn derivative(
        &self,
        t: f64,
        z: &[f64; STATE_COUNT],
        t_ext: f64,
        cw_ext: f64,
        latest_hour_of_day: f64,
    ) -> [f64; STATE_COUNT] {
        let [t_c, t_i, t_v, t_m, t_p, t_f, t_c1, t_c2, t_c3, t_c4, t_c5, c_w] = *z;
        let geo = &self.config.geometry;
        let lights = &self.config.lighting;
        let Controls {
            ventilation,
            air_speed: ias,
            dehumidifiers,
            lighting_shift,
        } = self.controls;
        let Surfaces {
            cover,
            floor,
            vegetation,
            mat,
            tray,
            lights: lamp,
        } = self.surfaces;
        let f = &self.views;

        // internal air
        let p_w = c_w * GAS_CONSTANT * t_i / WATER_MOLAR_MASS;
        let rho_i = ((ATMOSPHERIC_PRESSURE - p_w) * AIR_MOLAR_MASS + p_w * WATER_MOLAR_MASS)
            / (GAS_CONSTANT * t_i);

        // lighting
        let hour = (t / 3600.0).floor();
        let day_hour = (hour + latest_hour_of_day).rem_euclid(24.0);
        let lamps_on = lights.lamps_on(day_hour, lighting_shift);
        let lamp_flag = if lamps_on { 1.0 } else { 0.0 };
        let ambient_flag = if lights.ambient_on(day_hour) { 1.0 } else { 0.0 };
        let t_l = if lamps_on {
            lights.lamp_temperature + CELSIUS_KELVIN_OFFSET
        } else {
            t_i
        };
        let qv_l_i = lights.heat_fraction * lights.lamp_power * lights.lighting_factor * lamp_flag
            + lights.ambient_power * ambient_flag
            + dehumidifiers * self.config.dehumidifier_power;

        // convection
        let a_v_exp = geo.leaf_area_index * vegetation.area;
        let a_m_exp = mat.area * (1.0 - geo.growing_fraction);
        let qv_i_c = convection(COVER_DIMENSION, cover.area, t_i, t_c, ias);
        let qv_i_f = convection(FLOOR_DIMENSION, floor.area, t_i, t_f, ias);
        let qv_i_v = convection(VEGETATION_DIMENSION, a_v_exp, t_i, t_v, ias);
        let qv_i_m = convection(MAT_DIMENSION, a_m_exp * MAT_CONVECTIVE_SHARE, t_i, t_m, ias);
        let qv_i_p = convection(TRAY_DIMENSION, tray.area, t_i, t_p, ias);

        // condensation on / evaporation from the mat
        let (gr, re) = grashof_reynolds(MAT_DIMENSION, t_i, t_m, ias);
        let (_, sh) = nusselt_sherwood(gr, re);
        let qp_i_m = a_m_exp * MAT_EVAPORATIVE_SHARE * MAT_SATURATION * LATENT_HEAT
            / (rho_i * AIR_SPECIFIC_HEAT)
            * (sh / LEWIS_NUMBER)
            * (AIR_CONDUCTIVITY / MAT_DIMENSION)
            * (c_w - sat_conc(Kelvin::new(t_m)));

        // radiation
        let qr_c_f = radiation(&cover, &floor, f.c_f, f.f_c, t_c, t_f);
        let qr_c_v = radiation(&cover, &vegetation, f.c_v, f.v_c, t_c, t_v);
        let qr_c_m = radiation(&cover, &mat, f.c_m, f.m_c, t_c, t_m);
        let qr_l_c = radiation(&lamp, &cover, f.l_c, f.c_l, t_l, t_c);
        let qr_l_v = radiation(&lamp, &vegetation, f.l_v, f.v_l, t_l, t_v);
        let qr_l_m = radiation(&lamp, &mat, f.l_m, f.m_l, t_l, t_m);
        let qr_l_p = radiation(&lamp, &tray, f.l_p, f.p_l, t_l, t_p);
        let qr_v_c = radiation(&vegetation, &cover, f.v_c, f.c_v, t_v, t_c);
        let qr_v_m = radiation(&vegetation, &mat, f.v_m, f.m_v, t_v, t_m);
        let qr_v_p = radiation(&vegetation, &tray, f.v_p, f.p_v, t_v, t_p);
        let qr_m_c = radiation(&mat, &cover, f.m_c, f.c_m, t_m, t_c);
        let qr_m_v = radiation(&mat, &vegetation, f.m_v, f.v_m, t_m, t_v);
        let qr_m_p = radiation(&mat, &tray, f.m_p, f.p_m, t_m, t_p);
        let qr_p_v = radiation(&tray, &vegetation, f.p_v, f.v_p, t_p, t_v);
        let qr_p_m = radiation(&tray, &mat, f.p_m, f.m_p, t_p, t_m);
        let qr_p_f = radiation(&tray, &floor, f.p_f, f.f_p, t_p, t_f);
        let qr_f_c = radiation(&floor, &cover, f.f_c, f.c_f, t_f, t_c);
        let qr_f_p = radiation(&floor, &tray, f.f_p, f.p_f, t_f, t_p);

        // conduction through the cover, into the ground below the floor, mat to tray
        let t_ss = SUBSOIL_TEMPERATURE + CELSIUS_KELVIN_OFFSET;
        let layer_temps = [t_c, t_c1, t_c2, t_c3, t_c4, t_c5, t_ss];
        let mut qd_cover = [0.0; 6];
        for (k, (lam, l, _, _)) in COVER_LAYERS.iter().enumerate() {
            qd_cover[k] = conduction(cover.area, *lam, *l, layer_temps[k], layer_temps[k + 1]);
        }
        let t_ground = 0.435 * (t_ext - CELSIUS_KELVIN_OFFSET) + 12.0 + CELSIUS_KELVIN_OFFSET;
        let qd_f = conduction(floor.area, FLOOR_CONDUCTIVITY, FLOOR_THICKNESS, t_f, t_ground);
        let qd_m_p = conduction(mat.area, TRAY_CONDUCTIVITY, MAT_THICKNESS, t_m, t_p);

        // transpiration driven by photosynthetic photon flux from the lamps
        let qs_int = lights.light_fraction * lights.lamp_power * lights.lighting_factor * lamp_flag
            / tray.area;
        let ppfd = qs_int / 1e-6 / AVOGADRO / PHOTON_ENERGY;
        let r_s = 60.0 * (1500.0 + ppfd) / (200.0 + ppfd);
        let qt_v_i = vegetation.area
            * (geo.leaf_area_index * LATENT_HEAT / (CANOPY_AERODYNAMIC_RESISTANCE + r_s)
                * (sat_conc(Kelvin::new(t_v)) - c_w));

        // ventilation
        let qv_i_e = ventilation * geo.volume * rho_i * AIR_SPECIFIC_HEAT * (t_i - t_ext);
        let mw_i_e = ventilation * (c_w - cw_ext);

        // dehumidifier condensate (kg/h per unit volume, converted to kg/s)
        let rh = c_w / sat_conc(Kelvin::new(t_i));
        let dehumidify = dehumidifiers * (0.07 * t_i + 5.0 * rh - 21.8) / geo.volume;
        let mw_cc_i = -dehumidify / 3600.0;

        let layer_rate = |k: usize| {
            let (_, l, c, rho) = COVER_LAYERS[k];
            (qd_cover[k - 1] - qd_cover[k]) / (rho * c * l * cover.area)
        };

        [
            (qv_i_c - qr_c_f - qr_c_v - qr_c_m + qr_l_c - qd_cover[0])
                / (cover.area * COVER_HEAT_CAPACITY),
            (-qv_i_c - qv_i_f - qv_i_e + qv_l_i - qv_i_m - qv_i_v - qv_i_p)
                / (geo.volume * rho_i * AIR_SPECIFIC_HEAT),
            (qv_i_v - qr_v_c - qr_v_m + qr_l_v - qr_v_p - qt_v_i)
                / (VEGETATION_SPECIFIC_HEAT * vegetation.area * VEGETATION_SURFACE_DENSITY),
            (qv_i_m + qp_i_m - qr_m_v - qr_m_c + qr_l_m - qr_m_p - qd_m_p)
                / (mat.area * MAT_HEAT_CAPACITY),
            (qd_m_p + qv_i_p - qr_p_f + qr_l_p - qr_p_v - qr_p_m) / (tray.area * TRAY_HEAT_CAPACITY),
            (qv_i_f - qr_f_c - qr_f_p - qd_f) / (floor.area * FLOOR_HEAT_CAPACITY),
            layer_rate(1),
            layer_rate(2),
            layer_rate(3),
            layer_rate(4),
            layer_rate(5),
            (qt_v_i - qp_i_m) / (geo.volume * LATENT_HEAT) - mw_i_e + mw_cc_i,
        ]
    }
}

/// One classic Runge-Kutta step of length `h`
fn rk4_step<F>(z: &[f64; STATE_COUNT], h: f64, f: F) -> [f64; STATE_COUNT]
where
    F: Fn(f64, &[f64; STATE_COUNT]) -> [f64; STATE_COUNT],
{
    let offset = |base: &[f64; STATE_COUNT], k: &[f64; STATE_COUNT], s: f64| {
        let mut out = *base;
        for (o, d) in out.iter_mut().zip(k) {
            *o += s * d;
        }
        out
    };
    let k1 = f(0.0, z);
    let k2 = f(0.5 * h, &offset(z, &k1, 0.5 * h));
    let k3 = f(0.5 * h, &offset(z, &k2, 0.5 * h));
    let k4 = f(h, &offset(z, &k3, h));

    let mut out = *z;
    for (i, o) in out.iter_mut().enumerate() {
        *o += h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
    }
    out
}

/// Physics-based tunnel simulator
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelModel;

impl TunnelModel {
    /// Create the model
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Integrate one candidate over the climate grid starting at hour `h1`
    ///
    /// Returns one state per hour, `hours + 1` rows including the initial state.
    fn integrate(
        &self,
        h1: usize,
        hours: usize,
        controls: Controls,
        climate: &ClimateGrid,
        latest_hour_of_day: f64,
        config: &SimulationConfig,
    ) -> Result<Vec<[f64; STATE_COUNT]>> {
        let balance = Balance::new(config, controls);

        let h = config.integration_step();
        let intervals_per_hour = (3600.0 / config.time_step).round() as usize;
        let t_start = h1 as f64 * 3600.0;

        let mut z = config.initial_state;
        let mut out = Vec::with_capacity(hours + 1);
        out.push(z);

        for interval in 0..hours * intervals_per_hour {
            let elapsed = interval as f64 * config.time_step;
            let (temperature, relative_humidity) = climate.at(elapsed);
            let t_ext = temperature + CELSIUS_KELVIN_OFFSET;
            let cw_ext = relative_humidity / 100.0 * sat_conc(Kelvin::new(t_ext));

            for sub in 0..config.substeps {
                let t = t_start + elapsed + sub as f64 * h;
                z = rk4_step(&z, h, |dt, state| {
                    balance.derivative(t + dt, state, t_ext, cw_ext, latest_hour_of_day)
                });
            }

            if let Some(bad) = z.iter().position(|v| !v.is_finite()) {
                return Err(CalibrationError::SimulationFailure(format!(
                    "state {bad} diverged {elapsed} s after hour {h1} \
                     (ACH {} 1/h, IAS {} m/s); reduce the integration step",
                    controls.ventilation * 3600.0,
                    controls.air_speed
                )));
            }
            if (interval + 1) % intervals_per_hour == 0 {
                out.push(z);
            }
        }
        Ok(out)
    }
}

impl Simulator for TunnelModel {
    fn simulate(
        &self,
        h1: usize,
        h2: usize,
        parameters: &DMatrix<f64>,
        weather: &HourlySeries,
        latest_hour_of_day: f64,
        config: &SimulationConfig,
    ) -> Result<SimulationResults> {
        config.validate()?;
        if h2 < h1 {
            return Err(CalibrationError::Configuration(format!(
                "window end {h2} precedes start {h1}"
            )));
        }
        let columns = parameters.ncols();
        if columns != 2 && columns != 4 {
            return Err(CalibrationError::Configuration(format!(
                "parameter matrix must have 2 or 4 columns, got {columns}"
            )));
        }

        let climate = ClimateGrid::from_hourly(weather, h1, h2, config.time_step)?;
        let hours = h2 - h1;
        debug!(
            h1,
            h2,
            candidates = parameters.nrows(),
            latest_hour_of_day,
            "simulating tunnel"
        );

        let trajectories: Vec<Vec<[f64; STATE_COUNT]>> = (0..parameters.nrows())
            .into_par_iter()
            .map(|i| {
                let row = parameters.row(i);
                let (dehumidifiers, lighting_shift) = if columns == 4 {
                    (row[2], row[3])
                } else {
                    (config.dehumidifiers, 0.0)
                };
                let controls = Controls {
                    ventilation: row[0] / 3600.0,
                    air_speed: row[1],
                    dehumidifiers,
                    lighting_shift,
                };
                self.integrate(h1, hours, controls, &climate, latest_hour_of_day, config)
            })
            .collect::<Result<_>>()?;

        let channels = (0..STATE_COUNT)
            .map(|c| {
                DMatrix::from_fn(hours + 1, trajectories.len(), |hour, candidate| {
                    trajectories[candidate][hour][c]
                })
            })
            .collect();
        SimulationResults::from_channels(channels)
    }
}
