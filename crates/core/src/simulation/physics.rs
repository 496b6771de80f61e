//! Heat and mass transfer relations used by the tunnel model
//!
//! All temperatures in Kelvin, areas in m², lengths in m, fluxes in W.

/// Gravitational acceleration (m/s²)
pub const GRAVITY: f64 = 9.81;
/// Kinematic viscosity of air (m²/s)
pub const AIR_KINEMATIC_VISCOSITY: f64 = 15.1e-6;
/// Thermal conductivity of air (W/m·K)
pub const AIR_CONDUCTIVITY: f64 = 0.025;
/// Lewis number of water vapour in air
pub const LEWIS_NUMBER: f64 = 0.819;
/// Stefan-Boltzmann constant (W/m²·K⁴)
pub const STEFAN_BOLTZMANN: f64 = 5.67e-8;

/// Nusselt and Sherwood numbers for mixed free/forced convection
///
/// Free convection is laminar below `Gr = 1e5`, forced convection laminar below
/// `Re = 2e4`. The larger Nusselt number of the two regimes wins.
pub fn nusselt_sherwood(grashof: f64, reynolds: f64) -> (f64, f64) {
    let nu_free = if grashof < 1e5 {
        0.5 * grashof.powf(0.25)
    } else {
        0.13 * grashof.powf(0.33)
    };
    let nu_forced = if reynolds < 2e4 {
        0.6 * reynolds.sqrt()
    } else {
        0.032 * reynolds.powf(0.8)
    };

    if nu_free > nu_forced {
        (nu_free, nu_free * LEWIS_NUMBER.powf(0.25))
    } else {
        (nu_forced, nu_forced * LEWIS_NUMBER.powf(0.33))
    }
}

/// Grashof and Reynolds numbers for a surface of critical dimension `d`
#[inline]
pub fn grashof_reynolds(d: f64, t_air: f64, t_surface: f64, air_speed: f64) -> (f64, f64) {
    let gr = GRAVITY * d.powi(3) / (t_air * AIR_KINEMATIC_VISCOSITY.powi(2)) * (t_air - t_surface).abs();
    let re = air_speed * d / AIR_KINEMATIC_VISCOSITY;
    (gr, re)
}

/// Convective heat flow from air at `t_air` to a surface at `t_surface`
pub fn convection(d: f64, area: f64, t_air: f64, t_surface: f64, air_speed: f64) -> f64 {
    let (gr, re) = grashof_reynolds(d, t_air, t_surface, air_speed);
    let (nu, _) = nusselt_sherwood(gr, re);
    area * nu * AIR_CONDUCTIVITY * (t_air - t_surface) / d
}

/// Grey-body radiative exchange between two surfaces
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    /// Emissivity
    pub emissivity: f64,
    /// Reflectivity
    pub reflectivity: f64,
    /// Area (m²)
    pub area: f64,
}

/// Net radiation from `a` to `b` given view factors both ways
pub fn radiation(a: &Surface, b: &Surface, f_ab: f64, f_ba: f64, t_a: f64, t_b: f64) -> f64 {
    let k = a.emissivity * b.emissivity / (1.0 - a.reflectivity * b.reflectivity * f_ab * f_ba);
    k * STEFAN_BOLTZMANN * a.area * f_ab * (t_a.powi(4) - t_b.powi(4))
}

/// Conductive heat flow through a layer of thickness `l`
#[inline]
pub fn conduction(area: f64, conductivity: f64, l: f64, t1: f64, t2: f64) -> f64 {
    area * conductivity / l * (t1 - t2)
}
