//! Core types shared across the calibration engine

pub mod parameters;
pub mod series;
pub mod units;

pub use parameters::{
    LogConstraint, ParameterVector, ParticlePopulation, ACH, IAS, LENGTH_SCALE, PARAMETER_DIM,
    UNIT_CLIPPED,
};
pub use series::{align_windows, fill_gaps, resample_hourly, ClimateReading, HourlySeries};
pub use units::{Celsius, Kelvin};
