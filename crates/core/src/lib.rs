//! Tunnel Calibration Core Library
//!
//! Sequential Bayesian calibration of a growing-tunnel thermal/humidity model against
//! sparse monitored sensor data, and forecasting from the calibrated posteriors.
//!
//! ## Calibration loop
//!
//! Every step of a run:
//! - simulates a rolling window of weather for a fixed design of (ACH, IAS) candidates
//! - standardises the simulated and observed relative humidity
//! - scores each particle with a Gaussian-process marginal likelihood
//! - resamples the population and persists the posterior
//!
//! The posterior of one step seeds the next, so steps run in order; the particle scoring
//! inside a step runs on the rayon pool.

// Core types and utilities
pub mod core_types;
pub mod error;
pub mod psychrometrics;

// Surrogate and inference
pub mod gp;
pub mod inference;

// Simulator, data and orchestration
pub mod calibration;
pub mod config;
pub mod data;
pub mod forecast;
pub mod persistence;
pub mod simulation;

// Re-export core types
pub use core_types::{
    Celsius, ClimateReading, HourlySeries, Kelvin, LogConstraint, ParameterVector,
    ParticlePopulation,
};
pub use error::{CalibrationError, GpFitError, Result, RunError, WindowBounds};

// Re-export the calibration surface
pub use calibration::{
    CalibrationRun, CalibrationWindowController, DataPoint, DataPointHistory, DesignMatrix,
    StepPhase, StepRecord,
};
pub use config::CalibrationConfig;
pub use data::{load_aligned, CsvDataSource, DataSource};
pub use forecast::{Forecast, ForecastRun, Forecaster, PosteriorSummary, Scenario};
pub use inference::{CalibrationState, ParticleFilter};
pub use persistence::{CsvPosteriorStore, PosteriorSink};
pub use simulation::{SimulationConfig, SimulationResults, Simulator, TunnelModel};
