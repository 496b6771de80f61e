//! Rolling-window calibration loop
//!
//! Each step walks the same phases:
//!
//! ```text
//! AWAITING_WINDOW -> SIMULATING -> STANDARDIZING -> CALIBRATING -> PERSISTED
//! ```
//!
//! and the posterior of step `i` seeds step `i + 1`. A failure in any phase aborts the
//! run with a [`RunError`] naming the step, phase and window; steps already persisted
//! stay valid.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use tracing::{debug, info};

use super::design::DesignMatrix;
use super::history::{DataPoint, DataPointHistory};
use crate::config::CalibrationConfig;
use crate::core_types::{HourlySeries, ParticlePopulation};
use crate::error::{CalibrationError, Result, RunError, WindowBounds};
use crate::gp::TrainingSetBuilder;
use crate::inference::{
    CalibrationState, IndependentPrior, LikelihoodEvaluator, ParticleFilter, Prior,
};
use crate::persistence::PosteriorSink;
use crate::simulation::Simulator;

/// Phase of a calibration step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Selecting the data window
    AwaitingWindow,
    /// Running the simulator over the design
    Simulating,
    /// Converting outputs and observation to standardised humidity
    Standardizing,
    /// Reweighting and resampling the population
    Calibrating,
    /// Writing the step's outputs
    Persisted,
    /// Every step finished
    Done,
}

impl StepPhase {
    /// Upper-case name used in logs and errors
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingWindow => "AWAITING_WINDOW",
            Self::Simulating => "SIMULATING",
            Self::Standardizing => "STANDARDIZING",
            Self::Calibrating => "CALIBRATING",
            Self::Persisted => "PERSISTED",
            Self::Done => "DONE",
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of one calibration step, fixed once built
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationWindow {
    /// Hour bounds of the simulated weather
    pub bounds: WindowBounds,
    /// Standardised simulated humidity at the window end, one row per design candidate
    pub y_model: DMatrix<f64>,
    /// Standardised ground truth, one row
    pub y_data: DMatrix<f64>,
    /// Ground truth actually used
    pub data_point: DataPoint,
}

/// Everything one step produced
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// Zero-based step of this run
    pub step: usize,
    /// Window the step calibrated against
    pub window: WindowBounds,
    /// Ground truth used
    pub data_point: DataPoint,
    /// Prior, posterior and weighting diagnostics
    pub state: CalibrationState,
}

/// Outcome of a calibration run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationRun {
    /// Completed steps in order
    pub records: Vec<StepRecord>,
    /// Ground truth per step
    pub history: DataPointHistory,
    /// Whether the run stopped early on request
    pub cancelled: bool,
}

impl CalibrationRun {
    /// Posterior of every completed step
    pub fn posteriors(&self) -> Vec<&ParticlePopulation> {
        self.records
            .iter()
            .filter_map(|r| r.state.posterior.as_ref())
            .collect()
    }

    /// Prior of every completed step
    pub fn priors(&self) -> Vec<&ParticlePopulation> {
        self.records
            .iter()
            .filter_map(|r| r.state.prior.as_ref())
            .collect()
    }

    /// Posterior of the final completed step
    pub fn final_posterior(&self) -> Option<&ParticlePopulation> {
        self.records.last().and_then(|r| r.state.posterior.as_ref())
    }
}

/// Drives the sequential calibration over rolling weather windows
pub struct CalibrationWindowController<S: Simulator> {
    config: CalibrationConfig,
    simulator: S,
    design: DesignMatrix,
    prior: Box<dyn Prior>,
    filter: ParticleFilter,
    cancel: Option<Arc<AtomicBool>>,
}

impl<S: Simulator> CalibrationWindowController<S> {
    /// Controller using the production prior
    ///
    /// # Errors
    /// `Configuration` if the configuration is invalid
    pub fn new(config: CalibrationConfig, simulator: S, design: DesignMatrix) -> Result<Self> {
        config.validate()?;
        let filter = ParticleFilter::new(config.num_particles, config.jitter()?)?
            .with_policy(config.gp_failure_policy)
            .with_resampling(config.resampling);
        Ok(Self {
            prior: Box::new(IndependentPrior::calibration_default()?),
            config,
            simulator,
            design,
            filter,
            cancel: None,
        })
    }

    /// Replace the prior used for the first window
    pub fn with_prior(mut self, prior: Box<dyn Prior>) -> Self {
        self.prior = prior;
        self
    }

    /// Stop between steps once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Run configuration
    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Design candidates
    pub fn design(&self) -> &DesignMatrix {
        &self.design
    }

    /// Bounds of step `step`: `h2 = first_hour + step·delta_h`, `h1 = h2 - window + 1`
    pub fn window_bounds(&self, step: usize) -> Result<WindowBounds> {
        let end_hour = self.config.first_hour + step * self.config.delta_h;
        let start_hour = (end_hour + 1)
            .checked_sub(self.config.window_hours())
            .ok_or_else(|| {
                CalibrationError::DataUnavailable(format!(
                    "window of {} hours ending at hour {end_hour} starts before the data",
                    self.config.window_hours()
                ))
            })?;
        Ok(WindowBounds {
            start_hour,
            end_hour,
        })
    }

    /// Calibrate over every step
    ///
    /// `weather` and `monitored` must share the same hourly index.
    ///
    /// # Errors
    /// The first failing step, wrapped with its context
    pub fn run<R: Rng>(
        &self,
        weather: &HourlySeries,
        monitored: &HourlySeries,
        sink: &mut dyn PosteriorSink,
        rng: &mut R,
    ) -> Result<CalibrationRun, RunError> {
        let steps = self.config.num_data_points;
        info!(
            steps,
            particles = self.config.num_particles,
            candidates = self.design.len(),
            window_hours = self.config.window_hours(),
            "starting calibration run"
        );

        let mut run = CalibrationRun {
            history: match self.config.bootstrap_data_point {
                Some(value) => DataPointHistory::with_bootstrap(value),
                None => DataPointHistory::new(),
            },
            ..CalibrationRun::default()
        };
        let mut state = CalibrationState::initial();

        for step in 0..steps {
            if self.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed)) {
                info!(step, "run cancelled between steps");
                run.cancelled = true;
                return Ok(run);
            }
            state = self.step(step, &state, weather, monitored, &mut run, sink, rng)?;
        }

        let window = self.window_bounds(steps - 1).unwrap_or(WindowBounds {
            start_hour: 0,
            end_hour: 0,
        });
        sink.finish(&run)
            .map_err(|source| self.fail(steps - 1, StepPhase::Done, window, source))?;
        info!(steps, "calibration run finished");
        Ok(run)
    }

    fn step<R: Rng>(
        &self,
        step: usize,
        state: &CalibrationState,
        weather: &HourlySeries,
        monitored: &HourlySeries,
        run: &mut CalibrationRun,
        sink: &mut dyn PosteriorSink,
        rng: &mut R,
    ) -> Result<CalibrationState, RunError> {
        let unknown = WindowBounds {
            start_hour: 0,
            end_hour: self.config.first_hour + step * self.config.delta_h,
        };

        let mut phase = StepPhase::AwaitingWindow;
        debug!(step, %phase);
        let window = self
            .window_bounds(step)
            .and_then(|w| check_coverage(w, weather, monitored).map(|()| w))
            .map_err(|source| self.fail(step, phase, unknown, source))?;

        phase = StepPhase::Simulating;
        debug!(step, %phase, %window);
        let relative_humidity = self
            .simulate(window, weather)
            .map_err(|source| self.fail(step, phase, window, source))?;

        phase = StepPhase::Standardizing;
        debug!(step, %phase);
        let observed = monitored.relative_humidity_fraction(window.end_hour);
        let calibration_window = run
            .history
            .record(step, observed)
            .map(|data_point| self.standardize(window, &relative_humidity, data_point))
            .map_err(|source| self.fail(step, phase, window, source))?;

        phase = StepPhase::Calibrating;
        debug!(step, %phase);
        let next = self
            .calibrate(&calibration_window, state, rng)
            .map_err(|source| self.fail(step, phase, window, source))?;

        phase = StepPhase::Persisted;
        let record = StepRecord {
            step,
            window,
            data_point: calibration_window.data_point,
            state: next.clone(),
        };
        sink.record_step(&record)
            .map_err(|source| self.fail(step, phase, window, source))?;
        info!(
            step,
            %window,
            data_point = record.data_point.value,
            carried_forward = record.data_point.carried_forward,
            ess = next.effective_sample_size(),
            "step persisted"
        );
        run.records.push(record);
        Ok(next)
    }

    /// Simulate the design over the window and return final-hour relative humidity
    fn simulate(&self, window: WindowBounds, weather: &HourlySeries) -> Result<DVector<f64>> {
        let results = self.simulator.simulate(
            window.start_hour,
            window.end_hour,
            self.design.candidates(),
            weather,
            weather.latest_hour_of_day(),
            &self.config.simulation,
        )?;
        if results.candidates() != self.design.len() {
            return Err(CalibrationError::SimulationFailure(format!(
                "simulator returned {} candidates for a design of {}",
                results.candidates(),
                self.design.len()
            )));
        }
        results.validate()?;
        let rh = results.final_relative_humidity()?;
        if let Some(i) = rh.iter().position(|v| !v.is_finite()) {
            return Err(CalibrationError::SimulationFailure(format!(
                "relative humidity of candidate {i} is {}",
                rh[i]
            )));
        }
        Ok(rh)
    }

    fn standardize(
        &self,
        bounds: WindowBounds,
        relative_humidity: &DVector<f64>,
        data_point: DataPoint,
    ) -> CalibrationWindow {
        let standardizer = self.config.standardizer();
        let n_model = self.config.x_model.len();
        let n_data = self.config.x_data.len();
        let observed = standardizer.apply(data_point.value);
        CalibrationWindow {
            bounds,
            y_model: DMatrix::from_fn(relative_humidity.len(), n_model, |i, _| {
                standardizer.apply(relative_humidity[i])
            }),
            y_data: DMatrix::from_element(1, n_data, observed),
            data_point,
        }
    }

    fn calibrate<R: Rng>(
        &self,
        window: &CalibrationWindow,
        state: &CalibrationState,
        rng: &mut R,
    ) -> Result<CalibrationState> {
        let builder = TrainingSetBuilder::new(
            DVector::from_vec(self.config.x_model.clone()),
            DVector::from_vec(self.config.x_data.clone()),
            window.y_model.clone(),
            window.y_data.clone(),
            self.design.normalized(),
        )?;
        let evaluator = LikelihoodEvaluator::new(builder, self.config.surrogate_settings());
        self.filter
            .sequential_update(state, self.prior.as_ref(), &evaluator, rng)
    }

    fn fail(
        &self,
        step: usize,
        phase: StepPhase,
        window: WindowBounds,
        source: CalibrationError,
    ) -> RunError {
        RunError {
            step,
            phase: phase.as_str(),
            window,
            particles: self.config.num_particles,
            source,
        }
    }
}

fn check_coverage(
    window: WindowBounds,
    weather: &HourlySeries,
    monitored: &HourlySeries,
) -> Result<()> {
    for (name, series) in [("weather", weather), ("monitored", monitored)] {
        if series.len() <= window.end_hour {
            return Err(CalibrationError::DataUnavailable(format!(
                "{name} series has {} hourly rows, window {window} needs {}",
                series.len(),
                window.end_hour + 1
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{SimulationConfig, SimulationResults};
    use chrono::NaiveDate;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Humidity rises linearly with ACH, temperature fixed at 20 °C
    struct LinearSimulator;

    impl Simulator for LinearSimulator {
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
            let sat = crate::psychrometrics::sat_conc(crate::core_types::Kelvin::new(293.15));
            SimulationResults::from_air(
                DMatrix::from_element(hours, n, 293.15),
                DMatrix::from_fn(hours, n, |_, j| (0.5 + 0.03 * parameters[(j, 0)]) * sat),
            )
        }
    }

    struct NullSink;

    impl PosteriorSink for NullSink {
        fn record_step(&mut self, _record: &StepRecord) -> Result<()> {
            Ok(())
        }
    }

    fn series(rows: usize, rh: f64) -> HourlySeries {
        let start = NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        HourlySeries::new(start, vec![5.0; rows], vec![rh; rows]).unwrap()
    }

    fn config() -> CalibrationConfig {
        CalibrationConfig {
            num_particles: 40,
            calibration_window_days: 1,
            first_hour: 24,
            delta_h: 6,
            num_data_points: 3,
            delta_days: 3,
            num_weather_days: 3,
            seed: Some(1),
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn test_window_bounds() {
        let controller = CalibrationWindowController::new(
            config(),
            LinearSimulator,
            DesignMatrix::full_factorial(3, 2).unwrap(),
        )
        .unwrap();
        let w = controller.window_bounds(2).unwrap();
        assert_eq!(w.end_hour, 36);
        assert_eq!(w.start_hour, 13);
    }

    #[test]
    fn test_run_produces_clipped_posteriors() {
        let controller = CalibrationWindowController::new(
            config(),
            LinearSimulator,
            DesignMatrix::full_factorial(4, 3).unwrap(),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let run = controller
            .run(&series(73, 70.0), &series(73, 70.0), &mut NullSink, &mut rng)
            .unwrap();
        assert_eq!(run.records.len(), 3);
        assert!(!run.cancelled);
        for posterior in run.posteriors() {
            assert_eq!(posterior.len(), 40);
            for p in posterior.particles() {
                assert!((0.0..=1.0).contains(&p[0]) && (0.0..=1.0).contains(&p[1]));
                assert!(p[2] > 0.0);
            }
        }
        assert_eq!(run.history.values(), vec![0.7, 0.7, 0.7]);
    }

    #[test]
    fn test_short_weather_reports_step_and_phase() {
        let controller = CalibrationWindowController::new(
            config(),
            LinearSimulator,
            DesignMatrix::full_factorial(3, 2).unwrap(),
        )
        .unwrap();
        let err = controller
            .run(
                &series(30, 70.0),
                &series(73, 70.0),
                &mut NullSink,
                &mut StdRng::seed_from_u64(0),
            )
            .unwrap_err();
        assert_eq!(err.step, 1);
        assert_eq!(err.phase, "AWAITING_WINDOW");
        assert_eq!(err.source.kind(), "DataUnavailable");
        assert_eq!(err.particles, 40);
    }

    #[test]
    fn test_cancel_flag_stops_between_steps() {
        let flag = Arc::new(AtomicBool::new(true));
        let controller = CalibrationWindowController::new(
            config(),
            LinearSimulator,
            DesignMatrix::full_factorial(3, 2).unwrap(),
        )
        .unwrap()
        .with_cancel_flag(flag);
        let run = controller
            .run(
                &series(73, 70.0),
                &series(73, 70.0),
                &mut NullSink,
                &mut StdRng::seed_from_u64(0),
            )
            .unwrap();
        assert!(run.cancelled);
        assert!(run.records.is_empty());
    }
}
