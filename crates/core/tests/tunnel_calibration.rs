//! The physics-based tunnel model driving a calibration step and a forecast

mod common;

use chrono::Timelike;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tunnel_calib_core::calibration::DesignMatrix;
use tunnel_calib_core::forecast::ForecastRun;
use tunnel_calib_core::{
    CalibrationWindowController, Forecaster, HourlySeries, PosteriorSink, PosteriorSummary,
    Scenario, StepRecord, TunnelModel,
};

use common::{small_config, start};

struct Discard;

impl PosteriorSink for Discard {
    fn record_step(&mut self, _record: &StepRecord) -> tunnel_calib_core::Result<()> {
        Ok(())
    }
}

/// Mild spring days: 8-16 °C swing, humid nights
fn spring_weather(rows: usize) -> HourlySeries {
    let temperature = (0..rows)
        .map(|h| {
            let hour = f64::from(u32::try_from(h % 24).unwrap());
            12.0 - 4.0 * (std::f64::consts::TAU * hour / 24.0).cos()
        })
        .collect();
    let rh = (0..rows)
        .map(|h| if h % 24 < 8 { 90.0 } else { 70.0 })
        .collect();
    HourlySeries::new(start(), temperature, rh).unwrap()
}

#[test]
fn tunnel_model_calibrates_and_forecasts() {
    let weather = spring_weather(49);
    assert_eq!(weather.end().hour(), 0);
    let monitored = HourlySeries::new(start(), vec![20.0; 49], vec![65.0; 49]).unwrap();
    let config = small_config(1);
    let design = DesignMatrix::full_factorial(3, 2).unwrap();

    let controller =
        CalibrationWindowController::new(config.clone(), TunnelModel::new(), design.clone())
            .unwrap();
    let run = controller
        .run(&weather, &monitored, &mut Discard, &mut StdRng::seed_from_u64(2))
        .unwrap();

    let posterior = run.final_posterior().unwrap();
    assert_eq!(posterior.len(), config.num_particles);
    for p in posterior.particles() {
        assert!(p.iter().all(|v| v.is_finite()));
        assert!((0.0..=1.0).contains(&p[0]) && (0.0..=1.0).contains(&p[1]));
        assert!(p[2] > 0.0);
    }

    let summary = PosteriorSummary::from_posteriors(&design, &run.posteriors()).unwrap();
    let step = summary.last().unwrap();
    assert!(step.ach.lower <= step.ach.mean && step.ach.mean <= step.ach.upper);
    assert!((1.0..=10.0).contains(&step.ach.mean));

    let forecast = Forecaster::new(&TunnelModel::new(), &config)
        .run(&weather, None, &summary, &Scenario::default(), 12)
        .unwrap();
    assert_eq!(forecast.len(), 24 + 12);
    for run in ForecastRun::ALL {
        assert!(forecast.temperature(run).iter().all(|t| (-10.0..60.0).contains(t)));
        assert!(forecast.relative_humidity(run).iter().all(|rh| rh.is_finite() && *rh > 0.0));
    }
}
