use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tunnel_calib_core::core_types::resample_hourly;
use tunnel_calib_core::inference::{IndependentPrior, Prior, ResumedPosteriorPrior};
use tunnel_calib_core::{
    load_aligned, CalibrationConfig, CalibrationWindowController, CsvDataSource,
    CsvPosteriorStore, DataSource, DesignMatrix, Forecaster, PosteriorSummary, Scenario,
    TunnelModel,
};

/// Sequential calibration and forecasting of a growing tunnel's climate
#[derive(Parser, Debug)]
#[command(name = "tunnel-calib")]
#[command(about = "Calibrate the tunnel model against sensor data and forecast from it", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the rolling-window calibration and store the posteriors
    Calibrate {
        #[command(flatten)]
        common: CommonArgs,

        /// Continue from the posteriors already stored in the output directory
        #[arg(long)]
        resume: bool,
    },
    /// Forecast temperature and humidity from the last stored posterior
    Forecast {
        #[command(flatten)]
        common: CommonArgs,

        /// Weather forecast CSV (DateTime,T_e,RH_e); the last day repeats without it
        #[arg(long, env = "CROP_FORECAST_WEATHER")]
        forecast_weather: Option<PathBuf>,

        /// Hours to forecast past the end of the history
        #[arg(long, default_value_t = 48)]
        hours: usize,

        /// Scenario ventilation rate (air changes per hour)
        #[arg(long, default_value_t = 1.0)]
        ventilation_rate: f64,

        /// Scenario dehumidifier count for the whole farm
        #[arg(long, default_value_t = 2)]
        dehumidifiers: u32,

        /// Scenario lighting schedule shift in hours
        #[arg(long, default_value_t = -3.0, allow_hyphen_values = true)]
        lighting_shift: f64,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// External weather CSV (DateTime,T_e,RH_e)
    #[arg(long, env = "CROP_WEATHER_FILE")]
    weather: PathBuf,

    /// Monitored sensor CSV (DateTime,T_i,RH_i[,sensor_id])
    #[arg(long, env = "CROP_MONITORED_FILE")]
    monitored: PathBuf,

    /// Output directory for posterior tables and forecasts
    #[arg(short, long, env = "CROP_OUTPUT_DIR", default_value = "calibration_out")]
    out: PathBuf,

    /// JSON configuration file; command-line values override it
    #[arg(short, long, env = "CROP_CONFIG")]
    config: Option<PathBuf>,

    /// Headerless ACH,IAS design CSV; a full-factorial grid is used without it
    #[arg(long, env = "CROP_DESIGN_FILE")]
    design: Option<PathBuf>,

    /// ACH levels of the generated design
    #[arg(long, default_value_t = 10)]
    ach_levels: usize,

    /// IAS levels of the generated design
    #[arg(long, default_value_t = 6)]
    ias_levels: usize,

    #[command(flatten)]
    overrides: Overrides,
}

/// Per-option overrides of the configuration file
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Measurement error standard deviation
    #[arg(long, env = "CROP_SIGMA_Y")]
    sigma_y: Option<f64>,

    /// Regularisation variance of simulated rows
    #[arg(long, env = "CROP_NUGGET")]
    nugget: Option<f64>,

    /// Days of weather requested from the feeds
    #[arg(long, env = "CROP_NUM_WEATHER_DAYS")]
    num_weather_days: Option<usize>,

    /// Days of aligned history kept
    #[arg(long, env = "CROP_DELTA_DAYS")]
    delta_days: Option<usize>,

    /// Days of weather per calibration window
    #[arg(long, env = "CROP_CALIBRATION_WINDOW_DAYS")]
    calibration_window_days: Option<usize>,

    /// Number of calibration steps
    #[arg(long, env = "CROP_NUM_DATA_POINTS")]
    num_data_points: Option<usize>,

    /// Hours between steps
    #[arg(long, env = "CROP_DELTA_H")]
    delta_h: Option<usize>,

    /// Window end hour of the first step
    #[arg(long, env = "CROP_FIRST_HOUR")]
    first_hour: Option<usize>,

    /// Standardisation mean of relative humidity
    #[arg(long, env = "CROP_YM")]
    ym: Option<f64>,

    /// Standardisation standard deviation of relative humidity
    #[arg(long, env = "CROP_YSTD")]
    ystd: Option<f64>,

    /// Sensor providing ground truth
    #[arg(long, env = "CROP_SENSOR_ID")]
    sensor_id: Option<u32>,

    /// Particle population size
    #[arg(short = 'n', long, env = "CROP_NUM_PARTICLES")]
    particles: Option<usize>,

    /// Random seed; entropy when absent
    #[arg(long, env = "CROP_SEED")]
    seed: Option<u64>,

    /// Ground truth used when the first observation is missing
    #[arg(long, env = "CROP_BOOTSTRAP_DATA_POINT")]
    bootstrap_data_point: Option<f64>,
}

impl Overrides {
    fn apply(&self, config: &mut CalibrationConfig) {
        macro_rules! set {
            ($($field:ident => $target:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { config.$target = v; })*
            };
        }
        set!(
            sigma_y => sigma_y,
            nugget => nugget,
            num_weather_days => num_weather_days,
            delta_days => delta_days,
            calibration_window_days => calibration_window_days,
            num_data_points => num_data_points,
            delta_h => delta_h,
            first_hour => first_hour,
            ym => ym,
            ystd => ystd,
            sensor_id => sensor_id,
            particles => num_particles,
        );
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.bootstrap_data_point.is_some() {
            config.bootstrap_data_point = self.bootstrap_data_point;
        }
    }
}

impl CommonArgs {
    fn config(&self) -> Result<CalibrationConfig> {
        let mut config = match &self.config {
            Some(path) => CalibrationConfig::from_json_file(path)
                .with_context(|| format!("loading configuration {}", path.display()))?,
            None => CalibrationConfig::default(),
        };
        self.overrides.apply(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn design(&self) -> Result<DesignMatrix> {
        let design = match &self.design {
            Some(path) => DesignMatrix::from_csv(path)
                .with_context(|| format!("loading design {}", path.display()))?,
            None => DesignMatrix::full_factorial(self.ach_levels, self.ias_levels)?,
        };
        info!(candidates = design.len(), "design ready");
        Ok(design)
    }

    fn source(&self) -> CsvDataSource {
        CsvDataSource::new(&self.weather, &self.monitored)
    }
}

fn rng_for(config: &CalibrationConfig) -> StdRng {
    match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

fn write_effective_config(dir: &Path, config: &CalibrationConfig) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join("config.json");
    let json = serde_json::to_string_pretty(config)?;
    fs::write(&path, json).with_context(|| format!("writing {}", path.display()))
}

fn calibrate(common: &CommonArgs, resume: bool) -> Result<()> {
    let config = common.config()?;
    let design = common.design()?;
    let (weather, monitored) =
        load_aligned(&common.source(), &config).context("loading climate history")?;

    let base = IndependentPrior::calibration_default()?;
    let (mut store, prior): (CsvPosteriorStore, Box<dyn Prior>) = if resume {
        let store = CsvPosteriorStore::open(&common.out)?;
        match store.load_last_posterior()? {
            Some(particles) => {
                info!(
                    steps = store.step_offset(),
                    particles = particles.len(),
                    "resuming from stored posterior"
                );
                let prior = ResumedPosteriorPrior::new(particles, config.jitter()?, base)?;
                (store, Box::new(prior) as Box<dyn Prior>)
            }
            None => {
                warn!(dir = %common.out.display(), "nothing to resume from, starting fresh");
                (store, Box::new(base) as Box<dyn Prior>)
            }
        }
    } else {
        (CsvPosteriorStore::create(&common.out)?, Box::new(base) as Box<dyn Prior>)
    };
    write_effective_config(&common.out, &config)?;

    let mut rng = rng_for(&config);
    let controller = CalibrationWindowController::new(config, TunnelModel::new(), design)?
        .with_prior(prior);
    let run = controller.run(&weather, &monitored, &mut store, &mut rng)?;

    let summary = PosteriorSummary::from_posteriors(controller.design(), &run.posteriors())?;
    if let Some(last) = summary.last() {
        info!(
            steps = run.records.len(),
            ach_mean = last.ach.mean,
            ias_mean = last.ias.mean,
            "calibration complete"
        );
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn forecast(
    common: &CommonArgs,
    forecast_weather: Option<&Path>,
    hours: usize,
    scenario: Scenario,
) -> Result<()> {
    let config = common.config()?;
    let design = common.design()?;
    let (weather, _) =
        load_aligned(&common.source(), &config).context("loading climate history")?;

    let store = CsvPosteriorStore::open(&common.out)?;
    let Some(posterior) = store.load_last_posterior()? else {
        bail!(
            "no stored posterior in {}; run `calibrate` first",
            common.out.display()
        );
    };
    let summary = PosteriorSummary::from_posteriors(&design, &[&posterior])?;

    let forecast_series = match forecast_weather {
        Some(path) => {
            let source = CsvDataSource::new(path, path);
            let readings = source
                .weather_window(config.num_weather_days, usize::MAX)
                .with_context(|| format!("loading forecast weather {}", path.display()))?;
            Some(resample_hourly(&readings)?)
        }
        None => None,
    };

    let model = TunnelModel::new();
    let forecast = Forecaster::new(&model, &config).run(
        &weather,
        forecast_series.as_ref(),
        &summary,
        &scenario,
        hours,
    )?;
    forecast.write_csv(&common.out)?;
    info!(
        rows = forecast.len(),
        from = %forecast.start,
        dir = %common.out.display(),
        "forecast written"
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Calibrate { common, resume } => calibrate(common, *resume),
        Command::Forecast {
            common,
            forecast_weather,
            hours,
            ventilation_rate,
            dehumidifiers,
            lighting_shift,
        } => forecast(
            common,
            forecast_weather.as_deref(),
            *hours,
            Scenario {
                ventilation_rate: *ventilation_rate,
                num_dehumidifiers: *dehumidifiers,
                lighting_shift_hours: *lighting_shift,
            },
        ),
    }
}
