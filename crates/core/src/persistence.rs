//! Per-step calibration outputs on disk
//!
//! [`CsvPosteriorStore`] keeps one table per calibrated component (`ACH_out.csv`,
//! `IAS_out.csv`, `length_out.csv`). Each calibration step adds one column holding the
//! whole posterior population, headed by the step number. Tables are rewritten through
//! a temporary file and renamed into place, so a crash leaves either the old or the new
//! table, never a torn one. `data_points.csv` is an append-only ledger of the ground
//! truth each step used.
//!
//! The ledger row is written after all three table columns and marks the step as
//! committed. Columns numbered past the last ledger row belong to a step that never
//! finished storing; [`CsvPosteriorStore::open`] drops them.
//!
//! At the end of a run the per-step priors and posteriors are also written as
//! `prior_<name>.csv` / `posterior_<name>.csv` matrices with one row per step, covering
//! earlier runs of a resumed store as well.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationRun, DataPoint, StepRecord};
use crate::core_types::{ParticlePopulation, ACH, IAS, LENGTH_SCALE, PARAMETER_DIM};
use crate::error::{CalibrationError, Result};

/// Table name and parameter component, in component order
pub const TABLES: [(&str, usize); PARAMETER_DIM] =
    [("ACH", ACH), ("IAS", IAS), ("length", LENGTH_SCALE)];

/// File name of the ground-truth ledger
pub const DATA_POINTS_FILE: &str = "data_points.csv";

/// Receives calibration results as they are produced
pub trait PosteriorSink {
    /// Persist one completed step
    ///
    /// # Errors
    /// `Persistence` if the step cannot be stored
    fn record_step(&mut self, record: &StepRecord) -> Result<()>;

    /// Persist whole-run outputs once every step has completed
    ///
    /// # Errors
    /// `Persistence` if the outputs cannot be stored
    fn finish(&mut self, run: &CalibrationRun) -> Result<()> {
        let _ = run;
        Ok(())
    }
}

/// Column-per-step CSV tables in a directory
#[derive(Debug, Clone)]
pub struct CsvPosteriorStore {
    dir: PathBuf,
    step_offset: usize,
}

impl CsvPosteriorStore {
    /// Start a fresh store, removing tables left by an earlier run
    ///
    /// # Errors
    /// `Persistence` if the directory cannot be created or cleared
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        for (name, _) in TABLES {
            for path in [
                table_path(&dir, name),
                dir.join(format!("prior_{name}.csv")),
                dir.join(format!("posterior_{name}.csv")),
            ] {
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
        }
        let ledger = dir.join(DATA_POINTS_FILE);
        if ledger.exists() {
            fs::remove_file(ledger)?;
        }
        Ok(Self {
            dir,
            step_offset: 0,
        })
    }

    /// Open a store to continue an earlier run; new steps are numbered after the
    /// committed steps already present
    ///
    /// Table columns of a step whose ledger row is missing are removed.
    ///
    /// # Errors
    /// `Persistence` if the directory, the ledger or an existing table cannot be read
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut store = Self {
            dir,
            step_offset: 0,
        };
        store.step_offset = store.completed_steps()?;
        store.discard_uncommitted()?;
        Ok(store)
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Step number the next recorded step 0 is stored under
    pub fn step_offset(&self) -> usize {
        self.step_offset
    }

    /// Number of steps committed to the ledger
    ///
    /// # Errors
    /// `Persistence` if the ledger exists but cannot be read
    pub fn completed_steps(&self) -> Result<usize> {
        let path = self.dir.join(DATA_POINTS_FILE);
        if !path.exists() {
            return Ok(0);
        }
        let mut reader = csv::Reader::from_path(&path)?;
        let mut last = None;
        for point in reader.deserialize::<DataPoint>() {
            last = Some(point?.step);
        }
        Ok(last.map_or(0, |step| step + 1))
    }

    /// Population of the last committed step
    ///
    /// Returns `None` when no step has been committed yet.
    ///
    /// # Errors
    /// `Persistence` if a table is unreadable, lacks the committed step's column, or
    /// the tables disagree in length
    pub fn load_last_posterior(&self) -> Result<Option<ParticlePopulation>> {
        let committed = self.completed_steps()?;
        let Some(last_step) = committed.checked_sub(1) else {
            return Ok(None);
        };
        let header = last_step.to_string();

        let mut components = Vec::with_capacity(PARAMETER_DIM);
        for (name, _) in TABLES {
            let path = table_path(&self.dir, name);
            let column = read_table(&path)?.and_then(|(headers, mut columns)| {
                let j = headers.iter().position(|h| *h == header)?;
                Some(columns.swap_remove(j))
            });
            let Some(column) = column else {
                return Err(CalibrationError::Persistence(format!(
                    "{} has no column for committed step {header}",
                    path.display()
                )));
            };
            components.push(column);
        }

        let n = components[0].len();
        if n == 0 || components.iter().any(|c| c.len() != n) {
            return Err(CalibrationError::Persistence(format!(
                "posterior tables in {} disagree in length",
                self.dir.display()
            )));
        }
        let population =
            ParticlePopulation::new(DMatrix::from_fn(n, PARAMETER_DIM, |i, j| components[j][i]));
        debug!(particles = n, dir = %self.dir.display(), "loaded last posterior");
        Ok(Some(population))
    }

    /// Add (or replace) column `header` in table `name`
    ///
    /// # Errors
    /// `Persistence` on I/O errors or when `values` does not match the table length
    pub fn write_column(&self, name: &str, header: &str, values: &[f64]) -> Result<()> {
        let path = table_path(&self.dir, name);
        let (mut headers, mut columns) = read_table(&path)?.unwrap_or_default();
        if let Some(first) = columns.first() {
            if first.len() != values.len() {
                return Err(CalibrationError::Persistence(format!(
                    "{} holds {} particles per column, step {header} has {}",
                    path.display(),
                    first.len(),
                    values.len()
                )));
            }
        }
        match headers.iter().position(|h| h == header) {
            Some(existing) => columns[existing] = values.to_vec(),
            None => {
                headers.push(header.to_owned());
                columns.push(values.to_vec());
            }
        }

        write_table(&path, &headers, &columns)
    }

    /// Drop table columns numbered at or past the committed step count
    fn discard_uncommitted(&self) -> Result<()> {
        let committed = self.step_offset;
        for (name, _) in TABLES {
            let path = table_path(&self.dir, name);
            let Some((headers, columns)) = read_table(&path)? else {
                continue;
            };
            let stored = headers.len();
            let mut kept_headers = Vec::with_capacity(stored);
            let mut kept_columns = Vec::with_capacity(stored);
            for (header, column) in headers.into_iter().zip(columns) {
                let step: usize = header.parse().map_err(|_| {
                    CalibrationError::Persistence(format!(
                        "{} has non-numeric step header {header:?}",
                        path.display()
                    ))
                })?;
                if step < committed {
                    kept_headers.push(header);
                    kept_columns.push(column);
                } else {
                    warn!(table = name, step, committed, "dropping uncommitted step column");
                }
            }
            if kept_headers.is_empty() {
                fs::remove_file(&path)?;
            } else if kept_headers.len() < stored {
                write_table(&path, &kept_headers, &kept_columns)?;
            }
        }
        Ok(())
    }

    fn append_data_point(&self, record: &StepRecord) -> Result<()> {
        let path = self.dir.join(DATA_POINTS_FILE);
        let fresh = fs::metadata(&path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);
        let mut point = record.data_point;
        point.step += self.step_offset;
        writer.serialize(point)?;
        writer.flush()?;
        Ok(())
    }

    /// Posterior matrix rebuilt from every committed column of table `name`
    fn write_posterior_matrix(&self, name: &str) -> Result<()> {
        let columns = read_table(&table_path(&self.dir, name))?
            .map(|(_, columns)| columns)
            .unwrap_or_default();
        write_rows(&self.dir.join(format!("posterior_{name}.csv")), &columns)
    }

    /// Prior matrix of earlier runs followed by the priors of this run
    ///
    /// Steps before `step_offset` whose rows were never written are NaN.
    fn write_prior_matrix(
        &self,
        name: &str,
        priors: &[&ParticlePopulation],
        component: usize,
    ) -> Result<()> {
        let path = self.dir.join(format!("prior_{name}.csv"));
        let mut rows = if self.step_offset > 0 {
            read_rows(&path)?
        } else {
            Vec::new()
        };
        rows.truncate(self.step_offset);
        if rows.len() < self.step_offset {
            warn!(
                table = name,
                missing = self.step_offset - rows.len(),
                "earlier prior rows unavailable, filling with NaN"
            );
            let width = priors.first().map_or(0, |p| p.component(component).len());
            rows.resize(self.step_offset, vec![f64::NAN; width]);
        }
        rows.extend(priors.iter().map(|p| p.component(component)));
        write_rows(&path, &rows)
    }
}

impl PosteriorSink for CsvPosteriorStore {
    fn record_step(&mut self, record: &StepRecord) -> Result<()> {
        let posterior = record.state.posterior.as_ref().ok_or_else(|| {
            CalibrationError::Persistence(format!("step {} produced no posterior", record.step))
        })?;
        let header = (self.step_offset + record.step).to_string();
        for (name, component) in TABLES {
            self.write_column(name, &header, &posterior.component(component))?;
        }
        // commits the step
        self.append_data_point(record)?;
        debug!(step = record.step, dir = %self.dir.display(), "stored posterior columns");
        Ok(())
    }

    fn finish(&mut self, run: &CalibrationRun) -> Result<()> {
        let priors: Vec<&ParticlePopulation> =
            run.records.iter().filter_map(|r| r.state.prior.as_ref()).collect();
        for (name, component) in TABLES {
            self.write_prior_matrix(name, &priors, component)?;
            self.write_posterior_matrix(name)?;
        }
        info!(
            steps = self.step_offset + run.records.len(),
            dir = %self.dir.display(),
            "wrote prior/posterior matrices"
        );
        Ok(())
    }
}

fn table_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}_out.csv"))
}

/// Headers and columns of a step table, `None` if it does not exist
fn read_table(path: &Path) -> Result<Option<(Vec<String>, Vec<Vec<f64>>)>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_owned).collect();
    let mut columns = vec![Vec::new(); headers.len()];
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (j, field) in record.iter().enumerate() {
            let value = field.trim().parse::<f64>().map_err(|e| {
                CalibrationError::Persistence(format!(
                    "{} row {} column {j}: {e}",
                    path.display(),
                    row + 1
                ))
            })?;
            columns[j].push(value);
        }
    }
    Ok(Some((headers, columns)))
}

fn write_table(path: &Path, headers: &[String], columns: &[Vec<f64>]) -> Result<()> {
    let rows = columns.first().map_or(0, Vec::len);
    write_atomic(path, |writer| {
        writer.write_record(headers)?;
        for i in 0..rows {
            writer.write_record(columns.iter().map(|c| c[i].to_string()))?;
        }
        Ok(())
    })
}

/// Rows of a headerless step matrix, empty if it does not exist
fn read_rows(path: &Path) -> Result<Vec<Vec<f64>>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let row = record?
            .iter()
            .map(|field| field.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CalibrationError::Persistence(format!("{}: {e}", path.display())))?;
        rows.push(row);
    }
    Ok(rows)
}

fn write_rows(path: &Path, rows: &[Vec<f64>]) -> Result<()> {
    write_atomic(path, |writer| {
        for row in rows {
            writer.write_record(row.iter().map(f64::to_string))?;
        }
        Ok(())
    })
}

/// Write through `<path>.tmp` and rename over `path`
fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut csv::Writer<fs::File>) -> csv::Result<()>,
{
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&tmp)?;
        fill(&mut writer)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WindowBounds;
    use crate::inference::CalibrationState;

    fn record(step: usize, fill: f64) -> StepRecord {
        let posterior = ParticlePopulation::new(DMatrix::from_fn(4, 3, |i, j| {
            fill + i as f64 * 0.25 + j as f64
        }));
        StepRecord {
            step,
            window: WindowBounds {
                start_hour: step,
                end_hour: step + 10,
            },
            data_point: DataPoint {
                step,
                value: 0.7,
                carried_forward: step > 0,
            },
            state: CalibrationState {
                prior: Some(posterior.clone()),
                posterior: Some(posterior),
                ..CalibrationState::initial()
            },
        }
    }

    #[test]
    fn test_columns_accumulate_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvPosteriorStore::create(dir.path()).unwrap();
        store.record_step(&record(0, 0.0)).unwrap();
        store.record_step(&record(1, 0.5)).unwrap();

        assert_eq!(store.completed_steps().unwrap(), 2);
        let last = store.load_last_posterior().unwrap().unwrap();
        assert_eq!(last.len(), 4);
        assert_eq!(last.particle(1).as_slice(), &[0.75, 1.75, 2.75]);

        let ledger = fs::read_to_string(dir.path().join(DATA_POINTS_FILE)).unwrap();
        let lines: Vec<&str> = ledger.lines().collect();
        assert_eq!(lines, vec!["step,value,carried_forward", "0,0.7,false", "1,0.7,true"]);
        assert!(!dir.path().join("ACH_out.csv.tmp").exists());
    }

    #[test]
    fn test_reopened_store_numbers_after_existing_steps() {
        let dir = tempfile::tempdir().unwrap();
        CsvPosteriorStore::create(dir.path())
            .unwrap()
            .record_step(&record(0, 0.0))
            .unwrap();

        let mut resumed = CsvPosteriorStore::open(dir.path()).unwrap();
        assert_eq!(resumed.step_offset(), 1);
        resumed.record_step(&record(0, 0.2)).unwrap();
        let table = fs::read_to_string(dir.path().join("IAS_out.csv")).unwrap();
        assert_eq!(table.lines().next(), Some("0,1"));
    }

    #[test]
    fn test_empty_store_has_no_posterior() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvPosteriorStore::create(dir.path()).unwrap();
        assert!(store.load_last_posterior().unwrap().is_none());
    }

    fn run_of(store: &mut CsvPosteriorStore, records: Vec<StepRecord>) {
        for r in &records {
            store.record_step(r).unwrap();
        }
        store
            .finish(&CalibrationRun {
                records,
                ..CalibrationRun::default()
            })
            .unwrap();
    }

    #[test]
    fn test_finish_writes_step_matrices() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvPosteriorStore::create(dir.path()).unwrap();
        run_of(&mut store, vec![record(0, 0.0), record(1, 0.5)]);
        let matrix = fs::read_to_string(dir.path().join("posterior_length.csv")).unwrap();
        assert_eq!(matrix.lines().count(), 2);
        assert_eq!(matrix.lines().next().unwrap(), "2,2.25,2.5,2.75");
    }

    #[test]
    fn test_resumed_finish_keeps_earlier_matrix_rows() {
        let dir = tempfile::tempdir().unwrap();
        run_of(
            &mut CsvPosteriorStore::create(dir.path()).unwrap(),
            vec![record(0, 0.0), record(1, 0.5)],
        );

        let mut resumed = CsvPosteriorStore::open(dir.path()).unwrap();
        run_of(&mut resumed, vec![record(0, 0.25)]);

        for file in ["prior_ACH.csv", "posterior_ACH.csv"] {
            let matrix = fs::read_to_string(dir.path().join(file)).unwrap();
            let rows: Vec<&str> = matrix.lines().collect();
            assert_eq!(rows.len(), 3, "{file}");
            assert_eq!(rows[0], "0,0.25,0.5,0.75", "{file}");
            assert_eq!(rows[2], "0.25,0.5,0.75,1", "{file}");
        }
    }

    #[test]
    fn test_missing_prior_rows_are_nan() {
        let dir = tempfile::tempdir().unwrap();
        // a run that stored its step but never reached finish
        CsvPosteriorStore::create(dir.path())
            .unwrap()
            .record_step(&record(0, 0.0))
            .unwrap();

        let mut resumed = CsvPosteriorStore::open(dir.path()).unwrap();
        run_of(&mut resumed, vec![record(0, 0.5)]);

        let prior = fs::read_to_string(dir.path().join("prior_IAS.csv")).unwrap();
        let rows: Vec<&str> = prior.lines().collect();
        assert_eq!(rows, vec!["NaN,NaN,NaN,NaN", "1.5,1.75,2,2.25"]);
        let posterior = fs::read_to_string(dir.path().join("posterior_IAS.csv")).unwrap();
        assert_eq!(posterior.lines().count(), 2);
    }

    #[test]
    fn test_partial_step_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvPosteriorStore::create(dir.path()).unwrap();
        store.record_step(&record(0, 0.0)).unwrap();
        // step 1 stopped after its ACH column, before IAS, length and the ledger
        store.write_column("ACH", "1", &[0.5; 4]).unwrap();
        assert_eq!(store.completed_steps().unwrap(), 1);
        let last = store.load_last_posterior().unwrap().unwrap();
        assert_eq!(last.particle(0).as_slice(), &[0.0, 1.0, 2.0]);

        let mut reopened = CsvPosteriorStore::open(dir.path()).unwrap();
        assert_eq!(reopened.step_offset(), 1);
        let ach = fs::read_to_string(dir.path().join("ACH_out.csv")).unwrap();
        assert_eq!(ach.lines().next(), Some("0"));
        let last = reopened.load_last_posterior().unwrap().unwrap();
        assert_eq!(last.particle(0).as_slice(), &[0.0, 1.0, 2.0]);

        reopened.record_step(&record(0, 0.25)).unwrap();
        for (name, _) in TABLES {
            let table = fs::read_to_string(table_path(dir.path(), name)).unwrap();
            assert_eq!(table.lines().next(), Some("0,1"), "{name}");
        }
        let last = reopened.load_last_posterior().unwrap().unwrap();
        assert_eq!(last.particle(0).as_slice(), &[0.25, 1.25, 2.25]);
    }

    #[test]
    fn test_committed_step_without_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CsvPosteriorStore::create(dir.path()).unwrap();
        store.record_step(&record(0, 0.0)).unwrap();
        fs::remove_file(table_path(dir.path(), "IAS")).unwrap();

        let err = store.load_last_posterior().unwrap_err();
        assert_eq!(err.kind(), "Persistence");
        assert!(err.to_string().contains("committed step 0"), "{err}");
    }

    #[test]
    fn test_mismatched_population_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvPosteriorStore::create(dir.path()).unwrap();
        store.write_column("ACH", "0", &[0.1, 0.2]).unwrap();
        let err = store.write_column("ACH", "1", &[0.1]).unwrap_err();
        assert_eq!(err.kind(), "Persistence");
    }
}
