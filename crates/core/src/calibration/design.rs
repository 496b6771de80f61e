//! Design candidates the simulator is run over every step
//!
//! The design is a fixed `N × 2` matrix of physical `(ACH, IAS)` pairs. Its per-column
//! range maps candidates onto `[0, 1]` for the GP and maps posterior samples back to
//! physical units for forecasting.

use std::path::Path;

use nalgebra::{DMatrix, RowDVector};

use crate::core_types::{ParticlePopulation, ACH, IAS};
use crate::error::{CalibrationError, Result};

/// Physical range of the ventilation rate (air changes per hour)
pub const ACH_RANGE: (f64, f64) = (1.0, 10.0);
/// Physical range of the internal air speed (m/s)
pub const IAS_RANGE: (f64, f64) = (0.1, 0.85);

/// Fixed `(ACH, IAS)` candidates in physical units, one per row
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrix {
    candidates: DMatrix<f64>,
    min: [f64; 2],
    max: [f64; 2],
}

impl DesignMatrix {
    /// Wrap an `N × 2` candidate matrix
    ///
    /// # Errors
    /// `Configuration` if the matrix is empty, has the wrong width, holds non-finite
    /// values or a column without spread
    pub fn new(candidates: DMatrix<f64>) -> Result<Self> {
        if candidates.nrows() == 0 || candidates.ncols() != 2 {
            return Err(CalibrationError::Configuration(format!(
                "design matrix must be N x 2 with N > 0, got {} x {}",
                candidates.nrows(),
                candidates.ncols()
            )));
        }
        if candidates.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::Configuration(
                "design matrix contains non-finite values".into(),
            ));
        }
        let mut min = [0.0; 2];
        let mut max = [0.0; 2];
        for j in 0..2 {
            let column = candidates.column(j);
            min[j] = column.min();
            max[j] = column.max();
            if max[j] <= min[j] {
                return Err(CalibrationError::Configuration(format!(
                    "design column {j} has no spread (all values {})",
                    min[j]
                )));
            }
        }
        Ok(Self {
            candidates,
            min,
            max,
        })
    }

    /// Read a headerless two-column CSV of `ACH,IAS` rows
    ///
    /// # Errors
    /// `Persistence` on I/O or CSV errors, `Configuration` on malformed rows
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_path(path.as_ref())?;
        let mut rows = Vec::new();
        for (line, record) in reader.deserialize::<(f64, f64)>().enumerate() {
            let (ach, ias) = record.map_err(|e| {
                CalibrationError::Configuration(format!(
                    "{} row {}: {e}",
                    path.as_ref().display(),
                    line + 1
                ))
            })?;
            rows.push(RowDVector::from_vec(vec![ach, ias]));
        }
        if rows.is_empty() {
            return Err(CalibrationError::Configuration(format!(
                "{} holds no design candidates",
                path.as_ref().display()
            )));
        }
        Self::new(DMatrix::from_rows(&rows))
    }

    /// Full-factorial grid over the physical ranges
    ///
    /// # Errors
    /// `Configuration` if either level count is below two
    pub fn full_factorial(ach_levels: usize, ias_levels: usize) -> Result<Self> {
        if ach_levels < 2 || ias_levels < 2 {
            return Err(CalibrationError::Configuration(format!(
                "full-factorial design needs at least 2 levels per factor, got {ach_levels} x {ias_levels}"
            )));
        }
        let level = |(lo, hi): (f64, f64), n: usize, k: usize| lo + (hi - lo) * k as f64 / (n - 1) as f64;
        let candidates = DMatrix::from_fn(ach_levels * ias_levels, 2, |i, j| {
            if j == 0 {
                level(ACH_RANGE, ach_levels, i / ias_levels)
            } else {
                level(IAS_RANGE, ias_levels, i % ias_levels)
            }
        });
        Self::new(candidates)
    }

    /// Physical candidates
    pub fn candidates(&self) -> &DMatrix<f64> {
        &self.candidates
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.candidates.nrows()
    }

    /// Whether the design is empty (never true for a constructed design)
    pub fn is_empty(&self) -> bool {
        self.candidates.nrows() == 0
    }

    /// Column ranges as `(min, max)`
    pub fn bounds(&self, column: usize) -> (f64, f64) {
        (self.min[column], self.max[column])
    }

    /// Candidates mapped onto `[0, 1]` per column
    pub fn normalized(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.len(), 2, |i, j| {
            (self.candidates[(i, j)] - self.min[j]) / (self.max[j] - self.min[j])
        })
    }

    /// Map a normalised value of `column` back to physical units
    #[inline]
    pub fn denormalize(&self, column: usize, x: f64) -> f64 {
        self.min[column] + x * (self.max[column] - self.min[column])
    }

    /// Physical `(ACH, IAS)` of every particle, one row each
    pub fn denormalize_population(&self, population: &ParticlePopulation) -> DMatrix<f64> {
        let m = population.as_matrix();
        DMatrix::from_fn(population.len(), 2, |i, j| {
            let component = if j == 0 { ACH } else { IAS };
            self.denormalize(j, m[(i, component)])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn test_full_factorial_spans_physical_ranges() {
        let design = DesignMatrix::full_factorial(4, 3).unwrap();
        assert_eq!(design.len(), 12);
        assert_eq!(design.bounds(0), ACH_RANGE);
        assert_relative_eq!(design.bounds(1).1, IAS_RANGE.1);
        let normalized = design.normalized();
        assert_eq!(normalized.min(), 0.0);
        assert_relative_eq!(normalized.max(), 1.0);
    }

    #[test]
    fn test_normalisation_round_trip_in_physical_units() {
        let design = DesignMatrix::full_factorial(3, 3).unwrap();
        // mid-range particle maps to the mid-point of each range
        let population = ParticlePopulation::new(DMatrix::from_row_slice(1, 3, &[0.5, 0.5, 0.2]));
        let physical = design.denormalize_population(&population);
        assert_relative_eq!(physical[(0, 0)], 5.5);
        assert_relative_eq!(physical[(0, 1)], 0.475);
    }

    #[test]
    fn test_reads_headerless_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.0, 0.1\n5.5,0.3\n10,0.85").unwrap();
        let design = DesignMatrix::from_csv(file.path()).unwrap();
        assert_eq!(design.len(), 3);
        assert_eq!(design.candidates()[(1, 0)], 5.5);
    }

    #[test]
    fn test_rejects_constant_column() {
        let err = DesignMatrix::new(DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 2.0, 0.3]))
            .unwrap_err();
        assert_eq!(err.kind(), "Configuration");
    }

    #[test]
    fn test_rejects_malformed_csv_row() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1.0,0.1\nabc,0.3").unwrap();
        let err = DesignMatrix::from_csv(file.path()).unwrap_err();
        assert!(err.to_string().contains("row 2"), "{err}");
    }
}
