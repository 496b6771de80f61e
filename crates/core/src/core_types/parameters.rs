//! Calibration parameter vectors and particle populations
//!
//! A parameter vector has three components in this domain: normalised ventilation rate
//! (ACH), normalised internal air speed (IAS), and the GP length-scale that travels with
//! each candidate. A population stores one vector per row.

use nalgebra::{DMatrix, DVector, RowDVector};
use serde::{Deserialize, Serialize};

use crate::error::{CalibrationError, Result};

/// A single candidate parameter vector
pub type ParameterVector = DVector<f64>;

/// Index of the normalised ventilation rate component
pub const ACH: usize = 0;
/// Index of the normalised internal air speed component
pub const IAS: usize = 1;
/// Index of the kernel length-scale component
pub const LENGTH_SCALE: usize = 2;
/// Number of components in a calibration parameter vector
pub const PARAMETER_DIM: usize = 3;

/// Components clipped to `[0, 1]` after every resample
pub const UNIT_CLIPPED: [usize; 2] = [ACH, IAS];

/// Per-component flag selecting log-space (`true`) or linear (`false`) perturbation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogConstraint(Vec<bool>);

impl LogConstraint {
    /// Build from an explicit mask
    pub fn new(mask: Vec<bool>) -> Self {
        Self(mask)
    }

    /// Build from the 0/1 integer flags used in configuration files
    pub fn from_flags(flags: &[u8]) -> Self {
        Self(flags.iter().map(|&f| f == 1).collect())
    }

    /// The production mask: ACH and IAS linear, length-scale in log space
    pub fn calibration_default() -> Self {
        Self(vec![false, false, true])
    }

    /// Whether component `j` is perturbed in log space
    #[inline]
    pub fn is_log(&self, j: usize) -> bool {
        self.0.get(j).copied().unwrap_or(false)
    }

    /// Number of components covered by the mask
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// An empty mask means "all linear"
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for LogConstraint {
    fn default() -> Self {
        Self::calibration_default()
    }
}

/// A population of candidate parameter vectors, one per row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticlePopulation {
    samples: DMatrix<f64>,
}

impl ParticlePopulation {
    /// Wrap a matrix whose rows are particles
    pub fn new(samples: DMatrix<f64>) -> Self {
        Self { samples }
    }

    /// Stack parameter vectors into a population
    ///
    /// # Errors
    /// Returns `Configuration` if the vectors differ in length or the slice is empty
    pub fn from_vectors(vectors: &[ParameterVector]) -> Result<Self> {
        let first = vectors.first().ok_or_else(|| {
            CalibrationError::Configuration("cannot build an empty particle population".into())
        })?;
        let dim = first.len();
        if let Some(bad) = vectors.iter().position(|v| v.len() != dim) {
            return Err(CalibrationError::Configuration(format!(
                "particle {bad} has {} components, expected {dim}",
                vectors[bad].len()
            )));
        }
        let rows: Vec<RowDVector<f64>> = vectors.iter().map(DVector::transpose).collect();
        Ok(Self::new(DMatrix::from_rows(&rows)))
    }

    /// Number of particles
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.nrows()
    }

    /// Whether the population holds no particles
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.nrows() == 0
    }

    /// Number of components per particle
    #[inline]
    pub fn dim(&self) -> usize {
        self.samples.ncols()
    }

    /// Copy of particle `i`
    pub fn particle(&self, i: usize) -> ParameterVector {
        self.samples.row(i).transpose()
    }

    /// All particles as owned vectors
    pub fn particles(&self) -> Vec<ParameterVector> {
        (0..self.len()).map(|i| self.particle(i)).collect()
    }

    /// Values of component `j` across the population
    pub fn component(&self, j: usize) -> Vec<f64> {
        self.samples.column(j).iter().copied().collect()
    }

    /// Borrow the underlying matrix
    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.samples
    }

    /// Consume into the underlying matrix
    pub fn into_matrix(self) -> DMatrix<f64> {
        self.samples
    }

    /// New population made of the rows at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self::new(self.samples.select_rows(indices))
    }

    /// Clamp the listed components of every particle into `[0, 1]`
    pub fn clip_unit_interval(&mut self, components: &[usize]) {
        for &j in components {
            if j >= self.dim() {
                continue;
            }
            for v in self.samples.column_mut(j).iter_mut() {
                *v = v.clamp(0.0, 1.0);
            }
        }
    }
}
