//! Assembly of pooled simulation + observation training data
//!
//! Each training row is `[coordinate, t_1, .., t_e, ℓ]`:
//!
//! - simulated rows pair every model coordinate with every design candidate `tModel[i]`,
//!   followed by the scored particle's length-scale `ℓ`;
//! - observed rows pair every observation coordinate with the full scored particle
//!   (`tData`, whose last component is `ℓ`).
//!
//! Simulated rows always come first. The heteroscedastic noise vector relies on that.

use nalgebra::{DMatrix, DVector};

use crate::core_types::ParameterVector;
use crate::error::{CalibrationError, Result};

/// Pooled training inputs and outputs for one scored parameter vector
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSet {
    inputs: DMatrix<f64>,
    outputs: DVector<f64>,
    simulated_rows: usize,
}

impl TrainingSet {
    /// Training inputs, one row per training point
    pub fn inputs(&self) -> &DMatrix<f64> {
        &self.inputs
    }

    /// Training outputs
    pub fn outputs(&self) -> &DVector<f64> {
        &self.outputs
    }

    /// Total number of rows
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether the set holds no rows
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Number of leading rows that came from the simulator
    pub fn simulated_rows(&self) -> usize {
        self.simulated_rows
    }

    /// Number of trailing rows that came from observations
    pub fn observed_rows(&self) -> usize {
        self.len() - self.simulated_rows
    }

    /// Per-row noise variance: `nugget` on simulated rows, `sigma_y²` on observed rows
    pub fn noise_vector(&self, nugget: f64, sigma_y: f64) -> DVector<f64> {
        let sim = self.simulated_rows;
        DVector::from_fn(self.len(), |i, _| if i < sim { nugget } else { sigma_y * sigma_y })
    }
}

/// Holds the fixed training context of one calibration window and builds a
/// [`TrainingSet`] for any candidate parameter vector
///
/// Shapes: `x_model` (d1), `x_data` (d2), `y_model` (N × d1), `y_data` (M × d2),
/// `t_model` (N × e). Scored vectors (`tData`) have `e + 1` components.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSetBuilder {
    x_model: DVector<f64>,
    x_data: DVector<f64>,
    y_model: DMatrix<f64>,
    y_data: DMatrix<f64>,
    t_model: DMatrix<f64>,
}

impl TrainingSetBuilder {
    /// Validate shapes and capture the training context
    ///
    /// # Errors
    /// Returns `Configuration` on any dimension mismatch or non-finite output, both of
    /// which are fatal for the window
    pub fn new(
        x_model: DVector<f64>,
        x_data: DVector<f64>,
        y_model: DMatrix<f64>,
        y_data: DMatrix<f64>,
        t_model: DMatrix<f64>,
    ) -> Result<Self> {
        if y_model.nrows() != t_model.nrows() {
            return Err(CalibrationError::Configuration(format!(
                "yModel has {} rows but tModel has {} candidates",
                y_model.nrows(),
                t_model.nrows()
            )));
        }
        if y_model.ncols() != x_model.len() {
            return Err(CalibrationError::Configuration(format!(
                "yModel has {} columns but xModel has {} coordinates",
                y_model.ncols(),
                x_model.len()
            )));
        }
        if y_data.ncols() != x_data.len() {
            return Err(CalibrationError::Configuration(format!(
                "yData has {} columns but xData has {} coordinates",
                y_data.ncols(),
                x_data.len()
            )));
        }
        if let Some(i) = y_model.iter().position(|v| !v.is_finite()) {
            return Err(CalibrationError::Configuration(format!(
                "non-finite simulated output in yModel (flat index {i})"
            )));
        }
        if let Some(i) = y_data.iter().position(|v| !v.is_finite()) {
            return Err(CalibrationError::Configuration(format!(
                "non-finite observation in yData (flat index {i})"
            )));
        }
        Ok(Self {
            x_model,
            x_data,
            y_model,
            y_data,
            t_model,
        })
    }

    /// Number of design candidates (`N`)
    pub fn candidates(&self) -> usize {
        self.t_model.nrows()
    }

    /// Expected length of a scored parameter vector (`e + 1`)
    pub fn parameter_dim(&self) -> usize {
        self.t_model.ncols() + 1
    }

    /// Row count every built training set will have
    pub fn rows(&self) -> usize {
        self.y_model.nrows() * self.x_model.len() + self.y_data.nrows() * self.x_data.len()
    }

    /// Build the training set for the scored vector `t_data`
    ///
    /// # Errors
    /// Returns `Configuration` if `t_data` does not have `e + 1` components
    pub fn build(&self, t_data: &ParameterVector) -> Result<TrainingSet> {
        let e = self.t_model.ncols();
        if t_data.len() != e + 1 {
            return Err(CalibrationError::Configuration(format!(
                "scored parameter vector has {} components, expected {}",
                t_data.len(),
                e + 1
            )));
        }
        let length_scale = t_data[e];
        let width = e + 2;
        let n_sim = self.y_model.nrows() * self.x_model.len();
        let rows = self.rows();

        let mut inputs = DMatrix::zeros(rows, width);
        let mut outputs = DVector::zeros(rows);

        let mut r = 0;
        for i in 0..self.y_model.nrows() {
            for (k, &x) in self.x_model.iter().enumerate() {
                inputs[(r, 0)] = x;
                for c in 0..e {
                    inputs[(r, c + 1)] = self.t_model[(i, c)];
                }
                inputs[(r, e + 1)] = length_scale;
                outputs[r] = self.y_model[(i, k)];
                r += 1;
            }
        }
        for m in 0..self.y_data.nrows() {
            for (k, &x) in self.x_data.iter().enumerate() {
                inputs[(r, 0)] = x;
                for c in 0..=e {
                    inputs[(r, c + 1)] = t_data[c];
                }
                outputs[r] = self.y_data[(m, k)];
                r += 1;
            }
        }

        Ok(TrainingSet {
            inputs,
            outputs,
            simulated_rows: n_sim,
        })
    }
}
