//! Rolling-window calibration
//!
//! - [`design`]: fixed `(ACH, IAS)` candidates and their normalisation
//! - [`history`]: ground truth per step with carry-forward over gaps
//! - [`controller`]: the step loop tying simulator, surrogate and particle filter together

pub mod controller;
pub mod design;
pub mod history;

pub use controller::{
    CalibrationRun, CalibrationWindow, CalibrationWindowController, StepPhase, StepRecord,
};
pub use design::{DesignMatrix, ACH_RANGE, IAS_RANGE};
pub use history::{DataPoint, DataPointHistory};
