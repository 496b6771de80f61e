//! Gaussian process surrogate of the simulator/observation relationship
//!
//! - [`kernel`]: scaled RBF kernel whose length-scale comes from the scored particle
//! - [`training`]: pooled simulated + observed training rows and their noise vector
//! - [`surrogate`]: Cholesky fit and log marginal likelihood

pub mod kernel;
pub mod surrogate;
pub mod training;

pub use kernel::ScaledRbf;
pub use surrogate::{FittedGp, GaussianProcessSurrogate};
pub use training::{TrainingSet, TrainingSetBuilder};
