#![deny(unused_imports)]

//! Foehn classification with two-component mixture models.
//!
//! A predictor (usually wind speed) is modelled as a mixture of a background and a
//! foehn component. Concomitant variables may drive the mixing probability through
//! a logistic model. Fitting is EM with an IWLS solver for the concomitant model.

pub mod control;
pub mod convergence;
pub mod data;
pub mod diagnostics;
pub mod em;
pub mod estimate;
pub mod family;
pub mod iwls;
pub mod model;
pub mod prepare;

pub use control::{Control, ControlBuilder, ControlError};
pub use data::{DataError, RowFilter, TimeSeries};
pub use diagnostics::{Diagnostic, Diagnostics, Severity, Verbosity};
pub use estimate::{FitError, fit};
pub use family::{Family, FamilyKind};
pub use model::{FittedModel, ModelArtifact, ModelError, OptimizerRecord, ProbTable, Theta};
pub use prepare::{FitSpec, WorkingData};
