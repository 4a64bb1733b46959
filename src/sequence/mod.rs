//! Sequence engine: sweeps, grid construction, step execution and the
//! controller that drives a run.

pub mod controller;
pub mod executor;
pub mod grid;
pub mod state;
pub mod sweep;

pub use controller::{RunOutcome, RunSummary, SequenceController, SequenceNotice};
pub use executor::{StepDevices, StepExecutor, StepFault, StepPrecision};
pub use grid::{Axis, AxisSweeps, GridBuilder, GridRow, SequenceGrid};
pub use state::{AbortHandle, SequenceState};
pub use sweep::AxisSweep;
