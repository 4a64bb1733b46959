//! # Laser Sequencer
//!
//! Sequence engine for multi-instrument laser processing experiments: a motorized
//! XY stage, two rotation stages, a variable attenuator, a pulse generator, a
//! spectrometer and an oscilloscope, driven through a multi-dimensional parameter
//! grid with every step recorded in a durable CSV run log.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based loading (TOML + `LASER_SEQ_` environment) and
//!   validation of the sequence configuration.
//! - **`error`**: `DeviceError`, `DeviceFault` and the top-level `SequenceError`.
//! - **`hardware`**: capability traits, settle-polling, attenuator calibration,
//!   the instrument registry, serial drivers and mock instruments.
//! - **`run_log`**: the per-row run log and its atomic CSV rewrite.
//! - **`sequence`**: axis sweeps, grid building, step execution and the
//!   `SequenceController` state machine.
//! - **`tracing_config`**: subscriber setup for structured logging.

pub mod config;
pub mod error;
pub mod hardware;
pub mod run_log;
pub mod sequence;
pub mod tracing_config;

pub use config::SequenceConfig;
pub use error::{DeviceError, DeviceFault, SequenceError, SequenceResult};
pub use sequence::{SequenceController, SequenceState};
