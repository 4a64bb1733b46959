//! Hardware layer: capability traits, instrument drivers and mocks.
//!
//! - `capabilities` - the traits the sequence engine drives
//! - `settle` - bounded settle-polling shared by all positioning subsystems
//! - `calibration` - attenuator percent/angle conversion
//! - `registry` - one owned slot per subsystem
//! - `mock` - simulated instruments for tests and `--mock` runs
//!
//! Serial drivers (feature `instrument_serial`):
//! `mcl3` (stage), `piline` (rotation), `avacs` (attenuator), `dg645` (pulses).

pub mod calibration;
pub mod capabilities;
pub mod mock;
pub mod registry;
pub mod settle;

#[cfg(feature = "instrument_serial")]
pub mod avacs;
#[cfg(feature = "instrument_serial")]
pub mod dg645;
#[cfg(feature = "instrument_serial")]
pub mod mcl3;
#[cfg(feature = "instrument_serial")]
pub mod piline;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use capabilities::{
    Acquirable, AcquisitionMetadata, Capability, PowerSettable, Positionable, PulseBurst,
    PulseTrigger, Rotatable, Subsystem,
};
pub use registry::{InstrumentSlot, Instruments};
pub use settle::{BackupPolicy, Precision, SettleOutcome, SettlePolicy};
