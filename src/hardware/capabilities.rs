//! Atomic Hardware Capabilities
//!
//! The sequence engine never talks to a concrete instrument. Each subsystem is
//! driven through one small capability trait, and every instrument adapter
//! implements only the capabilities it actually supports:
//!
//! - A 2-D translation stage implements `Positionable`
//! - A polarizer mount or rotation controller implements `Rotatable`
//! - A beam attenuator implements `PowerSettable`
//! - A pulse generator implements `PulseTrigger`
//! - A spectrometer or oscilloscope implements `Acquirable`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Returns `DeviceResult` so callers can tell a garbled reply from a dead link
//! - Separates "write setpoint" from "read current value"; waiting for the
//!   device to settle is the job of [`crate::hardware::settle`]
//!
//! # Example
//!
//! ```rust,ignore
//! async fn park<T: Rotatable + ?Sized>(rotator: &T) -> DeviceResult<f64> {
//!     rotator.rotate_to(0.0).await?;
//!     rotator.read_angle().await
//! }
//! ```

use crate::error::DeviceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One independently drivable part of the experiment.
///
/// The declaration order is the fixed order in which the step executor drives
/// subsystems within a grid row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// 2-D translation stage
    Stage,
    /// Secondary rotation stage
    SecondaryRotation,
    /// Primary rotation (polarizer)
    Rotation,
    /// Beam attenuator
    Attenuator,
    /// Laser pulse burst from the pulse generator
    PulseTrigger,
    /// Raman spectrum acquisition
    Spectrometer,
    /// Oscilloscope trace capture after the trigger
    Oscilloscope,
}

impl Subsystem {
    /// Execution order within a grid row.
    pub const ORDER: [Subsystem; 7] = [
        Subsystem::Stage,
        Subsystem::SecondaryRotation,
        Subsystem::Rotation,
        Subsystem::Attenuator,
        Subsystem::PulseTrigger,
        Subsystem::Spectrometer,
        Subsystem::Oscilloscope,
    ];

    /// Capability an instrument must provide to serve this subsystem.
    pub fn capability(&self) -> Capability {
        match self {
            Subsystem::Stage => Capability::Positionable,
            Subsystem::SecondaryRotation | Subsystem::Rotation => Capability::Rotatable,
            Subsystem::Attenuator => Capability::PowerSettable,
            Subsystem::PulseTrigger => Capability::PulseTrigger,
            Subsystem::Spectrometer | Subsystem::Oscilloscope => Capability::Acquirable,
        }
    }

    /// Whether the subsystem moves something and must settle.
    pub fn is_positioning(&self) -> bool {
        matches!(
            self.capability(),
            Capability::Positionable | Capability::Rotatable | Capability::PowerSettable
        )
    }
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Subsystem::Stage => "stage",
            Subsystem::SecondaryRotation => "secondary_rotation",
            Subsystem::Rotation => "rotation",
            Subsystem::Attenuator => "attenuator",
            Subsystem::PulseTrigger => "pulse_trigger",
            Subsystem::Spectrometer => "spectrometer",
            Subsystem::Oscilloscope => "oscilloscope",
        };
        write!(f, "{}", label)
    }
}

/// Capability classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Two-axis positioning
    Positionable,
    /// Single-axis angular positioning
    Rotatable,
    /// Beam power in percent
    PowerSettable,
    /// Pulse burst output
    PulseTrigger,
    /// Produces an acquisition artifact
    Acquirable,
}

/// Capability: 2-D Positioning
///
/// # Contract
/// - Coordinates are in device-native units (centimetres for the MCL-3)
/// - `move_to` initiates motion and may return before the stage arrives
/// - `read_position` reports where the stage is now
/// - `move_from` is `move_to` with the current position already known, for
///   controllers that only move relative to where they are
#[async_trait]
pub trait Positionable: Send + Sync {
    /// Command an absolute move.
    async fn move_to(&self, x: f64, y: f64) -> DeviceResult<()>;

    /// Command an absolute move from a position the caller has just read.
    async fn move_from(&self, _from: (f64, f64), x: f64, y: f64) -> DeviceResult<()> {
        self.move_to(x, y).await
    }

    /// Read the current position.
    ///
    /// Returns `DeviceError::Parse` on a malformed reply so settle-polling can
    /// retry instead of failing the whole row.
    async fn read_position(&self) -> DeviceResult<(f64, f64)>;
}

/// Capability: Rotation
#[async_trait]
pub trait Rotatable: Send + Sync {
    /// Command an absolute rotation in degrees.
    async fn rotate_to(&self, degrees: f64) -> DeviceResult<()>;

    /// Read the current angle in degrees.
    async fn read_angle(&self) -> DeviceResult<f64>;
}

/// Capability: Beam Power
///
/// Power is expressed in percent of full transmission. Instruments that move
/// in coarser native steps report the achievable value via [`quantize`].
///
/// [`quantize`]: PowerSettable::quantize
#[async_trait]
pub trait PowerSettable: Send + Sync {
    /// Command a transmission in percent.
    async fn set_power(&self, percent: f64) -> DeviceResult<()>;

    /// Read the current transmission in percent.
    async fn read_power(&self) -> DeviceResult<f64>;

    /// The value the device will actually report after being asked for
    /// `percent`. Settle-polling compares readings against this.
    fn quantize(&self, percent: f64) -> f64 {
        percent
    }
}

/// Settings for one pulse burst.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseBurst {
    /// Pulse width in milliseconds
    pub width_ms: f64,
    /// Output amplitude in volts
    pub amplitude_v: f64,
    /// Spacing between pulses in milliseconds
    pub delay_ms: f64,
    /// Pulses per burst
    pub number: u32,
}

impl Default for PulseBurst {
    fn default() -> Self {
        Self {
            width_ms: 1.0,
            amplitude_v: 2.5,
            delay_ms: 100.0,
            number: 1,
        }
    }
}

/// Capability: Pulse Trigger
#[async_trait]
pub trait PulseTrigger: Send + Sync {
    /// Fire one burst and return the number of pulses actually emitted.
    async fn fire_burst(&self, burst: &PulseBurst) -> DeviceResult<u32>;
}

/// Context passed to an acquisition so artifacts can be named and traced.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionMetadata {
    /// Base file name, usually a timestamp
    pub base_name: String,
    /// Cycle of the grid row
    pub cycle_index: u32,
    /// Grid row index
    pub row_index: usize,
    /// Operator notes
    pub notes: String,
}

/// Capability: Acquisition
#[async_trait]
pub trait Acquirable: Send + Sync {
    /// Acquire once and return the artifact identifier.
    ///
    /// # Errors
    /// `DeviceError::NoDevice` when the acquisition software has nothing to
    /// acquire with.
    async fn acquire(&self, metadata: &AcquisitionMetadata) -> DeviceResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_declaration_order() {
        let mut sorted = Subsystem::ORDER;
        sorted.sort();
        assert_eq!(sorted, Subsystem::ORDER);
        assert_eq!(Subsystem::ORDER.first(), Some(&Subsystem::Stage));
        assert_eq!(Subsystem::ORDER.last(), Some(&Subsystem::Oscilloscope));
    }

    #[test]
    fn capability_table() {
        assert_eq!(Subsystem::Rotation.capability(), Capability::Rotatable);
        assert_eq!(
            Subsystem::SecondaryRotation.capability(),
            Capability::Rotatable
        );
        assert!(Subsystem::Attenuator.is_positioning());
        assert!(!Subsystem::PulseTrigger.is_positioning());
        assert!(!Subsystem::Oscilloscope.is_positioning());
    }
}
