//! Custom error types for the sequencer.
//!
//! Using the `thiserror` crate, this module provides one place to describe every
//! failure the sequence engine can surface, from configuration mistakes to
//! hardware faults in the middle of a run.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceError`**: what an instrument driver returns from a single
//!   command or readback. Distinguishes an unparsable reply (`Parse`, usually
//!   transient) from a broken transport (`Transport`, `Disconnected`).
//! - **`DeviceFault`**: an unrecoverable device failure tagged with the
//!   subsystem it happened on. Produced by settle-polling and the step executor.
//! - **`SequenceError`**: the top-level error returned by the controller and the
//!   configuration layer.
//!
//! Parse hiccups are handled locally by the settle-poll loop; everything else
//! propagates to the sequence controller, which is the only place that decides
//! whether a run is aborted or a row is skipped.

use crate::hardware::capabilities::Subsystem;
use thiserror::Error;

/// Convenience alias for driver-level results.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Convenience alias for results using the sequencer error type.
pub type SequenceResult<T> = std::result::Result<T, SequenceError>;

/// Failure of a single instrument command or readback.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The device answered, but the reply could not be parsed.
    #[error("unparsable response: {0}")]
    Parse(String),

    /// Writing to or reading from the transport failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The connection to the device is gone.
    #[error("device disconnected")]
    Disconnected,

    /// The device software is reachable but has no usable acquisition device.
    #[error("no device available: {0}")]
    NoDevice(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => DeviceError::Disconnected,
            _ => DeviceError::Transport(err.to_string()),
        }
    }
}

/// Category of an unrecoverable device fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Settle-polling exceeded its wall-clock budget.
    Timeout,
    /// Transport-level write/read failure.
    Transport,
    /// Connection lost mid-sequence.
    Disconnected,
    /// Acquisition software has no device.
    NoDevice,
    /// Too many consecutive unparsable readbacks.
    Parse,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FaultKind::Timeout => "timeout",
            FaultKind::Transport => "transport",
            FaultKind::Disconnected => "disconnected",
            FaultKind::NoDevice => "no_device",
            FaultKind::Parse => "parse",
        };
        write!(f, "{}", label)
    }
}

/// An unrecoverable failure on one subsystem.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{subsystem} {kind} fault: {message}")]
pub struct DeviceFault {
    /// Subsystem that failed.
    pub subsystem: Subsystem,
    /// Fault category.
    pub kind: FaultKind,
    /// Human-readable detail.
    pub message: String,
}

impl DeviceFault {
    /// Create a new fault.
    pub fn new(subsystem: Subsystem, kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            subsystem,
            kind,
            message: message.into(),
        }
    }

    /// Settle-poll timeout on `subsystem`.
    pub fn timeout(subsystem: Subsystem, message: impl Into<String>) -> Self {
        Self::new(subsystem, FaultKind::Timeout, message)
    }

    /// Lift a driver error into a fault on `subsystem`.
    pub fn from_device(subsystem: Subsystem, err: DeviceError) -> Self {
        let kind = match &err {
            DeviceError::Parse(_) => FaultKind::Parse,
            DeviceError::Transport(_) => FaultKind::Transport,
            DeviceError::Disconnected => FaultKind::Disconnected,
            DeviceError::NoDevice(_) => FaultKind::NoDevice,
        };
        Self::new(subsystem, kind, err.to_string())
    }

    /// Connection loss always ends the run.
    pub fn is_connection_loss(&self) -> bool {
        self.kind == FaultKind::Disconnected
    }
}

/// Primary error type for the sequencer.
#[derive(Error, Debug)]
pub enum SequenceError {
    /// Semantic configuration problem, raised before any hardware is touched.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration file could not be parsed or merged.
    #[error("Configuration load error: {0}")]
    Config(#[from] figment::Error),

    /// A device failed to open or identify itself.
    #[error("Connection error on {subsystem}: {message}")]
    Connection {
        /// Subsystem being connected.
        subsystem: Subsystem,
        /// Reason.
        message: String,
    },

    /// Unrecoverable device fault during a run.
    #[error(transparent)]
    Device(#[from] DeviceFault),

    /// A sequence is already in progress.
    #[error("A sequence is already running")]
    AlreadyRunning,

    /// Abort requested while nothing is running.
    #[error("No sequence is running")]
    NotRunning,

    /// Configuration-mutating operations are locked while a sequence runs.
    #[error("Controls are locked while a sequence is running")]
    ControlsLocked,

    /// Run log or settings file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Run log row could not be written as CSV.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Settings snapshot could not be rendered as TOML.
    #[error("Settings serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
