//! Sequence configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `LASER_SEQ_`, nested keys separated
//!    by `__` (e.g. `LASER_SEQ_SEQUENCE__CYCLES=3`)
//!
//! Every section has defaults, so an empty file is a valid (if dull)
//! configuration. [`SequenceConfig::template`] renders the defaults as a
//! starting point.
//!
//! # Example
//! ```no_run
//! use laser_sequencer::config::SequenceConfig;
//!
//! let config = SequenceConfig::load_from("config/sequence.toml")?;
//! config.validate()?;
//! println!("{} cycle(s)", config.sequence.cycles);
//! # Ok::<(), laser_sequencer::error::SequenceError>(())
//! ```

use crate::error::{SequenceError, SequenceResult};
use crate::hardware::calibration::AttenuatorCalibration;
use crate::hardware::capabilities::{PulseBurst, Subsystem};
use crate::hardware::settle::{Precision, SettlePolicy};
use crate::run_log;
use crate::sequence::executor::StepPrecision;
use crate::sequence::grid::{Axis, AxisSweeps, GridBuilder};
use crate::tracing_config;
use chrono::{DateTime, Local};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LASER_SEQ_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Session settings
    pub session: SessionConfig,
    /// Sequence settings
    pub sequence: SequenceSettings,
    /// Per-axis sweeps
    pub axes: AxisSweeps,
    /// Settle-polling
    pub settle: SettlePolicy,
    /// Settle precision per subsystem
    pub precision: PrecisionConfig,
    /// Pulse burst settings
    pub pulse: PulseBurst,
    /// Instrument ports and calibration
    pub instruments: InstrumentsConfig,
}

/// Session-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory for run logs and settings snapshots
    pub log_dir: PathBuf,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Operator notes copied into every log row
    pub notes: String,
    /// Write a settings snapshot when a sequence starts
    pub export_settings: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_level: "info".to_string(),
            notes: String::new(),
            export_settings: true,
        }
    }
}

/// What the controller does when a step faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// End the run.
    #[default]
    Abort,
    /// Log the faulted row and continue with the next one.
    SkipRow,
}

/// Sequence execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceSettings {
    /// Repeat cycles over the whole grid
    pub cycles: u32,
    /// Pause between rows
    #[serde(with = "humantime_serde")]
    pub pacing_delay: Duration,
    /// Axes to sort rows by within a cycle
    pub sort_keys: Vec<Axis>,
    /// Fault handling
    pub on_fault: FaultPolicy,
    /// Subsystems taking part in the sequence
    pub subsystems: SubsystemFlags,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            cycles: 1,
            pacing_delay: Duration::from_secs(1),
            sort_keys: vec![Axis::X, Axis::Y],
            on_fault: FaultPolicy::Abort,
            subsystems: SubsystemFlags::default(),
        }
    }
}

/// Enable flag per subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsystemFlags {
    /// 2-D stage
    pub stage: bool,
    /// Secondary rotation
    pub secondary_rotation: bool,
    /// Primary rotation
    pub rotation: bool,
    /// Attenuator
    pub attenuator: bool,
    /// Pulse generator
    pub pulse_trigger: bool,
    /// Spectrometer
    pub spectrometer: bool,
    /// Oscilloscope
    pub oscilloscope: bool,
}

impl SubsystemFlags {
    /// Everything enabled.
    pub fn all() -> Self {
        Self {
            stage: true,
            secondary_rotation: true,
            rotation: true,
            attenuator: true,
            pulse_trigger: true,
            spectrometer: true,
            oscilloscope: true,
        }
    }

    /// Whether `subsystem` takes part.
    pub fn is_enabled(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Stage => self.stage,
            Subsystem::SecondaryRotation => self.secondary_rotation,
            Subsystem::Rotation => self.rotation,
            Subsystem::Attenuator => self.attenuator,
            Subsystem::PulseTrigger => self.pulse_trigger,
            Subsystem::Spectrometer => self.spectrometer,
            Subsystem::Oscilloscope => self.oscilloscope,
        }
    }

    /// Turn `subsystem` on or off.
    pub fn set(&mut self, subsystem: Subsystem, enabled: bool) {
        let flag = match subsystem {
            Subsystem::Stage => &mut self.stage,
            Subsystem::SecondaryRotation => &mut self.secondary_rotation,
            Subsystem::Rotation => &mut self.rotation,
            Subsystem::Attenuator => &mut self.attenuator,
            Subsystem::PulseTrigger => &mut self.pulse_trigger,
            Subsystem::Spectrometer => &mut self.spectrometer,
            Subsystem::Oscilloscope => &mut self.oscilloscope,
        };
        *flag = enabled;
    }
}

/// Decimal places used when comparing readbacks to setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    /// Stage, in cm
    pub stage: u32,
    /// Secondary rotation, in degrees
    pub secondary_rotation: u32,
    /// Rotation, in degrees
    pub rotation: u32,
    /// Attenuator, in percent
    pub attenuator: u32,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            stage: 2,
            secondary_rotation: 2,
            rotation: 2,
            attenuator: 1,
        }
    }
}

impl From<PrecisionConfig> for StepPrecision {
    fn from(p: PrecisionConfig) -> Self {
        StepPrecision {
            stage: Precision::new(p.stage),
            secondary_rotation: Precision::new(p.secondary_rotation),
            rotation: Precision::new(p.rotation),
            attenuator: Precision::new(p.attenuator),
        }
    }
}

/// Serial ports of the instruments; unset ones are not opened.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentsConfig {
    /// MCL-3 stage port
    pub stage: Option<String>,
    /// PI C-867 port for the secondary rotation
    pub secondary_rotator: Option<String>,
    /// PI C-867 port for the primary rotation
    pub rotator: Option<String>,
    /// AVACS attenuator port
    pub attenuator: Option<String>,
    /// DG645 pulse generator port
    pub pulse_generator: Option<String>,
    /// Attenuator percent/angle fit
    pub attenuator_calibration: AttenuatorCalibration,
}

impl SequenceConfig {
    /// Load configuration from `path` and `LASER_SEQ_` environment variables.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SequenceResult<Self> {
        let config = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    /// The provider stack behind [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Default configuration rendered as TOML.
    pub fn template() -> SequenceResult<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }

    /// Whether `axis` is swept.
    pub fn is_axis_enabled(&self, axis: Axis) -> bool {
        self.axes.get(axis).enabled
    }

    /// Semantic checks that loading cannot catch.
    pub fn validate(&self) -> SequenceResult<()> {
        let invalid = |msg: String| Err(SequenceError::Configuration(msg));

        tracing_config::parse_log_level(&self.session.log_level)?;

        if self.sequence.cycles == 0 {
            return invalid("sequence.cycles must be at least 1".into());
        }

        let mut seen = Vec::new();
        for key in &self.sequence.sort_keys {
            if seen.contains(key) {
                return invalid(format!("duplicate sort key '{}'", key));
            }
            seen.push(*key);
        }

        for axis in Axis::ALL {
            let sweep = self.axes.get(axis);
            if let Some(v) = sweep.static_value {
                if !v.is_finite() {
                    return invalid(format!("axes.{}.static_value must be finite", axis));
                }
            }
            if !sweep.enabled {
                continue;
            }
            if sweep.step_count < 0 {
                return invalid(format!(
                    "axes.{}.step_count must not be negative, got {}",
                    axis, sweep.step_count
                ));
            }
            if !sweep.start.is_finite() || !sweep.end.is_finite() {
                return invalid(format!("axes.{} bounds must be finite", axis));
            }
            if !self.sequence.subsystems.is_enabled(axis.subsystem()) {
                return invalid(format!(
                    "axis '{}' is swept but subsystem '{}' is disabled",
                    axis,
                    axis.subsystem()
                ));
            }
        }
        GridBuilder::row_count(&self.axes, self.sequence.cycles)?;

        if self.settle.poll_interval.is_zero() {
            return invalid("settle.poll_interval must be greater than zero".into());
        }
        if self.settle.timeout < self.settle.poll_interval {
            return invalid("settle.timeout must be at least one poll interval".into());
        }

        let pulse = &self.pulse;
        for (name, v) in [
            ("width_ms", pulse.width_ms),
            ("amplitude_v", pulse.amplitude_v),
            ("delay_ms", pulse.delay_ms),
        ] {
            if !v.is_finite() || v < 0.0 {
                return invalid(format!("pulse.{} must be a non-negative number", name));
            }
        }

        Ok(())
    }

    /// Write this configuration next to the run log as
    /// `<sequence_start>_experiment_settings.toml`.
    pub fn export_snapshot(&self, sequence_start: DateTime<Local>) -> SequenceResult<PathBuf> {
        let contents = toml::to_string_pretty(self)?;
        let path = run_log::write_sidecar(
            &self.session.log_dir,
            sequence_start,
            "experiment_settings.toml",
            &contents,
        )?;
        tracing::info!(path = %path.display(), "settings exported");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::sweep::AxisSweep;

    #[test]
    fn defaults_are_valid() {
        assert!(SequenceConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_cycles_rejected() {
        let mut config = SequenceConfig::default();
        config.sequence.cycles = 0;
        assert!(matches!(
            config.validate(),
            Err(SequenceError::Configuration(_))
        ));
    }

    #[test]
    fn invalid_log_level() {
        let mut config = SequenceConfig::default();
        config.session.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn swept_axis_needs_its_subsystem() {
        let mut config = SequenceConfig::default();
        config.axes.rotation = AxisSweep::linear(0.0, 90.0, 3);
        assert!(config.validate().is_err());

        config.sequence.subsystems.set(Subsystem::Rotation, true);
        assert!(config.validate().is_ok());
        assert!(config.is_axis_enabled(Axis::Rotation));
        assert!(!config.is_axis_enabled(Axis::Power));
    }

    #[test]
    fn negative_step_count_rejected() {
        let mut config = SequenceConfig::default();
        config.sequence.subsystems = SubsystemFlags::all();
        config.axes.power = AxisSweep::linear(0.0, 100.0, -2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_grid_rejected() {
        let mut config = SequenceConfig::default();
        config.sequence.subsystems = SubsystemFlags::all();
        config.axes.x = AxisSweep::linear(0.0, 1.0, i64::MAX);
        assert!(matches!(config.validate(), Err(SequenceError::Configuration(_))));

        config.axes.x = AxisSweep::linear(0.0, 1.0, 999);
        config.axes.y = AxisSweep::linear(0.0, 1.0, 999);
        config.sequence.cycles = 2;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("row limit"));
    }

    #[test]
    fn duplicate_sort_keys_rejected() {
        let mut config = SequenceConfig::default();
        config.sequence.sort_keys = vec![Axis::X, Axis::X];
        assert!(config.validate().is_err());
    }

    #[test]
    fn template_parses_back() {
        let text = SequenceConfig::template().unwrap();
        let parsed: SequenceConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, SequenceConfig::default());
    }

    #[test]
    fn precision_converts() {
        let p: StepPrecision = PrecisionConfig::default().into();
        assert_eq!(p.attenuator, Precision::new(1));
        assert_eq!(p, StepPrecision::default());
    }
}
