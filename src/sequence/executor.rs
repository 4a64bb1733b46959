//! Step execution: drive every enabled subsystem for one grid row.
//!
//! Subsystems run strictly in [`Subsystem::ORDER`]. Each positioning
//! subsystem gets its setpoint and is then settle-polled until the readback
//! matches at the subsystem's precision. A `None` target holds the current
//! position; the current reading is still logged. After positioning the pulse
//! burst fires, then the spectrometer and the oscilloscope acquire.

use crate::error::DeviceFault;
use crate::hardware::capabilities::{
    Acquirable, AcquisitionMetadata, PowerSettable, Positionable, PulseBurst, PulseTrigger,
    Rotatable, Subsystem,
};
use crate::hardware::registry::Instruments;
use crate::hardware::settle::{poll_until, Precision, SettleOutcome, SettlePolicy};
use crate::run_log::{RunLogRow, FILE_STAMP_FORMAT};
use crate::sequence::grid::GridRow;
use chrono::Local;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Decimal places each positioning subsystem settles to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepPrecision {
    /// Stage X/Y
    pub stage: Precision,
    /// Secondary rotation
    pub secondary_rotation: Precision,
    /// Primary rotation
    pub rotation: Precision,
    /// Attenuator power
    pub attenuator: Precision,
}

impl Default for StepPrecision {
    fn default() -> Self {
        Self {
            stage: Precision::new(2),
            secondary_rotation: Precision::new(2),
            rotation: Precision::new(2),
            attenuator: Precision::new(1),
        }
    }
}

/// Handles for the subsystems enabled in this run. Disabled ones are `None`.
#[derive(Default, Clone)]
pub struct StepDevices {
    /// Stage
    pub stage: Option<Arc<dyn Positionable>>,
    /// Secondary rotation
    pub secondary_rotator: Option<Arc<dyn Rotatable>>,
    /// Primary rotation
    pub rotator: Option<Arc<dyn Rotatable>>,
    /// Attenuator
    pub attenuator: Option<Arc<dyn PowerSettable>>,
    /// Pulse generator
    pub pulse_generator: Option<Arc<dyn PulseTrigger>>,
    /// Spectrometer
    pub spectrometer: Option<Arc<dyn Acquirable>>,
    /// Oscilloscope
    pub oscilloscope: Option<Arc<dyn Acquirable>>,
}

impl StepDevices {
    /// Take handles for every subsystem `enabled` accepts.
    ///
    /// Returns the first enabled subsystem without an instrument as `Err`.
    pub fn select(
        instruments: &Instruments,
        enabled: impl Fn(Subsystem) -> bool,
    ) -> Result<Self, Subsystem> {
        let mut devices = StepDevices::default();
        for subsystem in Subsystem::ORDER {
            if !enabled(subsystem) {
                continue;
            }
            let present = match subsystem {
                Subsystem::Stage => {
                    devices.stage = instruments.stage.get();
                    devices.stage.is_some()
                }
                Subsystem::SecondaryRotation => {
                    devices.secondary_rotator = instruments.secondary_rotator.get();
                    devices.secondary_rotator.is_some()
                }
                Subsystem::Rotation => {
                    devices.rotator = instruments.rotator.get();
                    devices.rotator.is_some()
                }
                Subsystem::Attenuator => {
                    devices.attenuator = instruments.attenuator.get();
                    devices.attenuator.is_some()
                }
                Subsystem::PulseTrigger => {
                    devices.pulse_generator = instruments.pulse_generator.get();
                    devices.pulse_generator.is_some()
                }
                Subsystem::Spectrometer => {
                    devices.spectrometer = instruments.spectrometer.get();
                    devices.spectrometer.is_some()
                }
                Subsystem::Oscilloscope => {
                    devices.oscilloscope = instruments.oscilloscope.get();
                    devices.oscilloscope.is_some()
                }
            };
            if !present {
                return Err(subsystem);
            }
        }
        Ok(devices)
    }

    /// Enabled subsystems in execution order.
    pub fn enabled(&self) -> Vec<Subsystem> {
        let flags = [
            self.stage.is_some(),
            self.secondary_rotator.is_some(),
            self.rotator.is_some(),
            self.attenuator.is_some(),
            self.pulse_generator.is_some(),
            self.spectrometer.is_some(),
            self.oscilloscope.is_some(),
        ];
        Subsystem::ORDER
            .into_iter()
            .zip(flags)
            .filter_map(|(s, on)| on.then_some(s))
            .collect()
    }
}

/// A step that failed part-way, with whatever was recorded before the fault.
#[derive(Debug, Clone, Error)]
#[error("{fault}")]
pub struct StepFault {
    /// The device fault.
    pub fault: DeviceFault,
    /// Row as far as it got; notes carry the fault text.
    pub partial: RunLogRow,
}

/// Executes grid rows against the enabled instruments.
pub struct StepExecutor {
    devices: StepDevices,
    settle: SettlePolicy,
    precision: StepPrecision,
    burst: PulseBurst,
    notes: String,
    total_pulses: Arc<AtomicU64>,
}

impl StepExecutor {
    /// New executor sharing the session pulse counter `total_pulses`.
    pub fn new(
        devices: StepDevices,
        settle: SettlePolicy,
        precision: StepPrecision,
        burst: PulseBurst,
        notes: impl Into<String>,
        total_pulses: Arc<AtomicU64>,
    ) -> Self {
        Self {
            devices,
            settle,
            precision,
            burst,
            notes: notes.into(),
            total_pulses,
        }
    }

    /// Run one row.
    pub async fn execute(&mut self, row: &GridRow) -> Result<RunLogRow, StepFault> {
        let mut log = RunLogRow {
            cycle: Some(row.cycle_index),
            row_index: Some(row.index),
            pulse_width_ms: Some(self.burst.width_ms),
            pulse_amplitude_v: Some(self.burst.amplitude_v),
            pulse_delay_ms: Some(self.burst.delay_ms),
            pulse_number: Some(self.burst.number),
            ..RunLogRow::default()
        };
        if !self.notes.is_empty() {
            log.push_note(&self.notes);
        }

        let result = self.drive(row, &mut log).await;
        log.total_pulses = Some(self.total_pulses.load(Ordering::SeqCst));
        log.timestamp = Some(Local::now());

        match result {
            Ok(()) => Ok(log),
            Err(fault) => {
                log.push_note(&format!("FAULT: {}", fault));
                Err(StepFault {
                    fault,
                    partial: log,
                })
            }
        }
    }

    async fn drive(&self, row: &GridRow, log: &mut RunLogRow) -> Result<(), DeviceFault> {
        if let Some(stage) = &self.devices.stage {
            let outcome = self.settle_stage(stage.as_ref(), row.x, row.y).await?;
            note_backup(log, Subsystem::Stage, &outcome);
            log.x_position = Some(outcome.value.0);
            log.y_position = Some(outcome.value.1);
        }

        if let Some(rotator) = &self.devices.secondary_rotator {
            let outcome = self
                .settle_rotation(
                    Subsystem::SecondaryRotation,
                    rotator.as_ref(),
                    row.secondary_rotation,
                    self.precision.secondary_rotation,
                )
                .await?;
            note_backup(log, Subsystem::SecondaryRotation, &outcome);
            log.secondary_rotation_deg = Some(outcome.value);
        }

        if let Some(rotator) = &self.devices.rotator {
            let outcome = self
                .settle_rotation(
                    Subsystem::Rotation,
                    rotator.as_ref(),
                    row.rotation,
                    self.precision.rotation,
                )
                .await?;
            note_backup(log, Subsystem::Rotation, &outcome);
            log.rotation_deg = Some(outcome.value);
        }

        if let Some(attenuator) = &self.devices.attenuator {
            let outcome = self.settle_power(attenuator.as_ref(), row.power).await?;
            note_backup(log, Subsystem::Attenuator, &outcome);
            log.power_percent = Some(outcome.value);
        }

        if let Some(pulses) = &self.devices.pulse_generator {
            let fired = pulses
                .fire_burst(&self.burst)
                .await
                .map_err(|e| DeviceFault::from_device(Subsystem::PulseTrigger, e))?;
            let total = self
                .total_pulses
                .fetch_add(u64::from(fired), Ordering::SeqCst)
                + u64::from(fired);
            tracing::debug!(fired, total, "pulse burst");
        }

        let metadata = AcquisitionMetadata {
            base_name: Local::now().format(FILE_STAMP_FORMAT).to_string(),
            cycle_index: row.cycle_index,
            row_index: row.index,
            notes: self.notes.clone(),
        };
        if let Some(spectrometer) = &self.devices.spectrometer {
            let id = spectrometer
                .acquire(&metadata)
                .await
                .map_err(|e| DeviceFault::from_device(Subsystem::Spectrometer, e))?;
            log.spectrum_file = Some(id);
        }
        if let Some(scope) = &self.devices.oscilloscope {
            let id = scope
                .acquire(&metadata)
                .await
                .map_err(|e| DeviceFault::from_device(Subsystem::Oscilloscope, e))?;
            log.scope_file = Some(id);
        }
        Ok(())
    }

    async fn settle_stage(
        &self,
        stage: &dyn Positionable,
        x: Option<f64>,
        y: Option<f64>,
    ) -> Result<SettleOutcome<(f64, f64)>, DeviceFault> {
        let read = || stage.read_position();
        let current = poll_until(Subsystem::Stage, &self.settle, read, |_| true).await?;
        if x.is_none() && y.is_none() {
            return Ok(current);
        }

        // A single unset axis holds its current coordinate.
        let (tx, ty) = (x.unwrap_or(current.value.0), y.unwrap_or(current.value.1));
        stage
            .move_from(current.value, tx, ty)
            .await
            .map_err(|e| DeviceFault::from_device(Subsystem::Stage, e))?;
        let p = self.precision.stage;
        poll_until(Subsystem::Stage, &self.settle, read, |&(rx, ry)| {
            p.matches(rx, tx) && p.matches(ry, ty)
        })
        .await
    }

    async fn settle_rotation(
        &self,
        subsystem: Subsystem,
        rotator: &dyn Rotatable,
        target: Option<f64>,
        precision: Precision,
    ) -> Result<SettleOutcome<f64>, DeviceFault> {
        let read = || rotator.read_angle();
        let Some(target) = target else {
            return poll_until(subsystem, &self.settle, read, |_| true).await;
        };
        rotator
            .rotate_to(target)
            .await
            .map_err(|e| DeviceFault::from_device(subsystem, e))?;
        poll_until(subsystem, &self.settle, read, |&v| precision.matches(v, target)).await
    }

    async fn settle_power(
        &self,
        attenuator: &dyn PowerSettable,
        target: Option<f64>,
    ) -> Result<SettleOutcome<f64>, DeviceFault> {
        let read = || attenuator.read_power();
        let Some(target) = target else {
            return poll_until(Subsystem::Attenuator, &self.settle, read, |_| true).await;
        };
        attenuator
            .set_power(target)
            .await
            .map_err(|e| DeviceFault::from_device(Subsystem::Attenuator, e))?;
        let achievable = attenuator.quantize(target);
        let p = self.precision.attenuator;
        poll_until(Subsystem::Attenuator, &self.settle, read, |&v| {
            p.matches(v, achievable)
        })
        .await
    }
}

fn note_backup<T>(log: &mut RunLogRow, subsystem: Subsystem, outcome: &SettleOutcome<T>) {
    if outcome.from_backup {
        log.push_note(&format!("{} reading is last known good value", subsystem));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceError, FaultKind};
    use crate::hardware::mock::MockRig;
    use std::time::Duration;

    fn fast_settle() -> SettlePolicy {
        SettlePolicy {
            poll_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(500),
            ..SettlePolicy::default()
        }
    }

    fn executor(rig: &MockRig, enabled: &[Subsystem]) -> StepExecutor {
        let devices =
            StepDevices::select(&rig.instruments(), |s| enabled.contains(&s)).unwrap();
        StepExecutor::new(
            devices,
            fast_settle(),
            StepPrecision::default(),
            PulseBurst {
                delay_ms: 0.0,
                number: 5,
                ..PulseBurst::default()
            },
            "run a",
            Arc::new(AtomicU64::new(100)),
        )
    }

    fn row(x: Option<f64>, y: Option<f64>, rotation: Option<f64>) -> GridRow {
        GridRow {
            index: 0,
            cycle_index: 0,
            x,
            y,
            secondary_rotation: None,
            rotation,
            power: None,
        }
    }

    #[tokio::test]
    async fn subsystems_run_in_fixed_order() {
        let rig = MockRig::with_lag(1);
        let mut exec = executor(&rig, &Subsystem::ORDER);
        let log = exec
            .execute(&GridRow {
                power: Some(50.0),
                ..row(Some(1.0), Some(2.0), Some(30.0))
            })
            .await
            .unwrap();

        assert_eq!(rig.journal.subsystem_order().await, Subsystem::ORDER.to_vec());
        assert_eq!(log.x_position, Some(1.0));
        assert_eq!(log.y_position, Some(2.0));
        assert_eq!(log.rotation_deg, Some(30.0));
        assert_eq!(log.total_pulses, Some(105));
        assert_eq!(log.spectrum_file.as_deref().map(|s| s.starts_with("raman_")), Some(true));
        assert!(log.scope_file.is_some());
        assert_eq!(log.notes, "run a");
    }

    #[tokio::test]
    async fn disabled_subsystems_are_not_touched() {
        let rig = MockRig::new();
        let mut exec = executor(&rig, &[Subsystem::Rotation]);
        let log = exec.execute(&row(Some(5.0), None, Some(10.0))).await.unwrap();
        assert_eq!(rig.journal.subsystem_order().await, vec![Subsystem::Rotation]);
        assert_eq!(log.x_position, None);
        assert_eq!(log.total_pulses, Some(100));
    }

    #[tokio::test]
    async fn unset_value_holds_and_logs_current_reading() {
        let rig = MockRig::new();
        rig.rotator.rotate_to(12.5).await.unwrap();
        rig.journal.clear().await;
        let mut exec = executor(&rig, &[Subsystem::Rotation]);

        let log = exec.execute(&row(None, None, None)).await.unwrap();
        assert_eq!(log.rotation_deg, Some(12.5));
        let ops: Vec<_> = rig
            .journal
            .entries()
            .await
            .into_iter()
            .map(|e| e.operation)
            .collect();
        assert_eq!(ops, vec!["read_angle"]);
    }

    #[tokio::test]
    async fn parse_errors_then_settled_reading() {
        let rig = MockRig::new();
        for _ in 0..3 {
            rig.rotator
                .behavior()
                .fail_next_read(DeviceError::Parse("".into()))
                .await;
        }
        let mut exec = executor(&rig, &[Subsystem::Rotation]);
        let log = exec.execute(&row(None, None, Some(45.0))).await.unwrap();
        assert_eq!(log.rotation_deg, Some(45.0));
    }

    #[tokio::test]
    async fn garbled_stage_reading_before_move_is_retried() {
        let rig = MockRig::new();
        rig.stage
            .behavior()
            .fail_next_read(DeviceError::Parse("U?".into()))
            .await;
        let mut exec = executor(&rig, &[Subsystem::Stage]);
        let log = exec.execute(&row(Some(1.0), Some(1.0), None)).await.unwrap();

        assert_eq!(log.x_position, Some(1.0));
        assert_eq!(log.y_position, Some(1.0));
        let ops: Vec<_> = rig.journal.entries().await.iter().map(|e| e.operation).collect();
        assert_eq!(&ops[..3], ["read_position", "read_position", "move_to"]);
    }

    #[tokio::test]
    async fn fault_returns_partial_row() {
        let rig = MockRig::new();
        rig.attenuator
            .behavior()
            .fail_next_command(DeviceError::Transport("write failed".into()))
            .await;
        let mut exec = executor(&rig, &[Subsystem::Rotation, Subsystem::Attenuator]);
        let fault = exec
            .execute(&GridRow {
                power: Some(20.0),
                ..row(None, None, Some(15.0))
            })
            .await
            .unwrap_err();
        assert_eq!(fault.fault.subsystem, Subsystem::Attenuator);
        assert_eq!(fault.fault.kind, FaultKind::Transport);
        assert_eq!(fault.partial.rotation_deg, Some(15.0));
        assert_eq!(fault.partial.power_percent, None);
        assert!(fault.partial.notes.contains("FAULT: attenuator transport fault"));
    }

    #[tokio::test]
    async fn missing_instrument_is_reported() {
        let rig = MockRig::new();
        let mut instruments = rig.instruments();
        instruments.disconnect(Subsystem::Oscilloscope);
        let missing = StepDevices::select(&instruments, |_| true).err();
        assert_eq!(missing, Some(Subsystem::Oscilloscope));
    }
}
