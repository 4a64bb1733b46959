//! Instrument slots for runtime hardware management.
//!
//! Every subsystem has exactly one owned slot holding an optional capability
//! handle. Drivers are attached when an instrument connects and dropped on
//! disconnect; the sequence controller only ever sees the trait objects.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Instruments                        │
//! │  stage │ secondary_rotator │ rotator │ attenuator │ ...  │
//! ├──────────────────────────────────────────────────────────┤
//! │                    Capability Traits                     │
//! │  Positionable | Rotatable | PowerSettable | PulseTrigger │
//! ├──────────────────────────────────────────────────────────┤
//! │                    Hardware Drivers                      │
//! │  Mcl3Driver | PilineDriver | AvacsDriver | Dg645Driver   │
//! └──────────────────────────────────────────────────────────┘
//! ```

use crate::hardware::capabilities::{
    Acquirable, PowerSettable, Positionable, PulseTrigger, Rotatable, Subsystem,
};
use std::sync::Arc;

/// Owned slot for one instrument.
pub struct InstrumentSlot<T: ?Sized> {
    label: String,
    handle: Option<Arc<T>>,
}

impl<T: ?Sized> InstrumentSlot<T> {
    /// Empty slot.
    pub fn empty() -> Self {
        Self {
            label: String::new(),
            handle: None,
        }
    }

    /// Attach a connected instrument, replacing any previous one.
    pub fn attach(&mut self, label: impl Into<String>, handle: Arc<T>) {
        self.label = label.into();
        self.handle = Some(handle);
    }

    /// Drop the instrument handle.
    pub fn detach(&mut self) -> bool {
        self.label.clear();
        self.handle.take().is_some()
    }

    /// Shared handle, if connected.
    pub fn get(&self) -> Option<Arc<T>> {
        self.handle.clone()
    }

    /// Whether an instrument is attached.
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Label given at attach time, e.g. the port path.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T: ?Sized> Default for InstrumentSlot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// All instrument slots, one per subsystem.
#[derive(Default)]
pub struct Instruments {
    /// 2-D stage
    pub stage: InstrumentSlot<dyn Positionable>,
    /// Secondary rotation stage
    pub secondary_rotator: InstrumentSlot<dyn Rotatable>,
    /// Primary rotation (polarizer)
    pub rotator: InstrumentSlot<dyn Rotatable>,
    /// Beam attenuator
    pub attenuator: InstrumentSlot<dyn PowerSettable>,
    /// Pulse generator
    pub pulse_generator: InstrumentSlot<dyn PulseTrigger>,
    /// Raman spectrometer
    pub spectrometer: InstrumentSlot<dyn Acquirable>,
    /// Oscilloscope
    pub oscilloscope: InstrumentSlot<dyn Acquirable>,
}

impl Instruments {
    /// No instruments connected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the instrument serving `subsystem` is connected.
    pub fn is_connected(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::Stage => self.stage.is_connected(),
            Subsystem::SecondaryRotation => self.secondary_rotator.is_connected(),
            Subsystem::Rotation => self.rotator.is_connected(),
            Subsystem::Attenuator => self.attenuator.is_connected(),
            Subsystem::PulseTrigger => self.pulse_generator.is_connected(),
            Subsystem::Spectrometer => self.spectrometer.is_connected(),
            Subsystem::Oscilloscope => self.oscilloscope.is_connected(),
        }
    }

    /// Drop the instrument serving `subsystem`. Returns whether one was attached.
    pub fn disconnect(&mut self, subsystem: Subsystem) -> bool {
        let dropped = match subsystem {
            Subsystem::Stage => self.stage.detach(),
            Subsystem::SecondaryRotation => self.secondary_rotator.detach(),
            Subsystem::Rotation => self.rotator.detach(),
            Subsystem::Attenuator => self.attenuator.detach(),
            Subsystem::PulseTrigger => self.pulse_generator.detach(),
            Subsystem::Spectrometer => self.spectrometer.detach(),
            Subsystem::Oscilloscope => self.oscilloscope.detach(),
        };
        if dropped {
            tracing::info!(%subsystem, "instrument disconnected");
        }
        dropped
    }

    /// Subsystems with an attached instrument, in execution order.
    pub fn connected(&self) -> Vec<Subsystem> {
        Subsystem::ORDER
            .into_iter()
            .filter(|s| self.is_connected(*s))
            .collect()
    }
}

#[cfg(feature = "instrument_serial")]
mod serial_connect {
    use super::Instruments;
    use crate::config::InstrumentsConfig;
    use crate::error::{DeviceError, SequenceError};
    use crate::hardware::avacs::AvacsDriver;
    use crate::hardware::capabilities::Subsystem;
    use crate::hardware::dg645::Dg645Driver;
    use crate::hardware::mcl3::Mcl3Driver;
    use crate::hardware::piline::PilineDriver;
    use std::sync::Arc;

    fn connection_error(subsystem: Subsystem, port: &str, err: DeviceError) -> SequenceError {
        tracing::warn!(%subsystem, port, error = %err, "instrument unavailable");
        SequenceError::Connection {
            subsystem,
            message: err.to_string(),
        }
    }

    impl Instruments {
        /// Open every serial instrument that has a port configured.
        ///
        /// Instruments open independently: one that fails is left disconnected
        /// and its [`SequenceError::Connection`] is returned next to the rest.
        /// A sequence that needs it is rejected when it starts.
        ///
        /// The spectrometer and oscilloscope are driven by vendor software and
        /// have to be attached by the embedding application.
        pub async fn connect_from_config(
            config: &InstrumentsConfig,
        ) -> (Self, Vec<SequenceError>) {
            let mut instruments = Instruments::new();
            let mut failures = Vec::new();

            if let Some(port) = &config.stage {
                match Mcl3Driver::open(port).await {
                    Ok(driver) => instruments.stage.attach(port.clone(), Arc::new(driver)),
                    Err(e) => failures.push(connection_error(Subsystem::Stage, port, e)),
                }
            }
            if let Some(port) = &config.secondary_rotator {
                match PilineDriver::open(port).await {
                    Ok(driver) => instruments
                        .secondary_rotator
                        .attach(port.clone(), Arc::new(driver)),
                    Err(e) => failures.push(connection_error(Subsystem::SecondaryRotation, port, e)),
                }
            }
            if let Some(port) = &config.rotator {
                match PilineDriver::open(port).await {
                    Ok(driver) => instruments.rotator.attach(port.clone(), Arc::new(driver)),
                    Err(e) => failures.push(connection_error(Subsystem::Rotation, port, e)),
                }
            }
            if let Some(port) = &config.attenuator {
                match AvacsDriver::open(port, config.attenuator_calibration).await {
                    Ok(driver) => instruments.attenuator.attach(port.clone(), Arc::new(driver)),
                    Err(e) => failures.push(connection_error(Subsystem::Attenuator, port, e)),
                }
            }
            if let Some(port) = &config.pulse_generator {
                match Dg645Driver::open(port).await {
                    Ok(driver) => instruments
                        .pulse_generator
                        .attach(port.clone(), Arc::new(driver)),
                    Err(e) => failures.push(connection_error(Subsystem::PulseTrigger, port, e)),
                }
            }

            tracing::info!(
                connected = ?instruments.connected(),
                failed = failures.len(),
                "instruments connected"
            );
            (instruments, failures)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::hardware::mock::{MockJournal, MockStage2D};

        #[tokio::test]
        async fn failed_ports_leave_only_their_subsystem_disconnected() {
            let missing = Some("/dev/laser-sequencer-missing".to_string());
            let config = InstrumentsConfig {
                stage: missing.clone(),
                secondary_rotator: missing.clone(),
                rotator: missing.clone(),
                attenuator: missing.clone(),
                pulse_generator: missing,
                ..InstrumentsConfig::default()
            };

            let (mut instruments, failures) = Instruments::connect_from_config(&config).await;
            assert!(instruments.connected().is_empty());
            let failed: Vec<_> = failures
                .iter()
                .map(|e| match e {
                    SequenceError::Connection { subsystem, .. } => *subsystem,
                    other => panic!("unexpected error {other}"),
                })
                .collect();
            assert_eq!(
                failed,
                vec![
                    Subsystem::Stage,
                    Subsystem::SecondaryRotation,
                    Subsystem::Rotation,
                    Subsystem::Attenuator,
                    Subsystem::PulseTrigger,
                ]
            );

            // The partial set is still usable for whatever did connect.
            instruments
                .stage
                .attach("mock", Arc::new(MockStage2D::new(MockJournal::new())));
            assert_eq!(instruments.connected(), vec![Subsystem::Stage]);
        }

        #[tokio::test]
        async fn nothing_configured_opens_nothing() {
            let (instruments, failures) =
                Instruments::connect_from_config(&InstrumentsConfig::default()).await;
            assert!(instruments.connected().is_empty());
            assert!(failures.is_empty());
        }
    }
}
