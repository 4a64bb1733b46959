//! Mock Hardware Implementations
//!
//! Simulated instruments for running sequences without a lab. All mock devices
//! use async-safe operations (`tokio::time::sleep`, never `std::thread::sleep`).
//!
//! # Available Mocks
//!
//! - `MockStage2D` - 2-D stage
//! - `MockRotator` - rotation mount (primary or secondary)
//! - `MockAttenuator` - calibrated attenuator with 0.1° steps
//! - `MockPulseGenerator` - counts pulses
//! - `MockAcquirer` - spectrometer / oscilloscope producing numbered artifacts
//! - `MockRig` - one of each, ready to hand to the controller
//!
//! # Scripting behaviour
//!
//! Every mock shares a [`MockBehavior`] that can
//! - queue errors for the next readbacks or commands (`fail_next_read`,
//!   `fail_next_command`)
//! - lag behind a new setpoint for a number of polls (`with_lag`)
//! - drop the connection (`disconnect`)
//!
//! and records each call into a shared [`MockJournal`], so tests can assert on
//! the order in which a step drove the subsystems.

use crate::error::{DeviceError, DeviceResult};
use crate::hardware::calibration::AttenuatorCalibration;
use crate::hardware::capabilities::{
    Acquirable, AcquisitionMetadata, PowerSettable, Positionable, PulseBurst, PulseTrigger,
    Rotatable, Subsystem,
};
use crate::hardware::registry::Instruments;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

// =============================================================================
// MockJournal - shared call log
// =============================================================================

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Subsystem the call was made on.
    pub subsystem: Subsystem,
    /// Operation name, e.g. `move_to` or `read_angle`.
    pub operation: &'static str,
}

/// Shared, cloneable call log.
#[derive(Debug, Clone, Default)]
pub struct MockJournal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MockJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, subsystem: Subsystem, operation: &'static str) {
        self.entries.lock().await.push(JournalEntry {
            subsystem,
            operation,
        });
    }

    /// Snapshot of every call so far.
    pub async fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().await.clone()
    }

    /// Subsystems in call order with consecutive duplicates collapsed.
    pub async fn subsystem_order(&self) -> Vec<Subsystem> {
        let mut order: Vec<Subsystem> = Vec::new();
        for entry in self.entries.lock().await.iter() {
            if order.last() != Some(&entry.subsystem) {
                order.push(entry.subsystem);
            }
        }
        order
    }

    /// Forget recorded calls.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

// =============================================================================
// MockBehavior - fault script, lag, disconnect
// =============================================================================

/// Scriptable behaviour shared by all mocks.
#[derive(Debug)]
pub struct MockBehavior {
    subsystem: Subsystem,
    journal: MockJournal,
    read_faults: Mutex<VecDeque<DeviceError>>,
    command_faults: Mutex<VecDeque<DeviceError>>,
    lag_polls: u32,
    remaining_lag: AtomicU32,
    disconnected: AtomicBool,
    latency: Duration,
}

impl MockBehavior {
    fn new(subsystem: Subsystem, journal: MockJournal) -> Self {
        Self {
            subsystem,
            journal,
            read_faults: Mutex::new(VecDeque::new()),
            command_faults: Mutex::new(VecDeque::new()),
            lag_polls: 0,
            remaining_lag: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
            latency: Duration::ZERO,
        }
    }

    /// Queue an error for an upcoming readback.
    pub async fn fail_next_read(&self, err: DeviceError) {
        self.read_faults.lock().await.push_back(err);
    }

    /// Queue an error for an upcoming command.
    pub async fn fail_next_command(&self, err: DeviceError) {
        self.command_faults.lock().await.push_back(err);
    }

    /// Simulate a lost connection; every later call fails.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    async fn command(&self, operation: &'static str) -> DeviceResult<()> {
        self.journal.record(self.subsystem, operation).await;
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(DeviceError::Disconnected);
        }
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if let Some(err) = self.command_faults.lock().await.pop_front() {
            return Err(err);
        }
        self.remaining_lag.store(self.lag_polls, Ordering::SeqCst);
        Ok(())
    }

    /// Returns `Ok(true)` while the device is still on its way.
    async fn read(&self, operation: &'static str) -> DeviceResult<bool> {
        self.journal.record(self.subsystem, operation).await;
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(DeviceError::Disconnected);
        }
        if let Some(err) = self.read_faults.lock().await.pop_front() {
            return Err(err);
        }
        let lagging = self
            .remaining_lag
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(lagging)
    }
}

macro_rules! behavior_builders {
    ($ty:ty) => {
        impl $ty {
            /// Report the old value for `polls` readbacks after each command.
            pub fn with_lag(mut self, polls: u32) -> Self {
                self.behavior.lag_polls = polls;
                self
            }

            /// Add a fixed delay to every command.
            pub fn with_latency(mut self, latency: Duration) -> Self {
                self.behavior.latency = latency;
                self
            }

            /// Fault script and connection state.
            pub fn behavior(&self) -> &MockBehavior {
                &self.behavior
            }
        }
    };
}

// =============================================================================
// MockStage2D
// =============================================================================

/// Simulated 2-D translation stage.
#[derive(Debug)]
pub struct MockStage2D {
    behavior: MockBehavior,
    current: RwLock<(f64, f64)>,
    target: RwLock<(f64, f64)>,
}

impl MockStage2D {
    /// Stage at the origin.
    pub fn new(journal: MockJournal) -> Self {
        Self::with_position(journal, 0.0, 0.0)
    }

    /// Stage at `(x, y)`.
    pub fn with_position(journal: MockJournal, x: f64, y: f64) -> Self {
        Self {
            behavior: MockBehavior::new(Subsystem::Stage, journal),
            current: RwLock::new((x, y)),
            target: RwLock::new((x, y)),
        }
    }
}

behavior_builders!(MockStage2D);

#[async_trait]
impl Positionable for MockStage2D {
    async fn move_to(&self, x: f64, y: f64) -> DeviceResult<()> {
        self.behavior.command("move_to").await?;
        *self.target.write().await = (x, y);
        Ok(())
    }

    async fn read_position(&self) -> DeviceResult<(f64, f64)> {
        if !self.behavior.read("read_position").await? {
            let target = *self.target.read().await;
            *self.current.write().await = target;
        }
        Ok(*self.current.read().await)
    }
}

// =============================================================================
// MockRotator
// =============================================================================

/// Simulated rotation mount.
#[derive(Debug)]
pub struct MockRotator {
    behavior: MockBehavior,
    current: RwLock<f64>,
    target: RwLock<f64>,
}

impl MockRotator {
    /// Rotator at 0°, serving `subsystem` (primary or secondary rotation).
    pub fn new(subsystem: Subsystem, journal: MockJournal) -> Self {
        Self {
            behavior: MockBehavior::new(subsystem, journal),
            current: RwLock::new(0.0),
            target: RwLock::new(0.0),
        }
    }
}

behavior_builders!(MockRotator);

#[async_trait]
impl Rotatable for MockRotator {
    async fn rotate_to(&self, degrees: f64) -> DeviceResult<()> {
        self.behavior.command("rotate_to").await?;
        *self.target.write().await = degrees;
        Ok(())
    }

    async fn read_angle(&self) -> DeviceResult<f64> {
        if !self.behavior.read("read_angle").await? {
            let target = *self.target.read().await;
            *self.current.write().await = target;
        }
        Ok(*self.current.read().await)
    }
}

// =============================================================================
// MockAttenuator
// =============================================================================

/// Simulated attenuator that moves in whole calibration steps.
#[derive(Debug)]
pub struct MockAttenuator {
    behavior: MockBehavior,
    calibration: AttenuatorCalibration,
    angle: RwLock<f64>,
    target_angle: RwLock<f64>,
}

impl MockAttenuator {
    /// Attenuator at full transmission.
    pub fn new(journal: MockJournal) -> Self {
        Self::with_calibration(journal, AttenuatorCalibration::default())
    }

    /// Attenuator with a custom calibration.
    pub fn with_calibration(journal: MockJournal, calibration: AttenuatorCalibration) -> Self {
        Self {
            behavior: MockBehavior::new(Subsystem::Attenuator, journal),
            calibration,
            angle: RwLock::new(calibration.min_angle),
            target_angle: RwLock::new(calibration.min_angle),
        }
    }

    /// Current angle in degrees.
    pub async fn angle(&self) -> f64 {
        *self.angle.read().await
    }
}

behavior_builders!(MockAttenuator);

#[async_trait]
impl PowerSettable for MockAttenuator {
    async fn set_power(&self, percent: f64) -> DeviceResult<()> {
        self.behavior.command("set_power").await?;
        *self.target_angle.write().await = self.calibration.angle_for(percent);
        Ok(())
    }

    async fn read_power(&self) -> DeviceResult<f64> {
        if !self.behavior.read("read_power").await? {
            let target = *self.target_angle.read().await;
            *self.angle.write().await = target;
        }
        Ok(self.calibration.percent_at(*self.angle.read().await))
    }

    fn quantize(&self, percent: f64) -> f64 {
        self.calibration.achievable_percent(percent)
    }
}

// =============================================================================
// MockPulseGenerator
// =============================================================================

/// Simulated pulse generator.
#[derive(Debug)]
pub struct MockPulseGenerator {
    behavior: MockBehavior,
    pulses_fired: AtomicU64,
    bursts: AtomicU32,
}

impl MockPulseGenerator {
    /// New generator with nothing fired.
    pub fn new(journal: MockJournal) -> Self {
        Self {
            behavior: MockBehavior::new(Subsystem::PulseTrigger, journal),
            pulses_fired: AtomicU64::new(0),
            bursts: AtomicU32::new(0),
        }
    }

    /// Total pulses emitted.
    pub fn pulses_fired(&self) -> u64 {
        self.pulses_fired.load(Ordering::SeqCst)
    }

    /// Number of bursts fired.
    pub fn bursts(&self) -> u32 {
        self.bursts.load(Ordering::SeqCst)
    }
}

behavior_builders!(MockPulseGenerator);

#[async_trait]
impl PulseTrigger for MockPulseGenerator {
    async fn fire_burst(&self, burst: &PulseBurst) -> DeviceResult<u32> {
        self.behavior.command("fire_burst").await?;
        self.pulses_fired
            .fetch_add(u64::from(burst.number), Ordering::SeqCst);
        self.bursts.fetch_add(1, Ordering::SeqCst);
        Ok(burst.number)
    }
}

// =============================================================================
// MockAcquirer
// =============================================================================

/// Simulated acquisition device; artifacts are `<prefix>_<base>_<n>`.
#[derive(Debug)]
pub struct MockAcquirer {
    behavior: MockBehavior,
    prefix: String,
    count: AtomicU64,
}

impl MockAcquirer {
    /// Spectrometer mock.
    pub fn spectrometer(journal: MockJournal) -> Self {
        Self::new(Subsystem::Spectrometer, "raman", journal)
    }

    /// Oscilloscope mock.
    pub fn oscilloscope(journal: MockJournal) -> Self {
        Self::new(Subsystem::Oscilloscope, "scope", journal)
    }

    fn new(subsystem: Subsystem, prefix: &str, journal: MockJournal) -> Self {
        Self {
            behavior: MockBehavior::new(subsystem, journal),
            prefix: prefix.to_string(),
            count: AtomicU64::new(0),
        }
    }

    /// Number of successful acquisitions.
    pub fn acquisitions(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

behavior_builders!(MockAcquirer);

#[async_trait]
impl Acquirable for MockAcquirer {
    async fn acquire(&self, metadata: &AcquisitionMetadata) -> DeviceResult<String> {
        self.behavior.command("acquire").await?;
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}_{}_{:04}", self.prefix, metadata.base_name, n))
    }
}

// =============================================================================
// MockRig - one of everything
// =============================================================================

/// A full set of mock instruments sharing one journal.
///
/// Keeps concrete handles so tests can script faults after the rig has been
/// handed to the controller as [`Instruments`].
#[derive(Clone)]
pub struct MockRig {
    /// Shared call journal
    pub journal: MockJournal,
    /// Stage
    pub stage: Arc<MockStage2D>,
    /// Secondary rotation stage
    pub secondary_rotator: Arc<MockRotator>,
    /// Primary rotation
    pub rotator: Arc<MockRotator>,
    /// Attenuator
    pub attenuator: Arc<MockAttenuator>,
    /// Pulse generator
    pub pulse_generator: Arc<MockPulseGenerator>,
    /// Spectrometer
    pub spectrometer: Arc<MockAcquirer>,
    /// Oscilloscope
    pub oscilloscope: Arc<MockAcquirer>,
}

impl MockRig {
    /// Instant-settling mocks.
    pub fn new() -> Self {
        Self::with_lag(0)
    }

    /// Positioning mocks that report the old value for `polls` readbacks.
    pub fn with_lag(polls: u32) -> Self {
        let journal = MockJournal::new();
        Self {
            stage: Arc::new(MockStage2D::new(journal.clone()).with_lag(polls)),
            secondary_rotator: Arc::new(
                MockRotator::new(Subsystem::SecondaryRotation, journal.clone()).with_lag(polls),
            ),
            rotator: Arc::new(MockRotator::new(Subsystem::Rotation, journal.clone()).with_lag(polls)),
            attenuator: Arc::new(MockAttenuator::new(journal.clone()).with_lag(polls)),
            pulse_generator: Arc::new(MockPulseGenerator::new(journal.clone())),
            spectrometer: Arc::new(MockAcquirer::spectrometer(journal.clone())),
            oscilloscope: Arc::new(MockAcquirer::oscilloscope(journal.clone())),
            journal,
        }
    }

    /// Slots with every mock attached.
    pub fn instruments(&self) -> Instruments {
        let mut instruments = Instruments::new();
        instruments.stage.attach("mock", self.stage.clone());
        instruments
            .secondary_rotator
            .attach("mock", self.secondary_rotator.clone());
        instruments.rotator.attach("mock", self.rotator.clone());
        instruments.attenuator.attach("mock", self.attenuator.clone());
        instruments
            .pulse_generator
            .attach("mock", self.pulse_generator.clone());
        instruments
            .spectrometer
            .attach("mock", self.spectrometer.clone());
        instruments
            .oscilloscope
            .attach("mock", self.oscilloscope.clone());
        instruments
    }
}

impl Default for MockRig {
    fn default() -> Self {
        Self::new()
    }
}
