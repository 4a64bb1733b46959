//! End-to-end sequence runs against the mock rig.
//!
//! Every test gets its own log directory and runs with zero pacing and
//! millisecond settle-polling so the whole file finishes quickly.

use async_trait::async_trait;
use laser_sequencer::config::{FaultPolicy, SequenceConfig, SubsystemFlags};
use laser_sequencer::error::{DeviceError, DeviceResult, FaultKind, SequenceError};
use laser_sequencer::hardware::calibration::AttenuatorCalibration;
use laser_sequencer::hardware::mock::MockRig;
use laser_sequencer::hardware::{PulseBurst, PulseTrigger, Subsystem};
use laser_sequencer::run_log::RunLogRow;
use laser_sequencer::sequence::{
    AbortHandle, AxisSweep, RunOutcome, SequenceController, SequenceNotice, SequenceState,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn base_config(dir: &TempDir, enabled: &[Subsystem]) -> SequenceConfig {
    let mut config = SequenceConfig::default();
    config.session.log_dir = dir.path().to_path_buf();
    config.sequence.pacing_delay = Duration::ZERO;
    config.settle.poll_interval = Duration::from_millis(1);
    config.settle.timeout = Duration::from_secs(2);
    config.pulse.delay_ms = 0.0;
    let mut flags = SubsystemFlags::default();
    for subsystem in enabled {
        flags.set(*subsystem, true);
    }
    config.sequence.subsystems = flags;
    config
}

fn notices(rx: &mut tokio::sync::broadcast::Receiver<SequenceNotice>) -> Vec<SequenceNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        out.push(notice);
    }
    out
}

// =============================================================================
// Nominal runs
// =============================================================================

#[tokio::test]
async fn power_sweep_repeats_per_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Attenuator, Subsystem::PulseTrigger]);
    config.sequence.cycles = 2;
    config.axes.power = AxisSweep::linear(0.0, 100.0, 2);
    config.axes.x = AxisSweep {
        enabled: false,
        ..AxisSweep::linear(0.0, 1.0, 2)
    };

    let rig = MockRig::new();
    let controller = SequenceController::new(config, rig.instruments());
    let mut rx = controller.subscribe();

    let summary = controller.run_sequence().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.grid_rows, 6);
    assert_eq!(summary.rows_logged, 6);

    let rows = controller.log_rows().await;
    let cycles: Vec<_> = rows.iter().map(|r| r.cycle).collect();
    assert_eq!(
        cycles,
        vec![Some(0), Some(0), Some(0), Some(1), Some(1), Some(1)]
    );

    let cal = AttenuatorCalibration::default();
    let expected: Vec<_> = [0.0, 50.0, 100.0, 0.0, 50.0, 100.0]
        .iter()
        .map(|p| Some(cal.achievable_percent(*p)))
        .collect();
    let powers: Vec<_> = rows.iter().map(|r| r.power_percent).collect();
    assert_eq!(powers, expected);

    let pulses: Vec<_> = rows.iter().map(|r| r.total_pulses).collect();
    assert_eq!(
        pulses,
        vec![Some(1), Some(2), Some(3), Some(4), Some(5), Some(6)]
    );
    assert_eq!(rig.pulse_generator.pulses_fired(), 6);
    assert!(rows.iter().all(|r| r.rotation_deg.is_none()));

    let notices = notices(&mut rx);
    assert!(matches!(notices.first(), Some(SequenceNotice::Started { rows: 6, .. })));
    assert_eq!(
        notices.last(),
        Some(&SequenceNotice::Completed { rows_logged: 6 })
    );
}

#[tokio::test]
async fn rotation_sweep_settles_on_every_target() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Rotation]);
    config.axes.rotation = AxisSweep::linear(0.0, 90.0, 3);

    let rig = MockRig::with_lag(2);
    let controller = SequenceController::new(config, rig.instruments());
    controller.run_sequence().await.unwrap();

    let angles: Vec<_> = controller
        .log_rows()
        .await
        .iter()
        .map(|r| r.rotation_deg)
        .collect();
    assert_eq!(angles, vec![Some(0.0), Some(30.0), Some(60.0), Some(90.0)]);
    assert_eq!(controller.state(), SequenceState::Idle);
}

#[tokio::test]
async fn garbled_readbacks_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Rotation]);
    config.axes.rotation = AxisSweep::linear(10.0, 20.0, 1);

    let rig = MockRig::new();
    for _ in 0..3 {
        rig.rotator
            .behavior()
            .fail_next_read(DeviceError::Parse("~?x".into()))
            .await;
    }
    let controller = SequenceController::new(config, rig.instruments());
    let summary = controller.run_sequence().await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    let rows = controller.log_rows().await;
    assert_eq!(rows[0].rotation_deg, Some(10.0));
    assert_eq!(rows[1].rotation_deg, Some(20.0));
    assert!(rows.iter().all(|r| !r.notes.contains("FAULT")));
}

#[tokio::test]
async fn log_file_matches_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Stage, Subsystem::Spectrometer]);
    config.axes.x = AxisSweep::linear(0.0, 0.2, 2);
    config.axes.y = AxisSweep::fixed(0.5);
    config.session.notes = "sample A, spot 3".into();

    let rig = MockRig::new();
    let controller = SequenceController::new(config, rig.instruments());
    let summary = controller.run_sequence().await.unwrap();

    let mut reader = csv::Reader::from_path(&summary.log_path).unwrap();
    let headers = reader.headers().unwrap().clone();
    let records: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 3);

    let x = headers.iter().position(|h| h == "x_position").unwrap();
    let notes = headers.iter().position(|h| h == "notes").unwrap();
    let spectrum = headers.iter().position(|h| h == "spectrum_file").unwrap();
    assert_eq!(&records[2][x], "0.2");
    assert_eq!(&records[0][notes], "sample A__ spot 3");
    assert!(records[0][spectrum].starts_with("raman_"));
    assert_eq!(rig.spectrometer.acquisitions(), 3);
}

// =============================================================================
// Abort
// =============================================================================

/// Pulse trigger that requests an abort while firing its third burst.
struct AbortOnBurst {
    abort: AbortHandle,
    at: u32,
    fired: AtomicU32,
}

#[async_trait]
impl PulseTrigger for AbortOnBurst {
    async fn fire_burst(&self, burst: &PulseBurst) -> DeviceResult<u32> {
        let n = self.fired.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.at {
            self.abort.request();
        }
        Ok(burst.number)
    }
}

#[tokio::test]
async fn abort_finishes_current_row_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Rotation, Subsystem::PulseTrigger]);
    config.axes.rotation = AxisSweep::linear(0.0, 9.0, 9);

    let rig = MockRig::new();
    let controller = SequenceController::new(config, rig.instruments());
    let trigger = Arc::new(AbortOnBurst {
        abort: controller.abort_handle(),
        at: 3,
        fired: AtomicU32::new(0),
    });
    controller
        .instruments_mut()
        .await
        .unwrap()
        .pulse_generator
        .attach("abort-on-burst", trigger.clone());

    let summary = controller.run_sequence().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(summary.grid_rows, 10);
    assert_eq!(summary.rows_logged, 3);
    assert_eq!(controller.log_rows().await.len(), 3);
    assert_eq!(trigger.fired.load(Ordering::SeqCst), 3);

    assert!(!controller.is_running());
    assert!(!controller.is_aborted());
    assert_eq!(controller.state(), SequenceState::Idle);
}

#[tokio::test]
async fn abort_from_another_task() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Rotation]);
    config.axes.rotation = AxisSweep::linear(0.0, 99.0, 99);
    config.sequence.pacing_delay = Duration::from_millis(20);

    let controller = Arc::new(SequenceController::new(config, MockRig::new().instruments()));
    let mut state = controller.watch_state();
    let run = controller.start_sequence().unwrap();

    state
        .wait_for(|s| *s == SequenceState::Running)
        .await
        .unwrap();
    controller.abort_sequence().unwrap();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert!(summary.rows_logged < 100);
    assert!(matches!(
        controller.abort_sequence(),
        Err(SequenceError::NotRunning)
    ));
}

// =============================================================================
// Faults
// =============================================================================

fn acquisition_config(dir: &TempDir, on_fault: FaultPolicy) -> SequenceConfig {
    let mut config = base_config(dir, &[Subsystem::Rotation, Subsystem::Spectrometer]);
    config.axes.rotation = AxisSweep::linear(0.0, 20.0, 2);
    config.sequence.on_fault = on_fault;
    config
}

#[tokio::test]
async fn fault_ends_run_under_abort_policy() {
    let dir = tempfile::tempdir().unwrap();
    let rig = MockRig::new();
    rig.spectrometer
        .behavior()
        .fail_next_command(DeviceError::Transport("camera busy".into()))
        .await;
    let controller =
        SequenceController::new(acquisition_config(&dir, FaultPolicy::Abort), rig.instruments());

    let err = controller.run_sequence().await.unwrap_err();
    match err {
        SequenceError::Device(fault) => {
            assert_eq!(fault.subsystem, Subsystem::Spectrometer);
            assert_eq!(fault.kind, FaultKind::Transport);
        }
        other => panic!("unexpected error: {other}"),
    }

    let rows = controller.log_rows().await;
    assert_eq!(rows.len(), 1, "the faulted row is still logged");
    assert_eq!(rows[0].rotation_deg, Some(0.0));
    assert!(rows[0].spectrum_file.is_none());
    assert!(rows[0].notes.contains("FAULT: spectrometer transport fault"));
    assert_eq!(controller.state(), SequenceState::Idle);
}

#[tokio::test]
async fn fault_skips_row_under_skip_policy() {
    let dir = tempfile::tempdir().unwrap();
    let rig = MockRig::new();
    rig.spectrometer
        .behavior()
        .fail_next_command(DeviceError::NoDevice("no camera".into()))
        .await;
    let controller =
        SequenceController::new(acquisition_config(&dir, FaultPolicy::SkipRow), rig.instruments());
    let mut rx = controller.subscribe();

    let summary = controller.run_sequence().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);

    let rows: Vec<RunLogRow> = controller.log_rows().await;
    assert_eq!(rows.len(), 3);
    assert!(rows[0].notes.contains("FAULT"));
    assert!(rows[1].spectrum_file.is_some());
    assert!(rows[2].spectrum_file.is_some());

    assert!(notices(&mut rx).iter().any(|n| matches!(
        n,
        SequenceNotice::RowFaulted {
            index: 0,
            skipped: true,
            ..
        }
    )));
}

#[tokio::test]
async fn disconnect_ends_run_even_when_skipping() {
    let dir = tempfile::tempdir().unwrap();
    let rig = MockRig::new();
    rig.spectrometer.behavior().disconnect();
    let controller =
        SequenceController::new(acquisition_config(&dir, FaultPolicy::SkipRow), rig.instruments());

    let err = controller.run_sequence().await.unwrap_err();
    assert!(matches!(
        err,
        SequenceError::Device(ref fault) if fault.kind == FaultKind::Disconnected
    ));
    assert_eq!(controller.log_rows().await.len(), 1);
    assert!(!controller.is_running());
}

#[tokio::test]
async fn stuck_stage_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Stage]);
    config.axes.x = AxisSweep::linear(0.0, 1.0, 1);
    config.axes.y = AxisSweep::fixed(0.0);
    config.settle.timeout = Duration::from_millis(30);

    let rig = MockRig::with_lag(u32::MAX);
    let controller = SequenceController::new(config, rig.instruments());
    let err = controller.run_sequence().await.unwrap_err();
    assert!(matches!(
        err,
        SequenceError::Device(ref fault) if fault.kind == FaultKind::Timeout
    ));
}

// =============================================================================
// Controls and snapshots
// =============================================================================

#[tokio::test]
async fn preview_is_deterministic_and_touches_no_hardware() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Stage, Subsystem::Attenuator]);
    config.axes.x = AxisSweep::linear(0.0, 1.0, 2);
    config.axes.y = AxisSweep::linear(0.0, 1.0, 1);
    config.axes.power = AxisSweep::fixed(40.0);
    config.sequence.cycles = 2;

    let rig = MockRig::new();
    let controller = SequenceController::new(config, rig.instruments());
    let first = controller.preview_grid().unwrap();
    let second = controller.preview_grid().unwrap();

    assert_eq!(first, second);
    assert!(first.trim_end().ends_with("12 rows, 2 cycle(s)"));
    assert!(rig.journal.entries().await.is_empty());
    assert!(controller.log_path().await.is_none());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_hardware() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Attenuator]);
    config.axes.rotation = AxisSweep::linear(0.0, 90.0, 3);

    let rig = MockRig::new();
    let controller = SequenceController::new(config, rig.instruments());
    let err = controller.run_sequence().await.unwrap_err();

    assert!(matches!(err, SequenceError::Configuration(_)));
    assert!(rig.journal.entries().await.is_empty());
    assert!(!controller.is_running());
}

#[tokio::test]
async fn settings_snapshot_is_written_and_reloadable() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Rotation]);
    config.axes.rotation = AxisSweep::linear(0.0, 45.0, 1);
    config.sequence.on_fault = FaultPolicy::SkipRow;

    let controller = SequenceController::new(config.clone(), MockRig::new().instruments());
    controller.run_sequence().await.unwrap();

    let snapshot = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("_experiment_settings.toml"))
        })
        .expect("settings snapshot written");
    let text = std::fs::read_to_string(snapshot).unwrap();
    let reloaded: SequenceConfig = toml::from_str(&text).unwrap();
    assert_eq!(reloaded, config);
}

#[tokio::test]
async fn second_sequence_appends_to_session_log() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir, &[Subsystem::Rotation, Subsystem::PulseTrigger]);
    config.axes.rotation = AxisSweep::linear(0.0, 10.0, 1);

    let controller = SequenceController::new(config, MockRig::new().instruments());
    let first = controller.run_sequence().await.unwrap();
    let second = controller.run_sequence().await.unwrap();

    assert_eq!(first.log_path, second.log_path);
    assert_eq!(second.rows_logged, 2);
    let rows = controller.log_rows().await;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[3].total_pulses, Some(4));
    assert_eq!(controller.total_pulses(), 4);
}

#[tokio::test]
async fn returning_to_a_log_dir_keeps_its_rows() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir_a, &[Subsystem::Rotation, Subsystem::PulseTrigger]);
    config.axes.rotation = AxisSweep::linear(0.0, 10.0, 1);

    let controller = SequenceController::new(config.clone(), MockRig::new().instruments());
    let first = controller.run_sequence().await.unwrap();

    let mut elsewhere = config.clone();
    elsewhere.session.log_dir = dir_b.path().to_path_buf();
    controller.update_config(elsewhere).unwrap();
    let second = controller.run_sequence().await.unwrap();
    assert_ne!(first.log_path, second.log_path);
    assert_eq!(controller.log_rows().await.len(), 2);

    controller.update_config(config).unwrap();
    let third = controller.run_sequence().await.unwrap();
    assert_eq!(first.log_path, third.log_path);
    assert_eq!(controller.log_rows().await.len(), 4);

    let mut reader = csv::Reader::from_path(&third.log_path).unwrap();
    assert_eq!(reader.records().count(), 4);
    let mut reader = csv::Reader::from_path(&second.log_path).unwrap();
    assert_eq!(reader.records().count(), 2);
}
