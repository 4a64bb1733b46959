//! SequenceController - state machine for experimental sequences.
//!
//! Owns the configuration, the instrument slots, the session run log and the
//! run flags. A sequence snapshots the configuration, builds the grid, walks
//! it row by row through the [`StepExecutor`] and always finalizes.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐ start  ┌──────────────┐ grid built ┌─────────┐
//! │ Idle │───────▶│ Initializing │───────────▶│ Running │
//! └──────┘        └──────┬───────┘            └────┬────┘
//!    ▲                   │ error                   │ abort seen at row boundary
//!    │                   │                         ▼
//!    │                   │                   ┌──────────┐
//!    │                   │                   │ Aborting │
//!    │                   ▼                   └────┬─────┘
//!    │            ┌────────────┐                  │
//!    └────────────│ Finalizing │◀─────────────────┘
//!                 └────────────┘   (also on completion or fault)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = Arc::new(SequenceController::new(config, rig.instruments()));
//! let mut notices = controller.subscribe();
//! let run = controller.start_sequence()?;
//!
//! // from a Ctrl-C handler or UI button
//! controller.abort_sequence()?;
//!
//! let summary = run.await??;
//! ```

use crate::config::{FaultPolicy, SequenceConfig};
use crate::error::{SequenceError, SequenceResult};
use crate::hardware::capabilities::Subsystem;
use crate::hardware::registry::Instruments;
use crate::run_log::{RunLog, RunLogRow};
use crate::sequence::executor::{StepDevices, StepExecutor, StepFault};
use crate::sequence::grid::{Axis, GridBuilder, SequenceGrid};
use crate::sequence::state::{AbortHandle, RunFlags, SequenceState};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Human-readable progress messages for whoever is watching.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceNotice {
    /// Grid built, rows about to run.
    Started {
        /// Rows in the grid
        rows: usize,
        /// Run log file
        log_path: PathBuf,
    },
    /// A row finished and was logged.
    RowCompleted {
        /// Grid row index
        index: usize,
        /// Rows in the grid
        total: usize,
    },
    /// A row faulted and was logged with the fault in its notes.
    RowFaulted {
        /// Grid row index
        index: usize,
        /// Fault text
        fault: String,
        /// The run continues with the next row
        skipped: bool,
    },
    /// Every row ran.
    Completed {
        /// Rows written to the log
        rows_logged: usize,
    },
    /// Stopped at a row boundary on request.
    Aborted {
        /// Rows written to the log
        rows_logged: usize,
    },
    /// Ended by an error.
    Failed {
        /// Rows written to the log
        rows_logged: usize,
        /// Error text
        error: String,
    },
}

impl std::fmt::Display for SequenceNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequenceNotice::Started { rows, log_path } => {
                write!(f, "Sequence started: {} rows, logging to {}", rows, log_path.display())
            }
            SequenceNotice::RowCompleted { index, total } => {
                write!(f, "Row {}/{} complete", index + 1, total)
            }
            SequenceNotice::RowFaulted {
                index,
                fault,
                skipped,
            } => {
                let action = if *skipped { "skipping" } else { "stopping" };
                write!(f, "Row {} faulted ({}), {}", index + 1, fault, action)
            }
            SequenceNotice::Completed { rows_logged } => {
                write!(f, "Sequence complete: {} rows logged", rows_logged)
            }
            SequenceNotice::Aborted { rows_logged } => {
                write!(f, "Sequence aborted: {} rows logged", rows_logged)
            }
            SequenceNotice::Failed { rows_logged, error } => {
                write!(f, "Sequence failed after {} rows: {}", rows_logged, error)
            }
        }
    }
}

/// How a sequence that did not error ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All rows ran.
    Completed,
    /// Stopped on request.
    Aborted,
}

/// Result of one sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// How it ended
    pub outcome: RunOutcome,
    /// Rows logged by this sequence
    pub rows_logged: usize,
    /// Rows in the grid
    pub grid_rows: usize,
    /// Run log file
    pub log_path: PathBuf,
}

/// Coordinates configuration, instruments and the run log.
pub struct SequenceController {
    config: std::sync::RwLock<SequenceConfig>,
    instruments: RwLock<Instruments>,
    state_tx: watch::Sender<SequenceState>,
    notices: broadcast::Sender<SequenceNotice>,
    flags: Arc<RunFlags>,
    total_pulses: Arc<AtomicU64>,
    session_start: DateTime<Local>,
    logs: Mutex<SessionLogs>,
}

/// One run log per log directory used this session.
///
/// Every file is named after the session start, so a directory visited again
/// must get its existing log back rather than a fresh one over the same path.
#[derive(Default)]
struct SessionLogs {
    logs: Vec<RunLog>,
    active: Option<usize>,
}

impl SessionLogs {
    fn activate(&mut self, dir: &Path, session_start: DateTime<Local>) -> SequenceResult<()> {
        let existing = self.logs.iter().position(|l| l.path().parent() == Some(dir));
        let index = match existing {
            Some(index) => index,
            None => {
                self.logs.push(RunLog::new(dir, session_start)?);
                self.logs.len() - 1
            }
        };
        self.active = Some(index);
        Ok(())
    }

    fn active(&self) -> Option<&RunLog> {
        self.active.and_then(|i| self.logs.get(i))
    }

    fn active_mut(&mut self) -> Option<&mut RunLog> {
        self.active.and_then(|i| self.logs.get_mut(i))
    }
}

impl SequenceController {
    /// Controller in `Idle` with the given configuration and instruments.
    pub fn new(config: SequenceConfig, instruments: Instruments) -> Self {
        let (state_tx, _) = watch::channel(SequenceState::Idle);
        let (notices, _) = broadcast::channel(256);
        Self {
            config: std::sync::RwLock::new(config),
            instruments: RwLock::new(instruments),
            state_tx,
            notices,
            flags: Arc::new(RunFlags::new()),
            total_pulses: Arc::new(AtomicU64::new(0)),
            session_start: Local::now(),
            logs: Mutex::new(SessionLogs::default()),
        }
    }

    /// Current state.
    pub fn state(&self) -> SequenceState {
        *self.state_tx.borrow()
    }

    /// Follow state changes.
    pub fn watch_state(&self) -> watch::Receiver<SequenceState> {
        self.state_tx.subscribe()
    }

    /// Receive progress notices.
    pub fn subscribe(&self) -> broadcast::Receiver<SequenceNotice> {
        self.notices.subscribe()
    }

    /// Whether a sequence is running.
    pub fn is_running(&self) -> bool {
        self.flags.is_running()
    }

    /// Whether an abort has been requested for the current run.
    pub fn is_aborted(&self) -> bool {
        self.flags.is_aborted()
    }

    /// Handle for requesting an abort from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.flags.clone())
    }

    /// Request a cooperative abort. The current row finishes first.
    pub fn abort_sequence(&self) -> SequenceResult<()> {
        if self.abort_handle().request() {
            Ok(())
        } else {
            Err(SequenceError::NotRunning)
        }
    }

    /// Pulses fired this session.
    pub fn total_pulses(&self) -> u64 {
        self.total_pulses.load(Ordering::SeqCst)
    }

    /// Copy of the current configuration.
    pub fn config(&self) -> SequenceConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the configuration. Refused while a sequence runs.
    pub fn update_config(&self, config: SequenceConfig) -> SequenceResult<()> {
        if self.flags.is_running() {
            return Err(SequenceError::ControlsLocked);
        }
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        Ok(())
    }

    /// Whether `axis` is swept in the current configuration.
    pub fn is_axis_enabled(&self, axis: Axis) -> bool {
        self.config().is_axis_enabled(axis)
    }

    /// Mutable access to the instrument slots. Refused while a sequence runs.
    pub async fn instruments_mut(&self) -> SequenceResult<RwLockWriteGuard<'_, Instruments>> {
        if self.flags.is_running() {
            return Err(SequenceError::ControlsLocked);
        }
        Ok(self.instruments.write().await)
    }

    /// Drop the instrument serving `subsystem`. Refused while a sequence runs.
    pub async fn disconnect(&self, subsystem: Subsystem) -> SequenceResult<bool> {
        Ok(self.instruments_mut().await?.disconnect(subsystem))
    }

    /// Grid for the current configuration rendered as a table.
    pub fn preview_grid(&self) -> SequenceResult<String> {
        Ok(Self::build_grid(&self.config())?.preview())
    }

    /// Rows in the run log of the current log directory.
    pub async fn log_rows(&self) -> Vec<RunLogRow> {
        self.logs
            .lock()
            .await
            .active()
            .map(|log| log.rows().to_vec())
            .unwrap_or_default()
    }

    /// Run log path for the current log directory, once a sequence has started.
    pub async fn log_path(&self) -> Option<PathBuf> {
        self.logs
            .lock()
            .await
            .active()
            .map(|log| log.path().to_path_buf())
    }

    /// Spawn the sequence on the runtime and return its handle.
    pub fn start_sequence(self: &Arc<Self>) -> SequenceResult<JoinHandle<SequenceResult<RunSummary>>> {
        self.begin()?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run_begun().await }))
    }

    /// Run a sequence to the end on the current task.
    #[tracing::instrument(skip(self))]
    pub async fn run_sequence(&self) -> SequenceResult<RunSummary> {
        self.begin()?;
        self.run_begun().await
    }

    fn build_grid(config: &SequenceConfig) -> SequenceResult<SequenceGrid> {
        GridBuilder::build(
            &config.axes,
            config.sequence.cycles,
            &config.sequence.sort_keys,
        )
    }

    fn begin(&self) -> SequenceResult<()> {
        if !self.flags.begin() {
            return Err(SequenceError::AlreadyRunning);
        }
        self.state_tx.send_replace(SequenceState::Initializing);
        Ok(())
    }

    async fn run_begun(&self) -> SequenceResult<RunSummary> {
        let mut rows_logged = 0usize;
        let result = match self.initialize().await {
            Ok((config, grid, executor)) => {
                self.run_rows(&config, &grid, executor, &mut rows_logged)
                    .await
            }
            Err(e) => Err(e),
        };
        self.finalize(&result, rows_logged);
        result
    }

    async fn initialize(&self) -> SequenceResult<(SequenceConfig, SequenceGrid, StepExecutor)> {
        let config = self.config();
        config.validate()?;
        let sequence_start = Local::now();
        if config.session.export_settings {
            config.export_snapshot(sequence_start)?;
        }

        let grid = Self::build_grid(&config)?;

        let devices = {
            let instruments = self.instruments.read().await;
            let flags = config.sequence.subsystems;
            StepDevices::select(&instruments, |s| flags.is_enabled(s)).map_err(|missing| {
                SequenceError::Configuration(format!(
                    "subsystem '{}' is enabled but not connected",
                    missing
                ))
            })?
        };
        info!(subsystems = ?devices.enabled(), rows = grid.len(), "sequence initialized");

        let executor = StepExecutor::new(
            devices,
            config.settle.clone(),
            config.precision.into(),
            config.pulse,
            config.session.notes.clone(),
            self.total_pulses.clone(),
        );

        self.logs
            .lock()
            .await
            .activate(&config.session.log_dir, self.session_start)?;

        Ok((config, grid, executor))
    }

    async fn run_rows(
        &self,
        config: &SequenceConfig,
        grid: &SequenceGrid,
        mut executor: StepExecutor,
        rows_logged: &mut usize,
    ) -> SequenceResult<RunSummary> {
        self.state_tx.send_replace(SequenceState::Running);
        let log_path = self.log_path().await.unwrap_or_default();
        let total = grid.len();
        let _ = self.notices.send(SequenceNotice::Started {
            rows: total,
            log_path: log_path.clone(),
        });

        let mut outcome = RunOutcome::Completed;
        for (i, row) in grid.rows.iter().enumerate() {
            let (log_row, fault) = match executor.execute(row).await {
                Ok(log_row) => (log_row, None),
                Err(StepFault { fault, partial }) => (partial, Some(fault)),
            };
            self.append(log_row).await?;
            *rows_logged += 1;

            if let Some(fault) = fault {
                let stop = fault.is_connection_loss() || config.sequence.on_fault == FaultPolicy::Abort;
                let _ = self.notices.send(SequenceNotice::RowFaulted {
                    index: row.index,
                    fault: fault.to_string(),
                    skipped: !stop,
                });
                if stop {
                    error!(row = row.index, %fault, "step fault, ending sequence");
                    return Err(fault.into());
                }
                warn!(row = row.index, %fault, "step fault, skipping row");
            } else {
                let _ = self.notices.send(SequenceNotice::RowCompleted {
                    index: row.index,
                    total,
                });
            }

            if self.flags.is_aborted() {
                outcome = RunOutcome::Aborted;
                break;
            }
            if i + 1 < total {
                sleep(config.sequence.pacing_delay).await;
                if self.flags.is_aborted() {
                    outcome = RunOutcome::Aborted;
                    break;
                }
            }
        }

        if outcome == RunOutcome::Aborted {
            self.state_tx.send_replace(SequenceState::Aborting);
            info!(rows_logged = *rows_logged, "sequence aborted at row boundary");
        }
        Ok(RunSummary {
            outcome,
            rows_logged: *rows_logged,
            grid_rows: total,
            log_path,
        })
    }

    async fn append(&self, row: RunLogRow) -> SequenceResult<()> {
        let mut logs = self.logs.lock().await;
        match logs.active_mut() {
            Some(log) => log.append(row),
            None => Err(SequenceError::Configuration("run log is not open".into())),
        }
    }

    fn finalize(&self, result: &SequenceResult<RunSummary>, rows_logged: usize) {
        self.state_tx.send_replace(SequenceState::Finalizing);
        let notice = match result {
            Ok(summary) if summary.outcome == RunOutcome::Aborted => {
                SequenceNotice::Aborted { rows_logged }
            }
            Ok(_) => SequenceNotice::Completed { rows_logged },
            Err(e) => SequenceNotice::Failed {
                rows_logged,
                error: e.to_string(),
            },
        };
        self.flags.finish();
        self.state_tx.send_replace(SequenceState::Idle);
        info!(%notice, "sequence finalized");
        let _ = self.notices.send(notice);
    }
}
