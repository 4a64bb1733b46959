//! Run state and the interlocked abort flag.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of the sequence controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// No sequence; configuration may change.
    Idle,
    /// Snapshotting configuration and building the grid.
    Initializing,
    /// Executing grid rows.
    Running,
    /// Abort observed; leaving the row loop.
    Aborting,
    /// Cleaning up.
    Finalizing,
}

impl std::fmt::Display for SequenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SequenceState::Idle => "idle",
            SequenceState::Initializing => "initializing",
            SequenceState::Running => "running",
            SequenceState::Aborting => "aborting",
            SequenceState::Finalizing => "finalizing",
        };
        f.write_str(label)
    }
}

const RUNNING: u8 = 0b01;
const ABORTED: u8 = 0b10;

/// `running` / `aborted` pair in one atomic so an abort can only land while a
/// sequence is running.
#[derive(Debug, Default)]
pub struct RunFlags {
    bits: AtomicU8,
}

impl RunFlags {
    /// Both flags cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a new run: running, not aborted.
    pub fn begin(&self) -> bool {
        self.bits
            .compare_exchange(0, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clear both flags.
    pub fn finish(&self) {
        self.bits.store(0, Ordering::SeqCst);
    }

    /// Set `aborted` if running. Returns false when nothing is running.
    pub fn request_abort(&self) -> bool {
        self.bits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                (bits & RUNNING != 0).then_some(bits | ABORTED)
            })
            .is_ok()
    }

    /// A sequence is running.
    pub fn is_running(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & RUNNING != 0
    }

    /// Abort has been requested for the current run.
    pub fn is_aborted(&self) -> bool {
        self.bits.load(Ordering::SeqCst) & ABORTED != 0
    }
}

/// Cloneable handle that can request an abort from anywhere.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flags: Arc<RunFlags>,
}

impl AbortHandle {
    pub(crate) fn new(flags: Arc<RunFlags>) -> Self {
        Self { flags }
    }

    /// Request a cooperative abort. Returns false when nothing is running.
    pub fn request(&self) -> bool {
        let accepted = self.flags.request_abort();
        if accepted {
            tracing::info!("abort requested");
        }
        accepted
    }

    /// Whether an abort is pending.
    pub fn is_requested(&self) -> bool {
        self.flags.is_aborted()
    }
}
