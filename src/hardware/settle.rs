//! Settle-polling for slow positioning hardware.
//!
//! Stages, rotators and the attenuator accept a setpoint and then take an
//! unknown amount of time to get there. [`poll_until`] re-reads the device at a
//! fixed interval until the reading matches the target, with a wall-clock
//! budget so a stuck device becomes a [`DeviceFault`] instead of a hang.
//!
//! Unparsable replies are common on these serial links and are retried. Once
//! the retry budget is spent, [`BackupPolicy::LastKnownGood`] falls back to the
//! last good reading and flags the outcome so the caller can note it;
//! [`BackupPolicy::Retry`] gives up with a parse fault instead.

use crate::error::{DeviceError, DeviceFault, DeviceResult, FaultKind};
use crate::hardware::capabilities::Subsystem;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// What to do with a reading that failed to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPolicy {
    /// Discard the failed read and poll again.
    Retry,
    /// After the parse budget is spent, accept the last good reading.
    #[default]
    LastKnownGood,
}

/// Timing and retry budget for one settle-poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlePolicy {
    /// Delay between readbacks.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Wall-clock budget for the whole poll.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Consecutive parse failures tolerated before the poll gives up.
    pub max_parse_failures: u32,
    /// Handling of unparsable readings.
    pub backup: BackupPolicy,
}

impl Default for SettlePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
            max_parse_failures: 10,
            backup: BackupPolicy::LastKnownGood,
        }
    }
}

/// Rounding precision used to decide whether a reading matches its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precision {
    /// Decimal places.
    pub decimals: u32,
}

impl Precision {
    /// Precision with `decimals` decimal places.
    pub const fn new(decimals: u32) -> Self {
        Self { decimals }
    }

    /// Round `value` to this precision.
    pub fn round(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.decimals as i32);
        (value * scale).round() / scale
    }

    /// True when `reading` and `target` agree after rounding.
    pub fn matches(&self, reading: f64, target: f64) -> bool {
        let scale = 10f64.powi(self.decimals as i32);
        ((reading * scale).round() - (target * scale).round()).abs() < 0.5
    }
}

/// Result of a successful settle-poll.
#[derive(Debug, Clone, PartialEq)]
pub struct SettleOutcome<T> {
    /// Final reading.
    pub value: T,
    /// Number of readbacks issued.
    pub polls: u32,
    /// Parse failures seen along the way.
    pub parse_failures: u32,
    /// The final value came from the last-known-good backup.
    pub from_backup: bool,
}

/// Poll `read` until `is_settled` accepts a reading.
///
/// The first readback happens immediately; subsequent ones wait
/// `policy.poll_interval`. Transport-level errors end the poll at once.
pub async fn poll_until<T, F, Fut, P>(
    subsystem: Subsystem,
    policy: &SettlePolicy,
    mut read: F,
    is_settled: P,
) -> Result<SettleOutcome<T>, DeviceFault>
where
    T: Clone + std::fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = DeviceResult<T>>,
    P: Fn(&T) -> bool,
{
    let started = Instant::now();
    let mut polls = 0u32;
    let mut parse_failures = 0u32;
    let mut consecutive_failures = 0u32;
    let mut last_good: Option<T> = None;

    loop {
        polls += 1;
        match read().await {
            Ok(value) => {
                consecutive_failures = 0;
                if is_settled(&value) {
                    tracing::debug!(%subsystem, polls, ?value, "settled");
                    return Ok(SettleOutcome {
                        value,
                        polls,
                        parse_failures,
                        from_backup: false,
                    });
                }
                tracing::debug!(%subsystem, polls, ?value, "not settled yet");
                last_good = Some(value);
            }
            Err(DeviceError::Parse(reply)) => {
                parse_failures += 1;
                consecutive_failures += 1;
                if consecutive_failures > policy.max_parse_failures {
                    if let (BackupPolicy::LastKnownGood, Some(backup)) = (policy.backup, &last_good)
                    {
                        tracing::warn!(
                            %subsystem,
                            reply = %reply,
                            value = ?backup,
                            "readback keeps failing, using last known good value"
                        );
                        return Ok(SettleOutcome {
                            value: backup.clone(),
                            polls,
                            parse_failures,
                            from_backup: true,
                        });
                    }
                    return Err(DeviceFault::new(
                        subsystem,
                        FaultKind::Parse,
                        format!(
                            "{} consecutive unparsable readings, last: {}",
                            consecutive_failures, reply
                        ),
                    ));
                }
                tracing::debug!(%subsystem, reply = %reply, "unparsable reading, retrying");
            }
            Err(err) => return Err(DeviceFault::from_device(subsystem, err)),
        }

        if started.elapsed() >= policy.timeout {
            return Err(DeviceFault::timeout(
                subsystem,
                format!(
                    "not settled after {:?} ({} polls, last reading {:?})",
                    policy.timeout, polls, last_good
                ),
            ));
        }
        tokio::time::sleep(policy.poll_interval).await;
    }
}
