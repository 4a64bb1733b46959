//! Axis sweep generation.
//!
//! One axis configuration expands to the ordered list of values that axis
//! takes during a sequence. A disabled axis contributes a single value: its
//! static value, or `NaN` meaning "leave this subsystem where it is".

use crate::error::{SequenceError, SequenceResult};
use crate::sequence::grid::MAX_GRID_ROWS;
use serde::{Deserialize, Serialize};

/// Sweep settings for one axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisSweep {
    /// Sweep this axis during the sequence.
    pub enabled: bool,
    /// First value.
    pub start: f64,
    /// Last value.
    pub end: f64,
    /// Number of intervals between `start` and `end`.
    pub step_count: i64,
    /// Value used when the axis is not swept.
    pub static_value: Option<f64>,
}

impl Default for AxisSweep {
    fn default() -> Self {
        Self {
            enabled: false,
            start: 0.0,
            end: 0.0,
            step_count: 0,
            static_value: None,
        }
    }
}

impl AxisSweep {
    /// Swept axis from `start` to `end` in `step_count` intervals.
    pub fn linear(start: f64, end: f64, step_count: i64) -> Self {
        Self {
            enabled: true,
            start,
            end,
            step_count,
            static_value: None,
        }
    }

    /// Axis held at `value`.
    pub fn fixed(value: f64) -> Self {
        Self {
            static_value: Some(value),
            ..Self::default()
        }
    }

    /// Number of samples [`generate`](Self::generate) will produce.
    pub fn sample_count(&self) -> SequenceResult<usize> {
        if !self.enabled {
            return Ok(1);
        }
        let steps = usize::try_from(self.step_count).map_err(|_| {
            SequenceError::Configuration(format!(
                "step count must not be negative, got {}",
                self.step_count
            ))
        })?;
        match steps.checked_add(1) {
            Some(count) if count <= MAX_GRID_ROWS => Ok(count),
            _ => Err(SequenceError::Configuration(format!(
                "step count {} exceeds the {} row limit",
                self.step_count, MAX_GRID_ROWS
            ))),
        }
    }

    /// Expand into samples.
    ///
    /// Enabled sweeps yield `step_count + 1` linearly spaced values with both
    /// endpoints included exactly.
    pub fn generate(&self) -> SequenceResult<Vec<f64>> {
        if !self.enabled {
            return Ok(vec![self.static_value.unwrap_or(f64::NAN)]);
        }
        let count = self.sample_count()?;
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(SequenceError::Configuration(format!(
                "sweep bounds must be finite, got {} to {}",
                self.start, self.end
            )));
        }
        if count == 1 {
            return Ok(vec![self.start]);
        }

        let intervals = (count - 1) as f64;
        let step = (self.end - self.start) / intervals;
        let mut samples: Vec<f64> = (0..count)
            .map(|i| self.start + step * i as f64)
            .collect();
        if let Some(last) = samples.last_mut() {
            *last = self.end;
        }
        Ok(samples)
    }
}
