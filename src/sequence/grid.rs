//! Sequence grid construction.
//!
//! The grid is the Cartesian product of every axis' samples, replicated once
//! per cycle. Columns are ordered `x, y, secondary_rotation, rotation, power`
//! with the last column varying fastest, so a plain X/Y grid rasters X-major.
//! Rows are grouped by cycle; inside a cycle they are stably sorted by the
//! configured sort keys.

use crate::error::{SequenceError, SequenceResult};
use crate::hardware::capabilities::Subsystem;
use crate::sequence::sweep::AxisSweep;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Write as _;

/// Largest grid a sequence may expand to, across all cycles.
pub const MAX_GRID_ROWS: usize = 1_000_000;

/// A sweepable grid column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Stage X in cm
    X,
    /// Stage Y in cm
    Y,
    /// Secondary rotation in degrees
    SecondaryRotation,
    /// Primary rotation in degrees
    Rotation,
    /// Attenuator transmission in percent
    Power,
}

impl Axis {
    /// Column order of the product.
    pub const ALL: [Axis; 5] = [
        Axis::X,
        Axis::Y,
        Axis::SecondaryRotation,
        Axis::Rotation,
        Axis::Power,
    ];

    /// Subsystem that realizes this axis.
    pub fn subsystem(&self) -> Subsystem {
        match self {
            Axis::X | Axis::Y => Subsystem::Stage,
            Axis::SecondaryRotation => Subsystem::SecondaryRotation,
            Axis::Rotation => Subsystem::Rotation,
            Axis::Power => Subsystem::Attenuator,
        }
    }

    /// Column header.
    pub fn label(&self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::SecondaryRotation => "secondary_rotation",
            Axis::Rotation => "rotation",
            Axis::Power => "power",
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Sweep configuration of every axis.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisSweeps {
    /// Stage X
    pub x: AxisSweep,
    /// Stage Y
    pub y: AxisSweep,
    /// Secondary rotation
    pub secondary_rotation: AxisSweep,
    /// Primary rotation
    pub rotation: AxisSweep,
    /// Attenuator power
    pub power: AxisSweep,
}

impl AxisSweeps {
    /// Sweep for `axis`.
    pub fn get(&self, axis: Axis) -> &AxisSweep {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::SecondaryRotation => &self.secondary_rotation,
            Axis::Rotation => &self.rotation,
            Axis::Power => &self.power,
        }
    }

    /// Mutable sweep for `axis`.
    pub fn get_mut(&mut self, axis: Axis) -> &mut AxisSweep {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::SecondaryRotation => &mut self.secondary_rotation,
            Axis::Rotation => &mut self.rotation,
            Axis::Power => &mut self.power,
        }
    }
}

/// One step of a sequence. `None` means "hold the current value".
#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    /// Position in the grid, starting at 0.
    pub index: usize,
    /// Cycle this row belongs to, starting at 0.
    pub cycle_index: u32,
    /// Stage X target
    pub x: Option<f64>,
    /// Stage Y target
    pub y: Option<f64>,
    /// Secondary rotation target
    pub secondary_rotation: Option<f64>,
    /// Primary rotation target
    pub rotation: Option<f64>,
    /// Attenuator power target
    pub power: Option<f64>,
}

impl GridRow {
    /// Value of `axis` in this row.
    pub fn value(&self, axis: Axis) -> Option<f64> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::SecondaryRotation => self.secondary_rotation,
            Axis::Rotation => self.rotation,
            Axis::Power => self.power,
        }
    }
}

/// Fully materialized sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceGrid {
    /// Rows in execution order.
    pub rows: Vec<GridRow>,
    /// Number of repeat cycles.
    pub total_cycles: u32,
}

impl SequenceGrid {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when there is nothing to execute.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Render as a fixed-width table. Unset values show as `-`.
    pub fn preview(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{:>6} {:>5}", "row", "cycle");
        for axis in Axis::ALL {
            let _ = write!(out, " {:>18}", axis.label());
        }
        out.push('\n');
        for row in &self.rows {
            let _ = write!(out, "{:>6} {:>5}", row.index, row.cycle_index);
            for axis in Axis::ALL {
                match row.value(axis) {
                    Some(v) => {
                        let _ = write!(out, " {:>18.4}", v);
                    }
                    None => {
                        let _ = write!(out, " {:>18}", "-");
                    }
                }
            }
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "{} rows, {} cycle(s)",
            self.rows.len(),
            self.total_cycles
        );
        out
    }
}

fn unset_to_none(v: f64) -> Option<f64> {
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

fn compare_keys(a: &GridRow, b: &GridRow, keys: &[Axis]) -> Ordering {
    for key in keys {
        let ord = match (a.value(*key), b.value(*key)) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn axis_error(axis: Axis, e: SequenceError) -> SequenceError {
    match e {
        SequenceError::Configuration(msg) => {
            SequenceError::Configuration(format!("{} axis: {}", axis, msg))
        }
        other => other,
    }
}

/// Expands axis sweeps into a [`SequenceGrid`].
pub struct GridBuilder;

impl GridBuilder {
    /// Rows [`build`](Self::build) would produce, without generating any.
    ///
    /// Fails when the count overflows or exceeds [`MAX_GRID_ROWS`].
    pub fn row_count(sweeps: &AxisSweeps, total_cycles: u32) -> SequenceResult<usize> {
        if total_cycles == 0 {
            return Err(SequenceError::Configuration(
                "a sequence needs at least one cycle".into(),
            ));
        }
        let mut rows = total_cycles as usize;
        for axis in Axis::ALL {
            let samples = sweeps.get(axis).sample_count().map_err(|e| axis_error(axis, e))?;
            rows = match rows.checked_mul(samples) {
                Some(n) if n <= MAX_GRID_ROWS => n,
                _ => {
                    return Err(SequenceError::Configuration(format!(
                        "grid exceeds the {} row limit",
                        MAX_GRID_ROWS
                    )))
                }
            };
        }
        Ok(rows)
    }

    /// Build the grid for `total_cycles` repetitions, sorting rows inside each
    /// cycle by `sort_keys`.
    pub fn build(
        sweeps: &AxisSweeps,
        total_cycles: u32,
        sort_keys: &[Axis],
    ) -> SequenceResult<SequenceGrid> {
        let total = Self::row_count(sweeps, total_cycles)?;

        let columns: Vec<Vec<f64>> = Axis::ALL
            .iter()
            .map(|axis| sweeps.get(*axis).generate().map_err(|e| axis_error(*axis, e)))
            .collect::<SequenceResult<_>>()?;

        let per_cycle = total / total_cycles as usize;
        let mut cycle_rows = Vec::with_capacity(per_cycle);
        for flat in 0..per_cycle {
            // Mixed-radix decode, last column fastest.
            let mut rest = flat;
            let mut values = [f64::NAN; 5];
            for (slot, column) in values.iter_mut().zip(&columns).rev() {
                *slot = column[rest % column.len()];
                rest /= column.len();
            }
            cycle_rows.push(GridRow {
                index: 0,
                cycle_index: 0,
                x: unset_to_none(values[0]),
                y: unset_to_none(values[1]),
                secondary_rotation: unset_to_none(values[2]),
                rotation: unset_to_none(values[3]),
                power: unset_to_none(values[4]),
            });
        }
        if !sort_keys.is_empty() {
            cycle_rows.sort_by(|a, b| compare_keys(a, b, sort_keys));
        }

        let mut rows = Vec::with_capacity(total);
        for cycle in 0..total_cycles {
            for row in &cycle_rows {
                rows.push(GridRow {
                    index: rows.len(),
                    cycle_index: cycle,
                    ..row.clone()
                });
            }
        }

        tracing::debug!(rows = rows.len(), total_cycles, "grid built");
        Ok(SequenceGrid { rows, total_cycles })
    }
}
