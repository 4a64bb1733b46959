//! Durable per-step run log.
//!
//! Rows are kept in memory and the whole CSV file is rewritten after every
//! append: serialize to a sibling temp file, then rename over the log. A crash
//! mid-write leaves the previous complete log in place.
//!
//! The file name is fixed when the log is created:
//! `<log_dir>/<YYYY-MM-DD_HH-MM-SS>_log.csv`.

use crate::error::SequenceResult;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Timestamp format used in log and settings file names.
pub const FILE_STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Column names, in [`RunLogRow`] field order.
pub const HEADERS: [&str; 16] = [
    "timestamp",
    "cycle",
    "row_index",
    "total_pulses",
    "pulse_width_ms",
    "pulse_amplitude_v",
    "pulse_delay_ms",
    "pulse_number",
    "x_position",
    "y_position",
    "secondary_rotation_deg",
    "rotation_deg",
    "power_percent",
    "notes",
    "spectrum_file",
    "scope_file",
];

/// Outcome of one processed grid row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunLogRow {
    /// Time the row finished.
    pub timestamp: Option<DateTime<Local>>,
    /// Cycle index.
    pub cycle: Option<u32>,
    /// Grid row index.
    pub row_index: Option<usize>,
    /// Session-wide pulse count after this row.
    pub total_pulses: Option<u64>,
    /// Pulse width in ms.
    pub pulse_width_ms: Option<f64>,
    /// Pulse amplitude in V.
    pub pulse_amplitude_v: Option<f64>,
    /// Inter-pulse delay in ms.
    pub pulse_delay_ms: Option<f64>,
    /// Pulses per burst.
    pub pulse_number: Option<u32>,
    /// Achieved stage X.
    pub x_position: Option<f64>,
    /// Achieved stage Y.
    pub y_position: Option<f64>,
    /// Achieved secondary rotation.
    pub secondary_rotation_deg: Option<f64>,
    /// Achieved rotation.
    pub rotation_deg: Option<f64>,
    /// Achieved attenuator power.
    pub power_percent: Option<f64>,
    /// Free text; see [`sanitize_notes`].
    pub notes: String,
    /// Spectrum artifact identifier.
    pub spectrum_file: Option<String>,
    /// Oscilloscope artifact identifier.
    pub scope_file: Option<String>,
}

impl RunLogRow {
    /// True when the row carries no information at all.
    pub fn is_blank(&self) -> bool {
        *self == RunLogRow::default()
    }

    /// Append a note, separated from existing notes.
    pub fn push_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push_str("; ");
        }
        self.notes.push_str(&sanitize_notes(note));
    }
}

/// Replace the CSV-hostile `,` and tab with `__`.
pub fn sanitize_notes(notes: &str) -> String {
    notes.replace([',', '\t'], "__")
}

/// File-backed run log.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    rows: Vec<RunLogRow>,
}

impl RunLog {
    /// Log in `log_dir` named after `session_start`. The directory is created
    /// if needed; nothing is written until the first append.
    pub fn new(log_dir: &Path, session_start: DateTime<Local>) -> SequenceResult<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!(
            "{}_log.csv",
            session_start.format(FILE_STAMP_FORMAT)
        ));
        Ok(Self {
            path,
            rows: Vec::new(),
        })
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows appended so far.
    pub fn rows(&self) -> &[RunLogRow] {
        &self.rows
    }

    /// Record `row` and rewrite the file.
    pub fn append(&mut self, mut row: RunLogRow) -> SequenceResult<()> {
        row.notes = sanitize_notes(&row.notes);
        let last = self.rows.iter().rev().find_map(|r| r.timestamp);
        if let (Some(prev), Some(ts)) = (last, row.timestamp) {
            if ts < prev {
                row.timestamp = Some(prev);
            }
        }
        self.rows.push(row);
        self.flush()
    }

    fn flush(&self) -> SequenceResult<()> {
        let tmp = self.path.with_extension("csv.tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer.write_record(HEADERS)?;
            for row in self.rows.iter().filter(|r| !r.is_blank()) {
                writer.serialize(row)?;
            }
            writer.flush()?;
            let file = writer
                .into_inner()
                .map_err(|e| std::io::Error::new(e.error().kind(), e.to_string()))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        tracing::debug!(path = %self.path.display(), rows = self.rows.len(), "run log written");
        Ok(())
    }
}

/// Write `contents` next to the run log as `<stamp>_<suffix>`.
pub fn write_sidecar(
    log_dir: &Path,
    stamp: DateTime<Local>,
    suffix: &str,
    contents: &str,
) -> SequenceResult<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let path = log_dir.join(format!(
        "{}_{}",
        stamp.format(FILE_STAMP_FORMAT),
        suffix
    ));
    let mut file = File::create(&path)?;
    file.write_all(contents.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap()
    }

    fn row(index: usize, ts: DateTime<Local>) -> RunLogRow {
        RunLogRow {
            timestamp: Some(ts),
            cycle: Some(0),
            row_index: Some(index),
            ..RunLogRow::default()
        }
    }

    #[test]
    fn file_name_uses_session_start() {
        let dir = tempdir().unwrap();
        let log = RunLog::new(dir.path(), start()).unwrap();
        assert_eq!(
            log.path().file_name().unwrap().to_str().unwrap(),
            "2024-03-05_14-07-09_log.csv"
        );
    }

    #[test]
    fn notes_are_sanitized() {
        assert_eq!(sanitize_notes("a,b\tc"), "a__b__c");
        let mut r = RunLogRow::default();
        r.push_note("first");
        r.push_note("x,y");
        assert_eq!(r.notes, "first; x__y");
    }

    #[test]
    fn every_append_rewrites_whole_file() {
        let dir = tempdir().unwrap();
        let mut log = RunLog::new(dir.path(), start()).unwrap();
        log.append(row(0, start())).unwrap();
        log.append(RunLogRow::default()).unwrap();
        log.append(row(1, start() + Duration::seconds(1))).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3, "header plus two non-blank rows");
        assert!(lines[0].starts_with("timestamp,cycle,row_index,total_pulses"));
        assert!(!dir.path().join("2024-03-05_14-07-09_log.csv.tmp").exists());
        assert_eq!(log.rows().len(), 3);
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let dir = tempdir().unwrap();
        let mut log = RunLog::new(dir.path(), start()).unwrap();
        log.append(row(0, start() + Duration::seconds(5))).unwrap();
        log.append(row(1, start())).unwrap();
        assert_eq!(log.rows()[1].timestamp, log.rows()[0].timestamp);
    }

    #[test]
    fn csv_round_trips_notes_as_one_field() {
        let dir = tempdir().unwrap();
        let mut log = RunLog::new(dir.path(), start()).unwrap();
        let mut r = row(0, start());
        r.notes = "power, then\tangle".into();
        log.append(r).unwrap();

        let mut reader = csv::Reader::from_path(log.path()).unwrap();
        let headers = reader.headers().unwrap().clone();
        let record = reader.records().next().unwrap().unwrap();
        let notes_idx = headers.iter().position(|h| h == "notes").unwrap();
        assert_eq!(&record[notes_idx], "power__ then__angle");
    }

    #[test]
    fn blank_rows_still_leave_a_header() {
        let dir = tempdir().unwrap();
        let mut log = RunLog::new(dir.path(), start()).unwrap();
        log.append(RunLogRow::default()).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.lines().collect::<Vec<_>>(), vec![HEADERS.join(",")]);
    }

    #[test]
    fn headers_follow_row_fields() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.serialize(row(0, start())).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(text.lines().next(), Some(HEADERS.join(",").as_str()));
    }
}
