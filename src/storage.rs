//! CSV export of logged table rows.
//!
//! One file per device, header `timestamp,Cycle Count A,Cycle Count B,RPM A,RPM B`.
//! Timestamps use the day-of-month clock format `%d-%H:%M:%S`, so a file spans at
//! most one month without ambiguity.

use crate::consumer::TableRow;
use crate::device::DeviceId;
#[cfg(not(feature = "storage_csv"))]
use crate::error::RigError;
use crate::error::AppResult;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Timestamp format used in exported files.
pub const TIMESTAMP_FORMAT: &str = "%d-%H:%M:%S";

/// One exported row, as written to and read back from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    /// Formatted with [`TIMESTAMP_FORMAT`]
    pub timestamp: String,
    /// Channel A cycle count
    #[serde(rename = "Cycle Count A")]
    pub cycle_count_a: i64,
    /// Channel B cycle count
    #[serde(rename = "Cycle Count B")]
    pub cycle_count_b: i64,
    /// Channel A RPM
    #[serde(rename = "RPM A")]
    pub rpm_a: f64,
    /// Channel B RPM
    #[serde(rename = "RPM B")]
    pub rpm_b: f64,
}

impl From<&TableRow> for ExportRecord {
    fn from(row: &TableRow) -> Self {
        Self {
            timestamp: row.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            cycle_count_a: row.cycle_count_a,
            cycle_count_b: row.cycle_count_b,
            rpm_a: row.rpm_a,
            rpm_b: row.rpm_b,
        }
    }
}

/// File name for `device`'s export taken at `at`.
pub fn export_file_name(device: &DeviceId, at: DateTime<Local>) -> String {
    format!("{}_{}.csv", device, at.format("%Y%m%d_%H%M%S"))
}

/// `dir/<device>_<timestamp>.csv`.
pub fn export_path(dir: &Path, device: &DeviceId, at: DateTime<Local>) -> PathBuf {
    dir.join(export_file_name(device, at))
}

/// Write `rows` as CSV to `writer`. Returns the number of data rows.
#[cfg(feature = "storage_csv")]
pub fn export_rows<W: Write>(rows: &[TableRow], writer: W) -> AppResult<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    if rows.is_empty() {
        csv_writer.write_record(["timestamp", "Cycle Count A", "Cycle Count B", "RPM A", "RPM B"])?;
    }
    for row in rows {
        csv_writer.serialize(ExportRecord::from(row))?;
    }
    csv_writer.flush()?;
    Ok(rows.len())
}

/// Requires the `storage_csv` feature.
#[cfg(not(feature = "storage_csv"))]
pub fn export_rows<W: Write>(_rows: &[TableRow], _writer: W) -> AppResult<usize> {
    Err(RigError::FeatureNotEnabled("storage_csv".to_string()))
}

/// Write `rows` to `path`, replacing any existing file.
pub fn export_csv(rows: &[TableRow], path: &Path) -> AppResult<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let written = export_rows(rows, std::io::BufWriter::new(file))?;
    tracing::info!(path = %path.display(), rows = written, "Table exported");
    Ok(written)
}

/// Read an exported file back.
#[cfg(feature = "storage_csv")]
pub fn load_csv(path: &Path) -> AppResult<Vec<ExportRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader
        .deserialize()
        .collect::<Result<Vec<ExportRecord>, csv::Error>>()?;
    Ok(records)
}

/// Requires the `storage_csv` feature.
#[cfg(not(feature = "storage_csv"))]
pub fn load_csv(_path: &Path) -> AppResult<Vec<ExportRecord>> {
    Err(RigError::FeatureNotEnabled("storage_csv".to_string()))
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(day: u32, cycle: i64, rpm_a: f64) -> TableRow {
        TableRow {
            timestamp: Local.with_ymd_and_hms(2026, 3, day, 14, 5, 9).unwrap(),
            cycle_count_a: cycle,
            cycle_count_b: cycle + 1,
            rpm_a,
            rpm_b: 2400.0,
        }
    }

    #[test]
    fn test_export_header_and_format() {
        let mut out = Vec::new();
        let written = export_rows(&[row(7, 12, 2710.5)], &mut out).unwrap();
        assert_eq!(written, 1);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,Cycle Count A,Cycle Count B,RPM A,RPM B");
        assert_eq!(lines[1], "07-14:05:09,12,13,2710.5,2400.0");
    }

    #[test]
    fn test_empty_table_still_has_header() {
        let mut out = Vec::new();
        export_rows(&[], &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap().trim_end(),
            "timestamp,Cycle Count A,Cycle Count B,RPM A,RPM B"
        );
    }

    #[test]
    fn test_export_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ttyACM0.csv");
        export_csv(&[row(1, 1, 1.0), row(1, 2, 2.0), row(1, 3, 3.0)], &path).unwrap();
        export_csv(&[row(2, 9, 9.0)], &path).unwrap();

        let records = load_csv(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cycle_count_a, 9);
        assert_eq!(records[0].timestamp, "02-14:05:09");
    }

    #[test]
    fn test_export_path_naming() {
        let at = Local.with_ymd_and_hms(2026, 10, 14, 9, 30, 0).unwrap();
        let path = export_path(Path::new("data"), &DeviceId::new("COM3"), at);
        assert_eq!(path, Path::new("data").join("COM3_20261014_093000.csv"));
    }
}
