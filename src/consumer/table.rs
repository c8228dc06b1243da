//! Tabular log sink: one row per sample.

use super::TelemetryConsumer;
use crate::device::DeviceId;
use crate::protocol::Sample;
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One logged row.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    /// Arrival time
    pub timestamp: DateTime<Local>,
    /// Channel A cycle count
    pub cycle_count_a: i64,
    /// Channel B cycle count
    pub cycle_count_b: i64,
    /// Channel A RPM
    pub rpm_a: f64,
    /// Channel B RPM
    pub rpm_b: f64,
}

impl From<&Sample> for TableRow {
    fn from(sample: &Sample) -> Self {
        Self {
            timestamp: sample.received_at,
            cycle_count_a: sample.reading.cycle_count_a,
            cycle_count_b: sample.reading.cycle_count_b,
            rpm_a: sample.reading.rpm_a,
            rpm_b: sample.reading.rpm_b,
        }
    }
}

/// Shared, append-only table of samples.
#[derive(Clone, Default)]
pub struct TableSink {
    name: String,
    rows: Arc<Mutex<Vec<TableRow>>>,
}

impl TableSink {
    /// Empty table labelled `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TableRow>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of every row.
    pub fn rows(&self) -> Vec<TableRow> {
        self.lock().clone()
    }

    /// Most recent row.
    pub fn last(&self) -> Option<TableRow> {
        self.lock().last().cloned()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every row.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl TelemetryConsumer for TableSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_sample(&mut self, _device: &DeviceId, sample: &Sample) {
        self.lock().push(TableRow::from(sample));
    }

    fn reset(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reading;

    fn sample(cycle_a: i64) -> Sample {
        Sample::new(
            DeviceId::new("ttyACM0"),
            Reading {
                pos_cnt: 0,
                cycle_count_a: cycle_a,
                cycle_count_b: cycle_a + 1,
                rpm_a: 2500.0,
                rpm_b: 2600.0,
            },
        )
    }

    #[test]
    fn test_rows_appended_in_order_and_shared_between_clones() {
        let table = TableSink::new("ttyACM0 table");
        let mut bound = table.clone();
        let id = DeviceId::new("ttyACM0");
        for i in 0..3 {
            bound.on_sample(&id, &sample(i));
        }
        let rows = table.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(
            rows.iter().map(|r| r.cycle_count_a).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(table.last().unwrap().cycle_count_b, 3);

        bound.reset();
        assert!(table.is_empty());
    }
}
