//! Live chart sink: position counter over a rolling window.

use super::TelemetryConsumer;
use crate::device::DeviceId;
use crate::protocol::Sample;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default number of points kept per chart.
pub const DEFAULT_CHART_WINDOW: usize = 15_000;

/// One plotted point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartPoint {
    /// Arrival time
    pub timestamp: DateTime<Local>,
    /// Encoder position count
    pub pos_cnt: i64,
}

/// Bounded ring of recent points; oldest are evicted first.
#[derive(Clone)]
pub struct ChartSink {
    name: String,
    points: Arc<Mutex<VecDeque<ChartPoint>>>,
    capacity: usize,
}

impl ChartSink {
    /// Chart labelled `name` keeping at most `capacity` points.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            points: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(4096)))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ChartPoint>> {
        self.points.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the window, oldest first.
    pub fn points(&self) -> Vec<ChartPoint> {
        self.lock().iter().copied().collect()
    }

    /// Most recent point.
    pub fn latest(&self) -> Option<ChartPoint> {
        self.lock().back().copied()
    }

    /// Points currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Window size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// (min, max) position in the window.
    pub fn range(&self) -> Option<(i64, i64)> {
        let points = self.lock();
        let min = points.iter().map(|p| p.pos_cnt).min()?;
        let max = points.iter().map(|p| p.pos_cnt).max()?;
        Some((min, max))
    }
}

impl TelemetryConsumer for ChartSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_sample(&mut self, _device: &DeviceId, sample: &Sample) {
        let capacity = self.capacity;
        let mut points = self.lock();
        if points.len() >= capacity {
            points.pop_front();
        }
        points.push_back(ChartPoint {
            timestamp: sample.received_at,
            pos_cnt: sample.reading.pos_cnt,
        });
    }

    fn reset(&mut self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reading;

    fn sample(pos: i64) -> Sample {
        Sample::new(
            DeviceId::new("COM3"),
            Reading {
                pos_cnt: pos,
                cycle_count_a: 0,
                cycle_count_b: 0,
                rpm_a: 0.0,
                rpm_b: 0.0,
            },
        )
    }

    #[test]
    fn test_window_evicts_oldest() {
        let chart = ChartSink::new("COM3 graph", 3);
        let mut bound = chart.clone();
        let id = DeviceId::new("COM3");
        for pos in 1..=5 {
            bound.on_sample(&id, &sample(pos));
        }
        let positions: Vec<i64> = chart.points().iter().map(|p| p.pos_cnt).collect();
        assert_eq!(positions, vec![3, 4, 5]);
        assert_eq!(chart.latest().unwrap().pos_cnt, 5);
        assert_eq!(chart.range(), Some((3, 5)));
    }

    #[test]
    fn test_reset_clears_window() {
        let mut chart = ChartSink::new("c", DEFAULT_CHART_WINDOW);
        chart.on_sample(&DeviceId::new("COM3"), &sample(9));
        assert_eq!(chart.len(), 1);
        chart.reset();
        assert!(chart.is_empty());
        assert_eq!(chart.range(), None);
    }
}
