//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::time::Duration;
use testrig_daq::acquisition::WorkerSettings;

/// Worker settings tuned for mock links: tight polling and millisecond backoff.
pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        poll_interval: Duration::from_millis(1),
        max_consecutive_errors: 3,
        error_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

/// One controller telemetry line (without the newline).
pub fn telemetry(pos_cnt: i64, cycle_a: i64, cycle_b: i64, rpm_a: f64, rpm_b: f64) -> String {
    format!(
        r#"{{"pos_cnt": {pos_cnt}, "cycle count A": {cycle_a}, "cycle count B": {cycle_b}, "RPM A": {rpm_a}, "RPM B": {rpm_b}}}"#
    )
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}
