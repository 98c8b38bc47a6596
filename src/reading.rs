//! Calibrated force samples.

use serde::{Deserialize, Serialize};

/// One force sample handed to the caller.
///
/// `force` is already converted through the calibration that was active when the line
/// was decoded. `timestamp_nanos` comes from the device clock for streamed samples and
/// from the host clock for single reads. `id` is only populated by the legacy
/// free-running `id,force` line format.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Sample time in nanoseconds.
    pub timestamp_nanos: i64,
    /// Calibrated force.
    pub force: f64,
    /// Legacy sample counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

impl Reading {
    /// Create a reading without a legacy id.
    pub fn new(timestamp_nanos: i64, force: f64) -> Self {
        Self {
            timestamp_nanos,
            force,
            id: None,
        }
    }

    /// Attach a legacy sample counter.
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = Some(id);
        self
    }

    /// Sample time truncated to whole milliseconds.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_nanos / 1_000_000
    }
}
