//! Raw-count to force conversion.
//!
//! `force = (raw - gauge_value) * units_per_count`
//!
//! The state is two scalars behind a `parking_lot::RwLock`: every force-bearing decode
//! takes a consistent snapshot, and only the explicit calibration procedures write.
//! The procedures that need the device (re-gauge, scale calibration) live on
//! [`crate::driver::ForceStage`]; this module holds the arithmetic.

use crate::error::{DriverError, DriverResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Zero offset and scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Raw count at zero applied force.
    pub gauge_value: f64,
    /// Force per raw count above the gauge value.
    pub units_per_count: f64,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            gauge_value: 0.0,
            units_per_count: 1.0,
        }
    }
}

impl CalibrationState {
    /// Validated constructor.
    ///
    /// # Errors
    /// [`DriverError::Calibration`] if either value is non-finite or the scale is zero.
    pub fn new(gauge_value: f64, units_per_count: f64) -> DriverResult<Self> {
        let state = Self {
            gauge_value,
            units_per_count,
        };
        state.validate()?;
        Ok(state)
    }

    fn validate(&self) -> DriverResult<()> {
        if !self.gauge_value.is_finite() {
            return Err(DriverError::Calibration(format!(
                "gauge value must be finite, got {}",
                self.gauge_value
            )));
        }
        if !self.units_per_count.is_finite() || self.units_per_count == 0.0 {
            return Err(DriverError::Calibration(format!(
                "units per count must be finite and non-zero, got {}",
                self.units_per_count
            )));
        }
        Ok(())
    }

    /// Convert a raw count to force.
    pub fn convert(&self, raw: f64) -> f64 {
        (raw - self.gauge_value) * self.units_per_count
    }
}

/// Arithmetic mean of a non-empty sample set.
///
/// Computed incrementally, so a constant sample set averages to exactly that constant.
pub fn mean(samples: &[f64]) -> DriverResult<f64> {
    if samples.is_empty() {
        return Err(DriverError::Calibration("no samples to average".into()));
    }
    Ok(samples
        .iter()
        .enumerate()
        .fold(0.0, |avg, (i, x)| avg + (x - avg) / (i + 1) as f64))
}

/// Scale factor that maps the averaged raw count onto `known_force`.
///
/// The average is taken relative to `gauge_value` so that the result is consistent with
/// [`CalibrationState::convert`].
///
/// # Errors
/// [`DriverError::Calibration`] if the offset average is zero or the result is not a
/// usable scale factor.
pub fn scale_for_known_force(known_force: f64, samples: &[f64], gauge_value: f64) -> DriverResult<f64> {
    if !known_force.is_finite() || known_force == 0.0 {
        return Err(DriverError::Calibration(format!(
            "known force must be finite and non-zero, got {}",
            known_force
        )));
    }
    let counts = mean(samples)? - gauge_value;
    if counts == 0.0 {
        return Err(DriverError::Calibration(
            "average raw count equals the gauge value; is the reference load applied?".into(),
        ));
    }
    let units_per_count = known_force / counts;
    if !units_per_count.is_finite() || units_per_count == 0.0 {
        return Err(DriverError::Calibration(format!(
            "derived units per count {} is unusable",
            units_per_count
        )));
    }
    Ok(units_per_count)
}

/// Shared, live-adjustable calibration.
///
/// Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct Calibration {
    inner: Arc<RwLock<CalibrationState>>,
}

impl Calibration {
    /// Wrap an initial state.
    pub fn new(state: CalibrationState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    /// Consistent copy of the current state.
    pub fn snapshot(&self) -> CalibrationState {
        *self.inner.read()
    }

    /// Convert with the current state.
    pub fn convert(&self, raw: f64) -> f64 {
        self.inner.read().convert(raw)
    }

    /// Replace both values (manual calibration).
    pub fn set(&self, state: CalibrationState) -> DriverResult<()> {
        state.validate()?;
        *self.inner.write() = state;
        tracing::info!(
            gauge_value = state.gauge_value,
            units_per_count = state.units_per_count,
            "Calibration updated"
        );
        Ok(())
    }

    /// Replace the zero offset only.
    pub fn set_gauge_value(&self, gauge_value: f64) -> DriverResult<()> {
        let mut guard = self.inner.write();
        let next = CalibrationState {
            gauge_value,
            ..*guard
        };
        next.validate()?;
        *guard = next;
        tracing::info!(gauge_value, "Gauge value updated");
        Ok(())
    }

    /// Replace the scale factor only.
    pub fn set_units_per_count(&self, units_per_count: f64) -> DriverResult<()> {
        let mut guard = self.inner.write();
        let next = CalibrationState {
            units_per_count,
            ..*guard
        };
        next.validate()?;
        *guard = next;
        tracing::info!(units_per_count, "Scale factor updated");
        Ok(())
    }
}
