//! Local safety bounds checked before anything reaches the device.
//!
//! Travel limits are enforced on every `SP` regardless of what the firmware enforces
//! itself. The force limit protects the load cell: the sensor is damaged by loads well
//! above its rating, so every calibrated reading above `max_force` is logged loudly.

use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};

/// Default lower travel limit in mm.
pub const DEFAULT_MIN_POSITION: i64 = 1;
/// Default upper travel limit in mm.
pub const DEFAULT_MAX_POSITION: i64 = 46;

/// Allowed stage travel, inclusive, in mm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionLimits {
    min_position: i64,
    max_position: i64,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            min_position: DEFAULT_MIN_POSITION,
            max_position: DEFAULT_MAX_POSITION,
        }
    }
}

impl MotionLimits {
    /// Create limits.
    ///
    /// # Errors
    /// [`DriverError::Configuration`] if `min_position > max_position`.
    pub fn new(min_position: i64, max_position: i64) -> DriverResult<Self> {
        if min_position > max_position {
            return Err(DriverError::Configuration(format!(
                "min_position ({}) must not exceed max_position ({})",
                min_position, max_position
            )));
        }
        Ok(Self {
            min_position,
            max_position,
        })
    }

    /// Lower travel limit.
    pub fn min_position(&self) -> i64 {
        self.min_position
    }

    /// Upper travel limit.
    pub fn max_position(&self) -> i64 {
        self.max_position
    }

    /// Check a requested position.
    pub fn validate(&self, position: i64) -> DriverResult<()> {
        if position < self.min_position || position > self.max_position {
            return Err(DriverError::OutOfRange {
                position,
                min: self.min_position,
                max: self.max_position,
            });
        }
        Ok(())
    }
}

/// Overload threshold for calibrated force.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceLimit {
    /// Largest safe absolute force in calibrated units.
    pub max_force: f64,
    /// Emit a warning when exceeded.
    pub warn: bool,
}

impl Default for ForceLimit {
    fn default() -> Self {
        Self {
            max_force: 5.0,
            warn: true,
        }
    }
}

impl ForceLimit {
    /// True if `force` exceeds the limit in either direction.
    pub fn exceeded(&self, force: f64) -> bool {
        force.abs() > self.max_force
    }

    /// Log a warning when `force` is beyond the limit. Returns whether it was.
    pub fn check(&self, force: f64) -> bool {
        let over = self.exceeded(force);
        if over && self.warn {
            tracing::warn!(
                force,
                max_force = self.max_force,
                "Load cell overloaded; reduce applied force"
            );
        }
        over
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverErrorKind;
    use tracing_test::traced_test;

    #[test]
    fn default_limits_accept_exactly_the_travel_range() {
        let limits = MotionLimits::default();
        for position in -5..=60 {
            let result = limits.validate(position);
            if (1..=46).contains(&position) {
                assert!(result.is_ok(), "{position} should be accepted");
            } else {
                assert_eq!(result.unwrap_err().kind(), DriverErrorKind::OutOfRange);
            }
        }
    }

    #[test]
    fn inverted_limits_are_rejected() {
        assert!(MotionLimits::new(10, 5).is_err());
        let single = MotionLimits::new(7, 7).unwrap();
        assert!(single.validate(7).is_ok());
        assert!(single.validate(8).is_err());
    }

    #[traced_test]
    #[test]
    fn overload_is_logged_not_rejected() {
        let limit = ForceLimit::default();
        assert!(!limit.check(4.9));
        assert!(limit.check(-5.1));
        assert!(logs_contain("Load cell overloaded"));
    }
}
