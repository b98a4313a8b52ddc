//! Sweep and sense-range configuration values.

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// How the sense function picks its measurement range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SenseRange {
    /// Instrument autoranges freely.
    Auto,
    /// Range is locked to the compliance value.
    ///
    /// The hardware only re-evaluates the sense range on a protection write, so the
    /// compliance must be asserted again after this mode is selected.
    FollowCompliance,
    /// Fixed numeric range.
    Fixed(f64),
}

/// Settling delay between sweep steps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepDelay {
    /// Instrument chooses (about 1 ms).
    Auto,
    /// Explicit delay in seconds.
    Seconds(f64),
}

impl From<Option<f64>> for StepDelay {
    fn from(value: Option<f64>) -> Self {
        value.map_or(StepDelay::Auto, StepDelay::Seconds)
    }
}

/// A linear sweep request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    /// Source voltage (sense current) when true, source current otherwise.
    pub source_voltage: bool,
    /// Protection limit on the sense function, must be positive.
    pub compliance: f64,
    /// Sense range mode.
    pub sense_range: SenseRange,
    /// Number of sweep points; also used as the trigger count.
    pub points: u32,
    /// Step delay.
    pub step_delay: StepDelay,
    /// First source level.
    pub start: f64,
    /// Last source level.
    pub end: f64,
}

impl SweepSpec {
    /// Voltage-sourced sweep with compliance-following sense range and auto step delay.
    pub fn voltage(compliance: f64, points: u32, start: f64, end: f64) -> Self {
        Self {
            source_voltage: true,
            compliance,
            sense_range: SenseRange::FollowCompliance,
            points,
            step_delay: StepDelay::Auto,
            start,
            end,
        }
    }

    /// Check the invariants before anything is sent to the hardware.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.compliance > 0.0) {
            return Err(DaqError::InvalidSweep(format!(
                "compliance must be positive, got {}",
                self.compliance
            )));
        }
        if self.points < 2 {
            return Err(DaqError::InvalidSweep(format!(
                "a sweep needs at least 2 points, got {}",
                self.points
            )));
        }
        if let StepDelay::Seconds(delay) = self.step_delay {
            if !(delay >= 0.0) {
                return Err(DaqError::InvalidSweep(format!(
                    "step delay must be non-negative, got {}",
                    delay
                )));
            }
        }
        if let SenseRange::Fixed(range) = self.sense_range {
            if !(range > 0.0) {
                return Err(DaqError::InvalidSweep(format!(
                    "fixed sense range must be positive, got {}",
                    range
                )));
            }
        }
        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(DaqError::InvalidSweep("sweep limits must be finite".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_sweep() {
        assert!(SweepSpec::voltage(0.04, 101, 1.1, 0.0).validate().is_ok());
    }

    #[test]
    fn test_rejects_single_point() {
        let spec = SweepSpec::voltage(0.04, 1, 1.1, 0.0);
        assert!(matches!(spec.validate(), Err(DaqError::InvalidSweep(_))));
    }

    #[test]
    fn test_rejects_non_positive_compliance() {
        assert!(SweepSpec::voltage(0.0, 11, 1.0, 0.0).validate().is_err());
        assert!(SweepSpec::voltage(f64::NAN, 11, 1.0, 0.0).validate().is_err());
    }

    #[test]
    fn test_rejects_negative_step_delay() {
        let mut spec = SweepSpec::voltage(0.04, 11, 1.0, 0.0);
        spec.step_delay = StepDelay::Seconds(-0.001);
        assert!(spec.validate().is_err());
        spec.step_delay = StepDelay::Seconds(0.0);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_step_delay_from_option() {
        assert_eq!(StepDelay::from(None), StepDelay::Auto);
        assert_eq!(StepDelay::from(Some(0.005)), StepDelay::Seconds(0.005));
    }
}
