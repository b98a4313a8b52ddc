//! Samples and labelled sample batches.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppResult, DaqError};

/// Number of values the instrument emits per reading (voltage, current, time, status).
pub const VALUES_PER_SAMPLE: usize = 4;

/// Raw measurement status word reported alongside each reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusWord(pub u32);

impl StatusWord {
    const COMPLIANCE: u32 = 1 << 3;

    /// The sense function hit the compliance limit during this reading.
    pub fn in_compliance(self) -> bool {
        self.0 & Self::COMPLIANCE != 0
    }

    /// Status word with only the compliance bit set.
    pub fn compliance() -> Self {
        StatusWord(Self::COMPLIANCE)
    }
}

/// One reading. Immutable once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Instrument timestamp in seconds since the last time reset.
    pub timestamp: f64,
    /// Volts.
    pub voltage: f64,
    /// Amps.
    pub current: f64,
    /// Status flags for this reading.
    pub status: StatusWord,
}

impl Sample {
    /// Construct a sample.
    pub fn new(timestamp: f64, voltage: f64, current: f64, status: StatusWord) -> Self {
        Self {
            timestamp,
            voltage,
            current,
            status,
        }
    }

    /// Instantaneous power (signed).
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }

    /// Group a flat value list into samples.
    ///
    /// The instrument emits the enabled elements in a fixed order regardless of the
    /// order they were requested in: voltage, current, time, status.
    pub fn from_values(values: &[f64]) -> AppResult<Vec<Sample>> {
        if values.len() % VALUES_PER_SAMPLE != 0 {
            return Err(DaqError::Bus(format!(
                "expected a multiple of {} values per reading, got {}",
                VALUES_PER_SAMPLE,
                values.len()
            )));
        }
        Ok(values
            .chunks_exact(VALUES_PER_SAMPLE)
            .map(|c| Sample::new(c[2], c[0], c[1], StatusWord(c[3] as u32)))
            .collect())
    }
}

/// Which measurement phase produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseLabel {
    /// Open-circuit pre-bias dwell.
    VocDwell,
    /// Descending sweep from Voc toward short circuit.
    Sweep,
    /// Short-circuit dwell.
    IscDwell,
    /// Ascending sweep from short circuit to beyond Voc.
    Snaith,
    /// Maximum power point tracking.
    Mppt,
}

impl PhaseLabel {
    /// Label as written to the data sink.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseLabel::VocDwell => "V_oc dwell",
            PhaseLabel::Sweep => "Sweep",
            PhaseLabel::IscDwell => "I_sc dwell",
            PhaseLabel::Snaith => "Snaith",
            PhaseLabel::Mppt => "MPPT",
        }
    }
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-ordered samples from one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    /// Producing phase.
    pub phase: PhaseLabel,
    /// Samples in acquisition order.
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    /// Wrap samples with their phase label.
    pub fn new(phase: PhaseLabel, samples: Vec<Sample>) -> Self {
        Self { phase, samples }
    }

    /// Last sample, if any.
    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_values_uses_instrument_order() {
        let samples = Sample::from_values(&[0.5, -0.01, 12.5, 8.0, 0.4, -0.02, 12.6, 0.0]).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].voltage, 0.5);
        assert_eq!(samples[0].current, -0.01);
        assert_eq!(samples[0].timestamp, 12.5);
        assert!(samples[0].status.in_compliance());
        assert!(!samples[1].status.in_compliance());
    }

    #[test]
    fn test_from_values_rejects_partial_reading() {
        let err = Sample::from_values(&[0.5, -0.01, 12.5]).unwrap_err();
        assert!(matches!(err, DaqError::Bus(_)));
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(PhaseLabel::IscDwell.to_string(), "I_sc dwell");
        assert_eq!(PhaseLabel::Snaith.as_str(), "Snaith");
    }
}
