//! Per-pixel measurement record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mpp::MaxPowerPoint;
use super::sample::{PhaseLabel, SampleBatch};
use crate::pixel::PixelAddress;

/// Everything measured on one pixel.
///
/// Created when the pixel is dequeued, filled in phase by phase, and handed to the
/// data sink once finalized, complete or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelRecord {
    /// Which pixel.
    pub address: PixelAddress,
    /// Operator running the measurement.
    pub operator: String,
    /// Wall-clock time the pixel was dequeued.
    pub started_at: DateTime<Utc>,
    /// Steady-state open-circuit voltage.
    pub voc: Option<f64>,
    /// Steady-state short-circuit current.
    pub isc: Option<f64>,
    /// Voltage at the most recently extracted maximum power point.
    pub vmpp: Option<f64>,
    /// Current at the most recently extracted maximum power point.
    pub impp: Option<f64>,
    /// Power at the most recently extracted maximum power point.
    pub pmax: Option<f64>,
    /// Last derived current compliance.
    pub compliance: Option<f64>,
    /// Sample batches in the order they were captured.
    pub batches: Vec<SampleBatch>,
    /// All requested phases ran to completion.
    pub complete: bool,
    /// Why the pixel stopped early, if it did.
    pub error: Option<String>,
}

impl PixelRecord {
    /// Fresh record for a just-dequeued pixel.
    pub fn new(address: PixelAddress, operator: &str) -> Self {
        Self {
            address,
            operator: operator.to_string(),
            started_at: Utc::now(),
            voc: None,
            isc: None,
            vmpp: None,
            impp: None,
            pmax: None,
            compliance: None,
            batches: Vec::new(),
            complete: false,
            error: None,
        }
    }

    /// Record a maximum power point extracted from a sweep.
    pub fn set_max_power_point(&mut self, mpp: &MaxPowerPoint) {
        self.vmpp = Some(mpp.vmpp);
        self.impp = Some(mpp.impp);
        self.pmax = Some(mpp.pmax);
    }

    /// Batch captured in the given phase, if any.
    pub fn batch(&self, phase: PhaseLabel) -> Option<&SampleBatch> {
        self.batches.iter().find(|b| b.phase == phase)
    }

    /// Close the record: mark it complete, or store the reason it is partial.
    pub fn finalize(&mut self, error: Option<String>) {
        self.complete = error.is_none();
        self.error = error;
    }
}
