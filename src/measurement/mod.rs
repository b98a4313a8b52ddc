//! Measurement data types and the pure math applied to them.
//!
//! Everything here is instrument-agnostic: samples come out of a
//! [`SourceMeter`](crate::instrument::SourceMeter), get grouped into labelled
//! batches, and are reduced to the figures of merit stored on a [`PixelRecord`].

pub mod mpp;
pub mod record;
pub mod sample;
pub mod sweep;

pub use mpp::{
    compliance_after_isc, compliance_after_sweep, which_max_power, MaxPowerPoint,
    DARK_CURVE_COMPLIANCE, DARK_CURVE_ISC_THRESHOLD,
};
pub use record::PixelRecord;
pub use sample::{PhaseLabel, Sample, SampleBatch, StatusWord, VALUES_PER_SAMPLE};
pub use sweep::{SenseRange, StepDelay, SweepSpec};
