//! Source-measure unit drivers.
//!
//! [`SourceMeter`] is the intent-level seam the orchestrator and power trackers
//! program against. [`Keithley2400`] implements it over an [`InstrumentLink`];
//! [`DummySourceMeter`] implements it with a diode model for bench-free runs.

pub mod dummy;
pub mod encoding;
pub mod keithley_2400;
pub mod link;
pub mod transport;

pub use dummy::DummySourceMeter;
pub use encoding::DataEncoding;
pub use keithley_2400::Keithley2400;
pub use link::{Backend, ConnectionParameters, GpibAddress, InstrumentLink, TransportKind};
pub use transport::TransportStrategy;

use log::trace;
use std::time::{Duration, Instant};

use crate::error::{AppResult, DaqError};
use crate::measurement::{Sample, SenseRange, SweepSpec};

/// Intent-level operations on a source-measure unit.
///
/// Every call blocks until the instrument has accepted it. Failures are bus errors
/// and are never retried here.
pub trait SourceMeter {
    /// Terminal routing, 2/4-wire sensing, concurrent sensing, and manual auto-zero.
    fn configure_baseline(&mut self, front_terminals: bool, four_wire: bool) -> AppResult<()>;

    /// Integration time of both sense functions, in power-line cycles.
    fn set_integration_time(&mut self, nplc: f64) -> AppResult<()>;

    /// Fixed source level with compliance on the complementary sense function.
    fn configure_dc_level(
        &mut self,
        source_voltage: bool,
        compliance: f64,
        set_point: f64,
        sense_range: SenseRange,
    ) -> AppResult<()>;

    /// Linear sweep; returns the step size the instrument settled on.
    fn configure_sweep(&mut self, spec: &SweepSpec) -> AppResult<f64>;

    /// Initiate without triggering.
    fn arm(&mut self) -> AppResult<()>;

    /// Trigger an armed acquisition.
    fn trigger(&mut self) -> AppResult<()>;

    /// Block until pending operations are complete.
    fn opc(&mut self) -> AppResult<()>;

    /// Collect `expected` samples from the last acquisition.
    fn fetch(&mut self, expected: usize) -> AppResult<Vec<Sample>>;

    /// Take one reading at the current level.
    fn read_one(&mut self) -> AppResult<Sample>;

    /// Change the fixed source level in place.
    fn set_source_level(&mut self, level: f64) -> AppResult<()>;

    /// Output relay on or off.
    fn set_output(&mut self, on: bool) -> AppResult<()>;

    /// Read repeatedly until `dwell` has elapsed or `max_count` samples are in.
    ///
    /// At least one reading is always taken. `on_sample` runs after each one.
    fn read_many(
        &mut self,
        dwell: Duration,
        max_count: Option<usize>,
        on_sample: &mut dyn FnMut(&Sample),
    ) -> AppResult<Vec<Sample>> {
        let deadline = Instant::now() + dwell;
        let mut samples = Vec::new();
        loop {
            let sample = self.read_one()?;
            trace!("t={:.3} V={:.6} I={:.6e}", sample.timestamp, sample.voltage, sample.current);
            on_sample(&sample);
            samples.push(sample);

            if max_count.is_some_and(|max| samples.len() >= max) || Instant::now() >= deadline {
                return Ok(samples);
            }
        }
    }

    /// Configure, arm, trigger, wait, and fetch a whole sweep.
    fn run_sweep(&mut self, spec: &SweepSpec) -> AppResult<Vec<Sample>> {
        self.configure_sweep(spec)?;
        self.arm()?;
        self.trigger()?;
        self.opc()?;
        let samples = self.fetch(spec.points as usize)?;
        if samples.is_empty() {
            return Err(DaqError::Bus("sweep returned no samples".into()));
        }
        Ok(samples)
    }
}
