//! Simulated source-measure unit.
//!
//! Models an illuminated solar cell with the ideal single-diode equation
//! `I(V) = I0 * (exp(V / (n * Vt)) - 1) - Iph` (current into the device is
//! positive) and honours compliance the way the real instrument does: the
//! sensed quantity is clamped and the status word gets its compliance bit.

use log::{debug, info};
use std::thread;
use std::time::{Duration, Instant};

use super::SourceMeter;
use crate::error::{AppResult, DaqError};
use crate::measurement::{Sample, SenseRange, StatusWord, SweepSpec};

const THERMAL_VOLTAGE: f64 = 0.025_852;
const LINE_FREQUENCY_HZ: f64 = 50.0;

#[derive(Debug, Clone, Copy)]
struct PendingSweep {
    start: f64,
    end: f64,
    points: u32,
}

/// Source-measure unit stand-in driven by a diode model.
#[derive(Debug)]
pub struct DummySourceMeter {
    photocurrent: f64,
    saturation_current: f64,
    ideality: f64,
    epoch: Instant,
    nplc: f64,
    source_voltage: bool,
    level: f64,
    compliance: f64,
    output: bool,
    sweep: Option<PendingSweep>,
    armed: bool,
    acquired: Vec<Sample>,
}

impl Default for DummySourceMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl DummySourceMeter {
    /// A cell with 20 mA photocurrent and a Voc a little above 0.9 V.
    pub fn new() -> Self {
        Self {
            photocurrent: 0.02,
            saturation_current: 1e-12,
            ideality: 1.5,
            epoch: Instant::now(),
            nplc: 1.0,
            source_voltage: true,
            level: 0.0,
            compliance: 0.1,
            output: false,
            sweep: None,
            armed: false,
            acquired: Vec::new(),
        }
    }

    /// Override the photocurrent; zero gives a dark curve.
    pub fn with_photocurrent(mut self, amps: f64) -> Self {
        self.photocurrent = amps;
        self
    }

    /// Whether the output relay is closed.
    pub fn output_enabled(&self) -> bool {
        self.output
    }

    fn n_vt(&self) -> f64 {
        self.ideality * THERMAL_VOLTAGE
    }

    /// Device current at `voltage`.
    pub fn current_at(&self, voltage: f64) -> f64 {
        self.saturation_current * ((voltage / self.n_vt()).exp() - 1.0) - self.photocurrent
    }

    /// Device voltage while `current` is forced through it.
    pub fn voltage_at(&self, current: f64) -> f64 {
        let arg = (current + self.photocurrent) / self.saturation_current + 1.0;
        if arg > 0.0 {
            self.n_vt() * arg.ln()
        } else {
            f64::NEG_INFINITY
        }
    }

    fn measure(&self, level: f64) -> Sample {
        let timestamp = self.epoch.elapsed().as_secs_f64();
        let limit = self.compliance;
        let (raw_voltage, raw_current) = if self.source_voltage {
            (level, self.current_at(level))
        } else {
            (self.voltage_at(level), level)
        };
        let (voltage, current, clamped) = if self.source_voltage {
            let current = raw_current.clamp(-limit, limit);
            (raw_voltage, current, current != raw_current)
        } else {
            let voltage = raw_voltage.clamp(-limit, limit);
            (voltage, raw_current, voltage != raw_voltage)
        };
        let status = if clamped {
            StatusWord::compliance()
        } else {
            StatusWord::default()
        };
        Sample::new(timestamp, voltage, current, status)
    }

    fn integrate(&self) {
        thread::sleep(Duration::from_secs_f64(self.nplc / LINE_FREQUENCY_HZ));
    }
}

impl SourceMeter for DummySourceMeter {
    fn configure_baseline(&mut self, front_terminals: bool, four_wire: bool) -> AppResult<()> {
        debug!(
            "dummy baseline: front={} four_wire={}",
            front_terminals, four_wire
        );
        self.epoch = Instant::now();
        Ok(())
    }

    fn set_integration_time(&mut self, nplc: f64) -> AppResult<()> {
        if !(nplc > 0.0) {
            return Err(DaqError::InvalidSweep(format!("NPLC must be positive, got {}", nplc)));
        }
        self.nplc = nplc;
        Ok(())
    }

    fn configure_dc_level(
        &mut self,
        source_voltage: bool,
        compliance: f64,
        set_point: f64,
        _sense_range: SenseRange,
    ) -> AppResult<()> {
        if !(compliance > 0.0) {
            return Err(DaqError::InvalidSweep(format!(
                "compliance must be positive, got {}",
                compliance
            )));
        }
        self.source_voltage = source_voltage;
        self.compliance = compliance;
        self.level = set_point;
        self.output = true;
        self.sweep = None;
        self.armed = false;
        Ok(())
    }

    fn configure_sweep(&mut self, spec: &SweepSpec) -> AppResult<f64> {
        spec.validate()?;
        self.source_voltage = spec.source_voltage;
        self.compliance = spec.compliance;
        self.level = spec.start;
        self.output = true;
        self.sweep = Some(PendingSweep {
            start: spec.start,
            end: spec.end,
            points: spec.points,
        });
        self.armed = false;
        Ok(((spec.end - spec.start) / f64::from(spec.points - 1)).abs())
    }

    fn arm(&mut self) -> AppResult<()> {
        self.armed = self.sweep.is_some();
        Ok(())
    }

    fn trigger(&mut self) -> AppResult<()> {
        let sweep = match (self.armed, self.sweep) {
            (true, Some(sweep)) => sweep,
            _ => return Err(DaqError::Bus("trigger without an armed sweep".into())),
        };
        let step = (sweep.end - sweep.start) / f64::from(sweep.points - 1);
        self.acquired = (0..sweep.points)
            .map(|i| self.measure(sweep.start + step * f64::from(i)))
            .collect();
        self.level = sweep.end;
        self.armed = false;
        info!("dummy sweep produced {} points", self.acquired.len());
        Ok(())
    }

    fn opc(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn fetch(&mut self, expected: usize) -> AppResult<Vec<Sample>> {
        let samples = std::mem::take(&mut self.acquired);
        if samples.len() != expected {
            return Err(DaqError::Bus(format!(
                "fetched {} samples, expected {}",
                samples.len(),
                expected
            )));
        }
        Ok(samples)
    }

    fn read_one(&mut self) -> AppResult<Sample> {
        self.integrate();
        Ok(self.measure(self.level))
    }

    fn set_source_level(&mut self, level: f64) -> AppResult<()> {
        self.level = level;
        Ok(())
    }

    fn set_output(&mut self, on: bool) -> AppResult<()> {
        self.output = on;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::which_max_power;

    fn fast() -> DummySourceMeter {
        let mut smu = DummySourceMeter::new();
        smu.set_integration_time(0.01).unwrap();
        smu
    }

    #[test]
    fn test_open_circuit_dwell_finds_voc() {
        let mut smu = fast();
        smu.configure_dc_level(false, 3.0, 0.0, SenseRange::Auto).unwrap();
        let sample = smu.read_one().unwrap();
        assert!(sample.voltage > 0.85 && sample.voltage < 1.0, "Voc = {}", sample.voltage);
        assert!(!sample.status.in_compliance());
    }

    #[test]
    fn test_short_circuit_current_clamps_at_compliance() {
        let mut smu = fast();
        smu.configure_dc_level(true, 0.04, 0.0, SenseRange::Auto).unwrap();
        let isc = smu.read_one().unwrap();
        assert!((isc.current + 0.02).abs() < 1e-9);

        smu.configure_dc_level(true, 0.001, 0.0, SenseRange::Auto).unwrap();
        let clamped = smu.read_one().unwrap();
        assert_eq!(clamped.current, -0.001);
        assert!(clamped.status.in_compliance());
    }

    #[test]
    fn test_sweep_has_interior_power_point() {
        let mut smu = fast();
        let samples = smu.run_sweep(&SweepSpec::voltage(0.04, 51, 0.9, 0.0)).unwrap();
        assert_eq!(samples.len(), 51);
        let mpp = which_max_power(&samples).unwrap();
        assert!(mpp.vmpp > 0.7 && mpp.vmpp < 0.9, "Vmpp = {}", mpp.vmpp);
        assert!(mpp.index > 0 && mpp.index < 50);
    }

    #[test]
    fn test_read_many_respects_count_bound() {
        let mut smu = fast();
        smu.configure_dc_level(true, 0.04, 0.0, SenseRange::Auto).unwrap();
        let mut seen = 0;
        let samples = smu
            .read_many(Duration::from_secs(60), Some(3), &mut |_| seen += 1)
            .unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_trigger_without_arm_fails() {
        let mut smu = fast();
        assert!(smu.trigger().is_err());
    }
}
