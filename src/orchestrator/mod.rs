//! Per-pixel measurement state machine.
//!
//! ```text
//! NotReady -> PreBias -> (Sweep) -> SteadyStateIsc -> (Snaith) -> (Mppt) -> Complete
//! ```
//!
//! Pixels are measured strictly one after another. Compliance is carried forward
//! between phases: the open-circuit dwell and the short-circuit dwell both feed
//! the limits used by the phases after them.
//!
//! Failure handling follows three tiers:
//!
//! - Fatal errors (connection, configuration) stop the run.
//! - Any other error inside a pixel ends that pixel. Its partial record still
//!   goes to the data sink.
//! - Notifier, archive and light-source failures are logged and dropped.
//!
//! Whatever happens, the run ends with output off, light off, and
//! [`DataSink::run_done`].
//!
//! [`MeasurementOrchestrator::test_hardware`] is the alternative to a run: it
//! checks relays, light, and one reading per pixel without measuring anything.

pub mod collaborators;
pub mod hardware_check;

pub use hardware_check::{HardwareReport, PixelCheck, SubstrateCheck};
pub use collaborators::{
    Archiver, ChannelNotifier, ConstantVoltageHold, DataSink, DirectoryArchiver, JsonLinesSink,
    LightSource, MemorySink, NoLight, Notifier, PixelSelector, PowerTracker, StaticSelector,
};

use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::instrument::SourceMeter;
use crate::measurement::{
    compliance_after_isc, compliance_after_sweep, which_max_power, MaxPowerPoint, PhaseLabel,
    PixelRecord, SampleBatch, SenseRange, StepDelay, SweepSpec,
};
use crate::pixel::{PixelAddress, PixelQueue};

/// Where a pixel is in its measurement sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PixelPhase {
    /// Waiting for substrate and pixel gates.
    NotReady,
    /// Open-circuit dwell.
    PreBias,
    /// Descending sweep.
    Sweep,
    /// Short-circuit dwell.
    SteadyStateIsc,
    /// Ascending sweep.
    Snaith,
    /// Power-point tracking.
    Mppt,
    /// Record finalized.
    Complete,
}

impl fmt::Display for PixelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immutable per-run parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Recorded on every pixel.
    pub operator: String,
    /// Run the descending sweep.
    pub sweep: bool,
    /// Run the ascending sweep.
    pub snaith: bool,
    /// Length of each dwell.
    pub t_prebias: Duration,
    /// Tracking duration; zero skips tracking.
    pub mppt: Duration,
    /// Points per sweep.
    pub scan_points: u32,
    /// Integration time during sweeps.
    pub scan_nplc: f64,
    /// Integration time during dwells.
    pub dwell_nplc: f64,
    /// Sweep step delay.
    pub step_delay: StepDelay,
    /// Fixed current compliance.
    pub current_compliance_override: Option<f64>,
    /// Fixed low sweep limit.
    pub scan_low_override: Option<f64>,
    /// Fixed high sweep limit.
    pub scan_high_override: Option<f64>,
    /// First-sweep current compliance.
    pub compliance_guess: f64,
    /// Voltage compliance while open-circuited.
    pub voc_compliance: f64,
    /// Ascending sweep overshoot past Voc, percent.
    pub percent_beyond_voc: f64,
    /// Upper bound on samples per dwell.
    pub max_dwell_samples: Option<usize>,
    /// Front terminals instead of rear.
    pub front_terminals: bool,
    /// Remote sensing.
    pub four_wire: bool,
    /// Archive destination, if archiving.
    pub archive_address: Option<String>,
    /// Reference diode counts for the light source.
    pub diode_calibration: Option<(u32, u32)>,
}

impl RunConfig {
    /// Snapshot of the settings for one operator's run.
    pub fn from_settings(settings: &Settings, operator: &str) -> Self {
        let m = &settings.measurement;
        Self {
            operator: operator.to_string(),
            sweep: m.sweep,
            snaith: m.snaith,
            t_prebias: Duration::from_secs_f64(m.t_prebias_s),
            mppt: Duration::from_secs_f64(m.mppt_s),
            scan_points: m.scan_points,
            scan_nplc: m.scan_nplc,
            dwell_nplc: m.dwell_nplc,
            step_delay: StepDelay::from(m.step_delay_s),
            current_compliance_override: m.current_compliance_override,
            scan_low_override: m.scan_low_override,
            scan_high_override: m.scan_high_override,
            compliance_guess: m.compliance_guess,
            voc_compliance: m.voc_compliance,
            percent_beyond_voc: m.percent_beyond_voc,
            max_dwell_samples: m.max_dwell_samples,
            front_terminals: settings.instrument.front_terminals,
            four_wire: settings.instrument.four_wire,
            archive_address: settings.integrations.archive_address.clone(),
            diode_calibration: settings.integrations.diode_calibration,
        }
    }
}

/// Pixel counts at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Every requested phase finished.
    pub completed: usize,
    /// Stopped early by an error; a partial record was still delivered.
    pub partial: usize,
    /// Never measured: gate false or substrate setup failed.
    pub skipped: usize,
}

/// Everything the orchestrator talks to besides the instrument.
pub struct Collaborators<'a> {
    /// Relay board.
    pub selector: &'a mut dyn PixelSelector,
    /// Light source.
    pub light: &'a mut dyn LightSource,
    /// Record storage.
    pub sink: &'a mut dyn DataSink,
    /// Tracking algorithm.
    pub tracker: &'a mut dyn PowerTracker,
    /// Optional batch push.
    pub notifier: Option<&'a mut dyn Notifier>,
    /// Optional archival upload.
    pub archiver: Option<&'a mut dyn Archiver>,
}

/// Drives a [`SourceMeter`] through the pixel queue.
pub struct MeasurementOrchestrator<'a> {
    config: &'a RunConfig,
    smu: &'a mut dyn SourceMeter,
    collab: Collaborators<'a>,
    phase: PixelPhase,
}

impl<'a> MeasurementOrchestrator<'a> {
    /// Orchestrator over a verified instrument.
    pub fn new(config: &'a RunConfig, smu: &'a mut dyn SourceMeter, collab: Collaborators<'a>) -> Self {
        Self {
            config,
            smu,
            collab,
            phase: PixelPhase::NotReady,
        }
    }

    /// Phase of the pixel currently (or last) measured.
    pub fn phase(&self) -> PixelPhase {
        self.phase
    }

    /// Measure every pixel in `queue`, then tear down.
    pub fn run(&mut self, mut queue: PixelQueue) -> AppResult<RunSummary> {
        info!("Run started: {} pixel(s) queued", queue.len());
        let mut summary = RunSummary::default();

        let result = self
            .setup_run()
            .and_then(|()| self.run_queue(&mut queue, &mut summary));
        self.teardown();

        match result {
            Ok(()) => {
                info!(
                    "Run finished: {} complete, {} partial, {} skipped",
                    summary.completed, summary.partial, summary.skipped
                );
                Ok(summary)
            }
            Err(e) => {
                error!("Run aborted with {} pixel(s) left: {}", queue.len(), e);
                Err(e)
            }
        }
    }

    fn setup_run(&mut self) -> AppResult<()> {
        self.smu
            .configure_baseline(self.config.front_terminals, self.config.four_wire)?;
        if let Err(e) = self.collab.light.on() {
            warn!("Light source did not turn on: {}", e);
        }
        if let Some(counts) = self.config.diode_calibration {
            if let Err(e) = self.collab.light.apply_calibration(counts) {
                warn!("Light calibration {:?} not applied: {}", counts, e);
            }
        }
        Ok(())
    }

    fn run_queue(&mut self, queue: &mut PixelQueue, summary: &mut RunSummary) -> AppResult<()> {
        let mut substrate: Option<(char, bool)> = None;

        while let Some(address) = queue.pop_front() {
            self.phase = PixelPhase::NotReady;

            let letter = address.substrate();
            let substrate_ready = match substrate {
                Some((current, ready)) if current == letter => ready,
                _ => {
                    let ready = match self.collab.selector.setup_substrate(letter) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("Substrate {} setup failed, skipping its pixels: {}", letter, e);
                            false
                        }
                    };
                    substrate = Some((letter, ready));
                    ready
                }
            };
            if !substrate_ready {
                warn!("Skipping {}: substrate {} not set up", address, letter);
                summary.skipped += 1;
                continue;
            }

            match self.collab.selector.select_pixel(address) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Skipping {}: pixel not ready", address);
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Skipping {}: pixel selection failed: {}", address, e);
                    summary.skipped += 1;
                    continue;
                }
            }

            let (record, failure) = self.measure_pixel(address);
            if record.complete {
                summary.completed += 1;
            } else {
                summary.partial += 1;
            }
            self.collab.sink.pixel_complete(&record)?;

            if let Some(e) = failure.filter(DaqError::is_fatal) {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run the phases for one pixel and finalize its record, partial or not.
    fn measure_pixel(&mut self, address: PixelAddress) -> (PixelRecord, Option<DaqError>) {
        info!("Measuring pixel {}", address);
        let mut record = PixelRecord::new(address, &self.config.operator);

        let outcome = self.run_phases(&mut record);

        self.enter(PixelPhase::Complete);
        if let Err(e) = self.smu.set_output(false) {
            warn!("Output off after {} failed: {}", address, e);
        }
        let failure = outcome.err();
        if let Some(e) = &failure {
            warn!("Pixel {} stopped early: {}", address, e);
        }
        record.finalize(failure.as_ref().map(ToString::to_string));
        (record, failure)
    }

    fn run_phases(&mut self, record: &mut PixelRecord) -> AppResult<()> {
        let cfg = self.config;
        let mut compliance = cfg.current_compliance_override.unwrap_or(cfg.compliance_guess);
        record.compliance = Some(compliance);

        // Open circuit: source 0 A, sense voltage.
        self.enter(PixelPhase::PreBias);
        self.smu.set_integration_time(cfg.dwell_nplc)?;
        self.smu
            .configure_dc_level(false, cfg.voc_compliance, 0.0, SenseRange::Auto)?;
        let batch = self.dwell(PhaseLabel::VocDwell)?;
        let voc = batch
            .last()
            .map(|s| s.voltage)
            .ok_or_else(|| DaqError::Bus("open-circuit dwell returned no samples".into()))?;
        record.voc = Some(voc);
        info!("{}: Voc = {:.6} V", record.address, voc);
        self.publish(record, batch);

        let mut vmpp = None;

        if cfg.sweep {
            self.enter(PixelPhase::Sweep);
            let spec = SweepSpec {
                step_delay: cfg.step_delay,
                ..SweepSpec::voltage(
                    compliance,
                    cfg.scan_points,
                    cfg.scan_high_override.unwrap_or(voc),
                    cfg.scan_low_override.unwrap_or(0.0),
                )
            };
            let (batch, mpp) = self.sweep(record, &spec, PhaseLabel::Sweep)?;
            if let Some(mpp) = mpp {
                vmpp = Some(mpp.vmpp);
            }
            if let Some(last) = batch.last() {
                compliance = compliance_after_sweep(last.current, cfg.current_compliance_override);
                record.compliance = Some(compliance);
            }
            self.publish(record, batch);
        }

        // Short circuit: source 0 V, sense current.
        self.enter(PixelPhase::SteadyStateIsc);
        self.smu.set_integration_time(cfg.dwell_nplc)?;
        self.smu
            .configure_dc_level(true, compliance, 0.0, SenseRange::Auto)?;
        let batch = self.dwell(PhaseLabel::IscDwell)?;
        let isc = batch
            .last()
            .map(|s| s.current)
            .ok_or_else(|| DaqError::Bus("short-circuit dwell returned no samples".into()))?;
        record.isc = Some(isc);
        compliance = compliance_after_isc(isc, cfg.current_compliance_override);
        record.compliance = Some(compliance);
        info!(
            "{}: Isc = {:.6e} A, compliance now {:.3e} A",
            record.address, isc, compliance
        );
        self.publish(record, batch);

        if cfg.snaith {
            self.enter(PixelPhase::Snaith);
            let spec = SweepSpec {
                step_delay: cfg.step_delay,
                ..SweepSpec::voltage(
                    compliance,
                    cfg.scan_points,
                    cfg.scan_low_override.unwrap_or(0.0),
                    cfg.scan_high_override
                        .unwrap_or(voc * (1.0 + cfg.percent_beyond_voc / 100.0)),
                )
            };
            let (batch, mpp) = self.sweep(record, &spec, PhaseLabel::Snaith)?;
            if let Some(mpp) = mpp {
                vmpp = Some(mpp.vmpp);
            }
            self.publish(record, batch);
        }

        if !cfg.mppt.is_zero() {
            self.enter(PixelPhase::Mppt);
            let samples = self
                .collab
                .tracker
                .track(&mut *self.smu, vmpp, compliance, cfg.mppt)?;
            self.publish(record, SampleBatch::new(PhaseLabel::Mppt, samples));
        }

        Ok(())
    }

    fn enter(&mut self, phase: PixelPhase) {
        info!("{} -> {}", self.phase, phase);
        self.phase = phase;
    }

    fn dwell(&mut self, label: PhaseLabel) -> AppResult<SampleBatch> {
        let samples = self.smu.read_many(
            self.config.t_prebias,
            self.config.max_dwell_samples,
            &mut |_| {},
        )?;
        Ok(SampleBatch::new(label, samples))
    }

    /// Run one sweep and extract its maximum power point into the record.
    fn sweep(
        &mut self,
        record: &mut PixelRecord,
        spec: &SweepSpec,
        label: PhaseLabel,
    ) -> AppResult<(SampleBatch, Option<MaxPowerPoint>)> {
        self.smu.set_integration_time(self.config.scan_nplc)?;
        let samples = self.smu.run_sweep(spec)?;
        let mpp = which_max_power(&samples);
        if let Some(mpp) = &mpp {
            info!(
                "{} {}: Pmax = {:.4e} W at {:.4} V, {:.4e} A",
                record.address, label, mpp.pmax, mpp.vmpp, mpp.impp
            );
            record.set_max_power_point(mpp);
        }
        Ok((SampleBatch::new(label, samples), mpp))
    }

    /// Attach a finished batch to the record and offer it to the optional integrations.
    fn publish(&mut self, record: &mut PixelRecord, batch: SampleBatch) {
        let address = record.address;
        if let Some(notifier) = self.collab.notifier.as_mut() {
            if let Err(e) = notifier.notify(address, &batch) {
                warn!("Notifier dropped {} {}: {}", address, batch.phase, e);
            }
        }
        if let (Some(archiver), Some(destination)) =
            (self.collab.archiver.as_mut(), self.config.archive_address.as_deref())
        {
            if let Err(e) = archiver.upload(destination, address, &batch) {
                warn!("Archive upload of {} {} failed: {}", address, batch.phase, e);
            }
        }
        record.batches.push(batch);
    }

    fn teardown(&mut self) {
        if let Err(e) = self.smu.set_output(false) {
            warn!("Output off at end of run failed: {}", e);
        }
        if let Err(e) = self.collab.light.off() {
            warn!("Light source did not turn off: {}", e);
        }
        if let Err(e) = self.collab.selector.release() {
            warn!("Relay release failed: {}", e);
        }
        if let Err(e) = self.collab.sink.run_done() {
            error!("Data sink did not close cleanly: {}", e);
        }
    }
}
