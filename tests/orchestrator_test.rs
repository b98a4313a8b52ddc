//! Full runs against the Keithley driver over a scripted adapter.

use std::time::Duration;

use iv_daq::adapters::{CommandLog, MockAdapter};
use iv_daq::config::Settings;
use iv_daq::instrument::{ConnectionParameters, InstrumentLink, Keithley2400};
use iv_daq::instrument::SourceMeter;
use iv_daq::measurement::{PhaseLabel, PixelRecord, Sample};
use iv_daq::orchestrator::{
    ChannelNotifier, Collaborators, ConstantVoltageHold, DataSink, MeasurementOrchestrator,
    MemorySink, NoLight, Notifier, PowerTracker, RunConfig, RunSummary, StaticSelector,
};
use iv_daq::pixel::{queue_from_str, PixelAddress, SubstrateSet};
use iv_daq::{AppResult, DaqError};

fn config(sweep: bool) -> RunConfig {
    let mut settings = Settings::default();
    settings.measurement.sweep = sweep;
    settings.measurement.snaith = false;
    settings.measurement.t_prebias_s = 0.0;
    settings.measurement.mppt_s = 0.0;
    settings.measurement.scan_points = 3;
    settings.measurement.max_dwell_samples = Some(1);
    RunConfig::from_settings(&settings, "tester")
}

fn scripted() -> (MockAdapter, CommandLog) {
    let (mock, log) = MockAdapter::new();
    let mock = mock
        .with_response("*IDN?", "KEITHLEY INSTRUMENTS INC.,MODEL 2400,4089023,C32")
        .with_response(":source:function:mode?", "VOLT")
        .with_response(":read?", "9.0E-01,-2.0E-02,5.0E-01,0")
        .with_response(":source:voltage:step?", "-4.500000E-01")
        .with_response("*OPC?", "1")
        .with_response(
            ":fetch?",
            "9.0E-01,0.0E+00,1.0E-01,0,4.5E-01,-1.8E-02,2.0E-01,0,0.0E+00,-2.0E-02,3.0E-01,0",
        );
    (mock, log)
}

fn keithley(mock: MockAdapter) -> Keithley2400 {
    let params = ConnectionParameters::new("ASRL1::INSTR", "\n", 57600, Duration::from_millis(300));
    let link = InstrumentLink::with_adapter(params, Box::new(mock)).unwrap();
    Keithley2400::connect(link, Duration::from_secs(50)).unwrap()
}

fn run(
    config: &RunConfig,
    smu: &mut Keithley2400,
    selector: &mut StaticSelector,
    sink: &mut dyn DataSink,
    notifier: Option<&mut ChannelNotifier>,
    pixels: &str,
) -> AppResult<RunSummary> {
    let mut tracker = ConstantVoltageHold::default();
    run_tracked(config, smu, selector, sink, notifier, &mut tracker, pixels)
}

fn run_tracked(
    config: &RunConfig,
    smu: &mut Keithley2400,
    selector: &mut StaticSelector,
    sink: &mut dyn DataSink,
    notifier: Option<&mut ChannelNotifier>,
    tracker: &mut dyn PowerTracker,
    pixels: &str,
) -> AppResult<RunSummary> {
    let connected = SubstrateSet::from_letters("A");
    let mut light = NoLight;
    MeasurementOrchestrator::new(
        config,
        smu,
        Collaborators {
            selector,
            light: &mut light,
            sink,
            tracker,
            notifier: notifier.map(|n| n as &mut dyn Notifier),
            archiver: None,
        },
    )
    .run(queue_from_str(pixels, &connected)?)
}

fn a(pixel: u8) -> PixelAddress {
    PixelAddress::new('A', pixel).unwrap()
}

#[test]
fn unready_pixel_sends_nothing_and_queue_advances() {
    let (mock, log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A")).with_unready_pixel(a(1));
    let mut sink = MemorySink::default();
    log.clear();

    let summary = run(&config(true), &mut smu, &mut selector, &mut sink, None, "A1").unwrap();

    assert_eq!(summary, RunSummary { completed: 0, partial: 0, skipped: 1 });
    assert_eq!(log.count(":read?"), 0);
    assert_eq!(log.count(":source:sweep:points 3"), 0);
    assert!(sink.records.is_empty());
    assert!(sink.finished);

    let summary = run(&config(true), &mut smu, &mut selector, &mut sink, None, "A1A2").unwrap();

    assert_eq!(summary, RunSummary { completed: 1, partial: 0, skipped: 1 });
    assert_eq!(selector.selections(), &[a(2)]);
    assert_eq!(sink.records.len(), 1);
    assert_eq!(sink.records[0].address, a(2));
}

#[test]
fn complete_pixel_record() {
    let (mock, log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = MemorySink::default();

    let summary = run(&config(true), &mut smu, &mut selector, &mut sink, None, "A1").unwrap();

    assert_eq!(summary.completed, 1);
    let record = &sink.records[0];
    assert!(record.complete);
    assert_eq!(record.voc, Some(0.9));
    assert_eq!(record.isc, Some(-0.02));
    assert_eq!(record.vmpp, Some(0.45));
    assert!((record.compliance.unwrap() - 0.04).abs() < 1e-12);
    assert_eq!(record.batch(PhaseLabel::Sweep).unwrap().samples.len(), 3);
    assert_eq!(log.count(":source:voltage:start 0.900000"), 1);
    assert_eq!(log.count(":source:voltage:stop 0.000000"), 1);
    assert!(log.position(":rout:term rear").is_some());
    assert_eq!(log.count(":rout:term front"), 0);
    assert_eq!(log.entries().last().map(String::as_str), Some(":output off"));
}

#[test]
fn bus_failure_mid_pixel_delivers_partial_record() {
    let (mock, log) = scripted();
    let mut smu = keithley(mock.failing_on(":init"));
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = MemorySink::default();

    let summary = run(&config(true), &mut smu, &mut selector, &mut sink, None, "A1A2").unwrap();

    assert_eq!(summary, RunSummary { completed: 0, partial: 2, skipped: 0 });
    let record = &sink.records[0];
    assert!(!record.complete);
    assert!(record.error.as_deref().unwrap().contains(":init"));
    assert_eq!(record.voc, Some(0.9));
    assert!(record.batch(PhaseLabel::VocDwell).is_some());
    assert!(record.batch(PhaseLabel::Sweep).is_none());
    assert!(record.isc.is_none());

    let init = log.position(":init").unwrap();
    assert!(log.entries()[init..].iter().any(|c| c == ":output off"));
    assert_eq!(log.count("*TRG"), 0);
    assert!(sink.finished);
}

#[test]
fn dropped_notifier_does_not_stop_the_run() {
    let (mock, _log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = MemorySink::default();
    let (mut notifier, rx) = ChannelNotifier::bounded(1);
    drop(rx);

    let summary = run(
        &config(false),
        &mut smu,
        &mut selector,
        &mut sink,
        Some(&mut notifier),
        "A1",
    )
    .unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(sink.records[0].batches.len(), 2);
}

#[test]
fn notifier_sees_each_batch() {
    let (mock, _log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = MemorySink::default();
    let (mut notifier, rx) = ChannelNotifier::bounded(8);

    run(&config(true), &mut smu, &mut selector, &mut sink, Some(&mut notifier), "A1").unwrap();

    let phases: Vec<PhaseLabel> = rx.try_iter().map(|(_, batch)| batch.phase).collect();
    assert_eq!(
        phases,
        vec![PhaseLabel::VocDwell, PhaseLabel::Sweep, PhaseLabel::IscDwell]
    );
}

#[derive(Default)]
struct RefusingSink {
    closed: bool,
}

impl DataSink for RefusingSink {
    fn pixel_complete(&mut self, _record: &PixelRecord) -> AppResult<()> {
        Err(DaqError::Collaborator("disk full".into()))
    }

    fn run_done(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[test]
fn sink_failure_aborts_but_still_tears_down() {
    let (mock, log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = RefusingSink::default();

    let err = run(&config(false), &mut smu, &mut selector, &mut sink, None, "A1A2").unwrap_err();

    assert!(matches!(err, DaqError::Collaborator(_)));
    assert_eq!(selector.selections(), &[a(1)]);
    assert!(sink.closed);
    assert_eq!(log.entries().last().map(String::as_str), Some(":output off"));
}

#[test]
fn bitmask_skips_disconnected_substrates() {
    let queue = queue_from_str("0x80", &SubstrateSet::from_letters("AB")).unwrap();
    assert_eq!(queue.into_iter().collect::<Vec<_>>(), vec![a(1)]);
}

#[test]
fn front_terminals_follow_the_config() {
    let (mock, log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = MemorySink::default();
    let config = RunConfig {
        front_terminals: true,
        ..config(false)
    };

    run(&config, &mut smu, &mut selector, &mut sink, None, "A1").unwrap();

    assert_eq!(log.count(":rout:term front"), 1);
    assert_eq!(log.count(":rout:term rear"), 0);
}

#[test]
fn snaith_sweeps_from_zero_past_voc() {
    let (mock, log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = MemorySink::default();
    let config = RunConfig {
        snaith: true,
        ..config(false)
    };

    run(&config, &mut smu, &mut selector, &mut sink, None, "A1").unwrap();

    // Voc = 0.9 V, 25 % beyond
    assert_eq!(log.count(":source:voltage:start 0.000000"), 1);
    assert_eq!(log.count(":source:voltage:stop 1.125000"), 1);
    let record = &sink.records[0];
    assert!(record.complete);
    assert!(record.batch(PhaseLabel::Snaith).is_some());
    assert!(
        record.batches.iter().position(|b| b.phase == PhaseLabel::IscDwell)
            < record.batches.iter().position(|b| b.phase == PhaseLabel::Snaith)
    );
}

#[test]
fn scan_limit_overrides_apply_to_both_sweeps() {
    let (mock, log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = MemorySink::default();
    let config = RunConfig {
        snaith: true,
        scan_low_override: Some(-0.1),
        scan_high_override: Some(1.2),
        ..config(true)
    };

    run(&config, &mut smu, &mut selector, &mut sink, None, "A1").unwrap();

    // descending sweep
    assert_eq!(log.count(":source:voltage:start 1.200000"), 1);
    assert_eq!(log.count(":source:voltage:stop -0.100000"), 1);
    // ascending sweep
    assert_eq!(log.count(":source:voltage:start -0.100000"), 1);
    assert_eq!(log.count(":source:voltage:stop 1.200000"), 1);
    assert_eq!(log.count(":source:voltage:start 0.900000"), 0);
}

/// Tracker that records what it was handed and takes no readings.
#[derive(Default)]
struct RecordingTracker {
    calls: Vec<(Option<f64>, f64, Duration)>,
}

impl PowerTracker for RecordingTracker {
    fn track(
        &mut self,
        _smu: &mut dyn SourceMeter,
        seed_voltage: Option<f64>,
        compliance: f64,
        duration: Duration,
    ) -> AppResult<Vec<Sample>> {
        self.calls.push((seed_voltage, compliance, duration));
        Ok(Vec::new())
    }
}

fn tracked_config(sweep: bool, snaith: bool) -> RunConfig {
    RunConfig {
        snaith,
        mppt: Duration::from_millis(5),
        ..config(sweep)
    }
}

#[test]
fn tracking_is_seeded_from_the_latest_sweep() {
    const SWEEP: &str =
        "9.0E-01,0.0E+00,1.0E-01,0,4.5E-01,-1.8E-02,2.0E-01,0,0.0E+00,-2.0E-02,3.0E-01,0";
    const SNAITH: &str =
        "0.0E+00,-2.0E-02,4.0E-01,0,6.0E-01,-1.7E-02,5.0E-01,0,1.125E+00,5.0E-03,6.0E-01,0";

    // both sweeps: the ascending one ran last
    let (mock, _log) = scripted();
    let mut smu = keithley(mock.with_responses(":fetch?", &[SWEEP, SNAITH]));
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A"));
    let mut sink = MemorySink::default();
    let mut tracker = RecordingTracker::default();
    let config = tracked_config(true, true);
    run_tracked(&config, &mut smu, &mut selector, &mut sink, None, &mut tracker, "A1").unwrap();

    assert_eq!(tracker.calls.len(), 1);
    let (seed, compliance, duration) = tracker.calls[0];
    assert_eq!(seed, Some(0.6));
    assert!((compliance - 0.04).abs() < 1e-12);
    assert_eq!(duration, Duration::from_millis(5));
    assert_eq!(sink.records[0].vmpp, Some(0.6));
    assert!(sink.records[0].batch(PhaseLabel::Mppt).is_some());

    // descending sweep only
    let (mock, _log) = scripted();
    let mut smu = keithley(mock.with_responses(":fetch?", &[SWEEP]));
    let mut tracker = RecordingTracker::default();
    let config = tracked_config(true, false);
    run_tracked(&config, &mut smu, &mut selector, &mut sink, None, &mut tracker, "A1").unwrap();
    assert_eq!(tracker.calls[0].0, Some(0.45));

    // no sweep at all
    let (mock, _log) = scripted();
    let mut smu = keithley(mock);
    let mut tracker = RecordingTracker::default();
    let config = tracked_config(false, false);
    run_tracked(&config, &mut smu, &mut selector, &mut sink, None, &mut tracker, "A1").unwrap();
    assert_eq!(tracker.calls[0].0, None);
}

#[test]
fn hardware_check_reads_each_ready_pixel_without_scanning() {
    let (mock, log) = scripted();
    let mut smu = keithley(mock);
    let mut selector = StaticSelector::new(SubstrateSet::from_letters("A")).with_unready_pixel(a(8));
    let mut sink = MemorySink::default();
    let mut light = NoLight;
    let mut tracker = ConstantVoltageHold::default();
    let config = config(true);
    log.clear();

    let report = MeasurementOrchestrator::new(
        &config,
        &mut smu,
        Collaborators {
            selector: &mut selector,
            light: &mut light,
            sink: &mut sink,
            tracker: &mut tracker,
            notifier: None,
            archiver: None,
        },
    )
    .test_hardware(&['A'])
    .unwrap();

    assert_eq!(report.substrates.len(), 1);
    let pixels = &report.substrates[0].pixels;
    assert_eq!(pixels.len(), 8);
    assert!(pixels[..7].iter().all(|p| p.voltage == Some(0.9)));
    assert!(!pixels[7].ready);
    assert!(!report.all_ok());

    assert_eq!(log.count(":read?"), 7);
    assert_eq!(log.count(":init"), 0);
    assert_eq!(log.count(":source:sweep:points 3"), 0);
    assert!(sink.records.is_empty());
    assert!(sink.finished);
    assert_eq!(log.entries().last().map(String::as_str), Some(":output off"));
}
