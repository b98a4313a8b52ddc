//! iv_daq command-line interface.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use iv_daq::adapters::VisaAdapter;
use iv_daq::config::Settings;
use iv_daq::instrument::{ConnectionParameters, DummySourceMeter, InstrumentLink, Keithley2400, SourceMeter};
use iv_daq::orchestrator::{
    Archiver, ChannelNotifier, Collaborators, ConstantVoltageHold, DataSink, DirectoryArchiver,
    JsonLinesSink, MeasurementOrchestrator, NoLight, Notifier, RunConfig, StaticSelector,
};
use iv_daq::pixel::{queue_from_str, substrates_to_test, PixelQueue, SubstrateSet};

#[derive(Parser)]
#[command(name = "iv_daq")]
#[command(about = "Current-voltage characterization of solar-cell substrates", long_about = None)]
#[command(version)]
struct Cli {
    /// Operator name recorded with every pixel
    #[arg(value_name = "OPERATOR")]
    operator: Option<String>,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Pixels to measure: 0x-prefixed bitmask or a list like A1A2B3
    #[arg(long)]
    pixel_address: Option<String>,

    /// Run the descending sweep
    #[arg(long)]
    sweep: Option<bool>,

    /// Run the ascending sweep past Voc
    #[arg(long)]
    snaith: Option<bool>,

    /// Dwell length in seconds
    #[arg(long)]
    t_prebias: Option<f64>,

    /// Power-point tracking duration in seconds, 0 disables
    #[arg(long)]
    mppt: Option<f64>,

    /// Points per sweep
    #[arg(long)]
    scan_points: Option<u32>,

    /// Integration time during sweeps, in power-line cycles
    #[arg(long)]
    scan_nplc: Option<f64>,

    /// Fixed current compliance in amps
    #[arg(long)]
    current_compliance_override: Option<f64>,

    /// Fixed low sweep limit in volts
    #[arg(long)]
    scan_low_override: Option<f64>,

    /// Fixed high sweep limit in volts
    #[arg(long)]
    scan_high_override: Option<f64>,

    /// Source-measure unit address, e.g. GPIB0::24::INSTR or ASRL/dev/ttyUSB0::INSTR
    #[arg(long)]
    sm_address: Option<String>,

    /// Command terminator as hex, e.g. 0A
    #[arg(long)]
    sm_terminator: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    sm_baud: Option<u32>,

    /// Backend tried first: visa or native
    #[arg(long)]
    backend: Option<String>,

    /// Use the rear terminals
    #[arg(long)]
    rear: Option<bool>,

    /// Remote (4-wire) sensing
    #[arg(long)]
    four_wire: Option<bool>,

    /// Simulate the instrument and measure A1 only
    #[arg(long)]
    dummy: bool,

    /// List serial ports and VISA resources, then exit
    #[arg(long)]
    scan: bool,

    /// Check relays, light and instrument on the addressed (or all connected)
    /// substrates instead of measuring
    #[arg(long)]
    test_hardware: bool,

    /// Write records as JSON lines here instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

fn put<T: Serialize>(map: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value.and_then(|v| serde_json::to_value(v).ok()) {
        map.insert(key.to_string(), value);
    }
}

impl Cli {
    /// Command-line values as the top configuration layer.
    fn overrides(&self) -> Value {
        let mut instrument = Map::new();
        put(&mut instrument, "address", self.sm_address.clone());
        put(&mut instrument, "terminator_hex", self.sm_terminator.clone());
        put(&mut instrument, "baud_rate", self.sm_baud);
        put(&mut instrument, "backend", self.backend.as_ref().map(|b| b.to_ascii_lowercase()));
        put(&mut instrument, "front_terminals", self.rear.map(|rear| !rear));
        put(&mut instrument, "four_wire", self.four_wire);

        let mut measurement = Map::new();
        put(&mut measurement, "sweep", self.sweep);
        put(&mut measurement, "snaith", self.snaith);
        put(&mut measurement, "t_prebias_s", self.t_prebias);
        put(&mut measurement, "mppt_s", self.mppt);
        put(&mut measurement, "scan_points", self.scan_points);
        put(&mut measurement, "scan_nplc", self.scan_nplc);
        put(&mut measurement, "current_compliance_override", self.current_compliance_override);
        put(&mut measurement, "scan_low_override", self.scan_low_override);
        put(&mut measurement, "scan_high_override", self.scan_high_override);

        let mut fixture = Map::new();
        put(&mut fixture, "pixel_address", self.pixel_address.clone());

        serde_json::json!({
            "instrument": instrument,
            "measurement": measurement,
            "fixture": fixture,
        })
    }
}

fn scan_resources() -> Result<()> {
    #[cfg(feature = "instrument_serial")]
    {
        let ports = serialport::available_ports().context("listing serial ports")?;
        for port in ports {
            println!("{}\t{:?}", port.port_name, port.port_type);
        }
    }
    match VisaAdapter::list_resources() {
        Ok(resources) => resources.iter().for_each(|r| println!("{}", r)),
        Err(e) => info!("VISA scan skipped: {}", e),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_with(cli.config.as_deref(), cli.overrides())
        .context("loading configuration")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.application.log_level.as_str()),
    )
    .init();

    if cli.scan {
        return scan_resources();
    }

    let operator = cli
        .operator
        .as_deref()
        .context("an operator name is required")?;

    let connected = SubstrateSet::from_letters(&settings.fixture.connected_substrates);
    let address_spec = if cli.dummy {
        Some("A1".to_string())
    } else {
        settings.fixture.pixel_address.clone()
    };
    let queue = match address_spec {
        Some(spec) => queue_from_str(&spec, &connected).context("parsing the pixel address")?,
        None if cli.test_hardware => PixelQueue::new(),
        None => anyhow::bail!("no pixel address given (use --pixel-address or fixture.pixel_address)"),
    };
    if !cli.test_hardware {
        info!("{} pixel(s) to measure for {}", queue.len(), operator);
    }

    let mut smu: Box<dyn SourceMeter> = if cli.dummy {
        info!("Dummy mode: simulated source-measure unit");
        Box::new(DummySourceMeter::new())
    } else {
        let params = ConnectionParameters::from_settings(&settings.instrument)?;
        let link = InstrumentLink::open(params, settings.instrument.backend)
            .context("opening the source-measure unit")?;
        Box::new(
            Keithley2400::connect(
                link,
                Duration::from_millis(settings.instrument.acquisition_timeout_ms),
            )
            .context("identifying the source-measure unit")?,
        )
    };

    let mut sink: Box<dyn DataSink> = match &cli.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("creating output file {}", path.display()))?;
            Box::new(JsonLinesSink::new(BufWriter::new(file)))
        }
        None => Box::new(JsonLinesSink::new(io::stdout())),
    };

    let mut notifier = if settings.integrations.notify {
        let (notifier, rx) = ChannelNotifier::bounded(64);
        thread::spawn(move || {
            for (address, batch) in rx {
                info!("notify: {} {} ({} samples)", address, batch.phase, batch.samples.len());
            }
        });
        Some(notifier)
    } else {
        None
    };
    let mut archiver = settings
        .integrations
        .archive_address
        .as_ref()
        .map(|_| DirectoryArchiver::new(operator));

    let config = RunConfig::from_settings(&settings, operator);
    let mut selector = StaticSelector::new(connected.clone());
    let mut light = NoLight;
    let mut tracker = ConstantVoltageHold::new(settings.measurement.max_dwell_samples);

    let collaborators = Collaborators {
        selector: &mut selector,
        light: &mut light,
        sink: sink.as_mut(),
        tracker: &mut tracker,
        notifier: notifier.as_mut().map(|n| n as &mut dyn Notifier),
        archiver: archiver.as_mut().map(|a| a as &mut dyn Archiver),
    };

    let mut orchestrator = MeasurementOrchestrator::new(&config, smu.as_mut(), collaborators);

    if cli.test_hardware {
        let substrates = substrates_to_test(&queue, &connected);
        let report = orchestrator
            .test_hardware(&substrates)
            .context("hardware check aborted")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.all_ok() {
            anyhow::bail!("hardware check found problems");
        }
        return Ok(());
    }

    let summary = orchestrator.run(queue).context("measurement run aborted")?;

    if summary.partial > 0 || summary.skipped > 0 {
        warn!(
            "{} pixel(s) partial, {} skipped",
            summary.partial, summary.skipped
        );
    }
    info!("{} pixel(s) measured completely", summary.completed);
    Ok(())
}
