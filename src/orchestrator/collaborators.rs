//! Narrow interfaces to everything around the measurement core.
//!
//! The relay board, light source, data storage, remote notification, archival,
//! and the power-point tracking algorithm all live behind these traits. The
//! implementations here are the small ones the crate needs to run on its own.

use chrono::Utc;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::instrument::SourceMeter;
use crate::measurement::{PixelRecord, Sample, SampleBatch, SenseRange};
use crate::pixel::{PixelAddress, SubstrateSet};

/// Substrate and pixel relay control.
pub trait PixelSelector {
    /// One-time setup when the scan moves onto a new substrate.
    fn setup_substrate(&mut self, substrate: char) -> AppResult<()>;

    /// Route the source-measure unit to `address`; `false` means not ready.
    fn select_pixel(&mut self, address: PixelAddress) -> AppResult<bool>;

    /// Disconnect everything at the end of a run.
    fn release(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// External light source.
pub trait LightSource {
    /// Illuminate.
    fn on(&mut self) -> AppResult<()>;

    /// Stop illuminating.
    fn off(&mut self) -> AppResult<()>;

    /// Apply reference-diode ADC counts for intensity calibration.
    fn apply_calibration(&mut self, diode_counts: (u32, u32)) -> AppResult<()> {
        let _ = diode_counts;
        Ok(())
    }
}

/// Where finalized pixel records go.
pub trait DataSink {
    /// A pixel is done, completely or partially.
    fn pixel_complete(&mut self, record: &PixelRecord) -> AppResult<()>;

    /// No more pixels will arrive.
    fn run_done(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Fire-and-forget push of finished batches. Must not block.
pub trait Notifier {
    /// Offer a copy of one batch.
    fn notify(&mut self, address: PixelAddress, batch: &SampleBatch) -> AppResult<()>;
}

/// Off-site archival of finished batches.
pub trait Archiver {
    /// Upload one batch to `destination`.
    fn upload(&mut self, destination: &str, address: PixelAddress, batch: &SampleBatch) -> AppResult<()>;
}

/// Maximum-power-point tracking algorithm.
pub trait PowerTracker {
    /// Track for `duration` starting from `seed_voltage` (0 V when unknown) and
    /// return the time-ordered samples taken.
    fn track(
        &mut self,
        smu: &mut dyn SourceMeter,
        seed_voltage: Option<f64>,
        compliance: f64,
        duration: Duration,
    ) -> AppResult<Vec<Sample>>;
}

/// Relay stand-in with a fixed substrate set.
#[derive(Debug, Clone, Default)]
pub struct StaticSelector {
    connected: SubstrateSet,
    not_ready: Vec<PixelAddress>,
    broken_substrates: Vec<char>,
    selections: Vec<PixelAddress>,
}

impl StaticSelector {
    /// Every pixel on a connected substrate is ready.
    pub fn new(connected: SubstrateSet) -> Self {
        Self {
            connected,
            ..Self::default()
        }
    }

    /// Report `address` as not ready.
    pub fn with_unready_pixel(mut self, address: PixelAddress) -> Self {
        self.not_ready.push(address);
        self
    }

    /// Fail setup of `substrate`.
    pub fn with_broken_substrate(mut self, substrate: char) -> Self {
        self.broken_substrates.push(substrate.to_ascii_uppercase());
        self
    }

    /// Pixels selected so far, in order.
    pub fn selections(&self) -> &[PixelAddress] {
        &self.selections
    }
}

impl PixelSelector for StaticSelector {
    fn setup_substrate(&mut self, substrate: char) -> AppResult<()> {
        if !self.connected.contains(substrate) || self.broken_substrates.contains(&substrate) {
            return Err(DaqError::Collaborator(format!(
                "substrate {} is not available",
                substrate
            )));
        }
        Ok(())
    }

    fn select_pixel(&mut self, address: PixelAddress) -> AppResult<bool> {
        if self.not_ready.contains(&address) {
            return Ok(false);
        }
        self.selections.push(address);
        Ok(true)
    }
}

/// Light source that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLight;

impl LightSource for NoLight {
    fn on(&mut self) -> AppResult<()> {
        debug!("no light source configured");
        Ok(())
    }

    fn off(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Keeps finalized records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    /// Records in completion order.
    pub records: Vec<PixelRecord>,
    /// `run_done` was called.
    pub finished: bool,
}

impl DataSink for MemorySink {
    fn pixel_complete(&mut self, record: &PixelRecord) -> AppResult<()> {
        self.records.push(record.clone());
        Ok(())
    }

    fn run_done(&mut self) -> AppResult<()> {
        self.finished = true;
        Ok(())
    }
}

/// Writes one JSON object per record.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    /// Sink over any writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Give the writer back.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> DataSink for JsonLinesSink<W> {
    fn pixel_complete(&mut self, record: &PixelRecord) -> AppResult<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| DaqError::Io(e.into()))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn run_done(&mut self) -> AppResult<()> {
        Ok(self.writer.flush()?)
    }
}

/// Notifier over a bounded channel; never waits for the receiver.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: SyncSender<(PixelAddress, SampleBatch)>,
}

impl ChannelNotifier {
    /// Notifier plus the receiving end, holding at most `capacity` batches.
    pub fn bounded(capacity: usize) -> (Self, Receiver<(PixelAddress, SampleBatch)>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity);
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&mut self, address: PixelAddress, batch: &SampleBatch) -> AppResult<()> {
        self.tx
            .try_send((address, batch.clone()))
            .map_err(|e| match e {
                TrySendError::Full(_) => DaqError::Collaborator("notifier queue full".into()),
                TrySendError::Disconnected(_) => {
                    DaqError::Collaborator("notifier receiver gone".into())
                }
            })
    }
}

/// Archiver that writes each batch as a JSON file under the destination directory.
///
/// Files land in `<destination>/<operator>/<pixel>-<phase>-<UTC timestamp>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryArchiver {
    operator: String,
}

impl DirectoryArchiver {
    /// Archiver filing batches under `operator`.
    pub fn new(operator: &str) -> Self {
        Self {
            operator: operator.to_string(),
        }
    }

    fn target(&self, destination: &str, address: PixelAddress, batch: &SampleBatch) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        Path::new(destination)
            .join(&self.operator)
            .join(format!("{}-{:?}-{}.json", address, batch.phase, stamp))
    }
}

impl Archiver for DirectoryArchiver {
    fn upload(&mut self, destination: &str, address: PixelAddress, batch: &SampleBatch) -> AppResult<()> {
        let path = self.target(destination, address, batch);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, batch).map_err(|e| DaqError::Collaborator(e.to_string()))?;
        writer.flush()?;
        debug!("archived {} {} to {}", address, batch.phase, path.display());
        Ok(())
    }
}

/// Holds the seed voltage and records for the whole duration.
///
/// Satisfies the tracker contract without doing any tracking.
#[derive(Debug, Clone, Default)]
pub struct ConstantVoltageHold {
    max_samples: Option<usize>,
}

impl ConstantVoltageHold {
    /// Hold, optionally bounding the number of samples.
    pub fn new(max_samples: Option<usize>) -> Self {
        Self { max_samples }
    }
}

impl PowerTracker for ConstantVoltageHold {
    fn track(
        &mut self,
        smu: &mut dyn SourceMeter,
        seed_voltage: Option<f64>,
        compliance: f64,
        duration: Duration,
    ) -> AppResult<Vec<Sample>> {
        let voltage = seed_voltage.unwrap_or(0.0);
        info!("Holding {:.4} V for {:.1} s", voltage, duration.as_secs_f64());
        smu.configure_dc_level(true, compliance, voltage, SenseRange::Auto)?;
        smu.read_many(duration, self.max_samples, &mut |_| {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{PhaseLabel, StatusWord};

    fn address(token: &str) -> PixelAddress {
        token.parse().unwrap()
    }

    #[test]
    fn test_static_selector_gates() {
        let mut selector = StaticSelector::new(SubstrateSet::from_letters("AB"))
            .with_unready_pixel(address("A2"))
            .with_broken_substrate('b');

        assert!(selector.setup_substrate('A').is_ok());
        assert!(selector.setup_substrate('B').is_err());
        assert!(selector.setup_substrate('C').is_err());
        assert!(selector.select_pixel(address("A1")).unwrap());
        assert!(!selector.select_pixel(address("A2")).unwrap());
        assert_eq!(selector.selections(), &[address("A1")]);
    }

    #[test]
    fn test_channel_notifier_never_blocks() {
        let (mut notifier, rx) = ChannelNotifier::bounded(1);
        let batch = SampleBatch::new(PhaseLabel::Sweep, vec![]);

        notifier.notify(address("A1"), &batch).unwrap();
        assert!(matches!(
            notifier.notify(address("A2"), &batch),
            Err(DaqError::Collaborator(_))
        ));

        let (first, _) = rx.recv().unwrap();
        assert_eq!(first, address("A1"));
        drop(rx);
        assert!(notifier.notify(address("A3"), &batch).is_err());
    }

    #[test]
    fn test_directory_archiver_files_batches_per_operator() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().to_str().unwrap();
        let batch = SampleBatch::new(
            PhaseLabel::Sweep,
            vec![Sample::new(0.1, 0.5, -0.01, StatusWord::default())],
        );

        let mut archiver = DirectoryArchiver::new("ada");
        archiver.upload(destination, address("B2"), &batch).unwrap();

        let files: Vec<_> = fs::read_dir(dir.path().join("ada")).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("B2-Sweep-"));
        let text = fs::read_to_string(path).unwrap();
        let restored: SampleBatch = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, batch);
    }

    #[test]
    fn test_json_lines_sink_writes_one_line_per_record() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let mut record = PixelRecord::new(address("C4"), "ada");
        record.batches.push(SampleBatch::new(
            PhaseLabel::IscDwell,
            vec![Sample::new(0.0, 0.0, -0.02, StatusWord::default())],
        ));
        record.finalize(None);

        sink.pixel_complete(&record).unwrap();
        sink.pixel_complete(&record).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["address"], "C4");
        assert_eq!(parsed["complete"], true);
    }
}
