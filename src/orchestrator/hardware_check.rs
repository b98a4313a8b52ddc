//! Fixture check instead of a measurement run.
//!
//! Sets up each requested substrate, selects each of its pixels in turn, and
//! takes one open-circuit reading per ready pixel. No sweeps, no dwells, no
//! records for the data sink. Teardown is the same as for a run.

use log::{info, warn};
use serde::Serialize;

use super::MeasurementOrchestrator;
use crate::error::AppResult;
use crate::measurement::SenseRange;
use crate::pixel::{PixelAddress, PIXELS_PER_SUBSTRATE};

/// Outcome for one pixel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PixelCheck {
    /// Which pixel.
    pub address: PixelAddress,
    /// The selector reported it ready.
    pub ready: bool,
    /// Open-circuit voltage read through the relays.
    pub voltage: Option<f64>,
    /// Selection or reading failure.
    pub error: Option<String>,
}

/// Outcome for one substrate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubstrateCheck {
    /// Substrate letter.
    pub substrate: char,
    /// Why setup failed; its pixels were not tried.
    pub setup_error: Option<String>,
    /// Pixels 1..=8 in order.
    pub pixels: Vec<PixelCheck>,
}

/// Everything a hardware check found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HardwareReport {
    /// The light source turned on.
    pub light_ok: bool,
    /// Substrates in the order checked.
    pub substrates: Vec<SubstrateCheck>,
}

impl HardwareReport {
    /// Light on, every substrate set up, every pixel ready and read.
    pub fn all_ok(&self) -> bool {
        self.light_ok
            && self.substrates.iter().all(|s| {
                s.setup_error.is_none()
                    && s.pixels
                        .iter()
                        .all(|p| p.ready && p.voltage.is_some() && p.error.is_none())
            })
    }
}

impl<'a> MeasurementOrchestrator<'a> {
    /// Exercise relays, light, and instrument on `substrates`, then tear down.
    ///
    /// Only fatal errors abort the check; everything else ends up in the report.
    pub fn test_hardware(&mut self, substrates: &[char]) -> AppResult<HardwareReport> {
        info!("Hardware check on substrate(s) {:?}", substrates);
        let result = self.check_fixture(substrates);
        self.teardown();
        if let Ok(report) = &result {
            if report.all_ok() {
                info!("Hardware check passed");
            } else {
                warn!("Hardware check found problems");
            }
        }
        result
    }

    fn check_fixture(&mut self, substrates: &[char]) -> AppResult<HardwareReport> {
        self.smu
            .configure_baseline(self.config.front_terminals, self.config.four_wire)?;
        self.smu.set_integration_time(self.config.dwell_nplc)?;

        let mut report = HardwareReport {
            light_ok: match self.collab.light.on() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Light source did not turn on: {}", e);
                    false
                }
            },
            substrates: Vec::new(),
        };

        for &substrate in substrates {
            let mut check = SubstrateCheck {
                substrate,
                setup_error: None,
                pixels: Vec::new(),
            };
            match self.collab.selector.setup_substrate(substrate) {
                Ok(()) => {
                    let addresses: Vec<PixelAddress> = (1..=PIXELS_PER_SUBSTRATE)
                        .filter_map(|pixel| PixelAddress::new(substrate, pixel))
                        .collect();
                    for address in addresses {
                        check.pixels.push(self.check_pixel(address)?);
                    }
                }
                Err(e) => {
                    warn!("Substrate {} setup failed: {}", substrate, e);
                    check.setup_error = Some(e.to_string());
                }
            }
            report.substrates.push(check);
        }
        Ok(report)
    }

    fn check_pixel(&mut self, address: PixelAddress) -> AppResult<PixelCheck> {
        let mut check = PixelCheck {
            address,
            ready: false,
            voltage: None,
            error: None,
        };
        match self.collab.selector.select_pixel(address) {
            Ok(ready) => check.ready = ready,
            Err(e) => {
                warn!("{}: selection failed: {}", address, e);
                check.error = Some(e.to_string());
                return Ok(check);
            }
        }
        if !check.ready {
            warn!("{}: not ready", address);
            return Ok(check);
        }

        let reading = self
            .smu
            .configure_dc_level(false, self.config.voc_compliance, 0.0, SenseRange::Auto)
            .and_then(|()| self.smu.read_one());
        if let Err(e) = self.smu.set_output(false) {
            warn!("Output off after {} failed: {}", address, e);
        }
        match reading {
            Ok(sample) => {
                info!("{}: {:.4} V open circuit", address, sample.voltage);
                check.voltage = Some(sample.voltage);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("{}: reading failed: {}", address, e);
                check.error = Some(e.to_string());
            }
        }
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::instrument::DummySourceMeter;
    use crate::orchestrator::{
        Collaborators, ConstantVoltageHold, MemorySink, NoLight, RunConfig, StaticSelector,
    };
    use crate::pixel::SubstrateSet;

    #[test]
    fn test_check_reports_each_pixel_and_substrate() {
        let mut settings = Settings::default();
        settings.measurement.dwell_nplc = 0.01;
        let config = RunConfig::from_settings(&settings, "tester");
        let mut smu = DummySourceMeter::new();
        let mut selector = StaticSelector::new(SubstrateSet::from_letters("AB"))
            .with_unready_pixel(PixelAddress::new('A', 2).unwrap())
            .with_broken_substrate('B');
        let mut light = NoLight;
        let mut sink = MemorySink::default();
        let mut tracker = ConstantVoltageHold::default();

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
        .test_hardware(&['A', 'B'])
        .unwrap();

        assert!(report.light_ok);
        assert!(!report.all_ok());
        let a = &report.substrates[0];
        assert_eq!(a.pixels.len(), 8);
        assert!(!a.pixels[1].ready);
        assert_eq!(a.pixels[1].voltage, None);
        for pixel in a.pixels.iter().filter(|p| p.ready) {
            let voc = pixel.voltage.unwrap();
            assert!(voc > 0.85 && voc < 1.0);
        }
        let b = &report.substrates[1];
        assert!(b.setup_error.is_some());
        assert!(b.pixels.is_empty());

        assert_eq!(selector.selections().len(), 7);
        assert!(sink.records.is_empty());
        assert!(sink.finished);
        assert!(!smu.output_enabled());
    }
}
