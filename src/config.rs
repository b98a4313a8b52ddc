//! Layered configuration using Figment
//!
//! Settings are built once at startup and never mutated afterwards. Layers, later
//! ones winning:
//!
//! 1. Built-in defaults ([`Settings::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `IVDAQ_`, nested keys split on `__`
//! 4. Command-line overrides, passed in as any serializable value
//!
//! ```text
//! IVDAQ_APPLICATION__LOG_LEVEL=debug
//! IVDAQ_INSTRUMENT__ADDRESS=ASRL/dev/ttyUSB0::INSTR
//! IVDAQ_MEASUREMENT__MPPT_S=0
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, DaqError};
use crate::instrument::Backend;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Process-wide settings.
    pub application: ApplicationSettings,
    /// How to reach the source-measure unit.
    pub instrument: InstrumentSettings,
    /// What to measure on each pixel.
    pub measurement: MeasurementSettings,
    /// Substrate fixture.
    pub fixture: FixtureSettings,
    /// Optional integrations.
    pub integrations: IntegrationSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error, off)
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Source-measure unit connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSettings {
    /// VISA-style resource string or serial device path.
    pub address: String,
    /// Command terminator as hex bytes, e.g. `0A` or `0D0A`.
    pub terminator_hex: String,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Backend tried first.
    pub backend: Backend,
    /// Use the front terminals instead of the rear ones.
    pub front_terminals: bool,
    /// Remote (4-wire) sensing.
    pub four_wire: bool,
    /// Timeout while opening and identifying, in milliseconds.
    pub bringup_timeout_ms: u64,
    /// Timeout once measuring, sized to cover a full sweep.
    pub acquisition_timeout_ms: u64,
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            address: "GPIB0::24::INSTR".to_string(),
            terminator_hex: "0A".to_string(),
            baud_rate: 57600,
            backend: Backend::Native,
            front_terminals: false,
            four_wire: true,
            bringup_timeout_ms: 300,
            acquisition_timeout_ms: 50_000,
        }
    }
}

impl InstrumentSettings {
    /// Decoded command terminator.
    pub fn terminator(&self) -> AppResult<String> {
        let hex = self.terminator_hex.trim();
        let bad = || DaqError::Configuration(format!("bad terminator hex '{}'", self.terminator_hex));
        if hex.is_empty() || hex.len() % 2 != 0 {
            return Err(bad());
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| {
                hex.get(i..i + 2)
                    .and_then(|b| u8::from_str_radix(b, 16).ok())
                    .ok_or_else(bad)
            })
            .collect::<AppResult<Vec<u8>>>()?;
        String::from_utf8(bytes).map_err(|_| bad())
    }
}

/// Per-pixel measurement plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    /// Run the descending Voc-to-0 sweep.
    pub sweep: bool,
    /// Run the ascending 0-to-beyond-Voc sweep.
    pub snaith: bool,
    /// Length of each steady-state dwell, seconds.
    pub t_prebias_s: f64,
    /// Power-point tracking duration, seconds; 0 disables tracking.
    pub mppt_s: f64,
    /// Points per sweep.
    pub scan_points: u32,
    /// Integration time during sweeps.
    pub scan_nplc: f64,
    /// Integration time during dwells.
    pub dwell_nplc: f64,
    /// Sweep step delay in seconds; absent means instrument auto.
    pub step_delay_s: Option<f64>,
    /// Fixed current compliance, bypassing derivation.
    pub current_compliance_override: Option<f64>,
    /// Fixed low sweep limit.
    pub scan_low_override: Option<f64>,
    /// Fixed high sweep limit.
    pub scan_high_override: Option<f64>,
    /// Current compliance for the first sweep when nothing better is known.
    pub compliance_guess: f64,
    /// Voltage compliance during the open-circuit dwell.
    pub voc_compliance: f64,
    /// How far past Voc the ascending sweep goes, percent.
    pub percent_beyond_voc: f64,
    /// Upper bound on samples per dwell.
    pub max_dwell_samples: Option<usize>,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            sweep: true,
            snaith: true,
            t_prebias_s: 10.0,
            mppt_s: 37.0,
            scan_points: 101,
            scan_nplc: 1.0,
            dwell_nplc: 10.0,
            step_delay_s: None,
            current_compliance_override: None,
            scan_low_override: None,
            scan_high_override: None,
            compliance_guess: 0.04,
            voc_compliance: 3.0,
            percent_beyond_voc: 25.0,
            max_dwell_samples: None,
        }
    }
}

/// Substrate fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureSettings {
    /// Letters of substrates wired to the fixture.
    pub connected_substrates: String,
    /// Default pixel address spec when none is given on the command line.
    pub pixel_address: Option<String>,
}

impl Default for FixtureSettings {
    fn default() -> Self {
        Self {
            connected_substrates: "ABCDEFGH".to_string(),
            pixel_address: None,
        }
    }
}

/// Optional integrations. None of them can fail a measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IntegrationSettings {
    /// Destination batches are uploaded to.
    pub archive_address: Option<String>,
    /// Push finished batches to a notifier.
    pub notify: bool,
    /// Reference diode ADC counts handed to the light source.
    pub diode_calibration: Option<(u32, u32)>,
}

impl Settings {
    /// Defaults, TOML file and environment, without command-line overrides.
    pub fn figment(path: Option<&Path>) -> Figment {
        let figment = Figment::from(Serialized::defaults(Settings::default()));
        let figment = match path {
            Some(path) => figment.merge(Toml::file(path)),
            None => figment,
        };
        figment.merge(Env::prefixed("IVDAQ_").split("__"))
    }

    /// Load and validate settings.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        Self::load_with(path, serde_json::Map::new())
    }

    /// Load and validate settings with `overrides` merged on top.
    pub fn load_with<T: Serialize>(path: Option<&Path>, overrides: T) -> AppResult<Self> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(DaqError::Configuration(format!(
                    "configuration file {} does not exist",
                    path.display()
                )));
            }
        }
        let settings: Settings = Self::figment(path)
            .merge(Serialized::defaults(overrides))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would make a run meaningless or unsafe.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&self.application.log_level.to_ascii_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.instrument.terminator()?;

        let m = &self.measurement;
        if m.scan_points < 2 {
            return Err(DaqError::Configuration(format!(
                "scan_points must be at least 2, got {}",
                m.scan_points
            )));
        }
        for (name, value) in [("t_prebias_s", m.t_prebias_s), ("mppt_s", m.mppt_s)] {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(DaqError::Configuration(format!(
                    "{} must be a non-negative duration, got {}",
                    name, value
                )));
            }
        }
        if let Some(delay) = m.step_delay_s {
            if !(delay >= 0.0) {
                return Err(DaqError::Configuration(format!(
                    "step_delay_s must be non-negative, got {}",
                    delay
                )));
            }
        }
        let positive = [
            ("compliance_guess", Some(m.compliance_guess)),
            ("voc_compliance", Some(m.voc_compliance)),
            ("current_compliance_override", m.current_compliance_override),
            ("scan_nplc", Some(m.scan_nplc)),
            ("dwell_nplc", Some(m.dwell_nplc)),
        ];
        for (name, value) in positive {
            if let Some(value) = value {
                if !(value > 0.0) {
                    return Err(DaqError::Configuration(format!(
                        "{} must be positive, got {}",
                        name, value
                    )));
                }
            }
        }
        if m.max_dwell_samples == Some(0) {
            return Err(DaqError::Configuration("max_dwell_samples must be at least 1".into()));
        }
        Ok(())
    }
}
