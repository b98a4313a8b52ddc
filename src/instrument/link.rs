//! Bus session with the source-measure unit.
//!
//! [`InstrumentLink`] owns the one adapter of a run plus the transport strategy
//! chosen for it, and exposes blocking write/query primitives. Everything the
//! driver sends goes through here, so this is also where bus traffic is logged.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::encoding::DataEncoding;
use super::transport::{strategy_for, TransportStrategy};
use crate::adapters::{Adapter, SerialAdapter, VisaAdapter};
use crate::config::InstrumentSettings;
use crate::error::{AppResult, DaqError};

/// Vendor token the identity reply must contain.
pub const EXPECTED_VENDOR: &str = "KEITHLEY";

/// Bus family, derived from the address string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// RS-232, through VISA (`ASRL...`) or a bare device path.
    Serial,
    /// IEEE-488.
    Gpib,
    /// Anything else a VISA library can open.
    Other,
}

impl TransportKind {
    /// Classify an address. Never chosen independently of the address.
    pub fn from_address(address: &str) -> Self {
        if address.contains("ASRL") || is_bare_serial_path(address) {
            TransportKind::Serial
        } else if address.contains("GPIB") {
            TransportKind::Gpib
        } else {
            TransportKind::Other
        }
    }
}

fn is_bare_serial_path(address: &str) -> bool {
    !address.contains("::")
        && (address.contains("tty") || address.to_ascii_uppercase().starts_with("COM"))
}

/// `GPIB<board>::<primary>[::<secondary>]::INSTR`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpibAddress {
    /// Interface board index.
    pub board: u8,
    /// Primary address, 0..=30.
    pub primary: u8,
    /// Secondary address, if any.
    pub secondary: Option<u8>,
}

impl GpibAddress {
    /// Parse a GPIB resource string.
    pub fn parse(address: &str) -> AppResult<Self> {
        let bad = || DaqError::Connection(format!("cannot parse GPIB address '{}'", address));

        let fields: Vec<&str> = address.trim().split("::").collect();
        let (head, rest) = fields.split_first().ok_or_else(bad)?;
        let board = head
            .strip_prefix("GPIB")
            .map(|b| if b.is_empty() { "0" } else { b })
            .and_then(|b| b.parse::<u8>().ok())
            .ok_or_else(bad)?;

        let numbers: Vec<u8> = match rest.split_last() {
            Some((&"INSTR", numbers)) => numbers
                .iter()
                .map(|n| n.parse::<u8>().map_err(|_| bad()))
                .collect::<AppResult<_>>()?,
            _ => return Err(bad()),
        };

        match numbers.as_slice() {
            [primary] if *primary <= 30 => Ok(Self {
                board,
                primary: *primary,
                secondary: None,
            }),
            [primary, secondary] if *primary <= 30 => Ok(Self {
                board,
                primary: *primary,
                secondary: Some(*secondary),
            }),
            _ => Err(bad()),
        }
    }
}

/// Native device path for a serial resource.
///
/// `ASRL<n>::INSTR` maps to `COM<n>` on Windows and `/dev/ttyS<n-1>` elsewhere;
/// `ASRL<path>::INSTR` and bare paths pass through.
pub fn serial_port_name(address: &str) -> String {
    let inner = address
        .strip_prefix("ASRL")
        .map(|rest| rest.strip_suffix("::INSTR").unwrap_or(rest));

    match inner {
        Some(body) => match body.parse::<u32>() {
            Ok(n) if cfg!(windows) => format!("COM{}", n),
            Ok(n) => format!("/dev/ttyS{}", n.saturating_sub(1)),
            Err(_) => body.to_string(),
        },
        None => address.to_string(),
    }
}

/// Which adapter family to try first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// A system VISA library through visa-rs.
    Visa,
    /// The serialport crate. Serial resources only.
    #[default]
    Native,
}

impl Backend {
    fn other(self) -> Self {
        match self {
            Backend::Visa => Backend::Native,
            Backend::Native => Backend::Visa,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Visa => write!(f, "visa"),
            Backend::Native => write!(f, "native"),
        }
    }
}

impl FromStr for Backend {
    type Err = DaqError;

    fn from_str(s: &str) -> AppResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "visa" => Ok(Backend::Visa),
            "native" | "py" | "serial" => Ok(Backend::Native),
            other => Err(DaqError::Configuration(format!("unknown backend '{}'", other))),
        }
    }
}

/// How to reach the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParameters {
    /// Derived from `address`.
    pub kind: TransportKind,
    /// Resource string or device path.
    pub address: String,
    /// Write terminator; serial reads stop on its last byte.
    pub terminator: String,
    /// Serial only.
    pub baud_rate: u32,
    /// Bring-up timeout.
    pub timeout: Duration,
}

impl ConnectionParameters {
    /// Build parameters; the transport kind comes from the address.
    pub fn new(address: &str, terminator: &str, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            kind: TransportKind::from_address(address),
            address: address.to_string(),
            terminator: terminator.to_string(),
            baud_rate,
            timeout,
        }
    }

    /// Parameters from the instrument section of the settings.
    pub fn from_settings(settings: &InstrumentSettings) -> AppResult<Self> {
        Ok(Self::new(
            &settings.address,
            &settings.terminator()?,
            settings.baud_rate,
            Duration::from_millis(settings.bringup_timeout_ms),
        ))
    }
}

/// The open session.
pub struct InstrumentLink {
    adapter: Box<dyn Adapter>,
    strategy: Box<dyn TransportStrategy>,
    params: ConnectionParameters,
    identity: Option<String>,
}

impl fmt::Debug for InstrumentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentLink")
            .field("adapter", &self.adapter.info())
            .field("params", &self.params)
            .field("identity", &self.identity)
            .finish()
    }
}

impl InstrumentLink {
    /// Open a session, trying `backend` first and the other backend second.
    ///
    /// When both fail, the returned connection error carries both reasons.
    pub fn open(params: ConnectionParameters, backend: Backend) -> AppResult<Self> {
        let mut failures = Vec::new();
        for candidate in [backend, backend.other()] {
            match open_adapter(&params, candidate) {
                Ok(adapter) => {
                    info!("Opened {} with the {} backend", params.address, candidate);
                    return Self::with_adapter(params, adapter);
                }
                Err(e) => {
                    warn!("{} backend could not open {}: {}", candidate, params.address, e);
                    failures.push(format!("{}: {}", candidate, e));
                }
            }
        }
        Err(DaqError::Connection(format!(
            "could not open {} ({})",
            params.address,
            failures.join("; ")
        )))
    }

    /// Wrap an already-open adapter and run the transport bring-up.
    pub fn with_adapter(params: ConnectionParameters, mut adapter: Box<dyn Adapter>) -> AppResult<Self> {
        let strategy = strategy_for(params.kind, &params.address)?;
        adapter.set_timeout(params.timeout)?;
        strategy.prepare(adapter.as_mut()).map_err(|e| {
            DaqError::Connection(format!("bring-up of {} failed: {}", params.address, e))
        })?;
        debug!(
            "{} ready: {:?} transport, {:?} encoding",
            adapter.info(),
            strategy.kind(),
            strategy.encoding()
        );
        Ok(Self {
            adapter,
            strategy,
            params,
            identity: None,
        })
    }

    /// Reset, preset, and verify the identity.
    ///
    /// Nothing else is sent when the identity check fails.
    pub fn reset(&mut self) -> AppResult<&str> {
        self.write("*RST")?;
        self.write(":status:preset")?;
        self.write(":system:preset")?;

        let idn = self
            .query("*IDN?")
            .map_err(|e| DaqError::Connection(format!("identity query failed: {}", e)))?;
        if !idn.contains(EXPECTED_VENDOR) {
            return Err(DaqError::Connection(format!(
                "unexpected instrument identity '{}'",
                idn
            )));
        }
        info!("Connected to {}", idn);
        Ok(self.identity.insert(idn).as_str())
    }

    /// Blocking write of one command.
    pub fn write(&mut self, command: &str) -> AppResult<()> {
        debug!("-> {}", command);
        self.adapter.write_line(command)
    }

    /// Write a query and read its one-line reply.
    pub fn query(&mut self, command: &str) -> AppResult<String> {
        self.write(command)?;
        let reply = self.adapter.read_line()?;
        debug!("<- {}", reply);
        Ok(reply)
    }

    /// Write a query and decode its values in the session encoding.
    pub fn query_values(&mut self, command: &str, expected: Option<usize>) -> AppResult<Vec<f64>> {
        self.write(command)?;
        let values = self.encoding().read_values(self.adapter.as_mut(), expected)?;
        debug!("<- {} values", values.len());
        Ok(values)
    }

    /// Start a bus-armed acquisition the way this transport requires.
    pub fn trigger(&mut self) -> AppResult<()> {
        debug!("-> trigger ({:?})", self.strategy.kind());
        self.strategy.trigger(self.adapter.as_mut())
    }

    /// Raw bus command byte; GPIB only.
    pub fn send_bus_command(&mut self, byte: u8) -> AppResult<()> {
        debug!("-> bus command 0x{:02X}", byte);
        self.strategy.send_bus_command(self.adapter.as_mut(), byte)
    }

    /// Change the I/O timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        self.adapter.set_timeout(timeout)
    }

    /// Encoding fixed for this session.
    pub fn encoding(&self) -> DataEncoding {
        self.strategy.encoding()
    }

    /// Transport this session runs on.
    pub fn kind(&self) -> TransportKind {
        self.strategy.kind()
    }

    /// Identity string, once verified.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Parameters the session was opened with.
    pub fn params(&self) -> &ConnectionParameters {
        &self.params
    }
}

/// VISA session settings for `params`; serial resources get serial framing.
fn visa_adapter(params: &ConnectionParameters) -> VisaAdapter {
    let adapter = VisaAdapter::new(params.address.clone())
        .with_timeout(params.timeout)
        .with_line_terminator(params.terminator.clone());
    match params.kind {
        TransportKind::Serial => adapter.with_serial(params.baud_rate),
        _ => adapter,
    }
}

fn open_adapter(params: &ConnectionParameters, backend: Backend) -> AppResult<Box<dyn Adapter>> {
    match backend {
        Backend::Visa => {
            let mut adapter = visa_adapter(params);
            adapter.connect()?;
            Ok(Box::new(adapter))
        }
        Backend::Native => {
            if params.kind != TransportKind::Serial {
                return Err(DaqError::Connection(format!(
                    "native backend only handles serial resources, not {:?}",
                    params.kind
                )));
            }
            let mut adapter = SerialAdapter::new(serial_port_name(&params.address), params.baud_rate)
                .with_timeout(params.timeout)
                .with_line_terminator(params.terminator.clone());
            adapter.connect()?;
            Ok(Box::new(adapter))
        }
    }
}
