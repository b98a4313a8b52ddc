//! VISA Hardware Adapter for GPIB/USB/Ethernet instruments
//!
//! Provides an [`Adapter`] implementation for the VISA communication layer,
//! supporting instruments via GPIB, USB, Ethernet, and VISA-wrapped serial ports.
//! Everything that touches `visa-rs` sits behind the `instrument_visa` feature.

use crate::adapters::Adapter;
use crate::error::{AppResult, DaqError};
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use log::debug;
#[cfg(feature = "instrument_visa")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// VISA adapter for instrument communication
///
/// Supports resource strings like:
/// - "GPIB0::24::INSTR" (GPIB interface)
/// - "ASRL3::INSTR" (serial through VISA)
/// - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
pub struct VisaAdapter {
    /// VISA resource string (e.g., "GPIB0::24::INSTR")
    pub(crate) resource_string: String,

    /// Read/write timeout
    pub(crate) timeout: Duration,

    /// Line terminator for commands (typically "\n" for SCPI)
    pub(crate) line_terminator: String,

    /// Response line ending byte
    pub(crate) response_delimiter: u8,

    /// Serial framing for `ASRL` resources; `None` leaves the VISA defaults.
    pub(crate) serial: Option<SerialFraming>,

    /// Bytes read from the session but not consumed yet
    #[cfg(feature = "instrument_visa")]
    pending: Vec<u8>,

    /// The open VISA session
    #[cfg(feature = "instrument_visa")]
    instrument: Option<Instrument>,
}

/// `VI_ASRL_FLOW_NONE`
#[cfg(feature = "instrument_visa")]
const VI_ASRL_FLOW_NONE: u16 = 0;
/// `VI_ASRL_FLOW_XON_XOFF`
#[cfg(feature = "instrument_visa")]
const VI_ASRL_FLOW_XON_XOFF: u16 = 1;
/// `VI_TRUE`
#[cfg(feature = "instrument_visa")]
const VI_TRUE: u16 = 1;

/// Serial-line settings for a VISA `ASRL` session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialFraming {
    /// Line speed.
    pub baud_rate: u32,
    /// Data bits per character; parity none, one stop bit.
    pub data_bits: u16,
    /// Software flow control.
    pub xon_xoff: bool,
}

impl VisaAdapter {
    /// Create a new VISA adapter with default settings
    ///
    /// # Arguments
    /// * `resource_string` - VISA resource identifier (e.g., "GPIB0::24::INSTR")
    pub fn new(resource_string: String) -> Self {
        Self {
            resource_string,
            timeout: Duration::from_millis(300),
            line_terminator: "\n".to_string(),
            response_delimiter: b'\n',
            serial: None,
            #[cfg(feature = "instrument_visa")]
            pending: Vec::new(),
            #[cfg(feature = "instrument_visa")]
            instrument: None,
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the terminator used both for writes and as the read delimiter.
    ///
    /// The last byte of the terminator is the read delimiter.
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        if let Some(&last) = terminator.as_bytes().last() {
            self.response_delimiter = last;
        }
        self.line_terminator = terminator;
        self
    }

    /// Treat the resource as a serial port: 8-N-1 at `baud_rate`, XON/XOFF flow
    /// control, and the read delimiter as the VISA termination character.
    pub fn with_serial(mut self, baud_rate: u32) -> Self {
        self.serial = Some(SerialFraming {
            baud_rate,
            data_bits: 8,
            xon_xoff: true,
        });
        self
    }

    /// Serial framing applied at connect, if any.
    pub fn serial_framing(&self) -> Option<SerialFraming> {
        self.serial
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.instrument.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    /// Create a resource manager and open the resource.
    #[cfg(feature = "instrument_visa")]
    pub fn connect(&mut self) -> AppResult<()> {
        let rm = DefaultRM::new().map_err(|e| {
            DaqError::Connection(format!("Failed to create VISA resource manager: {}", e))
        })?;

        let resource = std::ffi::CString::new(self.resource_string.clone()).map_err(|e| {
            DaqError::Connection(format!("Bad VISA resource string '{}': {}", self.resource_string, e))
        })?;

        let instrument = rm
            .open(&resource.into(), AccessMode::NO_LOCK, self.timeout)
            .map_err(|e| {
                DaqError::Connection(format!(
                    "Failed to open VISA resource '{}': {}",
                    self.resource_string, e
                ))
            })?;

        self.instrument = Some(instrument);
        self.set_timeout(self.timeout)?;
        if let Some(framing) = self.serial {
            self.apply_serial_framing(framing)?;
        }

        debug!(
            "VISA resource '{}' opened with {}ms timeout",
            self.resource_string,
            self.timeout.as_millis()
        );
        Ok(())
    }

    /// Create a resource manager and open the resource.
    #[cfg(not(feature = "instrument_visa"))]
    pub fn connect(&mut self) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()))
    }

    /// List resources the VISA library can see.
    #[cfg(feature = "instrument_visa")]
    pub fn list_resources() -> AppResult<Vec<String>> {
        let rm = DefaultRM::new().map_err(|e| {
            DaqError::Connection(format!("Failed to create VISA resource manager: {}", e))
        })?;
        let expr = std::ffi::CString::new("?*::INSTR")
            .map_err(|e| DaqError::Connection(e.to_string()))?;
        let list = rm
            .find_res_list(&expr.into())
            .map_err(|e| DaqError::Connection(format!("VISA resource scan failed: {}", e)))?;
        Ok(list
            .filter_map(|res| res.ok())
            .map(|res| res.to_string())
            .collect())
    }

    /// List resources the VISA library can see.
    #[cfg(not(feature = "instrument_visa"))]
    pub fn list_resources() -> AppResult<Vec<String>> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()))
    }

    #[cfg(feature = "instrument_visa")]
    fn session(&mut self) -> AppResult<&mut Instrument> {
        let resource = &self.resource_string;
        self.instrument
            .as_mut()
            .ok_or_else(|| DaqError::Bus(format!("VISA resource '{}' not connected", resource)))
    }

    #[cfg(feature = "instrument_visa")]
    fn fill_pending(&mut self) -> AppResult<()> {
        let mut buf = [0u8; 4096];
        let n = self
            .session()?
            .read(&mut buf)
            .map_err(|e| DaqError::Bus(format!("VISA read failed: {}", e)))?;
        if n == 0 {
            return Err(DaqError::Bus("VISA read returned no data".into()));
        }
        self.pending.extend_from_slice(&buf[..n]);
        Ok(())
    }

    #[cfg(feature = "instrument_visa")]
    fn apply_serial_framing(&mut self, framing: SerialFraming) -> AppResult<()> {
        use visa_rs::enums::attribute::{
            AttrAsrlBaud, AttrAsrlDataBits, AttrAsrlFlowCntrl, AttrTermchar, AttrTermcharEn,
        };

        let baud = AttrAsrlBaud::new_checked(framing.baud_rate)
            .ok_or_else(|| DaqError::Connection(format!("Invalid baud rate {}", framing.baud_rate)))?;
        let data_bits = AttrAsrlDataBits::new_checked(framing.data_bits)
            .ok_or_else(|| DaqError::Connection(format!("Invalid data bits {}", framing.data_bits)))?;
        let flow = AttrAsrlFlowCntrl::new_checked(if framing.xon_xoff {
            VI_ASRL_FLOW_XON_XOFF
        } else {
            VI_ASRL_FLOW_NONE
        })
        .ok_or_else(|| DaqError::Connection("Invalid flow control".into()))?;
        let termchar = AttrTermchar::new_checked(self.response_delimiter)
            .ok_or_else(|| DaqError::Connection("Invalid termination character".into()))?;
        let termchar_en = AttrTermcharEn::new_checked(VI_TRUE)
            .ok_or_else(|| DaqError::Connection("Invalid termination enable".into()))?;

        let resource = self.resource_string.clone();
        let failed = |what: &str, e: &dyn std::fmt::Display| {
            DaqError::Connection(format!("Setting {} on VISA resource '{}' failed: {}", what, resource, e))
        };
        let session = self.session()?;
        session.set_attr(baud).map_err(|e| failed("baud rate", &e))?;
        session.set_attr(data_bits).map_err(|e| failed("data bits", &e))?;
        session.set_attr(flow).map_err(|e| failed("flow control", &e))?;
        session.set_attr(termchar).map_err(|e| failed("termination character", &e))?;
        session.set_attr(termchar_en).map_err(|e| failed("termination enable", &e))?;

        debug!(
            "VISA serial framing on '{}': {} baud, {} data bits, xon/xoff {}",
            self.resource_string, framing.baud_rate, framing.data_bits, framing.xon_xoff
        );
        Ok(())
    }

    #[cfg(feature = "instrument_visa")]
    fn visa_err(&self, what: &str, e: impl std::fmt::Display) -> DaqError {
        DaqError::Bus(format!("VISA {} on '{}' failed: {}", what, self.resource_string, e))
    }
}

#[cfg(feature = "instrument_visa")]
impl Adapter for VisaAdapter {
    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }

    fn write_line(&mut self, line: &str) -> AppResult<()> {
        let command_str = format!("{}{}", line, self.line_terminator);
        self.session()?
            .write_all(command_str.as_bytes())
            .map_err(|e| DaqError::Bus(format!("VISA write failed for '{}': {}", line, e)))?;
        debug!("VISA write sent: {}", line);
        Ok(())
    }

    fn read_line(&mut self) -> AppResult<String> {
        loop {
            let delimiter = self.response_delimiter;
            if let Some(pos) = self.pending.iter().position(|&b| b == delimiter) {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                let response = String::from_utf8_lossy(&line).trim().to_string();
                debug!("VISA response: {}", response);
                return Ok(response);
            }
            self.fill_pending()?;
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        while self.pending.len() < buf.len() {
            self.fill_pending()?;
        }
        buf.copy_from_slice(&self.pending[..buf.len()]);
        self.pending.drain(..buf.len());
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        self.timeout = timeout;
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let attr = visa_rs::enums::attribute::AttrTmoValue::new_checked(millis)
            .ok_or_else(|| DaqError::Bus(format!("Invalid VISA timeout {}ms", millis)))?;
        let result = self.session()?.set_attr(attr);
        result.map_err(|e| self.visa_err("set timeout", e))
    }

    fn assert_trigger(&mut self) -> AppResult<()> {
        let result = self
            .session()?
            .assert_trigger(visa_rs::enums::assert::AssertTrigPro::TrigProtDefault);
        result.map_err(|e| self.visa_err("assert trigger", e))
    }

    fn clear(&mut self) -> AppResult<()> {
        self.pending.clear();
        let result = self.session()?.clear();
        result.map_err(|e| self.visa_err("device clear", e))
    }

    fn send_ifc(&mut self) -> AppResult<()> {
        let result = self.session()?.gpib_send_ifc();
        result.map_err(|e| self.visa_err("interface clear", e))
    }

    fn send_command_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let result = self.session()?.gpib_command(bytes);
        result.map(|_| ()).map_err(|e| self.visa_err("bus command", e))
    }
}

#[cfg(not(feature = "instrument_visa"))]
impl Adapter for VisaAdapter {
    fn info(&self) -> String {
        format!(
            "VisaAdapter({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }

    fn write_line(&mut self, _line: &str) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()))
    }

    fn read_line(&mut self) -> AppResult<String> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()))
    }

    fn read_exact(&mut self, _buf: &mut [u8]) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".into()))
    }

    fn set_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        self.timeout = timeout;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("GPIB0::24::INSTR".to_string());
        assert!(!adapter.is_connected());
        assert_eq!(adapter.resource_string, "GPIB0::24::INSTR");
        assert_eq!(adapter.timeout, Duration::from_millis(300));
    }

    #[test]
    fn test_visa_adapter_builder() {
        let adapter = VisaAdapter::new("USB0::0x05E6::0x2400::1234567::INSTR".to_string())
            .with_timeout(Duration::from_millis(2000))
            .with_line_terminator("\r\n".to_string());

        assert_eq!(adapter.timeout, Duration::from_millis(2000));
        assert_eq!(adapter.line_terminator, "\r\n");
    }

    #[test]
    fn test_info_string() {
        let adapter = VisaAdapter::new("TCPIP0::192.168.1.100::INSTR".to_string())
            .with_timeout(Duration::from_millis(3000));
        let info = adapter.info();
        assert!(info.contains("TCPIP0::192.168.1.100::INSTR"));
        assert!(info.contains("3000ms"));
    }

    #[test]
    fn test_serial_framing_and_delimiter() {
        let adapter = VisaAdapter::new("ASRL/dev/ttyUSB0::INSTR".to_string())
            .with_line_terminator("\r".to_string())
            .with_serial(57600);

        assert_eq!(adapter.response_delimiter, b'\r');
        assert_eq!(
            adapter.serial_framing(),
            Some(SerialFraming {
                baud_rate: 57600,
                data_bits: 8,
                xon_xoff: true,
            })
        );
        assert_eq!(VisaAdapter::new("GPIB0::24::INSTR".to_string()).serial_framing(), None);
    }
}
