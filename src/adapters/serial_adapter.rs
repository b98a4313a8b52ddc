use crate::adapters::Adapter;
use crate::error::{AppResult, DaqError};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use log::debug;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::time::Instant;

/// Serial adapter for RS-232 communication
///
/// This adapter wraps the serialport crate with 8-N-1 framing and XON/XOFF
/// software flow control, which is what Keithley 24xx units expect on their
/// RS-232 port.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 57600)
    baud_rate: u32,

    /// Read timeout for a whole line or block
    timeout: Duration,

    /// Line terminator appended to commands
    line_terminator: String,

    /// Response line ending byte
    response_delimiter: u8,

    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn SerialPort>>,
}

impl SerialAdapter {
    /// Create a new serial adapter with default settings
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 57600)
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_millis(300),
            line_terminator: "\n".to_string(),
            response_delimiter: b'\n',
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Set read timeout
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

    /// Port name this adapter was built for.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open the port.
    #[cfg(feature = "instrument_serial")]
    pub fn connect(&mut self) -> AppResult<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::Software)
            .timeout(Duration::from_millis(50)) // internal poll interval
            .open()
            .map_err(|e| {
                DaqError::Connection(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    self.port_name, self.baud_rate, e
                ))
            })?;

        let _ = port.clear(serialport::ClearBuffer::All);
        self.port = Some(port);

        debug!(
            "Serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(())
    }

    /// Open the port.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn connect(&mut self) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".into()))
    }

    /// Close the port.
    pub fn disconnect(&mut self) {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&mut self) -> AppResult<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(DaqError::SerialPortNotConnected)
    }
}

#[cfg(feature = "instrument_serial")]
impl Adapter for SerialAdapter {
    fn info(&self) -> String {
        format!("SerialAdapter({} @ {} baud)", self.port_name, self.baud_rate)
    }

    fn write_line(&mut self, line: &str) -> AppResult<()> {
        use std::io::Write;

        let command_str = format!("{}{}", line, self.line_terminator);
        let port = self.port()?;
        port.write_all(command_str.as_bytes())
            .and_then(|()| port.flush())
            .map_err(|e| DaqError::Bus(format!("Failed to write to serial port: {}", e)))?;

        debug!("Sent serial command: {}", line);
        Ok(())
    }

    fn read_line(&mut self) -> AppResult<String> {
        use std::io::Read;

        let delimiter = self.response_delimiter;
        let timeout = self.timeout;
        let port = self.port()?;

        // Read response byte-by-byte until delimiter
        let mut response = Vec::new();
        let mut buffer = [0u8; 1];
        let start = Instant::now();

        loop {
            if start.elapsed() > timeout {
                return Err(DaqError::Bus(format!("Serial read timeout after {:?}", timeout)));
            }

            match port.read(&mut buffer) {
                Ok(1) => {
                    if buffer[0] == delimiter {
                        break;
                    }
                    response.push(buffer[0]);
                }
                Ok(0) => {
                    return Err(DaqError::Bus("Unexpected EOF from serial port".into()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    // Port timeout is shorter than our overall timeout
                    continue;
                }
                Err(e) => {
                    return Err(DaqError::Bus(format!("Serial read error: {}", e)));
                }
                Ok(_) => unreachable!("Read into single-byte buffer returned >1"),
            }
        }

        let response = String::from_utf8_lossy(&response).trim().to_string();
        debug!("Received serial response: {}", response);
        Ok(response)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> AppResult<()> {
        use std::io::Read;

        let timeout = self.timeout;
        let port = self.port()?;
        let start = Instant::now();
        let mut filled = 0;

        while filled < buf.len() {
            if start.elapsed() > timeout {
                return Err(DaqError::Bus(format!(
                    "Serial read timeout after {:?} ({} of {} bytes)",
                    timeout,
                    filled,
                    buf.len()
                )));
            }
            match port.read(&mut buf[filled..]) {
                Ok(0) => return Err(DaqError::Bus("Unexpected EOF from serial port".into())),
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(DaqError::Bus(format!("Serial read error: {}", e))),
            }
        }
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> AppResult<()> {
        self.timeout = timeout;
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Adapter for SerialAdapter {
    fn info(&self) -> String {
        format!("SerialAdapter({} @ {} baud)", self.port_name, self.baud_rate)
    }

    fn write_line(&mut self, _line: &str) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".into()))
    }

    fn read_line(&mut self) -> AppResult<String> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".into()))
    }

    fn read_exact(&mut self, _buf: &mut [u8]) -> AppResult<()> {
        Err(DaqError::FeatureNotEnabled("instrument_serial".into()))
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
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0".to_string(), 57600);
        assert_eq!(adapter.port_name(), "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate, 57600);
        assert_eq!(adapter.response_delimiter, b'\n');
    }

    #[test]
    fn test_terminator_sets_delimiter() {
        let adapter = SerialAdapter::new("COM3".to_string(), 9600).with_line_terminator("\r".into());
        assert_eq!(adapter.line_terminator, "\r");
        assert_eq!(adapter.response_delimiter, b'\r');
    }

    #[test]
    fn test_info_string() {
        let adapter = SerialAdapter::new("COM3".to_string(), 115200);
        let info = adapter.info();
        assert!(info.contains("COM3"));
        assert!(info.contains("115200"));
    }

    #[test]
    fn test_write_before_connect_fails() {
        let mut adapter = SerialAdapter::new("/dev/null-port".to_string(), 9600);
        assert!(adapter.write_line("*IDN?").is_err());
    }
}
