//! Hardware adapter implementations
//!
//! This module contains implementations of the [`Adapter`] trait, providing
//! low-level, blocking I/O for the transports a source-measure unit can sit on.
//! Adapters move bytes and lines; they know nothing about SCPI. Protocol choices
//! that depend on the transport live in
//! [`TransportStrategy`](crate::instrument::transport::TransportStrategy).

pub mod mock;
pub mod serial_adapter;
pub mod visa_adapter;

pub use mock::{CommandLog, MockAdapter};
pub use serial_adapter::SerialAdapter;
pub use visa_adapter::VisaAdapter;

use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Blocking, line-oriented byte transport to one instrument.
pub trait Adapter: Send {
    /// Short description for logs, e.g. the resource string.
    fn info(&self) -> String;

    /// Write one command; the adapter appends its write terminator.
    fn write_line(&mut self, line: &str) -> AppResult<()>;

    /// Read up to and including the read terminator, returned without it.
    fn read_line(&mut self) -> AppResult<String>;

    /// Fill `buf` completely or fail with a bus error.
    fn read_exact(&mut self, buf: &mut [u8]) -> AppResult<()>;

    /// Change the I/O timeout for subsequent operations.
    fn set_timeout(&mut self, timeout: Duration) -> AppResult<()>;

    /// Assert a hardware trigger (GPIB Group Execute Trigger).
    fn assert_trigger(&mut self) -> AppResult<()> {
        Err(DaqError::Bus(format!(
            "{} cannot assert a hardware trigger",
            self.info()
        )))
    }

    /// Selected device clear.
    fn clear(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Pulse interface clear on the bus.
    fn send_ifc(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Send raw bus command bytes (ATN asserted).
    fn send_command_bytes(&mut self, bytes: &[u8]) -> AppResult<()> {
        let _ = bytes;
        Err(DaqError::Bus(format!(
            "{} does not support raw bus commands",
            self.info()
        )))
    }
}
