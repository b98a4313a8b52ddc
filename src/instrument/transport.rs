//! Transport-specific protocol choices, selected once per session.
//!
//! The hardware trigger, bring-up sequence and data encoding all depend on which
//! bus the instrument sits on. A [`TransportStrategy`] is picked from the
//! [`TransportKind`] when the link opens, and nothing downstream inspects the
//! transport again.

use log::debug;

use super::encoding::DataEncoding;
use super::link::{GpibAddress, TransportKind};
use crate::adapters::Adapter;
use crate::error::{AppResult, DaqError};

/// Per-transport behaviour of an open session.
pub trait TransportStrategy: Send {
    /// Transport this strategy drives.
    fn kind(&self) -> TransportKind;

    /// Encoding for measurement replies.
    fn encoding(&self) -> DataEncoding;

    /// Bus-level bring-up right after the adapter is opened.
    fn prepare(&self, adapter: &mut dyn Adapter) -> AppResult<()>;

    /// Start a bus-armed acquisition.
    fn trigger(&self, adapter: &mut dyn Adapter) -> AppResult<()>;

    /// Send one raw bus command byte.
    fn send_bus_command(&self, adapter: &mut dyn Adapter, byte: u8) -> AppResult<()> {
        let _ = (adapter, byte);
        Err(DaqError::Bus(format!(
            "raw bus commands need a GPIB transport, this session is {:?}",
            self.kind()
        )))
    }
}

/// RS-232: ASCII data, software trigger.
#[derive(Debug, Default)]
pub struct SerialStrategy;

impl TransportStrategy for SerialStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn encoding(&self) -> DataEncoding {
        DataEncoding::Ascii
    }

    fn prepare(&self, _adapter: &mut dyn Adapter) -> AppResult<()> {
        Ok(())
    }

    fn trigger(&self, adapter: &mut dyn Adapter) -> AppResult<()> {
        adapter.write_line("*TRG")
    }
}

/// GPIB: binary data, hardware trigger.
#[derive(Debug)]
pub struct GpibStrategy {
    address: GpibAddress,
}

impl GpibStrategy {
    /// Strategy for the instrument at `address`.
    pub fn new(address: GpibAddress) -> Self {
        Self { address }
    }
}

impl TransportStrategy for GpibStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::Gpib
    }

    fn encoding(&self) -> DataEncoding {
        DataEncoding::BinarySingle
    }

    fn prepare(&self, adapter: &mut dyn Adapter) -> AppResult<()> {
        if cfg!(windows) {
            debug!("skipping interface clear on board {}", self.address.board);
        } else {
            adapter.send_ifc()?;
        }
        adapter.clear()?;
        debug!(
            "GPIB board {} primary {} cleared",
            self.address.board, self.address.primary
        );
        Ok(())
    }

    fn trigger(&self, adapter: &mut dyn Adapter) -> AppResult<()> {
        adapter.assert_trigger()
    }

    fn send_bus_command(&self, adapter: &mut dyn Adapter, byte: u8) -> AppResult<()> {
        adapter.send_command_bytes(&[byte])
    }
}

/// Anything else (USB-TMC, LAN): ASCII data, software trigger.
#[derive(Debug, Default)]
pub struct GenericStrategy;

impl TransportStrategy for GenericStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::Other
    }

    fn encoding(&self) -> DataEncoding {
        DataEncoding::Ascii
    }

    fn prepare(&self, adapter: &mut dyn Adapter) -> AppResult<()> {
        adapter.clear()
    }

    fn trigger(&self, adapter: &mut dyn Adapter) -> AppResult<()> {
        adapter.write_line("*TRG")
    }
}

/// Pick the strategy for a resource address.
pub fn strategy_for(kind: TransportKind, address: &str) -> AppResult<Box<dyn TransportStrategy>> {
    Ok(match kind {
        TransportKind::Serial => Box::new(SerialStrategy),
        TransportKind::Gpib => Box::new(GpibStrategy::new(GpibAddress::parse(address)?)),
        TransportKind::Other => Box::new(GenericStrategy),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{LOG_CLEAR, LOG_IFC, LOG_TRIGGER};
    use crate::adapters::MockAdapter;

    #[test]
    fn test_serial_uses_software_trigger() {
        let (mut adapter, log) = MockAdapter::new();
        let strategy = strategy_for(TransportKind::Serial, "ASRL1::INSTR").unwrap();
        strategy.trigger(&mut adapter).unwrap();
        assert_eq!(log.entries(), vec!["*TRG"]);
        assert_eq!(strategy.encoding(), DataEncoding::Ascii);
    }

    #[test]
    fn test_gpib_asserts_hardware_trigger() {
        let (mut adapter, log) = MockAdapter::new();
        let strategy = strategy_for(TransportKind::Gpib, "GPIB0::24::INSTR").unwrap();
        strategy.trigger(&mut adapter).unwrap();
        assert_eq!(log.entries(), vec![LOG_TRIGGER]);
        assert_eq!(strategy.encoding(), DataEncoding::BinarySingle);
    }

    #[test]
    fn test_gpib_bring_up_clears_device() {
        let (mut adapter, log) = MockAdapter::new();
        let strategy = strategy_for(TransportKind::Gpib, "GPIB1::5::INSTR").unwrap();
        strategy.prepare(&mut adapter).unwrap();
        assert_eq!(log.count(LOG_CLEAR), 1);
        assert_eq!(log.count(LOG_IFC), usize::from(!cfg!(windows)));
    }

    #[test]
    fn test_bus_command_rejected_off_gpib() {
        let (mut adapter, _log) = MockAdapter::new();
        let strategy = strategy_for(TransportKind::Serial, "COM3").unwrap();
        assert!(strategy.send_bus_command(&mut adapter, 0x08).is_err());
    }
}
