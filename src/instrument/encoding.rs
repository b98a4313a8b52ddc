//! Wire encodings for measurement data.
//!
//! Serial sessions use ASCII comma-separated values. GPIB sessions use IEEE-488.2
//! binary blocks of little-endian single-precision floats. The encoding is picked
//! once from the transport and never changes for the life of a session.

use log::trace;

use crate::adapters::Adapter;
use crate::error::{AppResult, DaqError};

/// Negotiated data encoding for `:read?` / `:fetch?` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEncoding {
    /// `:format:data ascii`
    Ascii,
    /// `:format:data sreal` with swapped (little-endian) byte order.
    BinarySingle,
}

impl DataEncoding {
    /// Commands that put the instrument into this encoding.
    pub fn format_commands(self) -> &'static [&'static str] {
        match self {
            DataEncoding::Ascii => &["format:data ascii"],
            DataEncoding::BinarySingle => &["format:data sreal", ":format:border swapped"],
        }
    }

    /// Read one reply in this encoding.
    ///
    /// `expected` is the number of values the caller asked for. It is required to
    /// delimit an indefinite-length binary block and ignored for ASCII.
    pub fn read_values(self, adapter: &mut dyn Adapter, expected: Option<usize>) -> AppResult<Vec<f64>> {
        match self {
            DataEncoding::Ascii => parse_ascii(&adapter.read_line()?),
            DataEncoding::BinarySingle => {
                let payload = read_block(adapter, expected.map(|n| n * 4))?;
                decode_f32_le(&payload)
            }
        }
    }
}

/// Parse a comma-separated list of decimal values.
pub fn parse_ascii(line: &str) -> AppResult<Vec<f64>> {
    let line = line.trim();
    if line.is_empty() {
        return Err(DaqError::Bus("empty reply where values were expected".into()));
    }
    line.split(',')
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .map_err(|e| DaqError::Bus(format!("bad value '{}' in reply: {}", field.trim(), e)))
        })
        .collect()
}

/// Read an IEEE-488.2 block (`#0...` or `#<n><len>...`) plus its terminator.
pub fn read_block(adapter: &mut dyn Adapter, indefinite_len: Option<usize>) -> AppResult<Vec<u8>> {
    let mut header = [0u8; 2];
    adapter.read_exact(&mut header)?;
    if header[0] != b'#' {
        return Err(DaqError::Bus(format!(
            "binary block must start with '#', got 0x{:02X}",
            header[0]
        )));
    }
    let digits = char::from(header[1])
        .to_digit(10)
        .ok_or_else(|| DaqError::Bus(format!("bad block header digit 0x{:02X}", header[1])))?;

    let len = if digits == 0 {
        indefinite_len.ok_or_else(|| {
            DaqError::Bus("indefinite binary block without an expected length".into())
        })?
    } else {
        let mut len_field = vec![0u8; digits as usize];
        adapter.read_exact(&mut len_field)?;
        std::str::from_utf8(&len_field)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| DaqError::Bus("bad binary block length field".into()))?
    };

    let mut payload = vec![0u8; len];
    adapter.read_exact(&mut payload)?;

    let mut terminator = [0u8; 1];
    adapter.read_exact(&mut terminator)?;
    trace!("binary block: {} payload bytes", len);
    Ok(payload)
}

/// Decode packed little-endian `f32` values.
pub fn decode_f32_le(payload: &[u8]) -> AppResult<Vec<f64>> {
    if payload.len() % 4 != 0 {
        return Err(DaqError::Bus(format!(
            "binary payload of {} bytes is not a whole number of floats",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|b| f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
        .collect())
}

/// Pack values into a definite-length block terminated by `\n`.
pub fn encode_block(values: &[f32]) -> Vec<u8> {
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let len = payload.len().to_string();
    let mut block = format!("#{}{}", len.len(), len).into_bytes();
    block.extend_from_slice(&payload);
    block.push(b'\n');
    block
}
