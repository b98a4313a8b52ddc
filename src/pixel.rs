//! Pixel addressing and queue construction.
//!
//! A pixel address specification comes in one of two forms, chosen strictly by
//! prefix:
//!
//! - `0x`-prefixed hex bitmask: one byte per substrate, the first byte is
//!   substrate `A`, and within a byte the most significant bit is pixel 1.
//!   `0xFC` enables `A1`..`A6`.
//! - Literal list: concatenated `<letter><digit>` tokens, e.g. `A1B3A2`.
//!
//! Candidates are validated against the set of electrically connected substrates
//! and the pixel range 1..=8. Invalid candidates are dropped with a warning; they
//! never abort parsing of the rest.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::error::{AppResult, DaqError};

/// Pixels per substrate.
pub const PIXELS_PER_SUBSTRATE: u8 = 8;

/// Substrate letter plus pixel index in 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PixelAddress {
    substrate: char,
    pixel: u8,
}

impl PixelAddress {
    /// Build an address; the substrate is upper-cased, the pixel must be in 1..=8.
    pub fn new(substrate: char, pixel: u8) -> Option<Self> {
        let substrate = substrate.to_ascii_uppercase();
        if substrate.is_ascii_uppercase() && (1..=PIXELS_PER_SUBSTRATE).contains(&pixel) {
            Some(Self { substrate, pixel })
        } else {
            None
        }
    }

    /// Substrate letter.
    pub fn substrate(&self) -> char {
        self.substrate
    }

    /// Pixel index, 1-based.
    pub fn pixel(&self) -> u8 {
        self.pixel
    }
}

impl fmt::Display for PixelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.substrate, self.pixel)
    }
}

impl FromStr for PixelAddress {
    type Err = DaqError;

    fn from_str(token: &str) -> AppResult<Self> {
        let mut chars = token.chars();
        let parsed = match (chars.next(), chars.next(), chars.next()) {
            (Some(letter), Some(digit), None) => digit
                .to_digit(10)
                .and_then(|d| PixelAddress::new(letter, d as u8)),
            _ => None,
        };
        parsed.ok_or_else(|| DaqError::Configuration(format!("bad pixel address '{}'", token)))
    }
}

impl TryFrom<String> for PixelAddress {
    type Error = DaqError;

    fn try_from(value: String) -> AppResult<Self> {
        value.parse()
    }
}

impl From<PixelAddress> for String {
    fn from(address: PixelAddress) -> Self {
        address.to_string()
    }
}

/// Substrates that are electrically connected to the fixture.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubstrateSet(Vec<char>);

impl SubstrateSet {
    /// Build from letters, e.g. `"ABCD"`. Case-insensitive, duplicates ignored.
    pub fn from_letters(letters: &str) -> Self {
        let mut set = Vec::new();
        for c in letters.chars().filter(|c| c.is_ascii_alphabetic()) {
            let c = c.to_ascii_uppercase();
            if !set.contains(&c) {
                set.push(c);
            }
        }
        SubstrateSet(set)
    }

    /// Whether a substrate letter is connected.
    pub fn contains(&self, substrate: char) -> bool {
        self.0.contains(&substrate.to_ascii_uppercase())
    }

    /// Connected letters in the order given.
    pub fn letters(&self) -> &[char] {
        &self.0
    }
}

/// Parsed address specification; the form is decided once, by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSpec {
    /// One byte per substrate starting at `A`.
    Bitmask(Vec<u8>),
    /// Raw literal text, tokenised two characters at a time.
    LiteralList(String),
}

impl AddressSpec {
    /// Pick the form by the `0x` prefix and decode a bitmask eagerly.
    pub fn parse(spec: &str) -> AppResult<Self> {
        let spec = spec.trim();
        match spec.strip_prefix("0x").or_else(|| spec.strip_prefix("0X")) {
            Some(hex) => decode_hex(hex).map(AddressSpec::Bitmask),
            None => Ok(AddressSpec::LiteralList(spec.to_string())),
        }
    }
}

fn decode_hex(hex: &str) -> AppResult<Vec<u8>> {
    if hex.is_empty() || hex.len() % 2 != 0 {
        return Err(DaqError::Configuration(format!(
            "pixel bitmask '0x{}' must have an even, non-zero number of hex digits",
            hex
        )));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|byte| u8::from_str_radix(byte, 16).ok())
                .ok_or_else(|| DaqError::Configuration(format!("bad hex in pixel bitmask '0x{}'", hex)))
        })
        .collect()
}

/// FIFO of pixels in scan order.
pub type PixelQueue = VecDeque<PixelAddress>;

/// Expand an address specification into a validated queue.
///
/// Bitmask form yields substrate-major, pixel-ascending order. Literal form keeps
/// the input order.
pub fn build_queue(spec: &AddressSpec, connected: &SubstrateSet) -> PixelQueue {
    let mut queue = PixelQueue::new();
    match spec {
        AddressSpec::Bitmask(bytes) => {
            for (substrate_index, byte) in bytes.iter().enumerate() {
                for bit in 0..PIXELS_PER_SUBSTRATE {
                    if byte & (0x80 >> bit) == 0 {
                        continue;
                    }
                    let letter = u8::try_from(substrate_index)
                        .ok()
                        .and_then(|i| b'A'.checked_add(i))
                        .map(char::from);
                    match letter.and_then(|l| PixelAddress::new(l, bit + 1)) {
                        Some(address) if connected.contains(address.substrate()) => {
                            queue.push_back(address)
                        }
                        Some(address) => {
                            warn!("Discarded pixel {}: substrate not connected", address)
                        }
                        None => warn!(
                            "Discarded pixel bit {} of bitmask byte {}: no such substrate",
                            bit, substrate_index
                        ),
                    }
                }
            }
        }
        AddressSpec::LiteralList(text) => {
            let chars: Vec<char> = text.chars().collect();
            for chunk in chars.chunks(2) {
                let token: String = chunk.iter().collect();
                match token.parse::<PixelAddress>() {
                    Ok(address) if connected.contains(address.substrate()) => {
                        queue.push_back(address)
                    }
                    _ => warn!("Discarded bad pixel address: {}", token),
                }
            }
        }
    }
    queue
}

/// Parse and expand in one step.
pub fn queue_from_str(spec: &str, connected: &SubstrateSet) -> AppResult<PixelQueue> {
    Ok(build_queue(&AddressSpec::parse(spec)?, connected))
}

/// Substrates a hardware check should exercise.
///
/// The distinct substrate letters of `queue` in alphabetical order, or every
/// connected substrate when the queue is empty.
pub fn substrates_to_test(queue: &PixelQueue, connected: &SubstrateSet) -> Vec<char> {
    if queue.is_empty() {
        return connected.letters().to_vec();
    }
    let mut letters: Vec<char> = queue.iter().map(PixelAddress::substrate).collect();
    letters.sort_unstable();
    letters.dedup();
    letters
}
