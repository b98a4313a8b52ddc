//! Core library for the iv_daq application.
//!
//! This library contains the instrument drivers, data structures, and the
//! measurement orchestrator for current-voltage characterization of solar-cell
//! substrates with a source-measure unit. It is used by the `iv_daq` binary and
//! by the integration tests, which drive it through a scripted adapter.

pub mod adapters;
pub mod config;
pub mod error;
pub mod instrument;
pub mod measurement;
pub mod orchestrator;
pub mod pixel;

pub use error::{AppResult, DaqError};
