//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire application.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur while talking to a source-measure unit and
//! sequencing pixel measurements.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the error sources and sorts them by how far they reach:
//!
//! - **`Connection`**: The instrument session could not be created, or the instrument
//!   did not identify itself as expected. These abort the whole run.
//! - **`Config`** / **`Configuration`**: Parse errors from the `figment` layers, and
//!   semantic errors caught by `Settings::validate`. Also fatal.
//! - **`Bus`**: A write, query, or read on an open session timed out or returned
//!   something that could not be decoded. Fatal to the pixel being measured only.
//! - **`InvalidSweep`**: A sweep or DC configuration was rejected before anything was
//!   sent to the hardware.
//! - **`Collaborator`**: An optional integration (notifier, archive, light source)
//!   failed. Callers log these and carry on.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling throughout the library with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Layered configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but holds values that make no sense.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Session creation or identity verification failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout or malformed response on an open session.
    #[error("Bus error: {0}")]
    Bus(String),

    /// Sweep or DC level parameters violate their invariants.
    #[error("Invalid sweep configuration: {0}")]
    InvalidSweep(String),

    /// Local I/O failure (sinks, files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An optional integration failed.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// The serial port has not been opened.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// Functionality compiled out of this build.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether this error must abort the whole run rather than only the current pixel.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Connection(_) | DaqError::Config(_) | DaqError::Configuration(_)
        )
    }
}
