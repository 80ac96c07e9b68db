//! Custom error types for the application.
//!
//! This module defines the primary error type, `SlaError`, for the whole crate.
//! Using the `thiserror` crate, it provides one place where every failure the
//! printer can hit is named, from serial transport problems to malformed
//! settings files.
//!
//! ## Error Hierarchy
//!
//! - **`Io` / `ShortWrite` / `SerialOpen`**: the serial link could not be opened
//!   or a write did not put every byte on the wire.
//! - **`Timeout` / `NoResponse` / `BufferFull`**: a bounded wait ran out. `NoResponse`
//!   is the typed outcome of a controller query that got no reply; callers decide
//!   whether to retry.
//! - **`Parse` / `Encoding`**: a reply line was too short or not numeric, or a
//!   request could not be expressed on the wire.
//! - **`Filesystem`**: the image directory could not be enumerated.
//! - **`Device`**: an error character reported by the controller itself.
//! - **`SettingsParse`**: a row of the layer settings file is malformed.
//! - **`Config` / `Configuration`**: loading or validating `PrinterConfig` failed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SlaError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum SlaError {
    /// The configuration sources could not be read or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configuration value failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Port or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or did not report open.
    #[error("Failed to open serial port '{port}': {reason}")]
    SerialOpen {
        /// Port identifier as configured.
        port: String,
        /// What the serial layer reported.
        reason: String,
    },

    /// Fewer bytes than requested reached the port.
    #[error("Short write to serial port: wrote {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes the port accepted.
        written: usize,
        /// Bytes in the line.
        expected: usize,
    },

    /// The link has been closed or was never opened.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// Built without the `instrument_serial` feature.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// A bounded wait ran out.
    #[error("Timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        /// What was being waited for.
        waiting_for: String,
        /// Time spent before giving up.
        elapsed: Duration,
    },

    /// A controller query got no terminated reply.
    #[error("No response to '{command}' within {timeout:?}")]
    NoResponse {
        /// The query line, without terminator.
        command: String,
        /// Read timeout that expired.
        timeout: Duration,
    },

    /// A reply filled the read buffer without a terminator.
    #[error("Read buffer full after {0} bytes without a line terminator")]
    BufferFull(usize),

    /// A reply line was too short, had the wrong header or was not numeric.
    #[error("Cannot parse reply {line:?}: {reason}")]
    Parse {
        /// The offending reply.
        line: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A request cannot be expressed on the wire.
    #[error("Cannot encode command '{command}': {reason}")]
    Encoding {
        /// Wire code of the command.
        command: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A path could not be opened or listed.
    #[error("Filesystem error at '{}': {source}", path.display())]
    Filesystem {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An error character reported by the controller.
    #[error("Device error '{code}': {description}")]
    Device {
        /// Error character from the `TE` reply.
        code: char,
        /// Manual text for the character.
        description: &'static str,
    },

    /// A layer settings row is malformed or out of range.
    #[error("Settings file line {line}: {reason}")]
    SettingsParse {
        /// One-based line number in the file, header included.
        line: u64,
        /// What was wrong with the row.
        reason: String,
    },

    /// A layer image could not be loaded or presented.
    #[error("Frame error: {0}")]
    Frame(String),

    /// The light engine rejected a call.
    #[error("Light engine error: {0}")]
    LightEngine(String),

    /// The background stage move panicked or was cancelled.
    #[error("Stage move task failed: {0}")]
    MoveTask(String),
}

impl SlaError {
    /// True when a controller query was sent but nothing came back in time.
    pub fn is_no_response(&self) -> bool {
        matches!(self, SlaError::NoResponse { .. })
    }

    pub(crate) fn parse(line: impl Into<String>, reason: impl Into<String>) -> Self {
        SlaError::Parse {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for SlaError {
    fn from(err: figment::Error) -> Self {
        SlaError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SlaError::Device {
            code: 'G',
            description: "Displacement out of limits",
        };
        assert_eq!(
            err.to_string(),
            "Device error 'G': Displacement out of limits"
        );
    }

    #[test]
    fn test_no_response_is_distinguishable() {
        let err = SlaError::NoResponse {
            command: "1TP?".into(),
            timeout: Duration::from_millis(20),
        };
        assert!(err.is_no_response());
        assert!(!SlaError::BufferFull(63).is_no_response());
    }

    #[test]
    fn test_filesystem_error_names_path() {
        let err = SlaError::Filesystem {
            path: PathBuf::from("/missing/layers"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert!(err.to_string().contains("/missing/layers"));
    }
}
