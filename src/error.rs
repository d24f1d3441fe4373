//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a test run can
//! hit, from configuration problems to unresponsive hardware.
//!
//! A note on what is *not* an error: a limit violation (measured current
//! outside its configured bounds) is a classification carried in the result
//! records, and a safety clamp on a computed scan amplitude is a warning.
//! Neither terminates a run by itself; the sequencer decides what to do with
//! them based on the configured policy.

use thiserror::Error;

use crate::core::AbortReason;

/// Convenience alias for results using the application error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Instrument '{alias}' not found in registry")]
    NotFound { alias: String },

    #[error("Instrument '{alias}' is already registered")]
    DuplicateAlias { alias: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Measurement error: {0}")]
    Measurement(String),

    #[error("Operation '{op}' is not supported by this instrument")]
    Unsupported { op: &'static str },

    #[error("Hardware command '{op}' timed out after {timeout_ms} ms")]
    Timeout { op: String, timeout_ms: u64 },

    #[error("Stage index {0} is outside 1..=7")]
    StageIndex(u8),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Sequence aborted: {0}")]
    Aborted(AbortReason),
}

impl From<figment::Error> for RigError {
    fn from(err: figment::Error) -> Self {
        RigError::ConfigLoad(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RigError::NotFound {
            alias: "DM1".to_string(),
        };
        assert_eq!(err.to_string(), "Instrument 'DM1' not found in registry");
    }

    #[test]
    fn test_abort_reason_display() {
        let err = RigError::Aborted(AbortReason::PowerLimit);
        assert_eq!(err.to_string(), "Sequence aborted: Power_Limit");
    }
}
