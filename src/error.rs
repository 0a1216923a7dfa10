//! Custom error types for the probe driver.
use thiserror::Error;

/// Errors surfaced by the driver, the pipeline and the shell.
///
/// The `Display` strings are what the line protocol prints inside `e-[…]`,
/// so they are phrased for the measurement harness, not for a backtrace.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("cannot open device: {0}")]
    CannotOpen(String),

    #[error("communication error: {0}")]
    Communication(String),

    #[error("control transfer timed out")]
    Timeout,

    #[error("Ring-buffer exhausted")]
    RingExhausted,

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_exhaustion_message_matches_the_line_protocol() {
        assert_eq!(ProbeError::RingExhausted.to_string(), "Ring-buffer exhausted");
    }

    #[test]
    fn io_errors_convert_implicitly() {
        fn touch_missing() -> Result<String> {
            Ok(std::fs::read_to_string("/nonexistent/js110")?)
        }
        assert!(matches!(touch_missing().unwrap_err(), ProbeError::Io(_)));
    }
}
