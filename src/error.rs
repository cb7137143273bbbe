//! Initialization-time errors
//!
//! Only setup can fail. Consistency faults observed while tracing are
//! counted by [`crate::fault::FaultLog`] and never reach the host program.

use thiserror::Error;

/// Errors reported to the caller of the tracer's setup routines
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Monotonic clock unavailable: {0}")]
    ClockUnavailable(String),

    #[error("Invalid tracer configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse tracer configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("A global tracer is already installed")]
    AlreadyInstalled,
}

/// Result type for tracer setup operations
pub type Result<T> = std::result::Result<T, TracerError>;
