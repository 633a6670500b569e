//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by the telemetry export core.
///
/// None of these ever cross into the instrumented application's call path:
/// `publish` on both the aggregator and the dispatcher degrades to data loss
/// or subsystem disablement instead of returning an error.
#[derive(Error, Debug)]
pub enum TracewireError {
    /// A configuration value failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// A span carried data the encoder cannot represent
    #[error("Invalid span data: {0}")]
    InvalidSpan(String),

    /// A payload outgrew its byte ceiling
    #[error("Payload limit exceeded: {size} bytes over {limit} byte ceiling")]
    PayloadFull {
        /// Size the payload would have reached
        size: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// Low-level msgpack write failure
    #[error("Wire encoding error: {0}")]
    Encode(#[from] rmp::encode::ValueWriteError),

    /// The sink could not deliver a payload
    #[error("Transmit failed: {0}")]
    Transmit(String),

    /// The subsystem was shut off after a collector downgrade
    #[error("Exporter is disabled")]
    Disabled,

    /// Underlying IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure in the config layer
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for tracewire operations
pub type Result<T> = std::result::Result<T, TracewireError>;

impl TracewireError {
    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new invalid-span error
    pub fn invalid_span<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSpan(msg.into())
    }

    /// Creates a new transmit error
    pub fn transmit<S: Into<String>>(msg: S) -> Self {
        Self::Transmit(msg.into())
    }

    /// Returns true if the failure is transient and worth retrying downstream
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transmit(_) | Self::PayloadFull { .. })
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::InvalidSpan(_) => "validation",
            Self::PayloadFull { .. } => "capacity",
            Self::Encode(_) | Self::Serialization(_) => "serialization",
            Self::Transmit(_) => "transport",
            Self::Disabled => "lifecycle",
            Self::Io(_) => "io",
        }
    }
}
