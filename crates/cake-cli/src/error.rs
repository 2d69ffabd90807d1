//! Error types for the CLI

use cake_common::telemetry::TelemetryError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A library operation failed
    #[error(transparent)]
    Cake(#[from] cake_common::Error),

    /// Logging could not be set up
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// Local filesystem or process failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
