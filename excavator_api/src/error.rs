//! Daemon-level error type.

use thiserror::Error;

/// Errors surfaced by the coordinator and its engines.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Hardware access failed.
    #[error(transparent)]
    Hal(#[from] excavator_hal::HalError),

    /// Configuration load/validation failed.
    #[error(transparent)]
    Config(#[from] excavator_common::config::ConfigError),

    /// Datagram session failed.
    #[error(transparent)]
    Session(#[from] crate::session::SessionError),

    /// Watchdog channel failed.
    #[error(transparent)]
    Heartbeat(#[from] excavator_common::heartbeat::HeartbeatError),

    /// An operation or engine transition was rejected.
    #[error("{0}")]
    Transition(String),

    /// Generic I/O failure while starting an engine.
    #[error("I/O error: {source}")]
    Io {
        /// Source I/O error.
        #[from]
        source: std::io::Error,
    },
}

/// Result alias for daemon operations.
pub type ApiResult<T> = Result<T, ApiError>;
