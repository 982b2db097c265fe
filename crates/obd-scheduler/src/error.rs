//! Monitoring Error Types

use thiserror::Error;

/// Errors raised when starting a monitoring session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MonitorError {
    /// A session is already running on this connection
    #[error("A monitoring session is already active")]
    AlreadyActive,

    /// No adapter connection is ready
    #[error("No adapter connection")]
    NotConnected,

    /// The parameter list was empty
    #[error("No parameters selected for monitoring")]
    NoParameters,
}
