//! OBD-II Error Types

use thiserror::Error;

/// Errors raised by the half-duplex command channel
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// A command is already outstanding on the channel
    #[error("Command channel busy: a command is already pending")]
    Busy,

    /// Timeout waiting for a response frame
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// The pending command was cancelled by a disconnect
    #[error("Pending command cancelled")]
    Cancelled,

    /// The adapter answered with an explicit no-data or error marker
    #[error("Adapter reported: {0}")]
    AdapterError(String),

    /// The response could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Writing to the byte-stream failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The byte-stream has been closed
    #[error("Command channel closed")]
    Closed,

    /// The response payload could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Transport(err.to_string())
    }
}

/// Errors raised while decoding parameter payloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// PID not present in the parameter table
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    /// Payload shorter than the PID formula requires
    #[error("PID {pid} needs {expected} data bytes, got {actual}")]
    InsufficientData {
        pid: String,
        expected: usize,
        actual: usize,
    },

    /// Response text is not a well-formed hex payload
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Errors during connection bring-up and teardown
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Opening or closing the byte-stream failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// A configuration or protocol-detect step failed
    #[error("Adapter initialization failed at step '{step}': {source}")]
    InitializationFailed {
        step: &'static str,
        #[source]
        source: ChannelError,
    },

    /// The supported-parameter query failed
    #[error("ECU discovery failed: {0}")]
    Discovery(#[source] ChannelError),

    /// The connect budget ran out
    #[error("Connection attempt timed out after {0}ms")]
    Timeout(u64),

    /// A connection is already established or in progress
    #[error("Adapter already connected")]
    AlreadyConnected,

    /// No connection is established
    #[error("Adapter not connected")]
    NotConnected,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Transport(err.to_string())
    }
}
