//! Error kinds shared by every layer of the stack.
//!
//! Application-facing helpers (settings file, logging setup) return
//! `anyhow::Result`; everything below them returns [`Result`].

use std::io;

/// Errors produced by the HCI, L2CAP and controller layers.
#[derive(Debug, thiserror::Error)]
pub enum BtError {
    /// Protocol inconsistency or stray event.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The underlying USB transport failed.
    #[error("transport failure: {0}")]
    IosException(#[from] io::Error),

    /// A worker task or queue could not be created or reached.
    #[error("scheduler failure: {0}")]
    SchedulerFailure(String),

    /// The caller passed an out-of-range value.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The host controller answered a command with a non-zero status.
    #[error("command {opcode:#06x} failed with status {status:#04x}")]
    RequestError { opcode: u16, status: u8 },

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A signalling exchange was refused by the peer; carries the result code.
    #[error("signal failed with result {0:#06x}")]
    SignalFailed(u16),

    #[error("{0} is already open")]
    AlreadyOpen(String),

    #[error("driver {0:#06x} failed to initialize")]
    DriverInitFail(u16),

    #[error("no driver found for {0}")]
    NoDriverFound(String),
}

impl BtError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }

    /// Whether this error is the common "device went away / wrong button"
    /// kind that is logged at info level rather than error.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed(_) | Self::Timeout(_) | Self::SignalFailed(_)
        )
    }
}

impl From<tokio::task::JoinError> for BtError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::SchedulerFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_display() {
        let err = BtError::RequestError {
            opcode: 0x0c03,
            status: 0x12,
        };
        assert_eq!(err.to_string(), "command 0x0c03 failed with status 0x12");
    }

    #[test]
    fn test_io_error_maps_to_transport_failure() {
        let err: BtError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, BtError::IosException(_)));
    }

    #[test]
    fn test_connection_failures_are_classified() {
        assert!(BtError::Timeout("channel".into()).is_connection_failure());
        assert!(BtError::SignalFailed(2).is_connection_failure());
        assert!(!BtError::runtime("stray").is_connection_failure());
    }
}
