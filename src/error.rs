use std::io::Error as IoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("header protocol error: {0}")]
    HeaderProtocol(String),

    #[error("master server returned non-200 status: {0}")]
    MasterStatus(String),

    #[error("source reservation failed: {0}")]
    Reservation(String),

    #[error("relay configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress: {0}")]
    Shutdown(String),
}

impl RelayError {
    pub fn connect(msg: impl Into<String>) -> Self {
        RelayError::Connect(msg.into())
    }

    pub fn header_protocol(msg: impl Into<String>) -> Self {
        RelayError::HeaderProtocol(msg.into())
    }

    pub fn master_status(msg: impl Into<String>) -> Self {
        RelayError::MasterStatus(msg.into())
    }

    pub fn reservation(msg: impl Into<String>) -> Self {
        RelayError::Reservation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn shutdown(msg: impl Into<String>) -> Self {
        RelayError::Shutdown(msg.into())
    }
}

/// Result type alias for the relay subsystem.
pub type RelayResult<T> = std::result::Result<T, RelayError>;
