//! Error taxonomy for the collection engine
//!
//! Every fallible operation in the engine returns an [`EngineError`], whose
//! [`EngineError::code`] classifies it into the shared [`ErrorCode`] taxonomy
//! used for propagation decisions (see the Worker's reconnect / stop logic)
//! and for the error field surfaced in status snapshots.

use thiserror::Error;

/// Classification-only taxonomy. Carried alongside the human-readable
/// [`EngineError`] so callers can match on "kind" without parsing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    InvalidParameter,
    ConfigurationError,
    AccessDenied,
    ResourceBusy,
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionLost,
    ProtocolError,
    ChecksumError,
    DeviceNotFound,
    DeviceBusy,
    DeviceError,
    InvalidAddress,
    DataTypeMismatch,
    DataOutOfRange,
    DataCorruption,
    SystemError,
    NotImplemented,
}

impl ErrorCode {
    /// Connection-class errors move an owning Worker to `RECONNECTING`.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed | ErrorCode::ConnectionTimeout | ErrorCode::ConnectionLost
        )
    }

    /// Configuration-class errors are fatal to the owning Worker only.
    pub fn is_configuration_class(&self) -> bool {
        matches!(self, ErrorCode::ConfigurationError | ErrorCode::NotImplemented)
    }
}

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("configuration error ({key}): {message}")]
    ConfigurationError { key: String, message: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("resource busy: {0}")]
    ResourceBusy(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timed out after {0}ms")]
    ConnectionTimeout(u64),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("checksum error")]
    ChecksumError,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("device error: {0}")]
    DeviceError(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("data type mismatch: expected {expected}, got {actual}")]
    DataTypeMismatch { expected: String, actual: String },

    #[error("data out of range: {0}")]
    DataOutOfRange(String),

    #[error("data corruption: {0}")]
    DataCorruption(String),

    #[error("system error: {0}")]
    SystemError(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidParameter(_) => ErrorCode::InvalidParameter,
            EngineError::ConfigurationError { .. } => ErrorCode::ConfigurationError,
            EngineError::AccessDenied(_) => ErrorCode::AccessDenied,
            EngineError::ResourceBusy(_) => ErrorCode::ResourceBusy,
            EngineError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            EngineError::ConnectionTimeout(_) => ErrorCode::ConnectionTimeout,
            EngineError::ConnectionLost(_) => ErrorCode::ConnectionLost,
            EngineError::ProtocolError(_) => ErrorCode::ProtocolError,
            EngineError::ChecksumError => ErrorCode::ChecksumError,
            EngineError::DeviceNotFound(_) => ErrorCode::DeviceNotFound,
            EngineError::DeviceBusy(_) => ErrorCode::DeviceBusy,
            EngineError::DeviceError(_) => ErrorCode::DeviceError,
            EngineError::InvalidAddress(_) => ErrorCode::InvalidAddress,
            EngineError::DataTypeMismatch { .. } => ErrorCode::DataTypeMismatch,
            EngineError::DataOutOfRange(_) => ErrorCode::DataOutOfRange,
            EngineError::DataCorruption(_) => ErrorCode::DataCorruption,
            EngineError::SystemError(_) => ErrorCode::SystemError,
            EngineError::NotImplemented(_) => ErrorCode::NotImplemented,
        }
    }

    pub fn configuration(key: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::ConfigurationError {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::SystemError(format!("database error: {e}"))
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::SystemError(format!("cache error: {e}"))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::SystemError(format!("history sink error: {e}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
