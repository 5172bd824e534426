use std::fmt;
use thiserror::Error;

use crate::txn::context::Step;

/// Error codes reported by the data-access layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    // General errors
    NoError = 0,
    Failed = 1,
    Internal = 4,
    BadParameter = 10,
    SerializationError = 40,
    ConfigError = 41,

    // Storage errors
    StorageUnavailable = 1100,
    StorageTimeout = 1101,
    StorageRejected = 1102,
    DuplicateKey = 1103,
    WriteConflict = 1104,
    DriverError = 1105,

    // Transaction errors
    SessionAcquisition = 1900,
    TransactionStart = 1901,
    TransactionOperation = 1902,
    TransactionCommit = 1903,
    TransactionInvalidState = 1904,
}

impl ErrorCode {
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NoError => write!(f, "no error"),
            ErrorCode::Failed => write!(f, "failed"),
            ErrorCode::Internal => write!(f, "internal error"),
            ErrorCode::BadParameter => write!(f, "bad parameter"),
            ErrorCode::SerializationError => write!(f, "serialization error"),
            ErrorCode::ConfigError => write!(f, "configuration error"),
            ErrorCode::StorageUnavailable => write!(f, "storage unavailable"),
            ErrorCode::StorageTimeout => write!(f, "storage timeout"),
            ErrorCode::StorageRejected => write!(f, "rejected by storage"),
            ErrorCode::DuplicateKey => write!(f, "duplicate key"),
            ErrorCode::WriteConflict => write!(f, "write conflict"),
            ErrorCode::DriverError => write!(f, "driver error"),
            ErrorCode::SessionAcquisition => write!(f, "session acquisition failed"),
            ErrorCode::TransactionStart => write!(f, "transaction start failed"),
            ErrorCode::TransactionOperation => write!(f, "transactional operation failed"),
            ErrorCode::TransactionCommit => write!(f, "transaction commit failed"),
            ErrorCode::TransactionInvalidState => write!(f, "invalid transaction state"),
        }
    }
}

/// Errors raised by a storage collaborator (driver or in-memory engine)
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("MongoDB error: {0}")]
    Driver(#[from] mongodb::error::Error),

    #[error("{step} timed out")]
    Timeout { step: Step },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("write conflict on collection '{0}'")]
    WriteConflict(String),

    #[error("duplicate key {0}")]
    DuplicateKey(String),

    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error("invalid session state: {0}")]
    InvalidState(String),
}

impl StorageError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            StorageError::Driver(_) => ErrorCode::DriverError,
            StorageError::Timeout { .. } => ErrorCode::StorageTimeout,
            StorageError::Unavailable(_) => ErrorCode::StorageUnavailable,
            StorageError::WriteConflict(_) => ErrorCode::WriteConflict,
            StorageError::DuplicateKey(_) => ErrorCode::DuplicateKey,
            StorageError::Rejected(_) => ErrorCode::StorageRejected,
            StorageError::InvalidState(_) => ErrorCode::TransactionInvalidState,
        }
    }

    /// Whether re-running the whole mutation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Driver(e) => {
                e.contains_label(mongodb::error::TRANSIENT_TRANSACTION_ERROR)
                    || e.contains_label(mongodb::error::UNKNOWN_TRANSACTION_COMMIT_RESULT)
            }
            StorageError::Timeout { .. }
            | StorageError::Unavailable(_)
            | StorageError::WriteConflict(_) => true,
            StorageError::DuplicateKey(_)
            | StorageError::Rejected(_)
            | StorageError::InvalidState(_) => false,
        }
    }
}

/// Main error type of the data-access layer
#[derive(Error, Debug)]
pub enum DaoError {
    #[error("start session failed: {0}")]
    SessionAcquisition(#[source] StorageError),

    #[error("start transaction failed: {0}")]
    TransactionStart(#[source] StorageError),

    #[error("operation failed: {0}")]
    Operation(#[source] StorageError),

    #[error("commit failed: {0}")]
    Commit(#[source] StorageError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("BSON serialization error: {0}")]
    BsonSer(#[from] bson::ser::Error),

    #[error("BSON deserialization error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<mongodb::error::Error> for DaoError {
    fn from(e: mongodb::error::Error) -> Self {
        DaoError::Storage(StorageError::Driver(e))
    }
}

impl DaoError {
    pub fn internal(message: impl Into<String>) -> Self {
        DaoError::Internal(message.into())
    }

    pub fn bad_parameter(message: impl Into<String>) -> Self {
        DaoError::BadParameter(message.into())
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            DaoError::SessionAcquisition(_) => ErrorCode::SessionAcquisition,
            DaoError::TransactionStart(_) => ErrorCode::TransactionStart,
            DaoError::Operation(_) => ErrorCode::TransactionOperation,
            DaoError::Commit(_) => ErrorCode::TransactionCommit,
            DaoError::Storage(e) => e.error_code(),
            DaoError::Config(_) => ErrorCode::ConfigError,
            DaoError::Validation(_) => ErrorCode::BadParameter,
            DaoError::Serde(_) | DaoError::BsonSer(_) | DaoError::BsonDe(_) => {
                ErrorCode::SerializationError
            }
            DaoError::BadParameter(_) => ErrorCode::BadParameter,
            DaoError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// The storage error behind a transactional failure, if any.
    pub fn storage_error(&self) -> Option<&StorageError> {
        match self {
            DaoError::SessionAcquisition(e)
            | DaoError::TransactionStart(e)
            | DaoError::Operation(e)
            | DaoError::Commit(e)
            | DaoError::Storage(e) => Some(e),
            _ => None,
        }
    }

    /// Classification for callers that want to retry the whole call.
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        self.storage_error().is_some_and(StorageError::is_transient)
    }
}

/// Result type alias for data-access operations
pub type Result<T> = std::result::Result<T, DaoError>;

/// Result type alias for storage collaborator calls
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_codes_are_distinct() {
        let op = DaoError::Operation(StorageError::Rejected("boom".into()));
        let commit = DaoError::Commit(StorageError::Rejected("boom".into()));
        assert_eq!(op.error_code(), ErrorCode::TransactionOperation);
        assert_eq!(commit.error_code(), ErrorCode::TransactionCommit);
        assert_ne!(op.error_code(), commit.error_code());
    }

    #[test]
    fn test_retry_classification() {
        let conflict = DaoError::Commit(StorageError::WriteConflict("class".into()));
        assert!(conflict.is_retryable());

        let timeout = DaoError::Operation(StorageError::Timeout { step: Step::Execute });
        assert!(timeout.is_retryable());

        let dup = DaoError::Operation(StorageError::DuplicateKey("1".into()));
        assert!(!dup.is_retryable());

        assert!(!DaoError::bad_parameter("x").is_retryable());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::StorageRejected.to_string(), "rejected by storage");
        assert_eq!(ErrorCode::DriverError.to_string(), "driver error");
        assert_eq!(ErrorCode::TransactionInvalidState.to_string(), "invalid transaction state");
        assert_eq!(ErrorCode::TransactionCommit.as_u32(), 1903);
    }

    #[test]
    fn test_storage_error_display() {
        let e = StorageError::Timeout { step: Step::Abort };
        assert_eq!(e.to_string(), "abort transaction timed out");
        let e = DaoError::SessionAcquisition(StorageError::Unavailable("pool exhausted".into()));
        assert_eq!(e.to_string(), "start session failed: storage unavailable: pool exhausted");
    }
}
