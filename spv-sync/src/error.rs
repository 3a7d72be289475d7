//! Error types for the SPV sync engines.

use thiserror::Error;

/// Main error type for the SPV sync engines.
#[derive(Debug, Error)]
pub enum SpvError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// Logging-related errors.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to create log directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    #[error("Subscriber initialization failed: {0}")]
    SubscriberInit(String),

    #[error("Log rotation failed: {0}")]
    RotationFailed(String),
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Peer disconnected: {0}")]
    PeerDisconnected(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Block not found: {0}")]
    BlockNotFound(String),
}

/// Storage-related errors.
#[derive(Debug, Error, Clone)]
pub enum StorageError {
    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),
}

/// Validation-related errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),

    #[error("Invalid header chain: {0}")]
    InvalidHeaderChain(String),

    #[error("Block timestamp {timestamp} is too far in the future (max {max_timestamp})")]
    TimestampTooFarInFuture {
        timestamp: u32,
        max_timestamp: u32,
    },

    #[error("Checkpoint mismatch at height {height}: expected {expected}, got {actual}")]
    CheckpointMismatch {
        height: u32,
        expected: bitcoin::BlockHash,
        actual: bitcoin::BlockHash,
    },

    #[error("Invalid filter header chain: {0}")]
    InvalidFilterHeaderChain(String),
}

/// A condition the process must not continue past.
///
/// Raised when an atomic batch write fails or a write would break the append-only
/// ordering of a store. Engine loops terminate on it and hand it to the caller.
#[derive(Debug, Error, Clone)]
#[error("fatal error during {operation}: {cause}")]
pub struct FatalError {
    /// The operation that failed.
    pub operation: &'static str,
    /// What went wrong.
    pub cause: String,
}

impl FatalError {
    pub fn new(operation: &'static str, cause: impl Into<String>) -> Self {
        Self {
            operation,
            cause: cause.into(),
        }
    }
}

/// Synchronization-related errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Indicates an invalid state in the sync process (e.g., a reorg in progress
    /// while filter headers are being fetched)
    #[error("Invalid sync state: {0}")]
    InvalidState(String),

    /// Indicates a missing dependency required for sync (e.g., missing previous block)
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// Network-related errors (e.g., no peers answered a query)
    #[error("Network error: {0}")]
    Network(String),

    /// Validation errors for data received during sync
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage-related errors that do not compromise chain invariants
    #[error("Storage error: {0}")]
    Storage(String),

    /// Peers kept disagreeing on filter checkpoints after resolution
    #[error("Checkpoint negotiation failed: {0}")]
    CheckpointNegotiation(String),

    /// Shutdown was requested while waiting
    #[error("Sync cancelled")]
    Cancelled,

    /// Unrecoverable invariant violation, must reach process-level shutdown
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl SyncError {
    /// Returns a static string representing the error category based on the variant
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::InvalidState(_) | SyncError::Cancelled => "state",
            SyncError::Validation(_) => "validation",
            SyncError::MissingDependency(_) => "dependency",
            SyncError::Network(_) => "network",
            SyncError::Storage(_) => "storage",
            SyncError::CheckpointNegotiation(_) => "negotiation",
            SyncError::Fatal(_) => "fatal",
        }
    }

    /// Whether the engine loop must stop on this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_))
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<ValidationError> for SyncError {
    fn from(err: ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<NetworkError> for SyncError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Cancelled => SyncError::Cancelled,
            other => SyncError::Network(other.to_string()),
        }
    }
}

/// Type alias for Result with SpvError.
pub type Result<T> = std::result::Result<T, SpvError>;

/// Type alias for network operation results.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for validation operation results.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Type alias for sync operation results.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Type alias for logging operation results.
pub type LoggingResult<T> = std::result::Result<T, LoggingError>;
