/// Error types for koru-recall operations.
///
/// Every fallible operation in the crate returns `Result<T, RecallError>`.
/// Misses are not errors: lookups return `Option` and deletes return `bool`.
use thiserror::Error;

/// The main error type for koru-recall operations.
#[derive(Error, Debug)]
pub enum RecallError {
    /// A vector's dimensionality does not match the index
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the index was built for
        expected: usize,
        /// Dimension of the rejected vector
        actual: usize,
    },

    /// A key or record that had to exist was absent
    #[error("Key '{key}' not found")]
    NotFound {
        /// The key that was not found
        key: String,
    },

    /// A cache level had no room and nothing could be evicted
    #[error("Capacity exceeded at level {level}")]
    CapacityExceeded {
        /// The level that was full
        level: String,
    },

    /// Writing a checkpoint, spill file or store record failed
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// A checkpoint could not be decoded
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// A configuration value is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Raw I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A maintenance task observed the cancellation flag
    #[error("Task cancelled")]
    Cancelled,

    /// The database collaborator reported a failure
    #[error("Store error: {0}")]
    Store(String),
}

impl RecallError {
    /// Whether the error came from a durable write rather than in-memory state.
    ///
    /// Callers use this to keep serving from memory while persistence is down.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            RecallError::PersistenceFailure(_) | RecallError::Io(_) | RecallError::Store(_)
        )
    }
}

/// Result type alias for koru-recall operations.
pub type RecallResult<T> = Result<T, RecallError>;
