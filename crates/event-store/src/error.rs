use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The expected version did not match the stream's current version, or
    /// the commit's wake-up notification failed and the transaction was
    /// rolled back.
    #[error("concurrency conflict on stream {stream}: expected version {expected}, found {actual}")]
    Concurrency {
        stream: String,
        expected: i64,
        actual: i64,
    },

    /// The commit request itself was malformed (e.g. no messages).
    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
