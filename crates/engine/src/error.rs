use event_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the engine when executing actions or folding streams.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A command was issued without a target stream.
    #[error("missing target stream")]
    MissingTarget,

    /// A payload failed its schema check. No store mutation occurred.
    #[error("validation failed for {name}: {reason}")]
    Validation { name: String, reason: String },

    /// A declared precondition failed for the current state and actor.
    /// No store mutation occurred.
    #[error("invariant violated by {action}: {description}")]
    Invariant { action: String, description: String },

    /// An action or event name has no registered handler or schema.
    /// This is a configuration-time defect, not a runtime data error.
    #[error("registration error: {0}")]
    Registration(String),

    /// The store rejected the operation (including version conflicts).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
