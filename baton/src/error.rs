use thiserror::Error;

use crate::song::{OwnerId, SongId};

/// Result type for baton operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the workflow engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Song request not found in the store
    #[error("song request not found: {0}")]
    RequestNotFound(SongId),

    /// Owner not found in the store
    #[error("owner not found: {0}")]
    OwnerNotFound(OwnerId),

    /// Store operation failed for a reason that may be transient
    #[error("store error: {0}")]
    Store(String),

    /// A row with the same ID already exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Guarded credit decrement would take the balance below zero
    #[error("insufficient credits for owner {owner_id}: {available} available, {requested} requested")]
    InsufficientCredits {
        owner_id: OwnerId,
        available: u32,
        requested: u32,
    },

    /// HTTP transport failed before a response was produced
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Trigger event data does not carry the fields the workflow needs
    #[error("malformed trigger: {0}")]
    MalformedTrigger(String),

    /// No workflow registered for the event name
    #[error("no workflow registered for event: {0}")]
    UnknownWorkflow(String),

    /// A durable step reached a terminal failure (recorded in the step log)
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Whether the step executor should retry the failed operation.
    ///
    /// Store and transport failures are assumed transient; everything else
    /// (missing rows, malformed data, recorded step failures) will not get
    /// better by running again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_) | Error::Http(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Store(err.to_string())
    }
}
