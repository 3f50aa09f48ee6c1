//! Checkpoint store error types.

/// Errors produced by [`CheckpointStore`](crate::CheckpointStore)
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint payload could not be (de)serialized.
    #[error("checkpoint encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Internal lock was poisoned by a panicked thread.
    #[error("checkpoint store lock poisoned")]
    LockPoisoned,

    /// Append-only violation: a conflicting record already exists for
    /// the same `(run, stage, key)`. Indicates a concurrency bug or
    /// duplicate run id misuse.
    #[error("conflicting checkpoint for run '{run_id}' stage '{stage}' key '{key}'")]
    Conflict {
        run_id: String,
        stage: String,
        key: String,
    },
}

impl StateError {
    /// Returns `true` for the append-only conflict case.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
