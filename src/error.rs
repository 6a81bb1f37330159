use std::io;

use thiserror::Error;

/// Failures while writing or reading a learner checkpoint.
/// None of these are fatal: a failed load falls back to fresh parameters
/// and a failed save leaves the in-memory model untouched.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("checkpoint is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("could not replace checkpoint atomically: {0}")]
    Persist(#[from] tempfile::PersistError),
    #[error("checkpoint does not fit this model: {0}")]
    Shape(String),
    #[error("no checkpoint location configured")]
    NoStore,
}

/// Errors reported to callers of the coach.
#[derive(Debug, Error)]
pub enum CoachError {
    #[error("{0}")]
    Validation(String),
    #[error("Unknown or already processed recommendation_id")]
    NotFound(String),
    #[error(transparent)]
    Persistence(#[from] CheckpointError),
}
