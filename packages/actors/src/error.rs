//! Error types for the runtime.

use coord_core::{DispatchError, JobError, StoreError};
use thiserror::Error;

/// Failures talking to a queue engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("queue engine unavailable: {0}")]
    Unavailable(String),

    #[error("queue engine messaging failed: {0}")]
    Messaging(String),

    #[error("queue engine timed out")]
    Timeout,
}

/// Errors surfaced by [`crate::JobClient`] and the delay helpers.
///
/// A job that runs and fails is not an error here: it is reported through
/// [`crate::PerformOutcome::Failed`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no worker registered as {0}")]
    UnknownWorker(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("hook failed: {0}")]
    Hook(#[from] JobError),

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}
