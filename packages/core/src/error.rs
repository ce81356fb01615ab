//! Error types shared across the coordination layer.

use thiserror::Error;

/// Failures reported by a key-value store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("key-value store error: {0}")]
    Backend(String),
}

/// Errors raised while registering or dispatching delayed invocations.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("unknown delay class: {0}")]
    UnknownClass(String),

    /// Raised at setup time when deferring a method the class does not define.
    #[error(
        "attempted to handle {class}#{method} asynchronously but {method} was not yet defined"
    )]
    UnsupportedDeferredMethod { class: String, method: String },

    #[error("{class} does not respond to {method}")]
    UnknownMethod { class: String, method: String },

    /// A raising finder could not locate the record.
    #[error("couldn't find {class} with id={id}")]
    RecordNotFound { class: String, id: String },

    #[error("invocation of {class}#{method} failed: {message}")]
    Invocation {
        class: String,
        method: String,
        message: String,
    },

    #[error("invalid delayed payload: {0}")]
    InvalidPayload(String),
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    /// A lock was declared without any attribute to lock on.
    #[error("{0}: what should i lock on?")]
    MissingLockAttributes(String),
}

/// Why a job's perform did not complete successfully.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("{0}")]
    Handler(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job panicked: {0}")]
    Panicked(String),
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        JobError::Handler(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        JobError::Handler(message.to_string())
    }
}
