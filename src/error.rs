//! Muninn error types

use std::sync::Arc;

use crate::retryer::CancelOptions;

/// Muninn error types
///
/// Errors are shared between every observer of a query, so the type is
/// cheap to clone. Foreign errors are kept behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MuninnError {
    // Errors produced by user fetch / mutation functions
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("{0}")]
    Source(Arc<dyn std::error::Error + Send + Sync>),

    /// Terminal outcome of a cancelled fetch or retry loop.
    ///
    /// Never stored as a query's `error`: the query either reverts to the
    /// state it had before the fetch started, or (when `silent`) leaves the
    /// state to whichever fetch superseded it.
    #[error("operation cancelled")]
    Cancelled { revert: bool, silent: bool },

    // Configuration errors
    #[error("missing query function for key {0}")]
    MissingQueryFn(String),

    #[error("missing mutation function")]
    MissingMutationFn,

    #[error("query {0} is cached with a different data type")]
    TypeMismatch(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Lifecycle callbacks
    #[error("callback failed: {0}")]
    Callback(String),

    // Spawned execution panicked or was aborted
    #[error("task failed: {0}")]
    Task(String),
}

impl MuninnError {
    /// Wrap any error type.
    pub fn source_error<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MuninnError::Source(Arc::new(err))
    }

    /// Whether this is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MuninnError::Cancelled { .. })
    }

    /// Whether this error comes from invalid configuration.
    ///
    /// Configuration errors are returned synchronously and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            MuninnError::MissingQueryFn(_)
                | MuninnError::MissingMutationFn
                | MuninnError::TypeMismatch(_)
                | MuninnError::Configuration(_)
        )
    }

    pub(crate) fn cancelled(options: CancelOptions) -> Self {
        MuninnError::Cancelled {
            revert: options.revert,
            silent: options.silent,
        }
    }
}

/// Errors compare by their rendered message.
impl PartialEq for MuninnError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl From<toml::de::Error> for MuninnError {
    fn from(err: toml::de::Error) -> Self {
        MuninnError::Configuration(err.to_string())
    }
}

impl From<std::io::Error> for MuninnError {
    fn from(err: std::io::Error) -> Self {
        MuninnError::Configuration(err.to_string())
    }
}

/// Result type alias for Muninn operations
pub type Result<T> = std::result::Result<T, MuninnError>;
