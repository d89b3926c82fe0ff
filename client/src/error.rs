//! Error types for the Rollcall client.

use rollcall_engine::EntityType;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;

/// Local persistence failures. Fatal to the operation that hit them.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt log {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Remote store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote unreachable: {0}")]
    Connectivity(String),

    /// The server was reached but the write did not go through.
    #[error("remote write failed: {0}")]
    Transient(String),

    #[error("remote rejected payload: {0}")]
    Validation(String),

    #[error("could not decode remote row: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout(_) | RemoteError::Connectivity(_) | RemoteError::Transient(_)
        )
    }

    /// Whether the failure means the remote store could not be reached.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, RemoteError::Timeout(_) | RemoteError::Connectivity(_))
    }
}

impl From<sqlx::Error> for RemoteError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => RemoteError::Connectivity(e.to_string()),
            sqlx::Error::Database(ref db) => {
                // SQLSTATE classes 22 (data exception) and 23 (integrity
                // constraint) will fail the same way on every retry.
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                if code.starts_with("22") || code.starts_with("23") {
                    RemoteError::Validation(e.to_string())
                } else {
                    RemoteError::Transient(e.to_string())
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                RemoteError::Decode(e.to_string())
            }
            other => RemoteError::Transient(other.to_string()),
        }
    }
}

/// Errors returned by the data service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Validation and queue-state errors from the engine.
    #[error(transparent)]
    Engine(#[from] rollcall_engine::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{entity_type} '{id}' not found")]
    NotFound { entity_type: EntityType, id: String },

    #[error("mode unavailable: {0}")]
    ModeUnavailable(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether the caller sent something malformed.
    pub fn is_validation(&self) -> bool {
        match self {
            Error::Engine(e) => e.is_validation(),
            Error::Remote(RemoteError::Validation(_)) => true,
            _ => false,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_classification() {
        let timeout = RemoteError::Timeout(Duration::from_secs(5));
        assert!(timeout.is_retryable());
        assert!(timeout.is_connectivity());

        let transient = RemoteError::Transient("503".into());
        assert!(transient.is_retryable());
        assert!(!transient.is_connectivity());

        let invalid = RemoteError::Validation("bad".into());
        assert!(!invalid.is_retryable());
        assert!(!invalid.is_connectivity());
    }

    #[test]
    fn sqlx_pool_errors_are_connectivity() {
        assert!(RemoteError::from(sqlx::Error::PoolTimedOut).is_connectivity());
        assert!(RemoteError::from(sqlx::Error::PoolClosed).is_connectivity());
        assert!(matches!(
            RemoteError::from(sqlx::Error::RowNotFound),
            RemoteError::Transient(_)
        ));
    }

    #[test]
    fn validation_errors_are_flagged() {
        let err = Error::from(rollcall_engine::Error::MissingRequiredField("name".into()));
        assert!(err.is_validation());

        let err = Error::from(rollcall_engine::Error::MutationNotFound("m1".into()));
        assert!(!err.is_validation());

        let err = Error::from(StorageError::Unavailable("disk full".into()));
        assert!(!err.is_validation());
    }
}
