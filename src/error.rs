//! Error taxonomy shared by the store, synchronizer and folder manager.
//!
//! Remote failures say which operation (and page) failed and how many pages
//! were already committed, so callers can tell whether progress survived.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Network or transport failure, including request timeouts.
    #[error("remote unavailable during {operation}: {message} ({committed_pages} page(s) committed, progress preserved)")]
    RemoteUnavailable {
        operation: String,
        message: String,
        committed_pages: u32,
    },

    /// Remaining call budget is below the safety threshold.
    #[error("rate limited, retry after {}s ({committed_pages} page(s) committed, progress preserved)", .retry_after.as_secs())]
    RateLimited {
        retry_after: Duration,
        committed_pages: u32,
    },

    #[error("authentication expired or rejected during {operation}; re-authenticate and retry")]
    AuthExpired { operation: String },

    #[error("a folder named '{0}' already exists")]
    NameConflict(String),

    #[error("folder '{0}' is a tag-query folder; its membership is derived from tags")]
    NotManualFolder(String),

    #[error("folder '{0}' not found")]
    FolderNotFound(String),

    #[error("repository {0} not found in the local store")]
    RepoNotFound(String),

    /// A queued star/unstar could not be propagated after the retry budget.
    #[error("pending conflict on {repo}: wanted starred={desired_starred}, {attempts} attempt(s) failed ({last_error})")]
    PendingConflict {
        repo: String,
        desired_starred: bool,
        attempts: u32,
        last_error: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage failure during {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

impl Error {
    /// Transport and rate-limit conditions can be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable { .. } | Error::RateLimited { .. }
        )
    }

    pub(crate) fn remote(operation: impl Into<String>, message: impl ToString) -> Self {
        Error::RemoteUnavailable {
            operation: operation.into(),
            message: message.to_string(),
            committed_pages: 0,
        }
    }

    /// Stamp the number of already committed pages onto remote failures.
    pub(crate) fn with_committed_pages(self, pages: u32) -> Self {
        match self {
            Error::RemoteUnavailable {
                operation, message, ..
            } => Error::RemoteUnavailable {
                operation,
                message,
                committed_pages: pages,
            },
            Error::RateLimited { retry_after, .. } => Error::RateLimited {
                retry_after,
                committed_pages: pages,
            },
            other => other,
        }
    }
}

/// Attach an operation name to rusqlite failures.
pub(crate) trait StorageContext<T> {
    fn storage(self, operation: &'static str) -> Result<T>;
}

impl<T> StorageContext<T> for std::result::Result<T, rusqlite::Error> {
    fn storage(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| Error::Storage { operation, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::remote("fetch page 1", "connection reset").is_retryable());
        assert!(Error::RateLimited {
            retry_after: Duration::from_secs(60),
            committed_pages: 2
        }
        .is_retryable());
        assert!(!Error::AuthExpired {
            operation: "fetch page 1".into()
        }
        .is_retryable());
        assert!(!Error::NameConflict("rust".into()).is_retryable());
    }

    #[test]
    fn test_committed_pages_in_message() {
        let err = Error::remote("fetch page 3", "timed out").with_committed_pages(2);
        let message = err.to_string();
        assert!(message.contains("fetch page 3"));
        assert!(message.contains("2 page(s) committed"));
    }
}
