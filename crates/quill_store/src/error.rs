//! Store error types.

use std::time::Duration;

use thiserror::Error;

use crate::naming::NameError;
use crate::waiter::WaitError;

/// Errors that can occur in a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The logical name could not be turned into a canonical key.
    #[error(transparent)]
    Naming(#[from] NameError),

    /// The backend failed to move data.
    #[error("{backend} backend failed for `{target}`: {detail}")]
    Transport {
        backend: &'static str,
        target: String,
        #[source]
        detail: TransportDetail,
    },

    /// The operation was cancelled through its token.
    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },

    /// The operation did not finish before its deadline.
    #[error("{operation} timed out after {after:?}")]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },

    /// One or more entries of a bulk operation failed.
    #[error(transparent)]
    Batch(Box<WaitError<String, StoreError>>),
}

/// Backend specific detail attached to a transport failure.
#[derive(Debug, Error)]
pub enum TransportDetail {
    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed or returned a non-success status.
    #[error("HTTP error{}: {message}", status_suffix(.status))]
    Http {
        status: Option<u16>,
        url: String,
        message: String,
    },

    /// Key/value engine failure.
    #[error("key/value error: {0}")]
    Kv(String),

    /// Stored document could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" {s}")).unwrap_or_default()
}

impl StoreError {
    /// Creates a transport error.
    pub fn transport(
        backend: &'static str,
        target: impl Into<String>,
        detail: impl Into<TransportDetail>,
    ) -> Self {
        Self::Transport {
            backend,
            target: target.into(),
            detail: detail.into(),
        }
    }

    /// Creates an HTTP transport error carrying the status and URL.
    pub fn http(
        backend: &'static str,
        status: Option<u16>,
        url: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let url = url.into();
        Self::Transport {
            backend,
            target: url.clone(),
            detail: TransportDetail::Http {
                status,
                url,
                message: message.into(),
            },
        }
    }

    /// Wraps the outcome of a failed batch.
    pub fn batch(error: WaitError<String, StoreError>) -> Self {
        Self::Batch(Box::new(error))
    }

    /// Returns the HTTP status of a transport failure, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Transport {
                detail: TransportDetail::Http { status, .. },
                ..
            } => *status,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_names_backend_and_target() {
        let err = StoreError::transport(
            "filesystem",
            "partials/header.html",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let text = err.to_string();
        assert!(text.contains("filesystem"));
        assert!(text.contains("partials/header.html"));
        assert!(text.contains("denied"));
    }

    #[test]
    fn http_error_exposes_status() {
        let err = StoreError::http("remote", Some(503), "http://localhost/x", "unavailable");
        assert_eq!(err.http_status(), Some(503));
        assert!(err.to_string().contains("HTTP error 503"));
    }
}
