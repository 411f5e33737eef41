//! Compiler error types.

use quill_store::{NameError, RenderError, StoreError};
use thiserror::Error;

use crate::config::RenderTimePolicy;
use crate::generator::GenerateError;

/// Errors that can occur while compiling or rendering templates.
#[derive(Debug, Error)]
pub enum QuillError {
    /// The logical name could not be resolved.
    #[error("Name resolution error: {0}")]
    Naming(#[from] NameError),

    /// No backend could supply content for the name.
    #[error("No content for `{name}` (key `{key}`, render-time policy `{policy}`)")]
    ContentNotFound {
        name: String,
        key: String,
        policy: RenderTimePolicy,
    },

    /// The code generator rejected the content.
    #[error("Failed to compile `{name}` (key `{key}`): {source}")]
    Compile {
        name: String,
        key: String,
        #[source]
        source: GenerateError,
    },

    /// A store operation failed on behalf of a name.
    #[error("Store error for `{name}` (key `{key}`): {source}")]
    StoreFor {
        name: String,
        key: String,
        #[source]
        source: StoreError,
    },

    /// A store operation not tied to a single name failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A compiled renderer failed.
    #[error("Failed to render `{name}`: {source}")]
    Render {
        name: String,
        #[source]
        source: RenderError,
    },

    /// File watching could not be set up.
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// The store backend does not support the operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QuillError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Attaches a name and key to a store failure.
    pub fn store_for(name: impl Into<String>, key: impl Into<String>, source: StoreError) -> Self {
        Self::StoreFor {
            name: name.into(),
            key: key.into(),
            source,
        }
    }

    /// Returns whether the failure came from a cancelled operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::Cancelled { .. })
                | Self::StoreFor {
                    source: StoreError::Cancelled { .. },
                    ..
                }
        )
    }
}
