//! Code generator seam.
//!
//! Turning template text into a [`Renderer`] is the job of an external
//! generator; the compiler only caches and names what it produces.

use std::sync::Arc;

use quill_store::{Content, Renderer};
use thiserror::Error;

/// Rejection of template content by a generator.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GenerateError {
    pub message: String,
}

impl GenerateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Produces renderers from template content.
pub trait Generator: Send + Sync + 'static {
    /// Compiles content into a renderer.
    ///
    /// `options` is the opaque generator section of the compiler options.
    fn generate(
        &self,
        content: &Content,
        options: &serde_json::Value,
    ) -> Result<Arc<dyn Renderer>, GenerateError>;

    /// Loads a renderer from source previously persisted by a store.
    fn materialize(
        &self,
        _source: &str,
        _options: &serde_json::Value,
    ) -> Result<Arc<dyn Renderer>, GenerateError> {
        Err(GenerateError::new("generator cannot load persisted code"))
    }
}
