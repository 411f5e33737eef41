//! Cached record types.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::naming::QueryParams;

/// Raw content of a partial, template or context document.
///
/// Structured content is replaced wholesale on re-registration; it is never
/// merged with a previous value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Json(serde_json::Value),
}

impl Content {
    /// Returns the textual form of the content.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Content::Text(text) => std::borrow::Cow::Borrowed(text),
            Content::Json(value) => std::borrow::Cow::Owned(value.to_string()),
        }
    }

    /// Parses file or response text, treating `.json` documents as structured.
    pub fn from_source(text: String, extension: Option<&str>) -> Self {
        let is_json = extension.is_some_and(|ext| ext.trim_start_matches('.') == "json");
        if is_json && let Ok(value) = serde_json::from_str(&text) {
            return Content::Json(value);
        }
        Content::Text(text)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_string())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Content::Json(value)
    }
}

/// How a partial record entered the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordOrigin {
    /// Registered through the public API.
    Explicit,
    /// Read or enumerated from a backend, or re-read by a watcher.
    Discovered,
}

/// Textual source of a partial or primary template.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRecord {
    pub canonical_key: String,
    /// Logical name the record was registered under.
    pub name: String,
    pub content: Content,
    pub extension: Option<String>,
    pub source_params: Option<QueryParams>,
    /// Set when a discovered record superseded an explicit registration.
    pub overridden: bool,
    pub origin: RecordOrigin,
}

impl PartialRecord {
    /// Creates a record with no overriding history.
    pub fn new(
        name: impl Into<String>,
        canonical_key: impl Into<String>,
        content: impl Into<Content>,
        origin: RecordOrigin,
    ) -> Self {
        Self {
            canonical_key: canonical_key.into(),
            name: name.into(),
            content: content.into(),
            extension: None,
            source_params: None,
            overridden: false,
            origin,
        }
    }

    pub fn with_extension(mut self, extension: Option<&str>) -> Self {
        self.extension = extension.map(crate::naming::normalize_extension);
        self
    }

    pub fn with_params(mut self, params: Option<QueryParams>) -> Self {
        self.source_params = params.filter(|p| !p.is_empty());
        self
    }
}

/// Error returned by a renderer.
#[derive(Debug, Clone, Error)]
#[error("render failed: {message}")]
pub struct RenderError {
    pub message: String,
}

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executable artifact produced by a code generator.
pub trait Renderer: Send + Sync {
    /// Renders the template against a context document.
    fn render(
        &self,
        context: &serde_json::Value,
        options: &serde_json::Value,
    ) -> Result<String, RenderError>;

    /// Textual representation that backends may persist.
    ///
    /// A renderer without one is only ever cached in memory.
    fn source(&self) -> Option<&str> {
        None
    }
}

/// A renderer cached under its canonical code key.
#[derive(Clone)]
pub struct CompiledRecord {
    pub canonical_key: String,
    /// Logical name the renderer was compiled for.
    pub short_name: String,
    pub renderer: Arc<dyn Renderer>,
}

impl CompiledRecord {
    pub fn new(
        canonical_key: impl Into<String>,
        short_name: impl Into<String>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        Self {
            canonical_key: canonical_key.into(),
            short_name: short_name.into(),
            renderer,
        }
    }

    pub fn render(
        &self,
        context: &serde_json::Value,
        options: &serde_json::Value,
    ) -> Result<String, RenderError> {
        self.renderer.render(context, options)
    }
}

impl fmt::Debug for CompiledRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRecord")
            .field("canonical_key", &self.canonical_key)
            .field("short_name", &self.short_name)
            .field("has_source", &self.renderer.source().is_some())
            .finish()
    }
}

/// Result of reading the code namespace.
#[derive(Debug, Clone)]
pub enum CodeArtifact {
    /// A live renderer held in memory.
    Live(Arc<CompiledRecord>),
    /// A persisted textual renderer that must be re-materialized.
    Text {
        canonical_key: String,
        name: String,
        source: String,
    },
}
