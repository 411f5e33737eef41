//! Compiler configuration.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quill_store::{NamingConfig, NamingResolver};
use serde::{Deserialize, Serialize};

use crate::QuillError;

/// Whether rendering may reach the backend for content and persist code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderTimePolicy {
    /// Only the registry and the in-memory overlay are consulted.
    None,
    /// Missing content is read from the backend.
    #[default]
    Read,
    /// Compiled code is persisted through the backend.
    Write,
    ReadWrite,
}

impl RenderTimePolicy {
    pub fn allows_read(self) -> bool {
        matches!(self, RenderTimePolicy::Read | RenderTimePolicy::ReadWrite)
    }

    pub fn allows_write(self) -> bool {
        matches!(self, RenderTimePolicy::Write | RenderTimePolicy::ReadWrite)
    }
}

impl fmt::Display for RenderTimePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RenderTimePolicy::None => "none",
            RenderTimePolicy::Read => "read",
            RenderTimePolicy::Write => "write",
            RenderTimePolicy::ReadWrite => "read-write",
        })
    }
}

/// Configuration for the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerOptions {
    /// Base paths, extensions and bypass pattern for name resolution.
    #[serde(default)]
    pub naming: NamingConfig,

    #[serde(default)]
    pub render_time_policy: RenderTimePolicy,

    /// Whether compiled renderers are reused across compiles.
    #[serde(default = "default_cache_raw_templates")]
    pub cache_raw_templates: bool,

    /// Deadline applied to every store operation.
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,

    /// Options passed through unchanged to the code generator.
    #[serde(default)]
    pub generator: serde_json::Value,
}

fn default_cache_raw_templates() -> bool {
    true
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerOptions {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            naming: NamingConfig::default(),
            render_time_policy: RenderTimePolicy::default(),
            cache_raw_templates: true,
            operation_timeout_ms: None,
            generator: serde_json::Value::Null,
        }
    }

    /// Parses configuration from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, QuillError> {
        serde_json::from_str(json).map_err(|e| QuillError::config(e.to_string()))
    }

    /// Loads configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, QuillError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            QuillError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Builds the resolver stores and the compiler share.
    pub fn resolver(&self) -> Result<Arc<NamingResolver>, QuillError> {
        Ok(Arc::new(NamingResolver::new(self.naming.clone())?))
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}
