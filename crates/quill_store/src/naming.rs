//! Canonical key derivation.
//!
//! Every store addresses artifacts by a canonical key derived from the
//! logical template name and the active [`NamingConfig`]. The derivation is
//! pure: the same name, configuration, kind and parameters always produce the
//! same key, whichever backend asks for it.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default pattern for names that are already fully qualified:
/// absolute unix paths, drive-letter paths and URLs.
pub const DEFAULT_BYPASS_PATTERN: &str = r"^(?:/|[A-Za-z]:[\\/]|[A-Za-z][A-Za-z0-9+.\-]*://)";

/// Errors raised while resolving a name.
#[derive(Debug, Error)]
pub enum NameError {
    /// The name was empty or blank.
    #[error("template name must not be empty")]
    Empty,

    /// The configured bypass pattern is not a valid regular expression.
    #[error("invalid bypass pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Which namespace a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Raw partial/template content.
    Content,
    /// Compiled renderer.
    Code,
}

/// Document kind, decided by comparing a name with the configured sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocKind {
    Template,
    Context,
    Partial,
}

/// Naming configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    /// Base path prepended to the primary template.
    pub template_base: String,
    /// Base path prepended to partials.
    pub partial_base: String,
    /// Base path prepended to context documents.
    pub context_base: String,
    /// Name that designates the primary template.
    pub template_name: String,
    /// Name that designates the context document.
    pub context_name: String,
    pub template_extension: String,
    pub partial_extension: String,
    pub context_extension: String,
    /// Discriminator appended to content keys to form code keys.
    pub code_suffix: String,
    /// Names matching this pattern are used as-is.
    pub bypass_pattern: Option<String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            template_base: String::new(),
            partial_base: "partials".to_string(),
            context_base: String::new(),
            template_name: "template".to_string(),
            context_name: "context".to_string(),
            template_extension: ".html".to_string(),
            partial_extension: ".html".to_string(),
            context_extension: ".json".to_string(),
            code_suffix: ".compiled".to_string(),
            bypass_pattern: Some(DEFAULT_BYPASS_PATTERN.to_string()),
        }
    }
}

/// Query parameters attached to a lookup.
///
/// Parameters are kept sorted so that their serialization is canonical.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryParams(BTreeMap<String, String>);

impl QueryParams {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter, replacing an existing value for the same key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serializes the parameters as a form-urlencoded query string.
    pub fn canonical(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.0.iter())
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Resolves logical names into canonical keys.
#[derive(Debug, Clone)]
pub struct NamingResolver {
    config: NamingConfig,
    bypass: Option<Regex>,
}

impl NamingResolver {
    /// Creates a resolver, compiling the bypass pattern once.
    pub fn new(config: NamingConfig) -> Result<Self, NameError> {
        let bypass = match &config.bypass_pattern {
            Some(pattern) => Some(Regex::new(pattern).map_err(|source| {
                NameError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                }
            })?),
            None => None,
        };
        Ok(Self { config, bypass })
    }

    pub fn config(&self) -> &NamingConfig {
        &self.config
    }

    /// Classifies a name against the configured sentinels.
    pub fn doc_kind(&self, name: &str) -> DocKind {
        if name == self.config.template_name {
            DocKind::Template
        } else if name == self.config.context_name {
            DocKind::Context
        } else {
            DocKind::Partial
        }
    }

    /// Returns whether the name is already fully qualified.
    pub fn is_bypassed(&self, name: &str) -> bool {
        self.bypass.as_ref().is_some_and(|re| re.is_match(name))
    }

    /// Default extension for a document kind, with a leading dot.
    pub fn default_extension(&self, kind: DocKind) -> String {
        let ext = match kind {
            DocKind::Template => &self.config.template_extension,
            DocKind::Context => &self.config.context_extension,
            DocKind::Partial => &self.config.partial_extension,
        };
        normalize_extension(ext)
    }

    /// Resolves a name into the canonical key of the given artifact kind.
    ///
    /// # Arguments
    ///
    /// * `name` - Logical template, partial or context name
    /// * `kind` - Content or code namespace
    /// * `extension` - Extension to append when the name carries none
    /// * `params` - Query parameters folded into the key
    pub fn resolve(
        &self,
        name: &str,
        kind: ArtifactKind,
        extension: Option<&str>,
        params: Option<&QueryParams>,
    ) -> Result<String, NameError> {
        let extension = if has_extension(name) {
            Some("")
        } else {
            extension
        };
        self.build(name, kind, extension, params)
    }

    /// Resolves the name of a source file whose extension was stripped.
    ///
    /// The extension is appended even when the stripped name still contains
    /// a dot, so `a.b` with `html` maps back to `a.b.html`.
    pub fn resolve_source(
        &self,
        name: &str,
        kind: ArtifactKind,
        extension: &str,
        params: Option<&QueryParams>,
    ) -> Result<String, NameError> {
        self.build(name, kind, Some(extension), params)
    }

    /// Derives the code key paired with a content key.
    pub fn code_key_for(&self, content_key: &str) -> String {
        let suffix = &self.config.code_suffix;
        match content_key.split_once('?') {
            Some((path, query)) => format!("{path}{suffix}?{query}"),
            None => format!("{content_key}{suffix}"),
        }
    }

    fn build(
        &self,
        name: &str,
        kind: ArtifactKind,
        extension: Option<&str>,
        params: Option<&QueryParams>,
    ) -> Result<String, NameError> {
        if name.trim().is_empty() {
            return Err(NameError::Empty);
        }

        let mut key = if self.is_bypassed(name) {
            name.to_string()
        } else {
            let doc_kind = self.doc_kind(name);
            let mut key = join_base(self.base_for(doc_kind), name);
            match extension {
                Some(ext) => key.push_str(&normalize_extension(ext)),
                None => key.push_str(&self.default_extension(doc_kind)),
            }
            key
        };

        if kind == ArtifactKind::Code {
            key.push_str(&self.config.code_suffix);
        }

        if let Some(params) = params
            && !params.is_empty()
        {
            key.push('?');
            key.push_str(&params.canonical());
        }

        Ok(key)
    }

    fn base_for(&self, kind: DocKind) -> &str {
        match kind {
            DocKind::Template => &self.config.template_base,
            DocKind::Context => &self.config.context_base,
            DocKind::Partial => &self.config.partial_base,
        }
    }
}

/// Returns whether the final path segment of a name has an extension.
pub fn has_extension(name: &str) -> bool {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    Path::new(last).extension().is_some()
}

/// Ensures an extension starts with a dot; empty stays empty.
pub fn normalize_extension(ext: &str) -> String {
    if ext.is_empty() || ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}

fn join_base(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}
