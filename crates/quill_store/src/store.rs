//! The storage backend contract.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::memory::MemoryStore;
use crate::naming::{ArtifactKind, NamingResolver, QueryParams};
use crate::record::{CodeArtifact, CompiledRecord, Content, PartialRecord, Renderer};
use crate::{OpToken, StoreError};

/// Callback receiving every record a bulk scan discovers.
pub type DiscoverFn<'a> = dyn FnMut(Arc<PartialRecord>) + Send + 'a;

/// Addressing of one artifact: a logical name plus optional extension and
/// query parameters.
#[derive(Debug, Clone, Copy)]
pub struct Lookup<'a> {
    pub name: &'a str,
    pub extension: Option<&'a str>,
    pub params: Option<&'a QueryParams>,
}

impl<'a> Lookup<'a> {
    pub fn name(name: &'a str) -> Self {
        Self {
            name,
            extension: None,
            params: None,
        }
    }

    pub fn with_extension(mut self, extension: Option<&'a str>) -> Self {
        self.extension = extension;
        self
    }

    pub fn with_params(mut self, params: Option<&'a QueryParams>) -> Self {
        self.params = params;
        self
    }

    /// Resolves this lookup into a canonical key.
    pub fn key(&self, resolver: &NamingResolver, kind: ArtifactKind) -> Result<String, StoreError> {
        Ok(resolver.resolve(self.name, kind, self.extension, self.params)?)
    }
}

/// A pluggable persistence medium for partial content and compiled code.
///
/// Every backend keeps a [`MemoryStore`] overlay that is consulted before any
/// slower round-trip. Code is always served from memory; backends that can
/// persist it do so only in textual form, returned as [`CodeArtifact::Text`].
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Resolver shared by every operation of this store.
    fn resolver(&self) -> &NamingResolver;

    /// First-level in-memory cache.
    fn overlay(&self) -> &MemoryStore;

    /// Reads partial content.
    async fn read_content(
        &self,
        lookup: Lookup<'_>,
        token: &OpToken,
    ) -> Result<Option<Arc<PartialRecord>>, StoreError>;

    /// Writes partial content.
    async fn write_content(
        &self,
        lookup: Lookup<'_>,
        content: Content,
        token: &OpToken,
    ) -> Result<Arc<PartialRecord>, StoreError>;

    /// Reads compiled code.
    async fn read_code(
        &self,
        lookup: Lookup<'_>,
        _token: &OpToken,
    ) -> Result<Option<CodeArtifact>, StoreError> {
        let key = lookup.key(self.resolver(), ArtifactKind::Code)?;
        Ok(self.overlay().get_compiled(&key).map(CodeArtifact::Live))
    }

    /// Writes compiled code.
    async fn write_code(
        &self,
        lookup: Lookup<'_>,
        renderer: Arc<dyn Renderer>,
        _token: &OpToken,
    ) -> Result<Arc<CompiledRecord>, StoreError> {
        let key = lookup.key(self.resolver(), ArtifactKind::Code)?;
        Ok(self
            .overlay()
            .put_compiled(CompiledRecord::new(key, lookup.name, renderer)))
    }

    /// Removes every artifact of a name.
    async fn unregister(&self, name: &str, token: &OpToken) -> Result<(), StoreError>;

    /// Drops cached state; `all` also removes state shared with other
    /// instances of the same backend.
    async fn clear(&self, all: bool, token: &OpToken) -> Result<(), StoreError>;

    /// Enumerates every partial the backend can supply.
    ///
    /// Per-entry failures do not stop the sweep: every readable record is
    /// passed to `on_discover` before the collected failures are returned.
    async fn scan(
        &self,
        _on_discover: &mut DiscoverFn<'_>,
        _token: &OpToken,
    ) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Root of the source tree, for backends that can be watched.
    fn source_root(&self) -> Option<&Path> {
        None
    }

    /// Logical partial name of a source file.
    fn partial_name(&self, _path: &Path) -> Option<String> {
        None
    }

    /// Reads a single source file; `None` when it no longer exists.
    async fn load_source(
        &self,
        _path: &Path,
        _token: &OpToken,
    ) -> Result<Option<Arc<PartialRecord>>, StoreError> {
        Ok(None)
    }
}
