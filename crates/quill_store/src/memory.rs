//! In-memory store, also used as the overlay of every other backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::naming::{ArtifactKind, NamingResolver};
use crate::record::{CompiledRecord, Content, PartialRecord, RecordOrigin};
use crate::store::{Lookup, Store};
use crate::{OpToken, StoreError};

/// Two maps from canonical key to record, one per namespace.
///
/// Records are stored behind `Arc` and swapped in whole, so a reader never
/// observes a half-written record; the last write for a key wins.
pub struct MemoryStore {
    resolver: Arc<NamingResolver>,
    content: RwLock<HashMap<String, Arc<PartialRecord>>>,
    code: RwLock<HashMap<String, Arc<CompiledRecord>>>,
}

impl MemoryStore {
    pub fn new(resolver: Arc<NamingResolver>) -> Self {
        Self {
            resolver,
            content: RwLock::new(HashMap::new()),
            code: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_partial(&self, key: &str) -> Option<Arc<PartialRecord>> {
        self.content.read().get(key).cloned()
    }

    pub fn put_partial(&self, record: PartialRecord) -> Arc<PartialRecord> {
        let record = Arc::new(record);
        self.content
            .write()
            .insert(record.canonical_key.clone(), record.clone());
        record
    }

    pub fn get_compiled(&self, key: &str) -> Option<Arc<CompiledRecord>> {
        self.code.read().get(key).cloned()
    }

    pub fn put_compiled(&self, record: CompiledRecord) -> Arc<CompiledRecord> {
        let record = Arc::new(record);
        self.code
            .write()
            .insert(record.canonical_key.clone(), record.clone());
        record
    }

    /// Removes every record registered under a logical name.
    ///
    /// Returns the canonical keys that were dropped from each namespace.
    pub fn remove_name(&self, name: &str) -> (Vec<String>, Vec<String>) {
        let mut content_keys = Vec::new();
        self.content.write().retain(|key, record| {
            let keep = record.name != name;
            if !keep {
                content_keys.push(key.clone());
            }
            keep
        });
        (content_keys, self.remove_compiled(name))
    }

    /// Removes the compiled records of a name, keeping its content.
    pub fn remove_compiled(&self, name: &str) -> Vec<String> {
        let mut code_keys = Vec::new();
        self.code.write().retain(|key, record| {
            let keep = record.short_name != name;
            if !keep {
                code_keys.push(key.clone());
            }
            keep
        });
        code_keys
    }

    pub fn remove_compiled_key(&self, key: &str) -> Option<Arc<CompiledRecord>> {
        self.code.write().remove(key)
    }

    /// Replaces both maps with empty ones.
    pub fn clear(&self) {
        *self.content.write() = HashMap::new();
        *self.code.write() = HashMap::new();
    }

    pub fn partial_count(&self) -> usize {
        self.content.read().len()
    }

    pub fn compiled_count(&self) -> usize {
        self.code.read().len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn resolver(&self) -> &NamingResolver {
        &self.resolver
    }

    fn overlay(&self) -> &MemoryStore {
        self
    }

    async fn read_content(
        &self,
        lookup: Lookup<'_>,
        _token: &OpToken,
    ) -> Result<Option<Arc<PartialRecord>>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Content)?;
        let hit = self.get_partial(&key);
        debug!(key = %key, hit = hit.is_some(), "memory content lookup");
        Ok(hit)
    }

    async fn write_content(
        &self,
        lookup: Lookup<'_>,
        content: Content,
        _token: &OpToken,
    ) -> Result<Arc<PartialRecord>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Content)?;
        let record = PartialRecord::new(lookup.name, key, content, RecordOrigin::Explicit)
            .with_extension(lookup.extension)
            .with_params(lookup.params.cloned());
        Ok(self.put_partial(record))
    }

    async fn unregister(&self, name: &str, _token: &OpToken) -> Result<(), StoreError> {
        self.remove_name(name);
        Ok(())
    }

    async fn clear(&self, _all: bool, _token: &OpToken) -> Result<(), StoreError> {
        MemoryStore::clear(self);
        Ok(())
    }
}
