//! Key/value backed store.
//!
//! Content and code live in two collections of JSON documents. The engine
//! itself is pluggable through [`KvEngine`]; [`EmbeddedKv`] keeps everything
//! in process.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::TransportDetail;
use crate::memory::MemoryStore;
use crate::naming::{ArtifactKind, NamingResolver};
use crate::record::{
    CodeArtifact, CompiledRecord, Content, PartialRecord, RecordOrigin, Renderer,
};
use crate::store::{DiscoverFn, Lookup, Store};
use crate::waiter;
use crate::{OpToken, StoreError};

const BACKEND: &str = "kv";

/// Collection holding partial content documents.
pub const CONTENT_COLLECTION: &str = "partials";

/// Collection holding compiled code documents.
pub const CODE_COLLECTION: &str = "code";

const DEFAULT_PAGE_SIZE: usize = 100;

/// Errors raised by a key/value engine.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Backend(String),
}

/// Minimal contract of a key/value engine with ordered key listing.
#[async_trait]
pub trait KvEngine: Send + Sync + 'static {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn put(&self, collection: &str, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Deletes a key; returns whether it existed.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, KvError>;

    /// Lists up to `limit` keys strictly greater than `after`, ascending.
    async fn keys_after(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError>;
}

/// In-process engine backed by concurrent maps.
#[derive(Debug, Default)]
pub struct EmbeddedKv {
    collections: DashMap<String, DashMap<String, Vec<u8>>>,
}

impl EmbeddedKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl KvEngine for EmbeddedKv {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(key).map(|v| v.value().clone())))
    }

    async fn put(&self, collection: &str, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, KvError> {
        Ok(self
            .collections
            .get(collection)
            .is_some_and(|c| c.remove(key).is_some()))
    }

    async fn keys_after(
        &self,
        collection: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, KvError> {
        let Some(entries) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<String> = entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| after.is_none_or(|after| k.as_str() > after))
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentDoc {
    name: String,
    content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extension: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CodeDoc {
    name: String,
    renderer: String,
}

fn kv_failure(target: &str, error: KvError) -> StoreError {
    StoreError::transport(BACKEND, target, TransportDetail::Kv(error.to_string()))
}

/// Store persisting documents through a [`KvEngine`].
pub struct KeyValueStore<E> {
    engine: Arc<E>,
    resolver: Arc<NamingResolver>,
    overlay: MemoryStore,
    /// Documents written by this instance, as `(collection, key)`.
    written: Mutex<HashSet<(&'static str, String)>>,
    page_size: usize,
}

impl<E: KvEngine> KeyValueStore<E> {
    pub fn new(engine: Arc<E>, resolver: Arc<NamingResolver>) -> Self {
        Self {
            engine,
            overlay: MemoryStore::new(resolver.clone()),
            resolver,
            written: Mutex::new(HashSet::new()),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets how many keys a sweep fetches per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    async fn delete(&self, collection: &'static str, key: String) -> Result<String, StoreError> {
        self.engine
            .delete(collection, &key)
            .await
            .map_err(|e| kv_failure(&key, e))?;
        self.written.lock().remove(&(collection, key.clone()));
        Ok(key)
    }

    async fn decode_content(&self, key: String) -> Result<Option<Arc<PartialRecord>>, StoreError> {
        let Some(bytes) = self
            .engine
            .get(CONTENT_COLLECTION, &key)
            .await
            .map_err(|e| kv_failure(&key, e))?
        else {
            return Ok(None);
        };
        let doc: ContentDoc = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::transport(BACKEND, key.as_str(), e))?;
        let record = PartialRecord::new(doc.name, key, doc.content, RecordOrigin::Discovered)
            .with_extension(doc.extension.as_deref());
        Ok(Some(self.overlay.put_partial(record)))
    }

    /// Visits every key of a collection page by page.
    ///
    /// Per-key failures are collected and do not stop the sweep.
    async fn sweep<F, Fut>(
        &self,
        collection: &'static str,
        token: &OpToken,
        mut visit: F,
    ) -> Result<Vec<Result<String, StoreError>>, StoreError>
    where
        F: FnMut(String) -> Fut + Send,
        Fut: std::future::Future<Output = Result<String, StoreError>> + Send,
    {
        let mut outcomes = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = token
                .run("kv list", async {
                    self.engine
                        .keys_after(collection, cursor.as_deref(), self.page_size)
                        .await
                        .map_err(|e| kv_failure(collection, e))
                })
                .await?;
            let Some(last) = page.last().cloned() else {
                break;
            };
            let full = page.len() == self.page_size;
            outcomes.extend(join_all(page.into_iter().map(&mut visit)).await);
            if !full {
                break;
            }
            cursor = Some(last);
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl<E: KvEngine> Store for KeyValueStore<E> {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn resolver(&self) -> &NamingResolver {
        &self.resolver
    }

    fn overlay(&self) -> &MemoryStore {
        &self.overlay
    }

    async fn read_content(
        &self,
        lookup: Lookup<'_>,
        token: &OpToken,
    ) -> Result<Option<Arc<PartialRecord>>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Content)?;
        if let Some(hit) = self.overlay.get_partial(&key) {
            return Ok(Some(hit));
        }
        let record = token.run("kv read", self.decode_content(key.clone())).await?;
        debug!(key = %key, hit = record.is_some(), "kv content lookup");
        Ok(record)
    }

    async fn write_content(
        &self,
        lookup: Lookup<'_>,
        content: Content,
        token: &OpToken,
    ) -> Result<Arc<PartialRecord>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Content)?;
        let doc = ContentDoc {
            name: lookup.name.to_string(),
            content,
            extension: lookup.extension.map(str::to_string),
        };
        let bytes =
            serde_json::to_vec(&doc).map_err(|e| StoreError::transport(BACKEND, key.as_str(), e))?;
        token
            .run("kv write", async {
                self.engine
                    .put(CONTENT_COLLECTION, &key, bytes)
                    .await
                    .map_err(|e| kv_failure(&key, e))
            })
            .await?;
        self.written.lock().insert((CONTENT_COLLECTION, key.clone()));

        let record = PartialRecord::new(lookup.name, key, doc.content, RecordOrigin::Explicit)
            .with_extension(lookup.extension)
            .with_params(lookup.params.cloned());
        Ok(self.overlay.put_partial(record))
    }

    async fn read_code(
        &self,
        lookup: Lookup<'_>,
        token: &OpToken,
    ) -> Result<Option<CodeArtifact>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Code)?;
        if let Some(hit) = self.overlay.get_compiled(&key) {
            return Ok(Some(CodeArtifact::Live(hit)));
        }
        let bytes = token
            .run("kv read code", async {
                self.engine
                    .get(CODE_COLLECTION, &key)
                    .await
                    .map_err(|e| kv_failure(&key, e))
            })
            .await?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let doc: CodeDoc = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::transport(BACKEND, key.as_str(), e))?;
        Ok(Some(CodeArtifact::Text {
            canonical_key: key,
            name: doc.name,
            source: doc.renderer,
        }))
    }

    async fn write_code(
        &self,
        lookup: Lookup<'_>,
        renderer: Arc<dyn Renderer>,
        token: &OpToken,
    ) -> Result<Arc<CompiledRecord>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Code)?;
        if let Some(source) = renderer.source() {
            let doc = CodeDoc {
                name: lookup.name.to_string(),
                renderer: source.to_string(),
            };
            let bytes = serde_json::to_vec(&doc)
                .map_err(|e| StoreError::transport(BACKEND, key.as_str(), e))?;
            token
                .run("kv write code", async {
                    self.engine
                        .put(CODE_COLLECTION, &key, bytes)
                        .await
                        .map_err(|e| kv_failure(&key, e))
                })
                .await?;
            self.written.lock().insert((CODE_COLLECTION, key.clone()));
        }
        Ok(self
            .overlay
            .put_compiled(CompiledRecord::new(key, lookup.name, renderer)))
    }

    async fn unregister(&self, name: &str, token: &OpToken) -> Result<(), StoreError> {
        let (mut content_keys, mut code_keys) = self.overlay.remove_name(name);
        content_keys.push(self.resolver.resolve(name, ArtifactKind::Content, None, None)?);
        code_keys.push(self.resolver.resolve(name, ArtifactKind::Code, None, None)?);
        content_keys.sort();
        content_keys.dedup();
        code_keys.sort();
        code_keys.dedup();

        let deletions = content_keys
            .into_iter()
            .map(|key| (CONTENT_COLLECTION, key))
            .chain(code_keys.into_iter().map(|key| (CODE_COLLECTION, key)));
        token
            .run("kv unregister", async {
                waiter::wait_all(deletions.map(|(collection, key)| self.delete(collection, key)))
                    .await
                    .map(|_| ())
                    .map_err(StoreError::batch)
            })
            .await
    }

    async fn clear(&self, all: bool, token: &OpToken) -> Result<(), StoreError> {
        self.overlay.clear();

        if !all {
            let written: Vec<_> = self.written.lock().drain().collect();
            info!(count = written.len(), "removing documents written by this store");
            return token
                .run("kv clear", async {
                    waiter::wait_all(written.into_iter().map(|(c, key)| self.delete(c, key)))
                        .await
                        .map(|_| ())
                        .map_err(StoreError::batch)
                })
                .await;
        }

        let mut outcomes = Vec::new();
        for collection in [CONTENT_COLLECTION, CODE_COLLECTION] {
            outcomes.extend(
                self.sweep(collection, token, |key| self.delete(collection, key))
                    .await?,
            );
        }
        info!(count = outcomes.len(), "cleared every document");
        waiter::collect(outcomes).map(|_| ()).map_err(StoreError::batch)
    }

    async fn scan(
        &self,
        on_discover: &mut DiscoverFn<'_>,
        token: &OpToken,
    ) -> Result<usize, StoreError> {
        let found = Mutex::new(Vec::new());
        let outcomes = self
            .sweep(CONTENT_COLLECTION, token, |key| {
                let found = &found;
                async move {
                    match self.decode_content(key.clone()).await {
                        Ok(Some(record)) => {
                            found.lock().push(record);
                            Ok(key)
                        }
                        Ok(None) => Ok(key),
                        Err(e) => {
                            warn!(key = %key, error = %e, "skipping unreadable document");
                            Err(e)
                        }
                    }
                }
            })
            .await?;

        let found = found.into_inner();
        let discovered = found.len();
        for record in found {
            on_discover(record);
        }
        info!(discovered, "scanned key/value store");
        waiter::collect(outcomes).map_err(StoreError::batch)?;
        Ok(discovered)
    }
}
