//! Compile orchestration.
//!
//! [`Compiler`] drives a name through
//! `NeedContent -> HaveContentNeedRenderer -> HaveRenderer -> Done`:
//!
//! 1. A cached renderer for the code key finishes immediately
//! 2. Content comes from inline input, the registry, or the store
//! 3. The generator turns content into a renderer; a failure writes nothing
//! 4. The renderer is persisted when the render-time policy allows writes
//!
//! Concurrent compiles of the same code key share a single in-flight cell.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quill_store::{
    ArtifactKind, CodeArtifact, CompiledRecord, Content, Lookup, MemoryStore, NamingResolver,
    OpToken, PartialRecord, QueryParams, RecordOrigin, Store, StoreError,
};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::CompilerOptions;
use crate::generator::Generator;
use crate::registry::PartialRegistry;
use crate::renderers::RendererCache;
use crate::watcher::{WatchEvent, WatchSink, Watcher};
use crate::QuillError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompileStage {
    NeedContent,
    HaveContentNeedRenderer,
    HaveRenderer,
    Done,
}

/// A compile of one name, optionally with inline content.
#[derive(Debug, Clone)]
pub struct CompileRequest<'a> {
    pub name: &'a str,
    pub content: Option<Content>,
    pub extension: Option<&'a str>,
    pub params: Option<&'a QueryParams>,
}

impl<'a> CompileRequest<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            content: None,
            extension: None,
            params: None,
        }
    }

    /// Supplies the content directly.
    ///
    /// The content is registered explicitly and compiled as given, whatever
    /// was registered under the key before.
    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_extension(mut self, extension: &'a str) -> Self {
        self.extension = Some(extension);
        self
    }

    pub fn with_params(mut self, params: &'a QueryParams) -> Self {
        self.params = Some(params);
        self
    }

    fn is_plain(&self) -> bool {
        self.extension.is_none() && self.params.is_none_or(QueryParams::is_empty)
    }
}

type InFlight = Arc<OnceCell<Arc<CompiledRecord>>>;

struct Inner {
    options: CompilerOptions,
    store: Arc<dyn Store>,
    generator: Arc<dyn Generator>,
    registry: PartialRegistry,
    renderers: RendererCache,
    in_flight: Mutex<HashMap<String, InFlight>>,
    root: Mutex<OpToken>,
    watchers: Mutex<Vec<Watcher>>,
}

/// Template compiler over a pluggable store.
///
/// Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct Compiler {
    inner: Arc<Inner>,
}

impl Compiler {
    /// Creates a compiler over `store`.
    ///
    /// Keys are resolved with the store's resolver, so the store should be
    /// built from [`CompilerOptions::resolver`].
    pub fn new(
        options: CompilerOptions,
        store: Arc<dyn Store>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                store,
                generator,
                registry: PartialRegistry::new(),
                renderers: RendererCache::new(),
                in_flight: Mutex::new(HashMap::new()),
                root: Mutex::new(OpToken::new()),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a compiler backed only by memory.
    pub fn in_memory(
        options: CompilerOptions,
        generator: Arc<dyn Generator>,
    ) -> Result<Self, QuillError> {
        let store = Arc::new(MemoryStore::new(options.resolver()?));
        Ok(Self::new(options, store, generator))
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.inner.options
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn registry(&self) -> &PartialRegistry {
        &self.inner.registry
    }

    pub fn renderers(&self) -> &RendererCache {
        &self.inner.renderers
    }

    fn resolver(&self) -> &NamingResolver {
        self.inner.store.resolver()
    }

    /// Registers partial content explicitly.
    ///
    /// Re-registering a name overwrites its record in place. A later scan
    /// that discovers the same key replaces it again.
    pub fn register_partial(
        &self,
        name: &str,
        content: impl Into<Content>,
    ) -> Result<Arc<PartialRecord>, QuillError> {
        let key = self
            .resolver()
            .resolve(name, ArtifactKind::Content, None, None)?;
        let record = PartialRecord::new(name, key, content, RecordOrigin::Explicit);
        Ok(self.inner.register(record))
    }

    pub fn get_registered(&self, name: &str) -> Option<Arc<PartialRecord>> {
        self.inner.registry.get(name)
    }

    /// Removes every variant of a name from the registry, the renderer
    /// cache and the store.
    pub async fn unregister(&self, name: &str) -> Result<(), QuillError> {
        let key = self
            .resolver()
            .resolve(name, ArtifactKind::Content, None, None)?;
        self.inner.remove_name(name);
        self.inner
            .store
            .unregister(name, &self.inner.token())
            .await
            .map_err(|e| QuillError::store_for(name, key, e))?;
        debug!(name, "unregistered partial");
        Ok(())
    }

    /// Registers every partial the store can enumerate.
    ///
    /// Records that could be read are registered even when others failed;
    /// the failures are returned together afterwards.
    pub async fn scan(&self) -> Result<usize, QuillError> {
        let token = self.inner.token();
        let mut found = Vec::new();
        let result = self
            .inner
            .store
            .scan(&mut |record| found.push(record), &token)
            .await;

        let discovered = found.len();
        for record in found {
            self.inner.register(PartialRecord::clone(&record));
        }
        info!(discovered, backend = self.inner.store.backend(), "registered scanned partials");
        Ok(result?)
    }

    pub async fn compile(&self, name: &str) -> Result<Arc<CompiledRecord>, QuillError> {
        self.compile_with(CompileRequest::new(name)).await
    }

    pub async fn compile_with(
        &self,
        request: CompileRequest<'_>,
    ) -> Result<Arc<CompiledRecord>, QuillError> {
        let inner = &self.inner;
        let resolver = self.resolver();
        let name = request.name;
        let code_key = resolver.resolve(name, ArtifactKind::Code, request.extension, request.params)?;

        let inline = match request.content.clone() {
            Some(content) => {
                let key = resolver.resolve(
                    name,
                    ArtifactKind::Content,
                    request.extension,
                    request.params,
                )?;
                let record = PartialRecord::new(name, key, content, RecordOrigin::Explicit)
                    .with_extension(request.extension)
                    .with_params(request.params.cloned());
                Some(inner.register(record))
            }
            None => None,
        };
        let since = inner.renderers.epoch();

        if inner.options.cache_raw_templates
            && let Some(hit) = inner.renderers.get(&code_key)
        {
            debug!(name, key = %code_key, stage = ?CompileStage::Done, "renderer cache hit");
            return Ok(hit);
        }

        let cell = inner
            .in_flight
            .lock()
            .entry(code_key.clone())
            .or_default()
            .clone();
        let result = cell
            .get_or_try_init(|| inner.compile_uncached(&request, &code_key, inline, since))
            .await
            .cloned();

        let mut in_flight = inner.in_flight.lock();
        if in_flight
            .get(&code_key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            in_flight.remove(&code_key);
        }
        result
    }

    /// Compiles a name and renders it against `context`.
    pub async fn render(
        &self,
        name: &str,
        context: &Value,
        options: &Value,
    ) -> Result<String, QuillError> {
        let record = self.compile(name).await?;
        record
            .render(context, options)
            .map_err(|source| QuillError::Render {
                name: name.to_string(),
                source,
            })
    }

    /// Starts watching the store's source tree.
    ///
    /// Must be called from within a Tokio runtime. Watching the same root
    /// twice is a no-op.
    pub fn watch(&self) -> Result<PathBuf, QuillError> {
        let mut watchers = self.inner.watchers.lock();
        if let Some(root) = self.inner.store.source_root()
            && let Some(existing) = watchers.iter().find(|w| w.root() == root)
        {
            return Ok(existing.root().to_path_buf());
        }

        let sink: Weak<Inner> = Arc::downgrade(&self.inner);
        let sink: Weak<dyn WatchSink> = sink;
        let mut token = OpToken::new();
        if let Some(timeout) = self.inner.options.operation_timeout() {
            token = token.with_timeout(timeout);
        }
        let watcher = Watcher::spawn(self.inner.store.clone(), sink, token)?;
        let root = watcher.root().to_path_buf();
        watchers.push(watcher);
        Ok(root)
    }

    /// Roots currently being watched.
    pub fn watching(&self) -> Vec<PathBuf> {
        self.inner
            .watchers
            .lock()
            .iter()
            .map(|w| w.root().to_path_buf())
            .collect()
    }

    /// Closes every watcher and drops all cached state.
    ///
    /// `all` is passed to the store, which then also removes state shared
    /// with other instances.
    pub async fn clear(&self, all: bool) -> Result<(), QuillError> {
        let watchers: Vec<Watcher> = self.inner.watchers.lock().drain(..).collect();
        let closed = watchers.len();
        for watcher in watchers {
            watcher.close();
        }

        self.inner.registry.clear();
        self.inner.renderers.clear();
        self.inner.store.clear(all, &self.inner.token()).await?;
        info!(closed, all, "cleared compiler state");
        Ok(())
    }

    /// Cancels every store operation currently in flight.
    ///
    /// Later operations are unaffected.
    pub fn cancel(&self) {
        let mut root = self.inner.root.lock();
        root.cancel();
        *root = OpToken::new();
        info!("cancelled in-flight operations");
    }
}

impl Inner {
    fn token(&self) -> OpToken {
        let token = self.root.lock().child();
        match self.options.operation_timeout() {
            Some(timeout) => token.with_timeout(timeout),
            None => token,
        }
    }

    /// Registers a record and invalidates its renderers when the content
    /// of its key changed.
    fn register(&self, record: PartialRecord) -> Arc<PartialRecord> {
        let (stored, outcome) = self.registry.register(record);
        if outcome.changed() {
            let resolver = self.store.resolver();
            let mut keys = vec![resolver.code_key_for(&stored.canonical_key)];
            // a plain name may be served by a file with a non-default extension
            if stored.source_params.is_none()
                && let Ok(plain) = resolver.resolve(&stored.name, ArtifactKind::Code, None, None)
                && plain != keys[0]
            {
                keys.push(plain);
            }
            self.invalidate(&stored.name, &keys);
        }
        stored
    }

    /// Drops every variant of a name from the registry and renderer cache.
    fn remove_name(&self, name: &str) {
        let resolver = self.store.resolver();
        let mut keys: Vec<String> = self
            .registry
            .remove(name)
            .iter()
            .map(|record| resolver.code_key_for(&record.canonical_key))
            .collect();
        if let Ok(plain) = resolver.resolve(name, ArtifactKind::Code, None, None) {
            keys.push(plain);
        }
        keys.sort();
        keys.dedup();
        self.invalidate(name, &keys);
        self.renderers.forget(name);
    }

    /// Drops the renderers of the given code keys.
    ///
    /// In-flight compiles of those keys are detached so later callers start
    /// over instead of joining them.
    fn invalidate(&self, name: &str, code_keys: &[String]) {
        let dropped = self.renderers.invalidate(code_keys.iter().map(String::as_str));
        let mut in_flight = self.in_flight.lock();
        for key in code_keys {
            self.store.overlay().remove_compiled_key(key);
            in_flight.remove(key);
        }
        debug!(name, dropped, keys = code_keys.len(), "invalidated renderers");
    }

    /// Compiles a code key whose renderer is not cached.
    ///
    /// `since` is the renderer epoch at the start of the compile; the result
    /// is neither cached nor written back to the registry when the key was
    /// invalidated after it.
    async fn compile_uncached(
        &self,
        request: &CompileRequest<'_>,
        code_key: &str,
        inline: Option<Arc<PartialRecord>>,
        since: u64,
    ) -> Result<Arc<CompiledRecord>, QuillError> {
        let name = request.name;
        let token = self.token();
        let policy = self.options.render_time_policy;
        let caching = self.options.cache_raw_templates;
        let lookup = Lookup::name(name)
            .with_extension(request.extension)
            .with_params(request.params);

        if caching
            && inline.is_none()
            && !self.renderers.is_stale(code_key)
            && let Some(record) = self.load_code(lookup, code_key, &token).await?
        {
            self.renderers.insert(record.clone(), since);
            debug!(name, key = %code_key, stage = ?CompileStage::Done, "loaded stored renderer");
            return Ok(record);
        }

        let content_key = self.store.resolver().resolve(
            name,
            ArtifactKind::Content,
            request.extension,
            request.params,
        )?;
        let plain = request.is_plain();
        let registered = match inline {
            Some(record) => Some(record),
            None => {
                debug!(name, stage = ?CompileStage::NeedContent, "resolving content");
                self.registry.lookup(name, &content_key, plain)
            }
        };
        let record = match registered {
            Some(record) => record,
            None => {
                let found = if policy.allows_read() {
                    self.store
                        .read_content(lookup, &token)
                        .await
                        .map_err(|e| QuillError::store_for(name, content_key.as_str(), e))?
                } else {
                    self.store.overlay().get_partial(&content_key)
                };
                let Some(found) = found else {
                    return Err(QuillError::ContentNotFound {
                        name: name.to_string(),
                        key: content_key,
                        policy,
                    });
                };
                if self.renderers.invalidated_since(code_key, since) {
                    debug!(name, key = %content_key, "registration changed during read");
                } else {
                    self.registry.register_if_absent(PartialRecord::clone(&found));
                }
                found
            }
        };

        debug!(name, stage = ?CompileStage::HaveContentNeedRenderer, "generating renderer");
        let renderer = self
            .generator
            .generate(&record.content, &self.options.generator)
            .map_err(|source| QuillError::Compile {
                name: name.to_string(),
                key: content_key.clone(),
                source,
            })?;

        debug!(name, stage = ?CompileStage::HaveRenderer, "renderer generated");
        let compiled = if policy.allows_write() {
            self.store
                .write_code(lookup, renderer, &token)
                .await
                .map_err(|e| QuillError::store_for(name, code_key, e))?
        } else {
            Arc::new(CompiledRecord::new(code_key, name, renderer))
        };

        if caching {
            if !self.renderers.insert(compiled.clone(), since) {
                debug!(name, key = %code_key, "key invalidated during compile; result not cached");
            }
        } else {
            self.renderers.mark_fresh(code_key, since);
        }
        debug!(name, key = %code_key, stage = ?CompileStage::Done, "compiled");
        Ok(compiled)
    }

    /// Looks for an already compiled renderer in the store.
    ///
    /// Persisted text that cannot be materialized, or a failed code read, is
    /// treated as a miss; only cancellation is propagated.
    async fn load_code(
        &self,
        lookup: Lookup<'_>,
        code_key: &str,
        token: &OpToken,
    ) -> Result<Option<Arc<CompiledRecord>>, QuillError> {
        let artifact = if self.options.render_time_policy.allows_read() {
            match self.store.read_code(lookup, token).await {
                Ok(artifact) => artifact,
                Err(e @ (StoreError::Cancelled { .. } | StoreError::TimedOut { .. })) => {
                    return Err(QuillError::store_for(lookup.name, code_key, e));
                }
                Err(e) => {
                    warn!(name = lookup.name, error = %e, "failed to read stored code; recompiling");
                    None
                }
            }
        } else {
            self.store.overlay().get_compiled(code_key).map(CodeArtifact::Live)
        };

        match artifact {
            Some(CodeArtifact::Live(record)) => Ok(Some(record)),
            Some(CodeArtifact::Text { source, .. }) => {
                match self.generator.materialize(&source, &self.options.generator) {
                    Ok(renderer) => Ok(Some(self.store.overlay().put_compiled(
                        CompiledRecord::new(code_key, lookup.name, renderer),
                    ))),
                    Err(e) => {
                        debug!(name = lookup.name, error = %e, "stored code not loadable; recompiling");
                        Ok(None)
                    }
                }
            }
            None => Ok(None),
        }
    }
}

impl WatchSink for Inner {
    fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Updated(record) => {
                self.register(PartialRecord::clone(&record));
            }
            WatchEvent::Removed(name) => self.remove_name(&name),
        }
    }
}
