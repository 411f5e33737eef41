//! File system backed store.
//!
//! The store mirrors a source directory tree into an output directory:
//!
//! - Source files are read directly and enumerated by [`FileSystemStore::scan`]
//! - Every source subdirectory gets an output counterpart, created once
//! - Compiled code is written under the output tree inside a module wrapper
//!
//! Without an explicit output path a uniquely named temporary directory is
//! created on first use.

use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::memory::MemoryStore;
use crate::naming::{ArtifactKind, NamingResolver};
use crate::record::{
    CodeArtifact, CompiledRecord, Content, PartialRecord, RecordOrigin, Renderer,
};
use crate::store::{DiscoverFn, Lookup, Store};
use crate::waiter;
use crate::{OpToken, StoreError};

const BACKEND: &str = "filesystem";

/// Default prefix of lazily created output directories.
pub const DEFAULT_TEMP_PREFIX: &str = "quill-";

/// Module wrapper written around persisted renderer source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleFormat {
    #[default]
    Plain,
    CommonJs,
    Esm,
}

impl ModuleFormat {
    fn prefix(self) -> &'static str {
        match self {
            ModuleFormat::Plain => "",
            ModuleFormat::CommonJs => "module.exports = ",
            ModuleFormat::Esm => "export default ",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ModuleFormat::Plain => "",
            ModuleFormat::CommonJs | ModuleFormat::Esm => ";\n",
        }
    }

    /// Wraps renderer source for this module system.
    pub fn wrap(self, source: &str) -> String {
        format!("{}{}{}", self.prefix(), source, self.suffix())
    }

    /// Strips the wrapper written by [`ModuleFormat::wrap`], if present.
    pub fn unwrap(self, text: &str) -> &str {
        let text = text.strip_prefix(self.prefix()).unwrap_or(text);
        text.strip_suffix(self.suffix()).unwrap_or(text)
    }
}

/// Configuration of a [`FileSystemStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsStoreConfig {
    /// Root of the source tree.
    pub source_dir: PathBuf,

    /// Leading path stripped from source files to form partial names.
    #[serde(default = "default_partial_prefix")]
    pub partial_prefix: String,

    /// Output directory; a temporary one is created when absent.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Directory temporary outputs are created in. Defaults to the system
    /// temp directory.
    #[serde(default)]
    pub temp_root: Option<PathBuf>,

    #[serde(default = "default_temp_prefix")]
    pub temp_prefix: String,

    #[serde(default)]
    pub module_format: ModuleFormat,
}

fn default_partial_prefix() -> String {
    "partials".to_string()
}

fn default_temp_prefix() -> String {
    DEFAULT_TEMP_PREFIX.to_string()
}

impl FsStoreConfig {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            partial_prefix: default_partial_prefix(),
            output_dir: None,
            temp_root: None,
            temp_prefix: default_temp_prefix(),
            module_format: ModuleFormat::default(),
        }
    }

    pub fn partial_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.partial_prefix = prefix.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(dir.into());
        self
    }

    pub fn temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.temp_prefix = prefix.into();
        self
    }

    pub fn module_format(mut self, format: ModuleFormat) -> Self {
        self.module_format = format;
        self
    }

    fn temp_root_or_default(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Outcome of mirroring the source tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    /// Output directories corresponding to source directories, sorted.
    pub directories: Vec<PathBuf>,
    /// Source files found, sorted.
    pub files: Vec<PathBuf>,
}

/// Relative directories, files and per-entry failures of one walk.
type WalkOutcome = (Vec<PathBuf>, Vec<PathBuf>, Vec<StoreError>);

/// Store reading from a source tree and writing into a mirrored output tree.
pub struct FileSystemStore {
    config: FsStoreConfig,
    /// Canonical form of the source root, for matching watcher paths.
    canonical_source: Option<PathBuf>,
    resolver: Arc<NamingResolver>,
    overlay: MemoryStore,
    output: Mutex<Option<PathBuf>>,
    created_dirs: Mutex<HashSet<PathBuf>>,
}

impl FileSystemStore {
    pub fn new(config: FsStoreConfig, resolver: Arc<NamingResolver>) -> Self {
        let canonical_source = std::fs::canonicalize(&config.source_dir).ok();
        let output = config.output_dir.clone();
        Self {
            overlay: MemoryStore::new(resolver.clone()),
            config,
            canonical_source,
            resolver,
            output: Mutex::new(output),
            created_dirs: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &FsStoreConfig {
        &self.config
    }

    /// Returns the output directory if it is known, without creating one.
    pub fn current_output_dir(&self) -> Option<PathBuf> {
        self.output.lock().clone()
    }

    /// Returns the output directory, creating a temporary one on first use.
    pub fn output_dir(&self) -> Result<PathBuf, StoreError> {
        let mut output = self.output.lock();
        if let Some(dir) = output.as_ref() {
            return Ok(dir.clone());
        }

        let root = self.config.temp_root_or_default();
        let dir = tempfile::Builder::new()
            .prefix(&self.config.temp_prefix)
            .tempdir_in(&root)
            .map_err(|e| StoreError::transport(BACKEND, root.display().to_string(), e))?
            .keep();
        info!(dir = %dir.display(), "created temporary output directory");
        self.created_dirs.lock().insert(dir.clone());
        *output = Some(dir.clone());
        Ok(dir)
    }

    /// Creates a directory unless it is already known to exist.
    async fn ensure_dir(&self, dir: &Path) -> Result<bool, StoreError> {
        if self.created_dirs.lock().contains(dir) {
            return Ok(false);
        }
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::transport(BACKEND, dir.display().to_string(), e))?;
        self.created_dirs.lock().insert(dir.to_path_buf());
        Ok(true)
    }

    /// Walks the source tree, collecting relative directories, files and
    /// per-entry failures.
    async fn walk_source(&self) -> Result<WalkOutcome, StoreError> {
        let root = self.config.source_dir.clone();
        let walk_root = root.clone();
        tokio::task::spawn_blocking(move || {
            let mut dirs = Vec::new();
            let mut files = Vec::new();
            let mut errors = Vec::new();
            let walker = WalkDir::new(&walk_root)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));
            for entry in walker {
                match entry {
                    Ok(entry) => {
                        let Ok(rel) = entry.path().strip_prefix(&walk_root) else {
                            continue;
                        };
                        if entry.file_type().is_dir() {
                            dirs.push(rel.to_path_buf());
                        } else if entry.file_type().is_file() {
                            files.push(entry.path().to_path_buf());
                        }
                    }
                    Err(e) => {
                        let target = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| walk_root.display().to_string());
                        errors.push(StoreError::transport(BACKEND, target, io::Error::from(e)));
                    }
                }
            }
            (dirs, files, errors)
        })
        .await
        .map_err(|e| StoreError::transport(BACKEND, root.display().to_string(), io::Error::other(e)))
    }

    async fn mirror_dirs(&self, relative: &[PathBuf]) -> Result<Vec<PathBuf>, StoreError> {
        let output = self.output_dir()?;
        self.ensure_dir(&output).await?;
        let mut created = 0usize;
        let mut directories = Vec::with_capacity(relative.len());
        for rel in relative {
            let dir = output.join(rel);
            if self.ensure_dir(&dir).await? {
                created += 1;
            }
            directories.push(dir);
        }
        directories.sort();
        debug!(created, total = directories.len(), "mirrored source directories");
        Ok(directories)
    }

    /// Mirrors the source directory tree into the output directory.
    ///
    /// Running it repeatedly is idempotent: known directories are never
    /// created again.
    pub async fn mirror(&self, token: &OpToken) -> Result<MirrorReport, StoreError> {
        token
            .run("filesystem mirror", async {
                let (dirs, mut files, errors) = self.walk_source().await?;
                let directories = self.mirror_dirs(&dirs).await?;
                if !errors.is_empty() {
                    let outcomes: Vec<Result<String, StoreError>> =
                        errors.into_iter().map(Err).collect();
                    waiter::collect(outcomes).map_err(StoreError::batch)?;
                }
                files.sort();
                Ok(MirrorReport { directories, files })
            })
            .await
    }

    fn source_path(&self, key: &str) -> PathBuf {
        let path_part = strip_query(key);
        let path = Path::new(path_part);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.source_dir.join(normal_components(path))
        }
    }

    fn output_path(output: &Path, key: &str) -> PathBuf {
        output.join(relative_key_path(key))
    }

    /// Content key of a source file registered under `name`.
    fn source_key(&self, name: &str, path: &Path) -> Result<String, StoreError> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        Ok(self
            .resolver
            .resolve_source(name, ArtifactKind::Content, extension, None)?)
    }

    fn relative_to_source<'p>(&self, path: &'p Path) -> Option<&'p Path> {
        path.strip_prefix(&self.config.source_dir).ok().or_else(|| {
            self.canonical_source
                .as_ref()
                .and_then(|root| path.strip_prefix(root).ok())
        })
    }

    async fn remove_file(&self, path: PathBuf) -> Result<String, StoreError> {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(path.display().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(path.display().to_string()),
            Err(e) => Err(StoreError::transport(BACKEND, path.display().to_string(), e)),
        }
    }

    async fn remove_dir(&self, path: PathBuf) -> Result<String, StoreError> {
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(path.display().to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(path.display().to_string()),
            Err(e) => Err(StoreError::transport(BACKEND, path.display().to_string(), e)),
        }
    }

    async fn prefixed_temp_dirs(&self) -> Result<Vec<PathBuf>, StoreError> {
        let root = self.config.temp_root_or_default();
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .map_err(|e| StoreError::transport(BACKEND, root.display().to_string(), e))?;
        let mut dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::transport(BACKEND, root.display().to_string(), e))?
        {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&self.config.temp_prefix)
                && entry.file_type().await.is_ok_and(|t| t.is_dir())
            {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

#[async_trait]
impl Store for FileSystemStore {
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
            debug!(key = %key, "filesystem overlay hit");
            return Ok(Some(hit));
        }

        let path = self.source_path(&key);
        token
            .run("filesystem read", async {
                let text = match tokio::fs::read_to_string(&path).await {
                    Ok(text) => text,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!(key = %key, path = %path.display(), "source file not found");
                        return Ok(None);
                    }
                    Err(e) => return Err(StoreError::transport(BACKEND, key.clone(), e)),
                };
                let extension = path.extension().and_then(|e| e.to_str());
                let record = PartialRecord::new(
                    lookup.name,
                    key.clone(),
                    Content::from_source(text, extension),
                    RecordOrigin::Discovered,
                )
                .with_extension(extension)
                .with_params(lookup.params.cloned());
                Ok(Some(self.overlay.put_partial(record)))
            })
            .await
    }

    async fn write_content(
        &self,
        lookup: Lookup<'_>,
        content: Content,
        token: &OpToken,
    ) -> Result<Arc<PartialRecord>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Content)?;
        let path = Self::output_path(&self.output_dir()?, &key);
        token
            .run("filesystem write", async {
                if let Some(parent) = path.parent() {
                    self.ensure_dir(parent).await?;
                }
                tokio::fs::write(&path, content.as_text().as_bytes())
                    .await
                    .map_err(|e| StoreError::transport(BACKEND, key.clone(), e))?;
                Ok(())
            })
            .await?;

        let record = PartialRecord::new(lookup.name, key, content, RecordOrigin::Explicit)
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
        let Some(output) = self.current_output_dir() else {
            return Ok(None);
        };

        let path = Self::output_path(&output, &key);
        let format = self.config.module_format;
        token
            .run("filesystem read code", async {
                match tokio::fs::read_to_string(&path).await {
                    Ok(text) => Ok(Some(CodeArtifact::Text {
                        source: format.unwrap(&text).to_string(),
                        canonical_key: key.clone(),
                        name: lookup.name.to_string(),
                    })),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(StoreError::transport(BACKEND, key.clone(), e)),
                }
            })
            .await
    }

    async fn write_code(
        &self,
        lookup: Lookup<'_>,
        renderer: Arc<dyn Renderer>,
        token: &OpToken,
    ) -> Result<Arc<CompiledRecord>, StoreError> {
        let key = lookup.key(&self.resolver, ArtifactKind::Code)?;
        if let Some(source) = renderer.source() {
            let path = Self::output_path(&self.output_dir()?, &key);
            let wrapped = self.config.module_format.wrap(source);
            token
                .run("filesystem write code", async {
                    if let Some(parent) = path.parent() {
                        self.ensure_dir(parent).await?;
                    }
                    tokio::fs::write(&path, wrapped)
                        .await
                        .map_err(|e| StoreError::transport(BACKEND, key.clone(), e))
                })
                .await?;
            debug!(key = %key, path = %path.display(), "wrote compiled code");
        }
        Ok(self
            .overlay
            .put_compiled(CompiledRecord::new(key, lookup.name, renderer)))
    }

    async fn unregister(&self, name: &str, token: &OpToken) -> Result<(), StoreError> {
        let (mut content_keys, mut code_keys) = self.overlay.remove_name(name);
        content_keys.push(self.resolver.resolve(name, ArtifactKind::Content, None, None)?);
        code_keys.push(self.resolver.resolve(name, ArtifactKind::Code, None, None)?);

        let Some(output) = self.current_output_dir() else {
            return Ok(());
        };
        let mut paths: Vec<PathBuf> = content_keys
            .iter()
            .chain(code_keys.iter())
            .map(|key| Self::output_path(&output, key))
            .collect();
        paths.sort();
        paths.dedup();

        token
            .run("filesystem unregister", async {
                waiter::wait_all(paths.into_iter().map(|path| self.remove_file(path)))
                    .await
                    .map(|_| ())
                    .map_err(StoreError::batch)
            })
            .await
    }

    async fn clear(&self, all: bool, token: &OpToken) -> Result<(), StoreError> {
        self.overlay.clear();
        let output = self.output.lock().take();
        self.created_dirs.lock().clear();
        if self.config.output_dir.is_some() {
            // an explicit output path stays configured for the next write
            *self.output.lock() = self.config.output_dir.clone();
        }

        token
            .run("filesystem clear", async {
                let mut targets: Vec<PathBuf> = output.into_iter().collect();
                if all {
                    targets.extend(self.prefixed_temp_dirs().await?);
                }
                targets.sort();
                targets.dedup();
                info!(count = targets.len(), all, "removing output directories");
                waiter::wait_all(targets.into_iter().map(|dir| self.remove_dir(dir)))
                    .await
                    .map(|_| ())
                    .map_err(StoreError::batch)
            })
            .await
    }

    async fn scan(
        &self,
        on_discover: &mut DiscoverFn<'_>,
        token: &OpToken,
    ) -> Result<usize, StoreError> {
        let (dirs, files, walk_errors) = token
            .run("filesystem scan", self.walk_source())
            .await?;
        self.mirror_dirs(&dirs).await?;

        let loaded = token
            .run("filesystem scan", async {
                Ok(join_all(files.iter().map(|path| self.load_source(path, token))).await)
            })
            .await?;

        let mut discovered = 0usize;
        let mut outcomes: Vec<Result<String, StoreError>> = walk_errors.into_iter().map(Err).collect();
        for outcome in loaded {
            match outcome {
                Ok(Some(record)) => {
                    discovered += 1;
                    outcomes.push(Ok(record.canonical_key.clone()));
                    on_discover(record);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "failed to load source file during scan");
                    outcomes.push(Err(e));
                }
            }
        }

        info!(discovered, root = %self.config.source_dir.display(), "scanned source tree");
        waiter::collect(outcomes).map_err(StoreError::batch)?;
        Ok(discovered)
    }

    fn source_root(&self) -> Option<&Path> {
        Some(&self.config.source_dir)
    }

    fn partial_name(&self, path: &Path) -> Option<String> {
        let rel = self.relative_to_source(path)?;
        if rel.components().any(|c| match c {
            Component::Normal(part) => is_hidden(part),
            _ => true,
        }) {
            return None;
        }
        let stripped = rel.strip_prefix(&self.config.partial_prefix).unwrap_or(rel);
        let name = stripped
            .with_extension("")
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect::<Vec<_>>()
            .join("/");
        if name.is_empty() {
            return None;
        }

        // a name whose key would address another file is not served by this store
        let key = self.source_key(&name, path).ok()?;
        if self.source_path(&key) != self.config.source_dir.join(normal_components(rel)) {
            debug!(path = %path.display(), key = %key, "file does not map back to its key");
            return None;
        }
        Some(name)
    }

    async fn load_source(
        &self,
        path: &Path,
        token: &OpToken,
    ) -> Result<Option<Arc<PartialRecord>>, StoreError> {
        let Some(name) = self.partial_name(path) else {
            return Ok(None);
        };

        let text = token
            .run("filesystem load", async {
                match tokio::fs::metadata(path).await {
                    Ok(meta) if meta.is_file() => {}
                    Ok(_) => return Ok(None),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(StoreError::transport(BACKEND, path.display().to_string(), e)),
                }
                match tokio::fs::read_to_string(path).await {
                    Ok(text) => Ok(Some(text)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(StoreError::transport(BACKEND, path.display().to_string(), e)),
                }
            })
            .await?;
        let Some(text) = text else {
            return Ok(None);
        };

        if let Some(parent) = self.relative_to_source(path).and_then(Path::parent)
            && !parent.as_os_str().is_empty()
        {
            let output = self.output_dir()?;
            self.ensure_dir(&output.join(parent)).await?;
        }

        let extension = path.extension().and_then(|e| e.to_str());
        let key = self.source_key(&name, path)?;
        let record = PartialRecord::new(
            name,
            key,
            Content::from_source(text, extension),
            RecordOrigin::Discovered,
        )
        .with_extension(extension);
        Ok(Some(self.overlay.put_partial(record)))
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

fn strip_query(key: &str) -> &str {
    key.split_once('?').map_or(key, |(path, _)| path)
}

/// Keeps only normal components so a key can never escape its root.
fn normal_components(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Maps a canonical key to a path relative to the output directory.
///
/// A query part is folded into the file name as a short digest.
fn relative_key_path(key: &str) -> PathBuf {
    let mut rel = normal_components(Path::new(strip_query(key)));
    if let Some((_, query)) = key.split_once('?') {
        let digest = blake3::hash(query.as_bytes()).to_hex();
        let file = rel
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        rel.set_file_name(format!("{file}.{}", &digest.as_str()[..12]));
    }
    rel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::{NamingConfig, QueryParams};
    use crate::record::RenderError;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    struct Echo(String);

    impl Renderer for Echo {
        fn render(
            &self,
            _context: &serde_json::Value,
            _options: &serde_json::Value,
        ) -> Result<String, RenderError> {
            Ok(self.0.clone())
        }

        fn source(&self) -> Option<&str> {
            Some(&self.0)
        }
    }

    fn resolver() -> Arc<NamingResolver> {
        Arc::new(NamingResolver::new(NamingConfig::default()).unwrap())
    }

    fn source_tree() -> TempDir {
        let dir = tempdir().unwrap();
        let partials = dir.path().join("partials");
        fs::create_dir_all(partials.join("nav")).unwrap();
        fs::write(partials.join("header.html"), "<h1>{{title}}</h1>").unwrap();
        fs::write(partials.join("nav/menu.html"), "<ul></ul>").unwrap();
        fs::write(dir.path().join("template.html"), "{{> header}}").unwrap();
        dir
    }

    #[test]
    fn key_paths_cannot_escape() {
        assert_eq!(
            relative_key_path("../../etc/passwd"),
            PathBuf::from("etc/passwd")
        );
        assert_eq!(
            relative_key_path("/abs/partials/a.html"),
            PathBuf::from("abs/partials/a.html")
        );
    }

    #[test]
    fn query_is_folded_into_file_name() {
        let a = relative_key_path("partials/a.html?lang=en");
        let b = relative_key_path("partials/a.html?lang=fr");
        assert_ne!(a, b);
        assert!(a.starts_with("partials"));
        assert!(a.to_string_lossy().contains("a.html."));
    }

    #[rstest::rstest]
    #[case::plain(ModuleFormat::Plain)]
    #[case::commonjs(ModuleFormat::CommonJs)]
    #[case::esm(ModuleFormat::Esm)]
    fn module_wrapper_is_stripped_on_load(#[case] format: ModuleFormat) {
        let wrapped = format.wrap("function render() {}");
        assert_eq!(format.unwrap(&wrapped), "function render() {}");
    }

    #[tokio::test]
    async fn mirror_is_idempotent() {
        let source = source_tree();
        let out = tempdir().unwrap();
        let store = FileSystemStore::new(
            FsStoreConfig::new(source.path()).output_dir(out.path().join("out")),
            resolver(),
        );
        let token = OpToken::new();

        let first = store.mirror(&token).await.unwrap();
        let second = store.mirror(&token).await.unwrap();

        assert_eq!(first, second);
        assert!(out.path().join("out/partials/nav").is_dir());
        assert_eq!(first.files.len(), 3);
    }

    #[tokio::test]
    async fn mirror_tolerates_preexisting_output() {
        let source = source_tree();
        let out = tempdir().unwrap();
        fs::create_dir_all(out.path().join("partials/nav")).unwrap();
        let store = FileSystemStore::new(
            FsStoreConfig::new(source.path()).output_dir(out.path()),
            resolver(),
        );
        let report = store.mirror(&OpToken::new()).await.unwrap();
        assert!(report.directories.contains(&out.path().join("partials/nav")));
    }

    #[tokio::test]
    async fn reads_source_files_directly() {
        let source = source_tree();
        let store = FileSystemStore::new(FsStoreConfig::new(source.path()), resolver());
        let token = OpToken::new();

        let record = store
            .read_content(Lookup::name("header"), &token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.content, Content::Text("<h1>{{title}}</h1>".to_string()));
        assert_eq!(record.origin, RecordOrigin::Discovered);

        let missing = store
            .read_content(Lookup::name("missing"), &token)
            .await
            .unwrap();
        assert!(missing.is_none());
        // reading never forces a temporary output directory into existence
        assert!(store.current_output_dir().is_none());
    }

    #[tokio::test]
    async fn scan_discovers_partials_with_stripped_names() {
        let source = source_tree();
        let out = tempdir().unwrap();
        let store = FileSystemStore::new(
            FsStoreConfig::new(source.path()).output_dir(out.path()),
            resolver(),
        );
        let mut names = Vec::new();
        let count = store
            .scan(&mut |record| names.push(record.name.clone()), &OpToken::new())
            .await
            .unwrap();
        names.sort();
        assert_eq!(count, 3);
        assert_eq!(names, vec!["header", "nav/menu", "template"]);
    }

    #[tokio::test]
    async fn scanned_keys_address_their_own_files() {
        let source = source_tree();
        fs::write(source.path().join("partials/a.b.html"), "dotted").unwrap();
        fs::create_dir_all(source.path().join("pages")).unwrap();
        fs::write(source.path().join("pages/x.html"), "stray").unwrap();
        let out = tempdir().unwrap();
        let store = FileSystemStore::new(
            FsStoreConfig::new(source.path()).output_dir(out.path()),
            resolver(),
        );

        let mut found = Vec::new();
        store
            .scan(
                &mut |record| found.push((record.name.clone(), record.canonical_key.clone())),
                &OpToken::new(),
            )
            .await
            .unwrap();
        found.sort();

        assert!(found.contains(&("a.b".to_string(), "partials/a.b.html".to_string())));
        assert!(found.iter().all(|(name, _)| name != "pages/x"));
        for (_, key) in &found {
            assert!(store.source_path(key).is_file(), "{key} has no source file");
        }
        assert_eq!(store.partial_name(&source.path().join("pages/x.html")), None);
    }

    #[tokio::test]
    async fn compiled_code_is_written_with_wrapper() {
        let source = source_tree();
        let out = tempdir().unwrap();
        let store = FileSystemStore::new(
            FsStoreConfig::new(source.path())
                .output_dir(out.path())
                .module_format(ModuleFormat::CommonJs),
            resolver(),
        );
        let token = OpToken::new();
        store
            .write_code(Lookup::name("header"), Arc::new(Echo("src".into())), &token)
            .await
            .unwrap();

        let written =
            fs::read_to_string(out.path().join("partials/header.html.compiled")).unwrap();
        assert_eq!(written, "module.exports = src;\n");

        store.overlay().clear();
        let artifact = store
            .read_code(Lookup::name("header"), &token)
            .await
            .unwrap()
            .unwrap();
        match artifact {
            CodeArtifact::Text { source, .. } => assert_eq!(source, "src"),
            other => panic!("expected text artifact, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unregister_removes_output_files() {
        let source = source_tree();
        let out = tempdir().unwrap();
        let store = FileSystemStore::new(
            FsStoreConfig::new(source.path()).output_dir(out.path()),
            resolver(),
        );
        let token = OpToken::new();
        store
            .write_content(Lookup::name("header"), "x".into(), &token)
            .await
            .unwrap();
        store
            .write_code(Lookup::name("header"), Arc::new(Echo("s".into())), &token)
            .await
            .unwrap();

        store.unregister("header", &token).await.unwrap();

        assert!(!out.path().join("partials/header.html").exists());
        assert!(!out.path().join("partials/header.html.compiled").exists());
        assert!(store.overlay().get_partial("partials/header.html").is_none());
    }

    #[tokio::test]
    async fn params_produce_distinct_output_files() {
        let source = source_tree();
        let out = tempdir().unwrap();
        let store = FileSystemStore::new(
            FsStoreConfig::new(source.path()).output_dir(out.path()),
            resolver(),
        );
        let token = OpToken::new();
        let en = QueryParams::new().with("lang", "en");
        let fr = QueryParams::new().with("lang", "fr");
        let a = store
            .write_content(Lookup::name("greet").with_params(Some(&en)), "hello".into(), &token)
            .await
            .unwrap();
        let b = store
            .write_content(Lookup::name("greet").with_params(Some(&fr)), "salut".into(), &token)
            .await
            .unwrap();
        assert_ne!(a.canonical_key, b.canonical_key);
        assert_eq!(
            fs::read_dir(out.path().join("partials")).unwrap().count(),
            2
        );
    }

    #[tokio::test]
    async fn clear_removes_lazily_created_temp_dirs() {
        let source = source_tree();
        let temp_root = tempdir().unwrap();
        let store = FileSystemStore::new(
            FsStoreConfig::new(source.path())
                .temp_root(temp_root.path())
                .temp_prefix("quill-test-"),
            resolver(),
        );
        let token = OpToken::new();
        assert!(store.current_output_dir().is_none());

        store.mirror(&token).await.unwrap();
        let output = store.current_output_dir().unwrap();
        assert!(output.starts_with(temp_root.path()));
        assert!(output.is_dir());

        // a stale directory from an earlier instance
        let stale = temp_root.path().join("quill-test-stale");
        fs::create_dir_all(&stale).unwrap();
        let unrelated = temp_root.path().join("other");
        fs::create_dir_all(&unrelated).unwrap();

        Store::clear(&store, true, &token).await.unwrap();

        assert!(!output.exists());
        assert!(!stale.exists());
        assert!(unrelated.exists());
        assert!(store.current_output_dir().is_none());
    }
}
