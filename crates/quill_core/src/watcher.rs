//! Source tree watching.
//!
//! File system events are forwarded to a tokio task. Each changed path is
//! debounced: only the last event for a path within [`DEBOUNCE_WINDOW`] is
//! acted upon. A path that still holds a file is reloaded through the store;
//! anything else unregisters the corresponding partial.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use quill_store::{OpToken, PartialRecord, Store};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::QuillError;

/// Quiet period a path must observe before its change is applied.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Change applied to a compiler after debouncing.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Updated(Arc<PartialRecord>),
    Removed(String),
}

/// Receiver of debounced watch events.
pub trait WatchSink: Send + Sync + 'static {
    fn apply(&self, event: WatchEvent);
}

/// A running watch over one store's source tree.
///
/// Dropping the watcher stops it.
pub struct Watcher {
    root: PathBuf,
    token: OpToken,
    _inner: RecommendedWatcher,
}

impl Watcher {
    /// Starts watching the source tree of `store`.
    pub fn spawn(
        store: Arc<dyn Store>,
        sink: Weak<dyn WatchSink>,
        token: OpToken,
    ) -> Result<Self, QuillError> {
        let root = store
            .source_root()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                QuillError::unsupported(format!("{} store cannot be watched", store.backend()))
            })?;

        let (tx, rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut inner = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(event) => {
                    for path in event.paths {
                        // the receiver is gone once the watcher is closed
                        let _ = tx.send(path);
                    }
                }
                Err(e) => warn!(error = %e, "file watcher reported an error"),
            }
        })?;
        inner.watch(&root, RecursiveMode::Recursive)?;

        info!(root = %root.display(), "watching source tree");
        tokio::spawn(run(rx, store, sink, token.clone()));

        Ok(Self {
            root,
            token,
            _inner: inner,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stops the watcher; pending debounced changes are discarded.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.token.cancel();
        debug!(root = %self.root.display(), "watcher closed");
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    store: Arc<dyn Store>,
    sink: Weak<dyn WatchSink>,
    token: OpToken,
) {
    let generations: Arc<Mutex<HashMap<PathBuf, u64>>> = Arc::default();
    loop {
        let path = tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(path) => path,
                None => break,
            },
        };

        let generation = {
            let mut generations = generations.lock();
            let counter = generations.entry(path.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let generations = generations.clone();
        let store = store.clone();
        let sink = sink.clone();
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            {
                let mut generations = generations.lock();
                if generations.get(&path) != Some(&generation) {
                    return;
                }
                generations.remove(&path);
            }
            if !token.is_cancelled() {
                settle(store.as_ref(), &sink, &path, &token).await;
            }
        });
    }
}

/// Applies the current state of a path.
async fn settle(store: &dyn Store, sink: &Weak<dyn WatchSink>, path: &Path, token: &OpToken) {
    let Some(name) = store.partial_name(path) else {
        return;
    };
    if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
        return;
    }

    let event = match store.load_source(path, token).await {
        Ok(Some(record)) => {
            debug!(name = %name, path = %path.display(), "reloaded watched partial");
            WatchEvent::Updated(record)
        }
        Ok(None) => {
            debug!(name = %name, path = %path.display(), "watched partial removed");
            unregister(store, &name, token).await;
            WatchEvent::Removed(name)
        }
        Err(e) => {
            warn!(name = %name, path = %path.display(), error = %e, "failed to reload watched partial");
            unregister(store, &name, token).await;
            WatchEvent::Removed(name)
        }
    };

    if token.is_cancelled() {
        return;
    }
    if let Some(sink) = sink.upgrade() {
        sink.apply(event);
    }
}

async fn unregister(store: &dyn Store, name: &str, token: &OpToken) {
    if let Err(e) = store.unregister(name, token).await {
        warn!(name = %name, error = %e, "failed to unregister removed partial");
    }
}
