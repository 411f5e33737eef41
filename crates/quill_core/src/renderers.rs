//! Compiled renderers by code key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use quill_store::CompiledRecord;

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Arc<CompiledRecord>>,
    /// Code key to the epoch of its last invalidation.
    stale: HashMap<String, u64>,
    epoch: u64,
    cleared_at: u64,
}

/// Renderer registry owned by a compiler.
///
/// Entries leave only through explicit invalidation or clearing. A key
/// invalidated here is also marked stale so that code persisted by a store
/// is not trusted until the key has been recompiled.
///
/// Every invalidation advances an epoch. A compile that started before the
/// epoch its key was invalidated at must not publish its result.
#[derive(Debug, Default)]
pub struct RendererCache {
    state: RwLock<State>,
}

impl RendererCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CompiledRecord>> {
        self.state.read().entries.get(key).cloned()
    }

    /// Current epoch, taken when a compile starts.
    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Whether a key was invalidated or cleared after `since`.
    pub fn invalidated_since(&self, key: &str, since: u64) -> bool {
        let state = self.state.read();
        state.cleared_at > since || state.stale.get(key).is_some_and(|&at| at > since)
    }

    /// Caches a renderer compiled since `since`.
    ///
    /// Returns `false`, leaving the cache untouched, when the key was
    /// invalidated in the meantime.
    pub fn insert(&self, record: Arc<CompiledRecord>, since: u64) -> bool {
        let mut state = self.state.write();
        let key = &record.canonical_key;
        if state.cleared_at > since || state.stale.get(key).is_some_and(|&at| at > since) {
            return false;
        }
        state.stale.remove(key);
        state.entries.insert(key.clone(), record);
        true
    }

    /// Drops the renderers of the given keys and marks them stale.
    pub fn invalidate<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> usize {
        let mut state = self.state.write();
        state.epoch += 1;
        let epoch = state.epoch;
        let mut dropped = 0;
        for key in keys {
            state.stale.insert(key.to_string(), epoch);
            dropped += usize::from(state.entries.remove(key).is_some());
        }
        dropped
    }

    /// Drops every renderer of a name, marking the dropped keys stale.
    pub fn forget(&self, name: &str) {
        let mut state = self.state.write();
        state.epoch += 1;
        let epoch = state.epoch;
        let keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, record)| record.short_name == name)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            state.entries.remove(&key);
            state.stale.insert(key, epoch);
        }
    }

    pub fn is_stale(&self, key: &str) -> bool {
        self.state.read().stale.contains_key(key)
    }

    /// Clears the stale mark once a key compiled without being cached.
    pub fn mark_fresh(&self, key: &str, since: u64) {
        let mut state = self.state.write();
        if state.stale.get(key).is_some_and(|&at| at <= since) {
            state.stale.remove(key);
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        state.epoch += 1;
        state.cleared_at = state.epoch;
        state.entries.clear();
        state.stale.clear();
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }
}
