//! In-process index of known partials.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use quill_store::{PartialRecord, RecordOrigin};
use tracing::debug;

/// Outcome of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The key was not known before.
    Inserted,
    /// The record under the key was overwritten.
    Replaced,
    /// A discovered record replaced an explicit one.
    Overrode,
    /// The same content was registered again.
    Unchanged,
}

impl Registration {
    /// Whether the effective content of the key may have changed.
    pub fn changed(self) -> bool {
        !matches!(self, Registration::Unchanged)
    }
}

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<String, Arc<PartialRecord>>,
    by_name: HashMap<String, BTreeSet<String>>,
}

impl Entries {
    fn insert(&mut self, record: Arc<PartialRecord>) {
        self.by_name
            .entry(record.name.clone())
            .or_default()
            .insert(record.canonical_key.clone());
        self.by_key.insert(record.canonical_key.clone(), record);
    }
}

/// Partial records by canonical content key.
///
/// Every key holds at most one record; a name may own several keys, one per
/// extension or parameter variant. A discovered record replacing an explicit
/// one under the same key is flagged `overridden`, and keeps that flag
/// across rediscovery.
#[derive(Debug, Default)]
pub struct PartialRegistry {
    entries: RwLock<Entries>,
}

impl PartialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mut record: PartialRecord) -> (Arc<PartialRecord>, Registration) {
        let mut entries = self.entries.write();
        let outcome = match entries.by_key.get(&record.canonical_key) {
            None => Registration::Inserted,
            Some(existing) => match (existing.origin, record.origin) {
                (RecordOrigin::Explicit, RecordOrigin::Discovered) => {
                    record.overridden = true;
                    Registration::Overrode
                }
                (RecordOrigin::Discovered, RecordOrigin::Explicit) => {
                    debug!(
                        key = %record.canonical_key,
                        "explicit registration replaces discovered partial"
                    );
                    Registration::Replaced
                }
                (previous, _) => {
                    record.overridden = existing.overridden && previous == RecordOrigin::Discovered;
                    if existing.content == record.content
                        && existing.overridden == record.overridden
                    {
                        return (existing.clone(), Registration::Unchanged);
                    }
                    Registration::Replaced
                }
            },
        };

        let record = Arc::new(record);
        entries.insert(record.clone());
        (record, outcome)
    }

    /// Registers a record only when its key is still unknown.
    pub fn register_if_absent(&self, record: PartialRecord) -> Option<Arc<PartialRecord>> {
        let mut entries = self.entries.write();
        if entries.by_key.contains_key(&record.canonical_key) {
            return None;
        }
        let record = Arc::new(record);
        entries.insert(record.clone());
        Some(record)
    }

    /// Returns the plain record of a name.
    ///
    /// The variant without parameters is preferred; otherwise the variant
    /// with the smallest key is returned.
    pub fn get(&self, name: &str) -> Option<Arc<PartialRecord>> {
        let entries = self.entries.read();
        let keys = entries.by_name.get(name)?;
        let records = keys.iter().filter_map(|key| entries.by_key.get(key));
        records
            .clone()
            .find(|record| record.source_params.is_none())
            .or_else(|| records.clone().next())
            .cloned()
    }

    pub fn get_key(&self, key: &str) -> Option<Arc<PartialRecord>> {
        self.entries.read().by_key.get(key).cloned()
    }

    /// Every record registered under a name, ordered by key.
    pub fn variants(&self, name: &str) -> Vec<Arc<PartialRecord>> {
        let entries = self.entries.read();
        entries
            .by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter_map(|key| entries.by_key.get(key).cloned())
            .collect()
    }

    /// Returns the record serving a content key.
    ///
    /// A plain-name request falls back to the parameterless record of the
    /// name, which may carry a non-default extension.
    pub fn lookup(&self, name: &str, key: &str, plain: bool) -> Option<Arc<PartialRecord>> {
        match self.get_key(key) {
            Some(record) => Some(record),
            None if plain => self.get(name).filter(|record| record.source_params.is_none()),
            None => None,
        }
    }

    /// Removes every variant of a name.
    pub fn remove(&self, name: &str) -> Vec<Arc<PartialRecord>> {
        let mut entries = self.entries.write();
        let keys = entries.by_name.remove(name).unwrap_or_default();
        keys.iter()
            .filter_map(|key| entries.by_key.remove(key))
            .collect()
    }

    pub fn clear(&self) {
        *self.entries.write() = Entries::default();
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().by_key.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }
}
