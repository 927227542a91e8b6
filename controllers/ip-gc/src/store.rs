//! Pod liveness store
//!
//! In-memory table of the Pods the GC engine is tracking. One `RwLock` guards
//! the map and is held only for map access, never across an `.await`.

use crate::entry::{PodEntry, PodKey, TracingState};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Errors returned by [`PodLivenessStore`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("pod {0} is already tracked")]
    AlreadyExists(PodKey),

    #[error("pod {0} is not tracked")]
    NotFound(PodKey),

    #[error("store is full ({0} entries)")]
    Full(usize),
}

/// Concurrent map of Pod identity to [`PodEntry`]
#[derive(Debug)]
pub struct PodLivenessStore {
    entries: RwLock<HashMap<PodKey, PodEntry>>,
    max_entries: usize,
}

impl PodLivenessStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    // Entries are replaced whole, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<PodKey, PodEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<PodKey, PodEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<PodEntry, StoreError> {
        let key = PodKey::new(namespace, name);
        self.read().get(&key).cloned().ok_or(StoreError::NotFound(key))
    }

    /// Inserts a new entry.
    pub fn create(&self, entry: PodEntry) -> Result<PodEntry, StoreError> {
        let mut entries = self.write();
        Self::insert_new(&mut entries, entry, self.max_entries)
    }

    /// Merges an observation into the existing entry (see [`PodEntry::merge`]).
    pub fn update(&self, entry: PodEntry) -> Result<PodEntry, StoreError> {
        let key = entry.key();
        let mut entries = self.write();
        let existing = entries.get_mut(&key).ok_or(StoreError::NotFound(key))?;
        existing.merge(entry);
        Ok(existing.clone())
    }

    /// Creates the entry or merges it into the existing one.
    pub fn apply(&self, entry: PodEntry) -> Result<PodEntry, StoreError> {
        let mut entries = self.write();
        match entries.get_mut(&entry.key()) {
            Some(existing) => {
                existing.merge(entry);
                Ok(existing.clone())
            }
            None => Self::insert_new(&mut entries, entry, self.max_entries),
        }
    }

    /// Moves the entry to `Released`. Returns whether an entry was moved.
    pub fn mark_released(&self, namespace: &str, name: &str) -> bool {
        self.write()
            .get_mut(&PodKey::new(namespace, name))
            .is_some_and(|entry| entry.transition(TracingState::Released))
    }

    /// Removes the entry; absent entries are ignored.
    pub fn delete(&self, namespace: &str, name: &str) -> Option<PodEntry> {
        self.write().remove(&PodKey::new(namespace, name))
    }

    /// Removes the entry only while it is still `Untracked`. Returns whether
    /// it was removed.
    pub fn delete_untracked(&self, namespace: &str, name: &str) -> bool {
        let key = PodKey::new(namespace, name);
        let mut entries = self.write();
        if !entries.get(&key).is_some_and(|e| e.state == TracingState::Untracked) {
            return false;
        }
        entries.remove(&key);
        true
    }

    /// Snapshot of every entry, ordered by key.
    pub fn list(&self) -> Vec<PodEntry> {
        let mut entries: Vec<PodEntry> = self.read().values().cloned().collect();
        entries.sort_by(|a, b| (&a.namespace, &a.pod_name).cmp(&(&b.namespace, &b.pod_name)));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn insert_new(
        entries: &mut HashMap<PodKey, PodEntry>,
        entry: PodEntry,
        max_entries: usize,
    ) -> Result<PodEntry, StoreError> {
        let key = entry.key();
        if entries.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        if entries.len() >= max_entries {
            return Err(StoreError::Full(max_entries));
        }
        entries.insert(key, entry.clone());
        Ok(entry)
    }
}
