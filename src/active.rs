//! Table of currently sounding notes, at most one per key.

use std::collections::HashMap;

use crate::note::{KeyId, Note};
use crate::scheduler::ScheduleHandle;

/// A triggered note that has not been released yet.
#[derive(Debug, Clone)]
pub struct ActiveNote {
    pub note: Note,
    /// Index of this note in the current history, if it was recorded.
    pub history_index: Option<usize>,
    /// Pending natural release for bounded notes.
    pub release: Option<ScheduleHandle>,
}

#[derive(Debug, Clone, Default)]
pub struct ActiveNotes {
    notes: HashMap<KeyId, ActiveNote>,
}

impl ActiveNotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a sounding note. The caller must have released the key first.
    ///
    /// Returns the previous entry if the key was still sounding, which would
    /// indicate a missed release.
    pub fn insert(&mut self, active: ActiveNote) -> Option<ActiveNote> {
        self.notes.insert(active.note.key, active)
    }

    pub fn remove(&mut self, key: KeyId) -> Option<ActiveNote> {
        self.notes.remove(&key)
    }

    pub fn get(&self, key: KeyId) -> Option<&ActiveNote> {
        self.notes.get(&key)
    }

    pub fn contains(&self, key: KeyId) -> bool {
        self.notes.contains_key(&key)
    }

    /// Keys sounding right now, sorted. Callers that release while iterating
    /// must work from this snapshot rather than the live table.
    pub fn keys(&self) -> Vec<KeyId> {
        let mut keys: Vec<KeyId> = self.notes.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}
