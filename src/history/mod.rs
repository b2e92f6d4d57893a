//! Session history records and copy-on-rewind lineage.
//!
//! A [`History`] is the committed, time-ordered note log of one session
//! branch. Rewinding never edits a record that has already been handed to the
//! archive; instead [`HistoryArena::fork`] appends an independent copy that
//! points back at its parent, so the arena forms a simple tree.

pub mod smf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::HistoryError;
use crate::note::{Note, NoteLength};

/// Index of a record inside a [`HistoryArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryId(pub usize);

/// Committed notes of one session branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub title: String,
    /// Tempo in BPM
    pub tempo: f64,
    #[serde(default)]
    pub notes: Vec<Note>,
    /// Trigger time of the last note the player seeded the model with
    #[serde(default)]
    pub last_seed_note_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<HistoryId>,
    #[serde(default = "Local::now")]
    pub created: DateTime<Local>,
}

impl History {
    pub fn new(title: impl Into<String>, tempo: f64) -> Self {
        Self {
            title: title.into(),
            tempo,
            notes: Vec::new(),
            last_seed_note_time: 0.0,
            parent: None,
            created: Local::now(),
        }
    }

    /// Append a note, returning its index.
    pub fn push(&mut self, mut note: Note) -> usize {
        note.handle = None;
        self.notes.push(note);
        self.notes.len() - 1
    }

    /// Overwrite the recorded length of the note at `index`.
    pub fn set_length(&mut self, index: usize, length: NoteLength) {
        if let Some(note) = self.notes.get_mut(index) {
            note.length = length;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Trigger time of the latest note.
    pub fn last_note_time(&self) -> Option<f64> {
        self.notes.iter().map(|n| n.time).reduce(f64::max)
    }

    /// Notes triggered at or after `start`.
    pub fn notes_since(&self, start: f64) -> impl Iterator<Item = &Note> {
        self.notes.iter().filter(move |n| n.time >= start)
    }

    pub fn sort_notes(&mut self) {
        self.notes.sort_by(|a, b| a.time.total_cmp(&b.time));
    }

    /// Split the record at a rewind point.
    ///
    /// Notes before `position` stay. Notes in `[position, replay_end)` are
    /// removed and returned (as fresh replay notes). Notes at or after
    /// `replay_end` are dropped.
    pub fn split_for_replay(&mut self, position: f64, replay_end: f64) -> Vec<Note> {
        self.sort_notes();
        let mut kept = Vec::with_capacity(self.notes.len());
        let mut replay = Vec::new();
        for note in self.notes.drain(..) {
            if note.time < position {
                kept.push(note);
            } else if note.time < replay_end {
                replay.push(note.as_replay());
            }
        }
        self.notes = kept;
        replay
    }

    /// Load a history record from YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HistoryError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Save this history record as YAML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), HistoryError> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Load a shared record, picking the format from the file extension.
    pub fn load_shared<P: AsRef<Path>>(
        path: P,
        lowest_midi_note: u8,
        num_keys: u8,
    ) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("mid") | Some("midi") => smf::read_midi_file(path, lowest_midi_note, num_keys),
            Some("yaml") | Some("yml") => Self::load(path),
            other => Err(HistoryError::Unsupported(format!(
                "unknown extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

/// Owner of every history record created during a run.
#[derive(Debug, Clone, Default)]
pub struct HistoryArena {
    records: Vec<History>,
}

impl HistoryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, history: History) -> HistoryId {
        self.records.push(history);
        HistoryId(self.records.len() - 1)
    }

    /// Append a copy of `id` linked to it as parent. Returns `None` for an unknown id.
    pub fn fork(&mut self, id: HistoryId) -> Option<HistoryId> {
        let source = self.records.get(id.0)?;
        let fork = History {
            title: source.title.clone(),
            tempo: source.tempo,
            notes: source.notes.clone(),
            last_seed_note_time: source.last_seed_note_time,
            parent: Some(id),
            created: Local::now(),
        };
        Some(self.add(fork))
    }

    pub fn get(&self, id: HistoryId) -> Option<&History> {
        self.records.get(id.0)
    }

    pub fn get_mut(&mut self, id: HistoryId) -> Option<&mut History> {
        self.records.get_mut(id.0)
    }

    /// `id` followed by its ancestors, nearest first.
    pub fn lineage(&self, id: HistoryId) -> Vec<HistoryId> {
        let mut chain = Vec::new();
        let mut cursor = self.get(id).map(|_| id);
        while let Some(current) = cursor {
            chain.push(current);
            cursor = self.get(current).and_then(|h| h.parent);
        }
        chain
    }

    /// Drop every record. Ids handed out earlier become dangling.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
