//! Persistence of finished history branches.

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::HistoryError;
use crate::history::smf::write_midi_file;
use crate::history::History;

/// Identifies one session (from first key press to reset).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: String,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            id: Local::now().format("%Y%m%d-%H%M%S%.3f").to_string(),
        }
    }

    pub fn named(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receives each history record as it is superseded (rewind) or closed (reset).
pub trait Archive {
    fn add_to_history_list(&mut self, history: &History, session: &SessionHandle);
}

impl<A: Archive + ?Sized> Archive for Box<A> {
    fn add_to_history_list(&mut self, history: &History, session: &SessionHandle) {
        (**self).add_to_history_list(history, session)
    }
}

/// Keeps archived records in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryArchive {
    pub records: Vec<(SessionHandle, History)>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Archive for MemoryArchive {
    fn add_to_history_list(&mut self, history: &History, session: &SessionHandle) {
        self.records.push((session.clone(), history.clone()));
    }
}

/// Writes each record as `<session>-<n>.yaml` plus a `.mid` rendering.
#[derive(Debug)]
pub struct DirectoryArchive {
    dir: PathBuf,
    lowest_midi_note: u8,
    channel: u8,
    written: usize,
}

impl DirectoryArchive {
    pub fn new<P: AsRef<Path>>(dir: P, lowest_midi_note: u8, channel: u8) -> Result<Self, HistoryError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lowest_midi_note,
            channel,
            written: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, history: &History, stem: &str) -> Result<PathBuf, HistoryError> {
        let yaml = self.dir.join(format!("{}.yaml", stem));
        history.save(&yaml)?;
        write_midi_file(
            history,
            self.dir.join(format!("{}.mid", stem)),
            self.lowest_midi_note,
            self.channel,
        )?;
        Ok(yaml)
    }
}

impl Archive for DirectoryArchive {
    fn add_to_history_list(&mut self, history: &History, session: &SessionHandle) {
        self.written += 1;
        let stem = format!("{}-{:03}", session.id, self.written);
        match self.write(history, &stem) {
            Ok(path) => info!(path = %path.display(), notes = history.notes.len(), "archived history"),
            Err(e) => warn!(error = %e, "failed to archive history {}", stem),
        }
    }
}
