//! Note events shared by the scheduler, history and collaborators.

use serde::{Deserialize, Serialize};

use crate::scheduler::ScheduleHandle;

/// Logical key index on the instrument (0 = lowest key).
pub type KeyId = u8;

/// Who produced a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Player,
    Model,
    Bot,
}

/// Requested sounding length of a note.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteLength {
    /// Sounds until explicitly released.
    Held,
    Seconds(f64),
}

impl NoteLength {
    pub fn seconds(&self) -> Option<f64> {
        match self {
            NoteLength::Held => None,
            NoteLength::Seconds(s) => Some(*s),
        }
    }
}

/// A single note event on the transport timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub key: KeyId,
    /// 0.0 - 1.0
    pub velocity: f32,
    pub length: NoteLength,
    /// Trigger time in transport seconds
    pub time: f64,
    pub actor: Actor,
    /// Cancellation handle while the note sits in the queue
    #[serde(skip)]
    pub handle: Option<ScheduleHandle>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_replay: bool,
}

impl Note {
    pub fn new(key: KeyId, velocity: f32, length: NoteLength, time: f64, actor: Actor) -> Self {
        Self {
            key,
            velocity: velocity.clamp(0.0, 1.0),
            length,
            time,
            actor,
            handle: None,
            is_replay: false,
        }
    }

    /// A fresh, unscheduled copy of this note tagged as a replay.
    pub fn as_replay(&self) -> Self {
        Self {
            handle: None,
            is_replay: true,
            ..self.clone()
        }
    }

    /// Transport time at which the note ends, if bounded.
    pub fn end_time(&self) -> Option<f64> {
        self.length.seconds().map(|d| self.time + d)
    }
}
