//! Sound and display collaborators.
//!
//! The engine reports every trigger, release and status change through a
//! [`PlaybackSink`]. Audio output (see [`crate::midi::MidiSink`]), logging and
//! test recorders all implement the same trait.

use chrono::{DateTime, Local};
use tracing::{debug, info};

use crate::note::{Actor, KeyId};

/// A note starting to sound.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub key: KeyId,
    pub velocity: f32,
    /// Wall-clock time the note logically starts
    pub wall_start: DateTime<Local>,
    /// Sounding length including the release tail; `None` while held
    pub duration: Option<f64>,
    /// Current tempo in BPM
    pub tempo: f64,
    pub actor: Actor,
    pub is_replay: bool,
}

/// Status changes for display collaborators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    /// Model output is now playing
    GlowStart,
    GlowStop,
    /// Session ended for inactivity
    IdleStart,
    IdleStop,
    /// Seeding progress 0-1
    SeedProgress(f64),
}

pub trait PlaybackSink {
    fn trigger(&mut self, event: &TriggerEvent);

    /// A note finished after `final_duration` seconds.
    fn release(&mut self, key: KeyId, final_duration: f64);

    /// Cut the sound of `key` short.
    fn stop_sound(&mut self, key: KeyId);

    fn stop_all(&mut self);

    fn signal(&mut self, _signal: Signal) {}
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn trigger(&mut self, event: &TriggerEvent) {
        (**self).trigger(event)
    }

    fn release(&mut self, key: KeyId, final_duration: f64) {
        (**self).release(key, final_duration)
    }

    fn stop_sound(&mut self, key: KeyId) {
        (**self).stop_sound(key)
    }

    fn stop_all(&mut self) {
        (**self).stop_all()
    }

    fn signal(&mut self, signal: Signal) {
        (**self).signal(signal)
    }
}

/// Logs everything; used when no MIDI output is available.
#[derive(Debug, Default)]
pub struct TraceSink;

impl PlaybackSink for TraceSink {
    fn trigger(&mut self, event: &TriggerEvent) {
        info!(
            key = event.key,
            velocity = event.velocity,
            actor = ?event.actor,
            replay = event.is_replay,
            at = %event.wall_start.format("%H:%M:%S%.3f"),
            "note on"
        );
    }

    fn release(&mut self, key: KeyId, final_duration: f64) {
        debug!(key, final_duration, "note off");
    }

    fn stop_sound(&mut self, key: KeyId) {
        debug!(key, "stop sound");
    }

    fn stop_all(&mut self) {
        info!("all sound stopped");
    }

    fn signal(&mut self, signal: Signal) {
        match signal {
            Signal::SeedProgress(p) => debug!(progress = p, "seeding"),
            other => info!(signal = ?other, "status"),
        }
    }
}

/// Everything a [`RecordingSink`] saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Trigger(TriggerEvent),
    Release { key: KeyId, duration: f64 },
    Stop(KeyId),
    StopAll,
    Signal(Signal),
}

/// Keeps every call for later inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn triggers(&self) -> impl Iterator<Item = &TriggerEvent> {
        self.events.iter().filter_map(|e| match e {
            SinkEvent::Trigger(t) => Some(t),
            _ => None,
        })
    }

    pub fn stops(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, SinkEvent::Stop(_)))
            .count()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Signal(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl PlaybackSink for RecordingSink {
    fn trigger(&mut self, event: &TriggerEvent) {
        self.events.push(SinkEvent::Trigger(event.clone()));
    }

    fn release(&mut self, key: KeyId, final_duration: f64) {
        self.events.push(SinkEvent::Release {
            key,
            duration: final_duration,
        });
    }

    fn stop_sound(&mut self, key: KeyId) {
        self.events.push(SinkEvent::Stop(key));
    }

    fn stop_all(&mut self) {
        self.events.push(SinkEvent::StopAll);
    }

    fn signal(&mut self, signal: Signal) {
        self.events.push(SinkEvent::Signal(signal));
    }
}
