//! MIDI keyboard input and note output.
//!
//! Keys are addressed by index from `lowest_midi_note`; anything outside the
//! instrument's range is ignored on input.

use anyhow::{anyhow, Result};
use midir::{MidiIO, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use std::collections::BTreeSet;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::engine::InputEvent;
use crate::note::KeyId;
use crate::sink::{PlaybackSink, Signal, TriggerEvent};

/// Note Off status (channel in low nibble)
pub const NOTE_OFF: u8 = 0x80;

/// Note On status; velocity 0 means release
pub const NOTE_ON: u8 = 0x90;

/// Control Change status
pub const CONTROL_CHANGE: u8 = 0xB0;

/// CC 123 - All Notes Off
pub const ALL_NOTES_OFF: u8 = 123;

/// Decode a raw channel message into a key event.
///
/// Channel is ignored. Returns `None` for anything but note on/off in range.
pub fn parse_input(message: &[u8], lowest_midi_note: u8, num_keys: u8) -> Option<InputEvent> {
    if message.len() < 3 {
        return None;
    }
    let status = message[0] & 0xF0;
    let note = message[1];
    let velocity = message[2];

    let key = note.checked_sub(lowest_midi_note).filter(|k| *k < num_keys)?;
    match status {
        NOTE_ON if velocity > 0 => Some(InputEvent::KeyDown {
            key,
            velocity: velocity as f32 / 127.0,
        }),
        NOTE_ON | NOTE_OFF => Some(InputEvent::KeyUp { key }),
        _ => None,
    }
}

pub fn note_name(note: u8) -> String {
    let names = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i8 - 1;
    format!("{}{}", names[(note % 12) as usize], octave)
}

/// Pick a port: first name containing `wanted`, else an IAC Driver, else the first.
fn select_port<T: MidiIO>(io: &T, wanted: Option<&str>) -> Result<(T::Port, String)> {
    let ports = io.ports();
    if ports.is_empty() {
        return Err(anyhow!("no MIDI ports found"));
    }

    let name_of = |p: &T::Port| io.port_name(p).unwrap_or_else(|_| "Unknown".to_string());
    for port in &ports {
        debug!(port = %name_of(port), "available MIDI port");
    }

    let find = |needle: &str| ports.iter().position(|p| name_of(p).contains(needle));
    let idx = match wanted {
        Some(wanted) => find(wanted).ok_or_else(|| anyhow!("no MIDI port matching {:?}", wanted))?,
        None => find("IAC").unwrap_or(0),
    };

    let port = ports[idx].clone();
    let name = name_of(&port);
    Ok((port, name))
}

/// Connect to a keyboard and forward key events to `events`.
pub fn connect_input(
    device: Option<&str>,
    lowest_midi_note: u8,
    num_keys: u8,
    events: UnboundedSender<InputEvent>,
) -> Result<(MidiInputConnection<()>, String)> {
    let midi_in = MidiInput::new("duet-in").map_err(|e| anyhow!("failed to create MIDI input: {}", e))?;
    let (port, port_name) = select_port(&midi_in, device)?;

    let connection = midi_in
        .connect(
            &port,
            "duet-keys",
            move |_timestamp, message, _| {
                if let Some(event) = parse_input(message, lowest_midi_note, num_keys) {
                    // Receiver gone means the session is shutting down.
                    let _ = events.send(event);
                }
            },
            (),
        )
        .map_err(|e| anyhow!("failed to connect MIDI input: {}", e))?;

    info!(port = %port_name, "MIDI input connected");
    Ok((connection, port_name))
}

/// Wrapper for MIDI output connection.
pub struct MidiOut {
    connection: MidiOutputConnection,
    pub port_name: String,
}

impl MidiOut {
    pub fn new(device: Option<&str>) -> Result<Self> {
        let midi_out = MidiOutput::new("duet-out").map_err(|e| anyhow!("failed to create MIDI output: {}", e))?;
        let (port, port_name) = select_port(&midi_out, device)?;

        let connection = midi_out
            .connect(&port, "duet-out")
            .map_err(|e| anyhow!("failed to connect MIDI output: {}", e))?;

        info!(port = %port_name, "MIDI output connected");
        Ok(Self {
            connection,
            port_name,
        })
    }

    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        self.connection
            .send(message)
            .map_err(|e| anyhow!("failed to send MIDI: {}", e))
    }
}

/// Plays engine output on a MIDI port.
pub struct MidiSink {
    out: MidiOut,
    lowest_midi_note: u8,
    /// 0-15
    channel: u8,
    sounding: BTreeSet<u8>,
}

impl MidiSink {
    pub fn new(out: MidiOut, lowest_midi_note: u8, channel: u8) -> Self {
        Self {
            out,
            lowest_midi_note,
            channel: channel & 0x0F,
            sounding: BTreeSet::new(),
        }
    }

    fn midi_note(&self, key: KeyId) -> u8 {
        (self.lowest_midi_note as u16 + key as u16).min(127) as u8
    }

    fn send(&mut self, message: &[u8]) {
        if let Err(e) = self.out.send(message) {
            warn!(error = %e, "MIDI output");
        }
    }

    fn note_off(&mut self, key: KeyId) {
        let note = self.midi_note(key);
        if self.sounding.remove(&note) {
            self.send(&[NOTE_OFF | self.channel, note, 0]);
        }
    }
}

impl PlaybackSink for MidiSink {
    fn trigger(&mut self, event: &TriggerEvent) {
        let note = self.midi_note(event.key);
        if self.sounding.contains(&note) {
            self.note_off(event.key);
        }
        let velocity = ((event.velocity * 127.0).round() as u8).clamp(1, 127);
        debug!(note = %note_name(note), velocity, actor = ?event.actor, "note on");
        self.send(&[NOTE_ON | self.channel, note, velocity]);
        self.sounding.insert(note);
    }

    fn release(&mut self, key: KeyId, _final_duration: f64) {
        self.note_off(key);
    }

    fn stop_sound(&mut self, key: KeyId) {
        self.note_off(key);
    }

    fn stop_all(&mut self) {
        let notes: Vec<u8> = self.sounding.iter().copied().collect();
        for note in notes {
            self.send(&[NOTE_OFF | self.channel, note, 0]);
        }
        self.sounding.clear();
        self.send(&[CONTROL_CHANGE | self.channel, ALL_NOTES_OFF, 0]);
    }

    fn signal(&mut self, signal: Signal) {
        match signal {
            Signal::SeedProgress(_) => {}
            other => info!(signal = ?other, "status"),
        }
    }
}
