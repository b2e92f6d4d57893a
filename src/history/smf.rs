//! Standard MIDI File import/export for history records.
//!
//! Exported files are single-track, constant-tempo, and use the history's
//! tempo for tick conversion. Imported files must be metrical; only the first
//! tempo meta event is honoured.

use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use super::History;
use crate::error::HistoryError;
use crate::note::{Actor, Note, NoteLength};

/// Ticks per quarter note in exported files.
pub const EXPORT_PPQ: u16 = 480;

const DEFAULT_US_PER_BEAT: u32 = 500_000;
const MAX_DELTA: u32 = 0x0FFF_FFFF;

fn seconds_to_ticks(seconds: f64, bpm: f64) -> u32 {
    let ticks = seconds.max(0.0) * bpm / 60.0 * EXPORT_PPQ as f64;
    ticks.round().min(u32::MAX as f64) as u32
}

/// Write `history` as a Standard MIDI File.
///
/// Key indices are offset by `lowest_midi_note`; `channel` is 0-15. Notes that
/// were never released have no length and are skipped.
pub fn write_midi_file<P: AsRef<Path>>(
    history: &History,
    path: P,
    lowest_midi_note: u8,
    channel: u8,
) -> Result<(), HistoryError> {
    // (tick, is_on, midi note, velocity); offs sort before ons at the same tick
    let mut events: Vec<(u32, bool, u8, u8)> = Vec::with_capacity(history.notes.len() * 2);
    for note in &history.notes {
        let Some(length) = note.length.seconds() else {
            debug!(key = note.key, time = note.time, "skipping unreleased note in export");
            continue;
        };
        let midi_note = (lowest_midi_note as u16 + note.key as u16).min(127) as u8;
        let vel = ((note.velocity * 127.0).round() as u8).clamp(1, 127);
        let start = seconds_to_ticks(note.time, history.tempo);
        let end = seconds_to_ticks(note.time + length, history.tempo).max(start + 1);
        events.push((start, true, midi_note, vel));
        events.push((end, false, midi_note, 0));
    }
    events.sort_by_key(|&(tick, is_on, _, _)| (tick, is_on));

    let channel = u4::new(channel & 0x0F);
    let us_per_beat = (60_000_000.0 / history.tempo).round() as u32;

    let mut track = Vec::with_capacity(events.len() + 3);
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::TrackName(history.title.as_bytes())),
    });
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(us_per_beat.min(0xFF_FFFF)))),
    });

    let mut last_tick = 0u32;
    for (tick, is_on, midi_note, vel) in events {
        let delta = (tick - last_tick).min(MAX_DELTA);
        last_tick = tick;
        let key = u7::new(midi_note & 0x7F);
        let message = if is_on {
            MidiMessage::NoteOn {
                key,
                vel: u7::new(vel),
            }
        } else {
            MidiMessage::NoteOff {
                key,
                vel: u7::new(0),
            }
        };
        track.push(TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi { channel, message },
        });
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(EXPORT_PPQ)),
    ));
    smf.tracks.push(track);
    smf.save(path)?;
    Ok(())
}

/// Load a MIDI file as a history record.
///
/// Notes outside `lowest_midi_note .. lowest_midi_note + num_keys` are dropped.
/// Imported notes are tagged [`Actor::Bot`] since their origin is unknown.
pub fn read_midi_file<P: AsRef<Path>>(
    path: P,
    lowest_midi_note: u8,
    num_keys: u8,
) -> Result<History, HistoryError> {
    let path = path.as_ref();
    let title = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();

    let data = fs::read(path)?;
    let smf = Smf::parse(&data).map_err(|e| HistoryError::Midi(e.to_string()))?;

    let ppq = match smf.header.timing {
        Timing::Metrical(ppq) if ppq.as_int() > 0 => ppq.as_int() as f64,
        Timing::Metrical(_) => {
            return Err(HistoryError::Unsupported(
                "MIDI file declares zero ticks per beat".to_string(),
            ))
        }
        Timing::Timecode(_, _) => {
            return Err(HistoryError::Unsupported(
                "timecode-based MIDI files not supported".to_string(),
            ))
        }
    };

    let us_per_beat = smf
        .tracks
        .iter()
        .flat_map(|track| track.iter())
        .find_map(|event| match event.kind {
            TrackEventKind::Meta(MetaMessage::Tempo(t)) => Some(t.as_int()),
            _ => None,
        })
        .unwrap_or(DEFAULT_US_PER_BEAT);
    let seconds_per_tick = us_per_beat as f64 / 1_000_000.0 / ppq;

    let mut history = History::new(title, 60_000_000.0 / us_per_beat as f64);

    for track in &smf.tracks {
        let mut tick: u64 = 0;
        // midi note -> (start seconds, velocity)
        let mut open: HashMap<u8, (f64, f32)> = HashMap::new();

        for event in track.iter() {
            tick += event.delta.as_int() as u64;
            let TrackEventKind::Midi { message, .. } = event.kind else {
                continue;
            };
            let now = tick as f64 * seconds_per_tick;
            let (midi_note, on_vel) = match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    (key.as_int(), Some(vel.as_int() as f32 / 127.0))
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    (key.as_int(), None)
                }
                _ => continue,
            };

            // A new note-on also closes a still-open note on the same key.
            if let Some((start, velocity)) = open.remove(&midi_note) {
                push_imported(&mut history, midi_note, start, now, velocity, lowest_midi_note, num_keys);
            }
            if let Some(velocity) = on_vel {
                open.insert(midi_note, (now, velocity));
            }
        }
    }

    history.sort_notes();
    Ok(history)
}

fn push_imported(
    history: &mut History,
    midi_note: u8,
    start: f64,
    end: f64,
    velocity: f32,
    lowest_midi_note: u8,
    num_keys: u8,
) {
    let Some(key) = midi_note.checked_sub(lowest_midi_note) else {
        return;
    };
    if key >= num_keys {
        return;
    }
    history.push(Note::new(
        key,
        velocity,
        NoteLength::Seconds(end - start),
        start,
        Actor::Bot,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("duet-{}-{}.mid", name, std::process::id()))
    }

    #[test]
    fn test_export_then_import_preserves_timing() {
        let mut history = History::new("phrase", 120.0);
        history.push(Note::new(39, 0.8, NoteLength::Seconds(0.5), 0.0, Actor::Player));
        history.push(Note::new(43, 0.6, NoteLength::Seconds(0.25), 0.5, Actor::Model));
        history.push(Note::new(46, 0.6, NoteLength::Held, 1.0, Actor::Player));

        let path = temp_path("roundtrip");
        write_midi_file(&history, &path, 21, 0).expect("write");
        let loaded = read_midi_file(&path, 21, 88).expect("read");
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.title, format!("duet-roundtrip-{}", std::process::id()));
        assert!((loaded.tempo - 120.0).abs() < 1e-6);
        assert_eq!(loaded.notes.len(), 2);
        assert_eq!(loaded.notes[0].key, 39);
        assert!((loaded.notes[0].time - 0.0).abs() < 1e-3);
        assert_eq!(loaded.notes[0].length.seconds().map(|d| (d * 1000.0).round()), Some(500.0));
        assert_eq!(loaded.notes[1].key, 43);
        assert!((loaded.notes[1].time - 0.5).abs() < 1e-3);
        assert!(loaded.notes.iter().all(|n| n.actor == Actor::Bot));
    }

    #[test]
    fn test_import_rejects_zero_ticks_per_beat() {
        let mut bytes = b"MThd\x00\x00\x00\x06\x00\x00\x00\x01\x00\x00".to_vec();
        let track = [
            0x00, 0x90, 0x27, 0x40, 0x60, 0x80, 0x27, 0x00, 0x00, 0xFF, 0x2F, 0x00,
        ];
        bytes.extend_from_slice(b"MTrk");
        bytes.extend_from_slice(&(track.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&track);

        let path = temp_path("zero-ppq");
        fs::write(&path, &bytes).expect("write");
        let loaded = read_midi_file(&path, 21, 88);
        let _ = fs::remove_file(&path);
        assert!(loaded.is_err());
    }

    #[test]
    fn test_import_drops_out_of_range_keys() {
        let mut history = History::new("wide", 100.0);
        history.push(Note::new(0, 0.5, NoteLength::Seconds(0.3), 0.0, Actor::Player));
        history.push(Note::new(30, 0.5, NoteLength::Seconds(0.3), 0.6, Actor::Player));

        let path = temp_path("range");
        write_midi_file(&history, &path, 48, 0).expect("write");
        // Instrument starting at C4 with 12 keys only sees the first note.
        let loaded = read_midi_file(&path, 48, 12).expect("read");
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.notes.len(), 1);
        assert_eq!(loaded.notes[0].key, 0);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = read_midi_file("/nonexistent/duet.mid", 21, 88).unwrap_err();
        assert!(matches!(err, HistoryError::Io(_)));
    }
}
