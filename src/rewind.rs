//! Rewind target computation.
//!
//! The engine applies the plan (archive, fork, split, reschedule); this module
//! only decides where the transport lands and how much history is replayed.

use crate::clock::Tempo;
use crate::config::RewindConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewindPlan {
    /// New transport position (on the half-tick offset grid)
    pub position: f64,
    /// Tick-quantized length of history replayed after `position`
    pub replay_seconds: f64,
    /// Where generation resumes: `position + replay_seconds`
    pub call_model_end: f64,
}

/// Compute the rewind target for a transport currently at `now`.
///
/// The transport never lands earlier than `last_seed_note_time -
/// replay_seconds`, so the player's seed phrase is never rewound past.
pub fn plan_rewind(now: f64, last_seed_note_time: f64, tempo: &Tempo, config: &RewindConfig) -> RewindPlan {
    let replay_ticks = tempo.seconds_to_ticks(config.replay_forward_secs);
    let replay_seconds = tempo.ticks_to_seconds(replay_ticks);

    let target = (now - config.back_secs).max(last_seed_note_time - replay_seconds);
    let position = tempo.round_to_offset(target);

    RewindPlan {
        position,
        replay_seconds,
        call_model_end: position + replay_seconds,
    }
}
