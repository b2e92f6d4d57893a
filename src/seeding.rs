//! Input-seeding state machine and tempo inference.
//!
//! The engine listens to the player until they pause, sends the captured
//! phrase to the model in buffered mode (priming), and only commits the
//! generated continuation once the pause has lasted long enough. Any new input
//! while priming throws the buffered result away.
//!
//! ```text
//! Idle --key--> Listening --silence >= wait--> Priming --silence >= k*wait--> Committed
//!                   ^                             |
//!                   +-----------key (interrupt)---+
//! ```

use crate::config::SeedingConfig;
use crate::scheduler::ScheduleHandle;

/// Onsets closer than this are treated as one chord, not a beat.
const MIN_INTER_ONSET_SECS: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPhase {
    /// No history, waiting for the first key press
    Idle,
    /// Recording the player's phrase
    Listening,
    /// Phrase sent to the model; results held in the note buffer
    Priming,
    /// Steady state: generated notes play on the transport
    Committed,
}

/// What the periodic seeding check decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeedStep {
    /// Keep waiting; `progress` is 0-1 towards commit
    Wait { progress: f64 },
    /// Silence long enough to prime the model
    Prime,
    /// Silence long enough to commit buffered notes
    Commit,
    /// Check no longer applies to the current phase
    Stop,
}

#[derive(Debug, Clone)]
pub struct Seeding {
    phase: SeedPhase,
    /// Elapsed time of the last key event
    last_input: f64,
    progress: f64,
    /// Transport time at which buffered generation begins
    boundary: f64,
    /// Periodic check task while listening or priming
    pub check_task: Option<ScheduleHandle>,
}

impl Seeding {
    pub fn new() -> Self {
        Self {
            phase: SeedPhase::Idle,
            last_input: 0.0,
            progress: 0.0,
            boundary: 0.0,
            check_task: None,
        }
    }

    pub fn phase(&self) -> SeedPhase {
        self.phase
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn boundary(&self) -> f64 {
        self.boundary
    }

    /// The check task runs while the engine is still deciding.
    pub fn is_listening(&self) -> bool {
        matches!(self.phase, SeedPhase::Listening | SeedPhase::Priming)
    }

    /// Record a key event. Returns `true` if it interrupted priming.
    pub fn on_input(&mut self, elapsed: f64) -> bool {
        self.last_input = elapsed;
        match self.phase {
            SeedPhase::Idle => {
                self.phase = SeedPhase::Listening;
                self.progress = 0.0;
                false
            }
            SeedPhase::Priming => {
                self.phase = SeedPhase::Listening;
                self.progress = 0.0;
                true
            }
            SeedPhase::Listening | SeedPhase::Committed => false,
        }
    }

    /// Decide the next step given the current elapsed time.
    pub fn check(&mut self, elapsed: f64, notes_sounding: bool, config: &SeedingConfig) -> SeedStep {
        let silence = (elapsed - self.last_input).max(0.0);
        let commit_after = config.wait_secs * config.commit_multiple;
        match self.phase {
            SeedPhase::Listening if notes_sounding => SeedStep::Wait {
                progress: self.progress,
            },
            SeedPhase::Listening if silence >= config.wait_secs => SeedStep::Prime,
            SeedPhase::Priming if silence >= commit_after => SeedStep::Commit,
            SeedPhase::Listening | SeedPhase::Priming => {
                self.progress = self.progress.max((silence / commit_after).min(1.0));
                SeedStep::Wait {
                    progress: self.progress,
                }
            }
            SeedPhase::Idle | SeedPhase::Committed => SeedStep::Stop,
        }
    }

    pub fn begin_priming(&mut self, boundary: f64) {
        self.phase = SeedPhase::Priming;
        self.boundary = boundary;
    }

    pub fn commit(&mut self) {
        self.phase = SeedPhase::Committed;
        self.progress = 1.0;
    }

    /// Skip seeding entirely (used when replaying a shared session).
    pub fn force_committed(&mut self, boundary: f64) {
        self.phase = SeedPhase::Committed;
        self.boundary = boundary;
        self.progress = 1.0;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Seeding {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimate a tempo from note onsets.
///
/// Uses the median inter-onset interval as one beat, then folds the result by
/// octaves into `[min_bpm, max_bpm]`. Falls back to `default_bpm` (also
/// folded) when there are fewer than two distinct onsets.
pub fn infer_bpm(onsets: &[f64], default_bpm: f64, min_bpm: f64, max_bpm: f64) -> f64 {
    let mut sorted: Vec<f64> = onsets.iter().copied().filter(|t| t.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut intervals: Vec<f64> = sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|ioi| *ioi >= MIN_INTER_ONSET_SECS)
        .collect();

    let raw = if intervals.is_empty() {
        default_bpm
    } else {
        intervals.sort_by(|a, b| a.total_cmp(b));
        let mid = intervals.len() / 2;
        let median = if intervals.len() % 2 == 0 {
            (intervals[mid - 1] + intervals[mid]) / 2.0
        } else {
            intervals[mid]
        };
        60.0 / median
    };

    fold_bpm(raw, min_bpm, max_bpm)
}

fn fold_bpm(bpm: f64, min_bpm: f64, max_bpm: f64) -> f64 {
    if !bpm.is_finite() || bpm <= 0.0 {
        return min_bpm;
    }
    let mut bpm = bpm;
    while bpm < min_bpm {
        bpm *= 2.0;
    }
    while bpm > max_bpm {
        bpm /= 2.0;
    }
    bpm.clamp(min_bpm, max_bpm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SeedingConfig {
        SeedingConfig {
            wait_secs: 1.0,
            commit_multiple: 2.0,
            check_secs: 0.05,
        }
    }

    #[test]
    fn test_first_input_starts_listening() {
        let mut seeding = Seeding::new();
        assert_eq!(seeding.phase(), SeedPhase::Idle);
        assert!(!seeding.on_input(0.0));
        assert_eq!(seeding.phase(), SeedPhase::Listening);
        assert!(seeding.is_listening());
    }

    #[test]
    fn test_prime_then_commit() {
        let cfg = config();
        let mut seeding = Seeding::new();
        seeding.on_input(0.0);

        assert!(matches!(seeding.check(0.5, false, &cfg), SeedStep::Wait { .. }));
        assert_eq!(seeding.check(1.0, false, &cfg), SeedStep::Prime);
        seeding.begin_priming(3.25);
        assert_eq!(seeding.boundary(), 3.25);

        assert!(matches!(seeding.check(1.5, false, &cfg), SeedStep::Wait { .. }));
        assert_eq!(seeding.check(2.0, false, &cfg), SeedStep::Commit);
        seeding.commit();
        assert_eq!(seeding.phase(), SeedPhase::Committed);
        assert_eq!(seeding.check(3.0, false, &cfg), SeedStep::Stop);
    }

    #[test]
    fn test_sounding_notes_block_priming() {
        let cfg = config();
        let mut seeding = Seeding::new();
        seeding.on_input(0.0);
        assert!(matches!(seeding.check(5.0, true, &cfg), SeedStep::Wait { .. }));
        assert_eq!(seeding.phase(), SeedPhase::Listening);
    }

    #[test]
    fn test_input_while_priming_interrupts() {
        let cfg = config();
        let mut seeding = Seeding::new();
        seeding.on_input(0.0);
        assert_eq!(seeding.check(1.2, false, &cfg), SeedStep::Prime);
        seeding.begin_priming(1.0);
        assert!(seeding.check(1.5, false, &cfg) != SeedStep::Commit);
        assert!(seeding.progress() > 0.0);

        assert!(seeding.on_input(1.6));
        assert_eq!(seeding.phase(), SeedPhase::Listening);
        assert_eq!(seeding.progress(), 0.0);
    }

    #[test]
    fn test_progress_is_monotonic_while_waiting() {
        let cfg = config();
        let mut seeding = Seeding::new();
        seeding.on_input(0.0);
        let mut last = 0.0;
        for step in 1..10 {
            if let SeedStep::Wait { progress } = seeding.check(step as f64 * 0.1, false, &cfg) {
                assert!(progress >= last);
                last = progress;
            }
        }
        assert!(last > 0.0);
    }

    #[test]
    fn test_infer_bpm_from_steady_pulse() {
        let onsets: Vec<f64> = (0..8).map(|i| i as f64 * 0.5).collect();
        assert!((infer_bpm(&onsets, 100.0, 60.0, 180.0) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_infer_bpm_folds_into_range() {
        // Eighth notes at 100 BPM look like 200 BPM.
        let onsets: Vec<f64> = (0..8).map(|i| i as f64 * 0.3).collect();
        assert!((infer_bpm(&onsets, 120.0, 60.0, 180.0) - 100.0).abs() < 1e-6);

        // A 2 s pulse (30 BPM) doubles up to the bottom of the range.
        let onsets = [0.0, 2.0, 4.0, 6.0];
        assert!((infer_bpm(&onsets, 120.0, 60.0, 180.0) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_infer_bpm_ignores_chords_and_falls_back() {
        let chord = [1.0, 1.01, 1.02];
        assert_eq!(infer_bpm(&chord, 96.0, 60.0, 180.0), 96.0);
        assert_eq!(infer_bpm(&[], 96.0, 60.0, 180.0), 96.0);
        assert_eq!(infer_bpm(&[0.5], 400.0, 60.0, 180.0), 100.0);
    }
}
