//! Configuration persistence for the duet engine.
//!
//! Saves and loads engine configuration to/from YAML files. Every field has a
//! default, so a partial file (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::clock::Tempo;
use crate::error::ConfigError;

/// Largest supported instrument (a full piano).
pub const MAX_KEYS: u8 = 88;

/// Instrument size and MIDI port preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Number of playable keys (1-88)
    #[serde(default = "InstrumentConfig::default_num_keys")]
    pub num_keys: u8,
    /// MIDI note number of key 0
    #[serde(default = "InstrumentConfig::default_lowest_midi_note")]
    pub lowest_midi_note: u8,
    /// MIDI input device name (substring match)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
    /// MIDI output device name (substring match)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
    /// MIDI output channel (1-16, stored as 1-indexed for human readability)
    #[serde(default = "InstrumentConfig::default_channel")]
    pub output_channel: u8,
}

impl InstrumentConfig {
    fn default_num_keys() -> u8 {
        MAX_KEYS
    }
    fn default_lowest_midi_note() -> u8 {
        21 // A0
    }
    fn default_channel() -> u8 {
        1
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            num_keys: Self::default_num_keys(),
            lowest_midi_note: Self::default_lowest_midi_note(),
            input_device: None,
            output_device: None,
            output_channel: Self::default_channel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Tempo used before one has been inferred
    #[serde(default = "TimingConfig::default_bpm")]
    pub default_bpm: f64,
    #[serde(default = "TimingConfig::default_ticks_per_beat")]
    pub ticks_per_beat: u32,
    /// Inferred tempi are folded into this range
    #[serde(default = "TimingConfig::default_min_bpm")]
    pub min_bpm: f64,
    #[serde(default = "TimingConfig::default_max_bpm")]
    pub max_bpm: f64,
}

impl TimingConfig {
    fn default_bpm() -> f64 {
        120.0
    }
    fn default_ticks_per_beat() -> u32 {
        4
    }
    fn default_min_bpm() -> f64 {
        60.0
    }
    fn default_max_bpm() -> f64 {
        180.0
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            default_bpm: Self::default_bpm(),
            ticks_per_beat: Self::default_ticks_per_beat(),
            min_bpm: Self::default_min_bpm(),
            max_bpm: Self::default_max_bpm(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Beats requested from the model per invocation
    #[serde(default = "GenerationConfig::default_buffer_beats")]
    pub buffer_beats: f64,
    /// Beats of context sent before the window end
    #[serde(default = "GenerationConfig::default_history_window_beats")]
    pub history_window_beats: f64,
    #[serde(default = "GenerationConfig::default_num_repeats")]
    pub num_repeats: u32,
    #[serde(default)]
    pub selection_idx: u32,
    /// Model calls slower than this count as failed
    #[serde(default = "GenerationConfig::default_model_timeout_ms")]
    pub model_timeout_ms: u64,
}

impl GenerationConfig {
    fn default_buffer_beats() -> f64 {
        4.0
    }
    fn default_history_window_beats() -> f64 {
        16.0
    }
    fn default_num_repeats() -> u32 {
        4
    }
    fn default_model_timeout_ms() -> u64 {
        10_000
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            buffer_beats: Self::default_buffer_beats(),
            history_window_beats: Self::default_history_window_beats(),
            num_repeats: Self::default_num_repeats(),
            selection_idx: 0,
            model_timeout_ms: Self::default_model_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedingConfig {
    /// Silence before the seed phrase is sent to the model
    #[serde(default = "SeedingConfig::default_wait_secs")]
    pub wait_secs: f64,
    /// Silence (as a multiple of `wait_secs`) before generated notes commit
    #[serde(default = "SeedingConfig::default_commit_multiple")]
    pub commit_multiple: f64,
    /// Period of the "still waiting" check
    #[serde(default = "SeedingConfig::default_check_secs")]
    pub check_secs: f64,
}

impl SeedingConfig {
    fn default_wait_secs() -> f64 {
        1.0
    }
    fn default_commit_multiple() -> f64 {
        2.0
    }
    fn default_check_secs() -> f64 {
        0.05
    }
}

impl Default for SeedingConfig {
    fn default() -> Self {
        Self {
            wait_secs: Self::default_wait_secs(),
            commit_multiple: Self::default_commit_multiple(),
            check_secs: Self::default_check_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Extra sounding time given to bounded notes; never recorded
    #[serde(default = "PlaybackConfig::default_release_tail_secs")]
    pub release_tail_secs: f64,
    /// Releases closer than this to the natural end skip the explicit stop
    #[serde(default = "PlaybackConfig::default_release_epsilon_secs")]
    pub release_epsilon_secs: f64,
}

impl PlaybackConfig {
    fn default_release_tail_secs() -> f64 {
        0.3
    }
    fn default_release_epsilon_secs() -> f64 {
        0.01
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            release_tail_secs: Self::default_release_tail_secs(),
            release_epsilon_secs: Self::default_release_epsilon_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewindConfig {
    #[serde(default = "RewindConfig::default_back_secs")]
    pub back_secs: f64,
    /// Seconds of history re-emitted after the rewind point
    #[serde(default = "RewindConfig::default_replay_forward_secs")]
    pub replay_forward_secs: f64,
    /// Rewinds closer together than this share one generation restart
    #[serde(default = "RewindConfig::default_restart_debounce_secs")]
    pub restart_debounce_secs: f64,
}

impl RewindConfig {
    fn default_back_secs() -> f64 {
        5.0
    }
    fn default_replay_forward_secs() -> f64 {
        2.0
    }
    fn default_restart_debounce_secs() -> f64 {
        0.5
    }
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            back_secs: Self::default_back_secs(),
            replay_forward_secs: Self::default_replay_forward_secs(),
            restart_debounce_secs: Self::default_restart_debounce_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "WatchdogConfig::default_idle_timeout_secs")]
    pub idle_timeout_secs: f64,
    #[serde(default = "WatchdogConfig::default_check_secs")]
    pub check_secs: f64,
}

impl WatchdogConfig {
    fn default_idle_timeout_secs() -> f64 {
        120.0
    }
    fn default_check_secs() -> f64 {
        5.0
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: Self::default_idle_timeout_secs(),
            check_secs: Self::default_check_secs(),
        }
    }
}

/// Complete duet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DuetConfig {
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub seeding: SeedingConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub rewind: RewindConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    /// Directory for archived histories (in-memory archive when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

fn require_positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("must be a positive number, got {}", value)))
    }
}

impl DuetConfig {
    /// Get the default config file path.
    pub fn default_path() -> PathBuf {
        let project_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        project_dir.join("duet_config.yaml")
    }

    /// Load configuration from a YAML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(ConfigError::Read)?;
        let config: Self = serde_yaml::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self).map_err(ConfigError::Parse)?;
        fs::write(path, content).map_err(ConfigError::Write)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let instrument = &self.instrument;
        if instrument.num_keys == 0 || instrument.num_keys > MAX_KEYS {
            return Err(invalid(
                "instrument.num_keys",
                format!("must be between 1 and {}, got {}", MAX_KEYS, instrument.num_keys),
            ));
        }
        if instrument.lowest_midi_note as u16 + instrument.num_keys as u16 > 128 {
            return Err(invalid(
                "instrument.lowest_midi_note",
                format!(
                    "{} keys starting at note {} exceed the MIDI range",
                    instrument.num_keys, instrument.lowest_midi_note
                ),
            ));
        }
        if !(1..=16).contains(&instrument.output_channel) {
            return Err(invalid(
                "instrument.output_channel",
                format!("must be between 1 and 16, got {}", instrument.output_channel),
            ));
        }

        let timing = &self.timing;
        require_positive("timing.default_bpm", timing.default_bpm)?;
        require_positive("timing.min_bpm", timing.min_bpm)?;
        require_positive("timing.max_bpm", timing.max_bpm)?;
        if timing.ticks_per_beat == 0 {
            return Err(invalid("timing.ticks_per_beat", "must be at least 1"));
        }
        // Folding by octaves needs max >= 2 * min to always find a tempo.
        if timing.max_bpm < timing.min_bpm * 2.0 {
            return Err(invalid(
                "timing.max_bpm",
                format!("must be at least twice min_bpm ({})", timing.min_bpm),
            ));
        }

        require_positive("generation.buffer_beats", self.generation.buffer_beats)?;
        require_positive(
            "generation.history_window_beats",
            self.generation.history_window_beats,
        )?;
        require_positive("seeding.wait_secs", self.seeding.wait_secs)?;
        require_positive("seeding.check_secs", self.seeding.check_secs)?;
        if self.seeding.commit_multiple < 1.0 {
            return Err(invalid("seeding.commit_multiple", "must be at least 1"));
        }
        if self.playback.release_tail_secs < 0.0 || self.playback.release_epsilon_secs < 0.0 {
            return Err(invalid("playback", "tail and epsilon must not be negative"));
        }
        require_positive("rewind.back_secs", self.rewind.back_secs)?;
        if self.rewind.replay_forward_secs < 0.0 || self.rewind.restart_debounce_secs < 0.0 {
            return Err(invalid("rewind", "replay and debounce must not be negative"));
        }
        require_positive("watchdog.idle_timeout_secs", self.watchdog.idle_timeout_secs)?;
        require_positive("watchdog.check_secs", self.watchdog.check_secs)?;
        Ok(())
    }

    /// Tempo before anything has been inferred.
    pub fn initial_tempo(&self) -> Tempo {
        Tempo::new(self.timing.default_bpm, self.timing.ticks_per_beat)
    }

    /// 0-indexed MIDI channel for output.
    pub fn output_channel_index(&self) -> u8 {
        self.instrument.output_channel.saturating_sub(1).min(15)
    }
}
