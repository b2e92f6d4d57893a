//! Transport clock and tick quantization.
//!
//! This module handles:
//! - Tracking the transport position in seconds (seekable, can be rewound)
//! - Tracking monotonic elapsed time, which never moves backward
//! - Converting between beats and seconds at the session tempo
//! - Snapping times onto the half-tick offset grid used for generation windows
//!
//! # Ownership
//! Exactly one [`TransportClock`] exists per session and it is owned by the
//! engine. Nothing else advances it; the runtime calls
//! [`TransportClock::advance`] with measured wall time.

use chrono::{DateTime, Duration as ChronoDuration, Local};

/// Tempo and grid resolution used for all beat/second conversions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tempo {
    pub bpm: f64,
    pub ticks_per_beat: u32,
}

impl Tempo {
    pub fn new(bpm: f64, ticks_per_beat: u32) -> Self {
        Self {
            bpm,
            ticks_per_beat,
        }
    }

    pub fn beats_to_seconds(&self, beats: f64) -> f64 {
        beats * 60.0 / self.bpm
    }

    /// Length of one tick (`1 / ticks_per_beat` of a beat) in seconds.
    pub fn tick_interval(&self) -> f64 {
        self.beats_to_seconds(1.0 / self.ticks_per_beat as f64)
    }

    pub fn half_interval(&self) -> f64 {
        self.tick_interval() / 2.0
    }

    /// Quantize `t` up to the next boundary of the half-tick offset grid.
    ///
    /// Boundaries sit at `(k + 0.5) * interval`. A value already on a boundary
    /// moves forward a full interval, so this is not idempotent: rounding an
    /// already rounded value yields the next boundary.
    pub fn round_to_offset(&self, t: f64) -> f64 {
        let interval = self.tick_interval();
        t - (t + interval / 2.0).rem_euclid(interval) + interval
    }

    /// Whole number of ticks closest to `seconds`.
    pub fn seconds_to_ticks(&self, seconds: f64) -> u32 {
        (seconds / self.tick_interval()).round().max(0.0) as u32
    }

    pub fn ticks_to_seconds(&self, ticks: u32) -> f64 {
        ticks as f64 * self.tick_interval()
    }
}

/// Seekable transport clock.
///
/// `position` is the musical timeline every note is scheduled against and can
/// be set to any value. `elapsed` counts real time since the clock was created
/// and is what timers and the idle watchdog use, since it is never rewound.
#[derive(Debug, Clone)]
pub struct TransportClock {
    position: f64,
    elapsed: f64,
    /// Wall time corresponding to `anchor_position`.
    anchor_wall: DateTime<Local>,
    anchor_position: f64,
}

impl TransportClock {
    pub fn new() -> Self {
        Self::starting_at(Local::now())
    }

    /// Create a clock whose position 0 maps to `wall`.
    pub fn starting_at(wall: DateTime<Local>) -> Self {
        Self {
            position: 0.0,
            elapsed: 0.0,
            anchor_wall: wall,
            anchor_position: 0.0,
        }
    }

    pub fn now(&self) -> f64 {
        self.position
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Move both position and elapsed time forward by `seconds`.
    pub fn advance(&mut self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        self.position += seconds;
        self.elapsed += seconds;
    }

    /// Jump the transport to `position`, keeping wall-clock display continuous.
    pub fn seek(&mut self, position: f64) {
        self.anchor_wall = self.wall_time(self.position);
        self.anchor_position = position;
        self.position = position;
    }

    /// Wall-clock timestamp at which transport time `t` sounds (or sounded).
    pub fn wall_time(&self, t: f64) -> DateTime<Local> {
        let offset_us = ((t - self.anchor_position) * 1_000_000.0).round() as i64;
        self.anchor_wall + ChronoDuration::microseconds(offset_us)
    }
}

impl Default for TransportClock {
    fn default() -> Self {
        Self::new()
    }
}
