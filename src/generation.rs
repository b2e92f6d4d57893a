//! Generation loop state: request windowing and the epoch guard.
//!
//! Every start of the loop mints a new integer epoch. Requests carry the epoch
//! they were issued under, and a response is accepted only while that epoch
//! is still current, so a slow response from a loop that has since been
//! stopped or restarted is dropped no matter when it arrives.
//!
//! `call_model_end` marks the end of the window already requested. It moves
//! forward by exactly one buffer per request, at request time, so a failed or
//! discarded response never stalls the loop and latency never accumulates as
//! drift.

use crate::clock::Tempo;
use crate::config::GenerationConfig;
use crate::history::History;
use crate::model::{Delivery, GenerationRequest};
use crate::note::Note;
use crate::scheduler::ScheduleHandle;

#[derive(Debug, Clone)]
pub struct GenerationLoop {
    call_model_end: f64,
    epoch: Option<u64>,
    last_epoch: u64,
    delivery: Delivery,
    /// Periodic generation task while running in steady state
    pub tick_task: Option<ScheduleHandle>,
}

impl GenerationLoop {
    pub fn new() -> Self {
        Self {
            call_model_end: 0.0,
            epoch: None,
            last_epoch: 0,
            delivery: Delivery::Scheduled,
            tick_task: None,
        }
    }

    pub fn call_model_end(&self) -> f64 {
        self.call_model_end
    }

    /// Realign the window end (seeding and rewinds).
    pub fn set_call_model_end(&mut self, t: f64) {
        self.call_model_end = t;
    }

    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    pub fn is_running(&self) -> bool {
        self.epoch.is_some()
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    /// Switch delivery without invalidating in-flight requests.
    pub fn set_delivery(&mut self, delivery: Delivery) {
        self.delivery = delivery;
    }

    /// Start (or restart) the loop under a fresh epoch.
    pub fn start(&mut self, delivery: Delivery) -> u64 {
        self.last_epoch += 1;
        self.epoch = Some(self.last_epoch);
        self.delivery = delivery;
        self.last_epoch
    }

    /// Stop the loop. Returns the periodic task handle for the caller to cancel.
    pub fn stop(&mut self) -> Option<ScheduleHandle> {
        self.epoch = None;
        self.tick_task.take()
    }

    /// Whether a response issued under `epoch` may still be applied.
    pub fn accepts(&self, epoch: u64) -> bool {
        self.epoch == Some(epoch)
    }

    /// Seconds between invocations (one buffer).
    pub fn period(tempo: &Tempo, config: &GenerationConfig) -> f64 {
        tempo.beats_to_seconds(config.buffer_beats)
    }

    pub fn window_start(&self, tempo: &Tempo, config: &GenerationConfig) -> f64 {
        let lookback = tempo.beats_to_seconds(config.history_window_beats);
        (self.call_model_end - lookback).max(-tempo.half_interval())
    }

    /// Build the next request and advance `call_model_end` by one buffer.
    ///
    /// Context is the committed history plus still-queued notes at or after
    /// the window start. Returns `None` while the loop is stopped.
    pub fn next_request<'a>(
        &mut self,
        tempo: &Tempo,
        config: &GenerationConfig,
        history: &'a History,
        queued: impl Iterator<Item = &'a Note>,
    ) -> Option<GenerationRequest> {
        let epoch = self.epoch?;
        let window_start = self.window_start(tempo, config);
        let window_end = self.call_model_end;

        let mut context: Vec<Note> = history
            .notes_since(window_start)
            .chain(queued.filter(|n| n.time >= window_start))
            .map(|n| Note {
                handle: None,
                ..n.clone()
            })
            .collect();
        context.sort_by(|a, b| a.time.total_cmp(&b.time));

        let buffer_ticks =
            (config.buffer_beats * tempo.ticks_per_beat as f64).round().max(1.0) as u32;

        self.call_model_end += Self::period(tempo, config);

        Some(GenerationRequest {
            epoch,
            delivery: self.delivery,
            context,
            window_start,
            window_end,
            tick_interval: tempo.tick_interval(),
            buffer_ticks,
            num_repeats: config.num_repeats,
            selection_idx: config.selection_idx,
        })
    }
}

impl Default for GenerationLoop {
    fn default() -> Self {
        Self::new()
    }
}
