//! Generative model collaborator interface.
//!
//! The engine never awaits the model itself. It emits a [`GenerationRequest`]
//! stamped with the loop epoch; the runtime runs the model and hands back a
//! [`GenerationResponse`] carrying the same epoch, which the engine checks
//! before anything is committed.

use std::future::Future;
use std::time::Duration;

use crate::note::{KeyId, Note};

/// Where accepted notes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Withheld in the note buffer until seeding commits.
    Buffered,
    /// Scheduled on the transport immediately.
    Scheduled,
}

/// Everything the model needs for one buffer window.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub epoch: u64,
    pub delivery: Delivery,
    /// Committed and queued notes at or after `window_start`, time-ordered
    pub context: Vec<Note>,
    pub window_start: f64,
    /// Generated notes start here
    pub window_end: f64,
    pub tick_interval: f64,
    pub buffer_ticks: u32,
    pub num_repeats: u32,
    pub selection_idx: u32,
}

impl GenerationRequest {
    pub fn buffer_seconds(&self) -> f64 {
        self.buffer_ticks as f64 * self.tick_interval
    }
}

/// One note proposed by the model. `time` is in transport seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneratedNote {
    pub key: KeyId,
    pub velocity: f32,
    pub duration: f64,
    pub time: f64,
}

/// Result of running a request. `notes` is `None` when the model failed or timed out.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub epoch: u64,
    pub notes: Option<Vec<GeneratedNote>>,
}

/// An opaque asynchronous note generator.
pub trait GenerativeModel: Send + Sync + 'static {
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = anyhow::Result<Vec<GeneratedNote>>> + Send;
}

/// Call-and-response model that answers with an earlier phrase.
///
/// The context is cut into `num_repeats` buffer-length segments counting back
/// from `window_end`; segment `selection_idx` (0 = most recent) is replayed
/// into the new window, snapped onto the tick grid.
#[derive(Debug, Clone, Default)]
pub struct EchoModel {
    /// Simulated inference time
    pub latency: Duration,
}

impl EchoModel {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    /// The synchronous part of [`GenerativeModel::generate`].
    pub fn respond(request: &GenerationRequest) -> Vec<GeneratedNote> {
        let buffer = request.buffer_seconds();
        if buffer <= 0.0 || request.tick_interval <= 0.0 {
            return Vec::new();
        }
        let repeats = request.num_repeats.max(1);
        let back = (request.selection_idx % repeats) as f64 + 1.0;
        let segment_start = request.window_end - back * buffer;
        let segment_end = segment_start + buffer;
        let shift = back * buffer;

        let mut notes: Vec<GeneratedNote> = request
            .context
            .iter()
            .filter(|n| n.time >= segment_start && n.time < segment_end)
            .filter_map(|n| {
                let offset = n.time + shift - request.window_end;
                let tick = (offset / request.tick_interval).round();
                let time = request.window_end + tick * request.tick_interval;
                if time < request.window_end || time >= request.window_end + buffer {
                    return None;
                }
                let duration = n
                    .length
                    .seconds()
                    .unwrap_or(request.tick_interval)
                    .max(request.tick_interval / 2.0);
                Some(GeneratedNote {
                    key: n.key,
                    velocity: n.velocity,
                    duration,
                    time,
                })
            })
            .collect();
        notes.sort_by(|a, b| a.time.total_cmp(&b.time));
        notes
    }
}

impl GenerativeModel for EchoModel {
    async fn generate(&self, request: &GenerationRequest) -> anyhow::Result<Vec<GeneratedNote>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(Self::respond(request))
    }
}
