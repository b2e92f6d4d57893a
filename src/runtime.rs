//! Async session runner.
//!
//! Owns the engine on a single task. Wall time is fed to the engine on every
//! wake-up; model calls run as spawned tasks under a timeout and report back
//! over a channel, so the engine itself never waits on the model.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::engine::{Engine, InputEvent};
use crate::model::{GenerationResponse, GenerativeModel};
use crate::sink::PlaybackSink;

/// How often the transport is advanced when nothing else happens.
const TICK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Rewind,
    Reset,
    Quit,
}

impl Command {
    /// Parse a console line (`r`, `x`, `q`).
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "r" | "rewind" => Some(Self::Rewind),
            "x" | "reset" => Some(Self::Reset),
            "q" | "quit" => Some(Self::Quit),
            _ => None,
        }
    }
}

enum Wake {
    Tick,
    Input(InputEvent),
    Generated(GenerationResponse),
    Command(Command),
}

/// Run a session until [`Command::Quit`] or the command channel closes.
///
/// The session is reset (and archived) on the way out; the engine is handed
/// back for inspection.
pub async fn run_session<M, S, A>(
    mut engine: Engine<S, A>,
    model: Arc<M>,
    mut inputs: UnboundedReceiver<InputEvent>,
    mut commands: UnboundedReceiver<Command>,
) -> Engine<S, A>
where
    M: GenerativeModel,
    S: PlaybackSink,
    A: Archive,
{
    let (results_tx, mut results) = mpsc::unbounded_channel();
    let timeout = Duration::from_millis(engine.config().generation.model_timeout_ms);

    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();

    // Requests issued before the runner started (e.g. a loaded shared history).
    dispatch(&mut engine, &model, &results_tx, timeout);

    loop {
        let wake = tokio::select! {
            _ = ticker.tick() => Wake::Tick,
            Some(event) = inputs.recv() => Wake::Input(event),
            Some(response) = results.recv() => Wake::Generated(response),
            command = commands.recv() => match command {
                Some(command) => Wake::Command(command),
                None => Wake::Command(Command::Quit),
            },
        };

        let now = Instant::now();
        engine.advance(now.duration_since(last).as_secs_f64());
        last = now;

        match wake {
            Wake::Tick => {}
            Wake::Input(event) => engine.handle_input(event),
            Wake::Generated(response) => {
                engine.apply_generation(response);
            }
            Wake::Command(Command::Rewind) => {
                if engine.rewind().is_none() {
                    info!("nothing to rewind yet");
                }
            }
            Wake::Command(Command::Reset) => engine.reset(),
            Wake::Command(Command::Quit) => break,
        }

        dispatch(&mut engine, &model, &results_tx, timeout);
    }

    info!("session runner stopping");
    engine.reset();
    engine
}

/// Start one model call per pending request.
fn dispatch<M, S, A>(
    engine: &mut Engine<S, A>,
    model: &Arc<M>,
    results: &UnboundedSender<GenerationResponse>,
    timeout: Duration,
) where
    M: GenerativeModel,
    S: PlaybackSink,
    A: Archive,
{
    for request in engine.take_requests() {
        let model = Arc::clone(model);
        let results = results.clone();
        tokio::spawn(async move {
            let epoch = request.epoch;
            let notes = match tokio::time::timeout(timeout, model.generate(&request)).await {
                Ok(Ok(notes)) => Some(notes),
                Ok(Err(e)) => {
                    warn!(epoch, error = %e, "model call failed");
                    None
                }
                Err(_) => {
                    warn!(epoch, ?timeout, "model call timed out");
                    None
                }
            };
            if results.send(GenerationResponse { epoch, notes }).is_err() {
                debug!(epoch, "session gone before model answered");
            }
        });
    }
}
