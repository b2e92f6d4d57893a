//! The duet session engine.
//!
//! [`Engine`] owns every piece of mutable session state and is driven from one
//! execution context: the runtime feeds it key events, advances its clock and
//! hands back model responses. Nothing in here blocks or awaits. Model calls
//! leave as [`GenerationRequest`]s (see [`Engine::take_requests`]) and come
//! back through [`Engine::apply_generation`], where the epoch check decides
//! whether they still apply.
//!
//! Two timelines are in play:
//! - transport position (`clock.now()`): notes, releases and generation
//!   windows. Seeks on commit and rewind.
//! - elapsed time (`clock.elapsed()`): periodic tasks (seeding checks,
//!   generation ticks, idle checks, the restart debounce). Never rewinds.

use tracing::{debug, info, warn};

use crate::active::{ActiveNote, ActiveNotes};
use crate::archive::{Archive, SessionHandle};
use crate::clock::{Tempo, TransportClock};
use crate::config::DuetConfig;
use crate::error::ConfigError;
use crate::generation::GenerationLoop;
use crate::history::{History, HistoryArena, HistoryId};
use crate::model::{Delivery, GenerationRequest, GenerationResponse};
use crate::note::{Actor, KeyId, Note, NoteLength};
use crate::rewind::plan_rewind;
use crate::scheduler::{ScheduleHandle, Scheduler};
use crate::seeding::{infer_bpm, SeedPhase, SeedStep, Seeding};
use crate::sink::{PlaybackSink, Signal, TriggerEvent};
use crate::watchdog::IdleWatchdog;

/// Key event from the instrument, by logical key index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    KeyDown { key: KeyId, velocity: f32 },
    KeyUp { key: KeyId },
}

/// Periodic and one-shot work on the elapsed timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Generate,
    SeedCheck,
    IdleCheck,
    RestartGeneration,
}

/// What a successful rewind did.
#[derive(Debug, Clone, PartialEq)]
pub struct RewindOutcome {
    /// The forked history now being written
    pub history: HistoryId,
    pub position: f64,
    pub call_model_end: f64,
    pub replay_seconds: f64,
    /// Notes scheduled again as replays
    pub replayed: usize,
    /// Queued notes committed to history before the split
    pub committed: usize,
}

pub struct Engine<S, A> {
    config: DuetConfig,
    title: String,
    clock: TransportClock,
    tempo: Tempo,
    histories: HistoryArena,
    current: Option<HistoryId>,
    session: SessionHandle,
    /// Scheduled notes on the transport timeline
    queue: Scheduler<Note>,
    /// Generated notes withheld while priming
    buffer: Vec<Note>,
    active: ActiveNotes,
    /// Natural note ends on the transport timeline
    releases: Scheduler<KeyId>,
    tasks: Scheduler<Task>,
    generation: GenerationLoop,
    seeding: Seeding,
    watchdog: IdleWatchdog,
    restart_task: Option<ScheduleHandle>,
    requests: Vec<GenerationRequest>,
    sink: S,
    archive: A,
}

impl<S: PlaybackSink, A: Archive> Engine<S, A> {
    pub fn new(config: DuetConfig, sink: S, archive: A) -> Result<Self, ConfigError> {
        config.validate()?;
        let tempo = config.initial_tempo();
        let watchdog = IdleWatchdog::new(config.watchdog.idle_timeout_secs);
        Ok(Self {
            config,
            title: "duet".to_string(),
            clock: TransportClock::new(),
            tempo,
            histories: HistoryArena::new(),
            current: None,
            session: SessionHandle::new(),
            queue: Scheduler::new(),
            buffer: Vec::new(),
            active: ActiveNotes::new(),
            releases: Scheduler::new(),
            tasks: Scheduler::new(),
            generation: GenerationLoop::new(),
            seeding: Seeding::new(),
            watchdog,
            restart_task: None,
            requests: Vec::new(),
            sink,
            archive,
        })
    }

    /// Title given to histories of new sessions.
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    pub fn config(&self) -> &DuetConfig {
        &self.config
    }

    pub fn clock(&self) -> &TransportClock {
        &self.clock
    }

    pub fn tempo(&self) -> &Tempo {
        &self.tempo
    }

    pub fn phase(&self) -> SeedPhase {
        self.seeding.phase()
    }

    pub fn seeding(&self) -> &Seeding {
        &self.seeding
    }

    pub fn generation(&self) -> &GenerationLoop {
        &self.generation
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// The history currently being written, if a session is active.
    pub fn history(&self) -> Option<&History> {
        self.current.and_then(|id| self.histories.get(id))
    }

    pub fn history_id(&self) -> Option<HistoryId> {
        self.current
    }

    pub fn histories(&self) -> &HistoryArena {
        &self.histories
    }

    /// Queued notes in firing order.
    pub fn queued_notes(&self) -> Vec<&Note> {
        let mut notes: Vec<&Note> = self.queue.iter().map(|(_, _, note)| note).collect();
        notes.sort_by(|a, b| a.time.total_cmp(&b.time));
        notes
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn buffer(&self) -> &[Note] {
        &self.buffer
    }

    pub fn active(&self) -> &ActiveNotes {
        &self.active
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn archive(&self) -> &A {
        &self.archive
    }

    /// Model requests issued since the last call.
    pub fn take_requests(&mut self) -> Vec<GenerationRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn handle_input(&mut self, event: InputEvent) {
        match event {
            InputEvent::KeyDown { key, velocity } => self.key_down(key, velocity),
            InputEvent::KeyUp { key } => self.key_up(key),
        }
    }

    pub fn key_down(&mut self, key: KeyId, velocity: f32) {
        if key >= self.config.instrument.num_keys {
            debug!(key, "ignoring key outside the instrument");
            return;
        }
        if self.seeding.phase() == SeedPhase::Idle {
            self.start_session();
        }
        self.note_activity();

        let now = self.clock.now();
        let note = Note::new(key, velocity, NoteLength::Held, now, Actor::Player);
        self.play_note(note, now);
    }

    pub fn key_up(&mut self, key: KeyId) {
        // A key the model has since retriggered belongs to the model note.
        let held = self
            .active
            .get(key)
            .map_or(false, |a| a.note.actor == Actor::Player);
        if !held {
            return;
        }
        self.note_activity();
        let now = self.clock.now();
        self.release_note(key, now);
    }

    /// Move time forward and run everything that came due.
    pub fn advance(&mut self, seconds: f64) {
        self.clock.advance(seconds);
        self.run_due();
    }

    /// Put a note on the transport queue. The stored note carries its own handle.
    pub fn schedule_note(&mut self, note: Note) -> ScheduleHandle {
        let time = note.time;
        self.queue.schedule_with(time, move |handle| Note {
            handle: Some(handle),
            ..note
        })
    }

    pub fn cancel_note(&mut self, handle: ScheduleHandle) -> Option<Note> {
        self.queue.cancel(handle).map(|note| Note {
            handle: None,
            ..note
        })
    }

    /// Apply a model response. Returns how many notes were accepted.
    pub fn apply_generation(&mut self, response: GenerationResponse) -> usize {
        if !self.generation.accepts(response.epoch) {
            debug!(epoch = response.epoch, current = ?self.generation.epoch(), "dropping stale generation");
            return 0;
        }
        let Some(notes) = response.notes else {
            warn!(epoch = response.epoch, "model produced nothing this cycle");
            return 0;
        };

        let now = self.clock.now();
        let num_keys = self.config.instrument.num_keys;
        let delivery = self.generation.delivery();
        let mut accepted = 0;
        for generated in notes {
            if generated.key >= num_keys {
                warn!(key = generated.key, "model note outside the instrument");
                continue;
            }
            let finite = generated.time.is_finite()
                && generated.duration.is_finite()
                && generated.velocity.is_finite();
            if !finite || generated.duration <= 0.0 {
                debug!(?generated, "discarding malformed model note");
                continue;
            }
            let note = Note::new(
                generated.key,
                generated.velocity,
                NoteLength::Seconds(generated.duration),
                generated.time,
                Actor::Model,
            );
            match delivery {
                Delivery::Buffered => self.buffer.push(note),
                Delivery::Scheduled => {
                    if note.time < now {
                        debug!(key = note.key, time = note.time, now, "model note arrived late");
                        continue;
                    }
                    self.schedule_note(note);
                }
            }
            accepted += 1;
        }
        debug!(epoch = response.epoch, accepted, ?delivery, "applied generation");
        accepted
    }

    /// Jump back, fork the history and replay the tail after a short debounce.
    ///
    /// Only allowed once the session is committed. Returns `None` when
    /// rejected or when there is nothing to rewind.
    pub fn rewind(&mut self) -> Option<RewindOutcome> {
        if self.seeding.phase() != SeedPhase::Committed {
            debug!(phase = ?self.seeding.phase(), "rewind ignored");
            return None;
        }
        let current = self.current?;
        let recorded = self.histories.get(current).is_some_and(|h| !h.is_empty());
        if !recorded && self.queue.is_empty() {
            debug!("rewind ignored, nothing recorded");
            return None;
        }

        let now = self.clock.now();
        let elapsed = self.clock.elapsed();
        self.watchdog.touch(elapsed);

        // Snapshot queued notes before anything cancels them.
        let pending = self.queue.drain();
        self.release_all_notes(now);
        self.archive_current();
        self.stop_generation();
        self.releases.drain();

        let fork = self.histories.fork(current)?;
        self.current = Some(fork);
        let history = self.histories.get_mut(fork)?;
        let plan = plan_rewind(
            now,
            history.last_seed_note_time,
            &self.tempo,
            &self.config.rewind,
        );

        let mut committed = 0;
        for note in pending.into_iter().filter(|n| n.time <= plan.call_model_end) {
            history.push(note);
            committed += 1;
        }
        let replay = history.split_for_replay(plan.position, plan.call_model_end);
        let replayed = replay.len();

        self.clock.seek(plan.position);
        for note in replay {
            self.schedule_note(note);
        }
        self.generation.set_call_model_end(plan.call_model_end);

        if let Some(handle) = self.restart_task.take() {
            self.tasks.cancel(handle);
        }
        let restart_at = elapsed + self.config.rewind.restart_debounce_secs;
        self.restart_task = Some(self.tasks.schedule(restart_at, Task::RestartGeneration));

        info!(
            from = now,
            to = plan.position,
            call_model_end = plan.call_model_end,
            replayed,
            committed,
            "rewound"
        );
        Some(RewindOutcome {
            history: fork,
            position: plan.position,
            call_model_end: plan.call_model_end,
            replay_seconds: plan.replay_seconds,
            replayed,
            committed,
        })
    }

    /// End the session: silence everything, archive, return to idle.
    pub fn reset(&mut self) {
        if self.current.is_none() && self.seeding.phase() == SeedPhase::Idle {
            return;
        }
        let now = self.clock.now();
        self.release_all_notes(now);
        self.stop_generation();
        self.releases.drain();
        self.tasks.drain();
        self.restart_task = None;
        self.watchdog.check_task = None;
        self.seeding.reset();
        self.buffer.clear();
        self.archive_current();
        self.current = None;
        self.histories.clear();
        self.tempo = self.config.initial_tempo();

        self.sink.stop_all();
        self.sink.signal(Signal::GlowStop);
        self.sink.signal(Signal::IdleStart);
        info!(session = %self.session.id, "session reset");
    }

    /// Start a session that replays a shared history, then keeps generating.
    pub fn load_shared(&mut self, shared: History) {
        self.reset();

        let bpm = if shared.tempo.is_finite() && shared.tempo > 0.0 {
            shared.tempo
        } else {
            self.config.timing.default_bpm
        };
        self.tempo = Tempo::new(bpm, self.config.timing.ticks_per_beat);
        self.session = SessionHandle::new();
        self.clock.seek(0.0);

        let mut history = History::new(shared.title.clone(), bpm);
        history.last_seed_note_time = shared.last_seed_note_time;
        self.current = Some(self.histories.add(history));

        let beat = self.tempo.beats_to_seconds(1.0);
        let num_keys = self.config.instrument.num_keys;
        let mut replayed = 0;
        let mut end = 0.0_f64;
        for note in shared.notes.iter().filter(|n| n.key < num_keys) {
            let mut replay = note.as_replay();
            if replay.length == NoteLength::Held {
                replay.length = NoteLength::Seconds(beat);
            }
            end = end.max(replay.time);
            self.schedule_note(replay);
            replayed += 1;
        }

        self.seeding.force_committed(shared.last_seed_note_time);
        let elapsed = self.clock.elapsed();
        self.watchdog.touch(elapsed);
        self.schedule_idle_check(elapsed);
        self.sink.signal(Signal::IdleStop);

        self.generation.set_call_model_end(self.tempo.round_to_offset(end));
        self.start_steady_generation();
        info!(title = %shared.title, replayed, bpm, "loaded shared history");
    }

    fn start_session(&mut self) {
        self.clock.seek(0.0);
        self.tempo = self.config.initial_tempo();
        self.session = SessionHandle::new();
        let history = History::new(self.title.clone(), self.tempo.bpm);
        self.current = Some(self.histories.add(history));
        self.generation.set_call_model_end(0.0);

        let elapsed = self.clock.elapsed();
        let check_at = elapsed + self.config.seeding.check_secs;
        self.seeding.check_task = Some(self.tasks.schedule(check_at, Task::SeedCheck));
        self.schedule_idle_check(elapsed);
        self.sink.signal(Signal::IdleStop);
        info!(session = %self.session.id, "session started");
    }

    fn schedule_idle_check(&mut self, from: f64) {
        let at = from + self.config.watchdog.check_secs;
        self.watchdog.check_task = Some(self.tasks.schedule(at, Task::IdleCheck));
    }

    fn note_activity(&mut self) {
        let elapsed = self.clock.elapsed();
        self.watchdog.touch(elapsed);
        if self.seeding.on_input(elapsed) {
            info!(dropped = self.buffer.len(), "seeding interrupted");
            self.stop_generation();
            self.buffer.clear();
            self.sink.signal(Signal::SeedProgress(0.0));
        }
    }

    /// Sound a note. `at` is when the clock actually reached it.
    fn play_note(&mut self, mut note: Note, at: f64) {
        if self.active.contains(note.key) {
            self.release_note(note.key, at);
        }
        if let Some(handle) = note.handle.take() {
            self.queue.cancel(handle);
        }

        let tail = self.config.playback.release_tail_secs;
        self.sink.trigger(&TriggerEvent {
            key: note.key,
            velocity: note.velocity,
            wall_start: self.clock.wall_time(note.time),
            duration: note.length.seconds().map(|d| d + tail),
            tempo: self.tempo.bpm,
            actor: note.actor,
            is_replay: note.is_replay,
        });

        let release = note.end_time().map(|end| self.releases.schedule(end, note.key));
        let history_index = self
            .current
            .and_then(|id| self.histories.get_mut(id))
            .map(|history| history.push(note.clone()));
        self.active.insert(ActiveNote {
            note,
            history_index,
            release,
        });
    }

    /// Release the sounding note on `key`. Returns the final duration.
    ///
    /// Sound is cut and the history length rewritten only when the note ends
    /// away from its requested length.
    fn release_note(&mut self, key: KeyId, at: f64) -> Option<f64> {
        let active = self.active.remove(key)?;
        if let Some(handle) = active.release {
            self.releases.cancel(handle);
        }

        let final_duration = (at - active.note.time).max(0.0);
        let epsilon = self.config.playback.release_epsilon_secs;
        let natural = matches!(
            active.note.length,
            NoteLength::Seconds(d) if (final_duration - d).abs() <= epsilon
        );
        if !natural {
            self.sink.stop_sound(key);
            if let (Some(index), Some(history)) = (
                active.history_index,
                self.current.and_then(|id| self.histories.get_mut(id)),
            ) {
                history.set_length(index, NoteLength::Seconds(final_duration));
            }
        }
        self.sink.release(key, final_duration);
        Some(final_duration)
    }

    fn release_all_notes(&mut self, at: f64) {
        for key in self.active.keys() {
            self.release_note(key, at);
        }
    }

    fn archive_current(&mut self) {
        if let Some(history) = self.current.and_then(|id| self.histories.get(id)) {
            if !history.is_empty() {
                self.archive.add_to_history_list(history, &self.session);
            }
        }
    }

    /// Stop the loop (in-flight results go stale) and cancel every queued note.
    fn stop_generation(&mut self) {
        if let Some(handle) = self.generation.stop() {
            self.tasks.cancel(handle);
        }
        let cancelled = self.queue.drain();
        if !cancelled.is_empty() {
            debug!(cancelled = cancelled.len(), "cancelled queued notes");
        }
    }

    fn start_steady_generation(&mut self) {
        let epoch = self.generation.start(Delivery::Scheduled);
        let elapsed = self.clock.elapsed();
        self.generation.tick_task = Some(self.tasks.schedule(elapsed, Task::Generate));
        debug!(epoch, call_model_end = self.generation.call_model_end(), "generation started");
    }

    fn request_generation(&mut self) {
        let Some(history) = self.current.and_then(|id| self.histories.get(id)) else {
            return;
        };
        let queued = self.queue.iter().map(|(_, _, note)| note);
        if let Some(request) =
            self.generation
                .next_request(&self.tempo, &self.config.generation, history, queued)
        {
            debug!(
                epoch = request.epoch,
                window_end = request.window_end,
                context = request.context.len(),
                "generation requested"
            );
            self.requests.push(request);
        }
    }

    /// Fire whatever is due, most overdue first.
    fn run_due(&mut self) {
        loop {
            let now = self.clock.now();
            let elapsed = self.clock.elapsed();
            let lag = |t: Option<f64>, clock: f64| {
                t.map(|t| clock - t)
                    .filter(|lag| *lag >= 0.0)
                    .unwrap_or(f64::NEG_INFINITY)
            };
            let release_lag = lag(self.releases.next_time(), now);
            let note_lag = lag(self.queue.next_time(), now);
            let task_lag = lag(self.tasks.next_time(), elapsed);

            if release_lag.max(note_lag).max(task_lag) == f64::NEG_INFINITY {
                break;
            }
            if release_lag >= note_lag && release_lag >= task_lag {
                self.fire_release(now);
            } else if note_lag >= task_lag {
                self.fire_note(now);
            } else {
                self.fire_task(elapsed);
            }
        }
    }

    fn fire_release(&mut self, now: f64) {
        let Some((handle, end, key)) = self.releases.pop_due(now) else {
            return;
        };
        if self.active.get(key).and_then(|a| a.release) == Some(handle) {
            self.release_note(key, end);
        }
    }

    fn fire_note(&mut self, now: f64) {
        if let Some((_, _, note)) = self.queue.pop_due(now) {
            self.play_note(note, now);
        }
    }

    fn fire_task(&mut self, elapsed: f64) {
        let Some((handle, at, task)) = self.tasks.pop_due(elapsed) else {
            return;
        };
        match task {
            Task::Generate => {
                if self.generation.tick_task != Some(handle) {
                    return;
                }
                self.generation.tick_task = None;
                self.request_generation();
                if self.generation.is_running() {
                    let period = GenerationLoop::period(&self.tempo, &self.config.generation);
                    self.generation.tick_task = Some(self.tasks.schedule(at + period, Task::Generate));
                }
            }
            Task::SeedCheck => {
                if self.seeding.check_task != Some(handle) {
                    return;
                }
                self.seeding.check_task = None;
                self.seed_check(at);
                if self.seeding.is_listening() {
                    let next = at + self.config.seeding.check_secs;
                    self.seeding.check_task = Some(self.tasks.schedule(next, Task::SeedCheck));
                }
            }
            Task::IdleCheck => {
                if self.watchdog.check_task != Some(handle) {
                    return;
                }
                self.watchdog.check_task = None;
                if self.watchdog.is_expired(at) {
                    info!(idle_for = self.watchdog.idle_for(at), "session idle");
                    self.reset();
                } else {
                    self.schedule_idle_check(at);
                }
            }
            Task::RestartGeneration => {
                if self.restart_task != Some(handle) {
                    return;
                }
                self.restart_task = None;
                self.start_steady_generation();
            }
        }
    }

    fn seed_check(&mut self, at: f64) {
        let sounding = !self.active.is_empty();
        match self.seeding.check(at, sounding, &self.config.seeding) {
            SeedStep::Wait { progress } => self.sink.signal(Signal::SeedProgress(progress)),
            SeedStep::Prime => self.prime(),
            SeedStep::Commit => self.commit_seed(),
            SeedStep::Stop => {}
        }
    }

    /// Infer the tempo from the seed phrase and ask for a buffered continuation.
    fn prime(&mut self) {
        let Some(history) = self.current.and_then(|id| self.histories.get_mut(id)) else {
            return;
        };
        let Some(last) = history.last_note_time() else {
            return;
        };
        let onsets: Vec<f64> = history
            .notes
            .iter()
            .filter(|n| n.actor == Actor::Player)
            .map(|n| n.time)
            .collect();
        let timing = &self.config.timing;
        let bpm = infer_bpm(&onsets, timing.default_bpm, timing.min_bpm, timing.max_bpm);
        history.tempo = bpm;
        history.last_seed_note_time = last;
        self.tempo = Tempo::new(bpm, timing.ticks_per_beat);

        let boundary = self.tempo.round_to_offset(last);
        self.seeding.begin_priming(boundary);
        self.generation.set_call_model_end(boundary);
        let epoch = self.generation.start(Delivery::Buffered);
        info!(bpm, boundary, epoch, "priming model");
        self.request_generation();
    }

    /// Rewind to the seed boundary and release the buffered continuation.
    fn commit_seed(&mut self) {
        let boundary = self.seeding.boundary();
        self.seeding.commit();
        self.clock.seek(boundary);

        let buffered = std::mem::take(&mut self.buffer);
        let flushed = buffered.len();
        for note in buffered {
            self.schedule_note(note);
        }

        if self.generation.is_running() {
            self.generation.set_delivery(Delivery::Scheduled);
            let elapsed = self.clock.elapsed();
            self.generation.tick_task = Some(self.tasks.schedule(elapsed, Task::Generate));
        } else {
            self.start_steady_generation();
        }

        self.sink.signal(Signal::SeedProgress(1.0));
        self.sink.signal(Signal::GlowStart);
        info!(boundary, flushed, bpm = self.tempo.bpm, "seed committed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::model::EchoModel;
    use crate::sink::{RecordingSink, SinkEvent};

    type TestEngine = Engine<RecordingSink, MemoryArchive>;

    fn engine_with(config: DuetConfig) -> TestEngine {
        Engine::new(config, RecordingSink::new(), MemoryArchive::new()).expect("valid config")
    }

    fn engine() -> TestEngine {
        engine_with(DuetConfig::default())
    }

    /// Answer every pending request with the echo model.
    fn pump(engine: &mut TestEngine) -> usize {
        let mut accepted = 0;
        for request in engine.take_requests() {
            let notes = EchoModel::respond(&request);
            accepted += engine.apply_generation(GenerationResponse {
                epoch: request.epoch,
                notes: Some(notes),
            });
        }
        accepted
    }

    fn step_until(engine: &mut TestEngine, limit: usize, done: impl Fn(&TestEngine) -> bool) {
        for _ in 0..limit {
            if done(engine) {
                return;
            }
            engine.advance(0.05);
            pump(engine);
        }
        assert!(done(engine), "condition not reached");
    }

    /// Four quarter notes at 120 BPM, each held 0.2 s.
    fn play_seed(engine: &mut TestEngine) {
        for (i, key) in [40u8, 42, 44, 45].into_iter().enumerate() {
            if i > 0 {
                engine.advance(0.3);
            }
            engine.key_down(key, 0.8);
            engine.advance(0.2);
            engine.key_up(key);
        }
    }

    fn committed_engine() -> TestEngine {
        let mut engine = engine();
        play_seed(&mut engine);
        step_until(&mut engine, 200, |e| e.phase() == SeedPhase::Committed);
        engine
    }

    fn lengths(engine: &TestEngine) -> Vec<(f64, f64)> {
        engine
            .history()
            .expect("history")
            .notes
            .iter()
            .map(|n| (n.time, n.length.seconds().unwrap_or(f64::NAN)))
            .collect()
    }

    #[test]
    fn test_press_release_twice_records_two_notes() {
        let mut engine = engine();
        engine.key_down(10, 0.8);
        engine.advance(0.5);
        engine.key_up(10);
        assert!(engine.active().is_empty());
        engine.advance(0.5);
        engine.key_down(10, 0.6);
        engine.advance(0.25);
        engine.key_up(10);
        assert!(engine.active().is_empty());

        let notes = lengths(&engine);
        assert_eq!(notes.len(), 2);
        assert!((notes[0].0 - 0.0).abs() < 1e-9);
        assert!((notes[0].1 - 0.5).abs() < 1e-9);
        assert!((notes[1].0 - 1.0).abs() < 1e-9);
        assert!((notes[1].1 - 0.25).abs() < 1e-9);
        assert!(engine.active().is_empty());
        assert_eq!(engine.phase(), SeedPhase::Listening);
    }

    #[test]
    fn test_retrigger_closes_previous_note() {
        let mut engine = engine();
        engine.key_down(5, 0.8);
        engine.advance(0.3);
        engine.key_down(5, 0.9);
        assert_eq!(engine.active().len(), 1);
        engine.advance(0.2);
        engine.key_up(5);

        let notes = lengths(&engine);
        assert_eq!(notes.len(), 2);
        assert!((notes[0].1 - 0.3).abs() < 1e-9);
        assert!((notes[1].0 - 0.3).abs() < 1e-9);
        assert!((notes[1].1 - 0.2).abs() < 1e-9);
        assert_eq!(engine.sink().stops(), 2);
    }

    #[test]
    fn test_keys_outside_instrument_ignored() {
        let mut engine = engine();
        engine.key_down(88, 1.0);
        assert_eq!(engine.phase(), SeedPhase::Idle);
        assert!(engine.history().is_none());
        engine.key_up(3);
        assert!(engine.sink().events.is_empty());
    }

    #[test]
    fn test_natural_release_keeps_requested_length() {
        let mut engine = engine();
        engine.key_down(1, 0.5);
        engine.key_up(1);
        engine.sink_mut().clear();

        let at = engine.clock().now() + 0.1;
        engine.schedule_note(Note::new(7, 0.5, NoteLength::Seconds(0.25), at, Actor::Model));
        for _ in 0..20 {
            engine.advance(0.05);
        }

        let history = engine.history().expect("history");
        let model = history.notes.iter().find(|n| n.actor == Actor::Model).expect("played");
        assert_eq!(model.length, NoteLength::Seconds(0.25));
        assert_eq!(engine.sink().stops(), 0);
        assert!(engine
            .sink()
            .events
            .iter()
            .any(|e| matches!(e, SinkEvent::Release { key: 7, duration } if (*duration - 0.25).abs() < 1e-9)));
        let trigger = engine.sink().triggers().next().expect("trigger");
        assert!((trigger.duration.expect("bounded") - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_cancelled_note_never_plays() {
        let mut engine = engine();
        engine.key_down(1, 0.5);
        engine.key_up(1);
        let at = engine.clock().now() + 0.1;
        let handle = engine.schedule_note(Note::new(9, 0.5, NoteLength::Seconds(0.1), at, Actor::Model));
        let cancelled = engine.cancel_note(handle).expect("queued");
        assert!(cancelled.handle.is_none());
        engine.advance(0.5);
        assert!(engine.sink().triggers().all(|t| t.key != 9));
    }

    #[test]
    fn test_seeding_primes_then_commits() {
        let mut engine = engine();
        play_seed(&mut engine);

        for _ in 0..100 {
            if engine.phase() == SeedPhase::Priming {
                break;
            }
            engine.advance(0.05);
        }
        assert_eq!(engine.phase(), SeedPhase::Priming);
        assert!((engine.tempo().bpm - 120.0).abs() < 1e-6);
        let boundary = engine.seeding().boundary();
        assert!((boundary - 1.5625).abs() < 1e-9);

        let requests = engine.take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].delivery, Delivery::Buffered);
        assert!((requests[0].window_end - boundary).abs() < 1e-9);
        assert_eq!(requests[0].context.len(), 4);

        let notes = EchoModel::respond(&requests[0]);
        let accepted = engine.apply_generation(GenerationResponse {
            epoch: requests[0].epoch,
            notes: Some(notes),
        });
        assert!(accepted > 0);
        assert_eq!(engine.buffer().len(), accepted);
        assert_eq!(engine.queue_len(), 0);

        for _ in 0..100 {
            if engine.phase() == SeedPhase::Committed {
                break;
            }
            engine.advance(0.05);
        }
        assert_eq!(engine.phase(), SeedPhase::Committed);
        assert!((engine.clock().now() - boundary).abs() < 1e-9);
        assert!(engine.buffer().is_empty());
        assert_eq!(engine.queue_len(), accepted);
        assert!(engine.queued_notes().iter().all(|n| n.time >= boundary));
        assert!(engine.sink().signals().contains(&Signal::GlowStart));

        let steady = engine.take_requests();
        assert_eq!(steady.len(), 1);
        assert_eq!(steady[0].delivery, Delivery::Scheduled);
        assert_eq!(steady[0].epoch, requests[0].epoch);
    }

    #[test]
    fn test_input_while_priming_discards_buffer() {
        let mut engine = engine();
        play_seed(&mut engine);
        step_until(&mut engine, 100, |e| e.phase() == SeedPhase::Priming);
        assert!(!engine.buffer().is_empty());

        engine.key_down(50, 0.7);
        assert_eq!(engine.phase(), SeedPhase::Listening);
        assert!(engine.buffer().is_empty());
        assert!(!engine.generation().is_running());
    }

    #[test]
    fn test_stale_buffered_response_dropped_after_interrupt() {
        let mut engine = engine();
        play_seed(&mut engine);
        for _ in 0..100 {
            if engine.phase() == SeedPhase::Priming {
                break;
            }
            engine.advance(0.05);
        }
        let request = engine.take_requests().pop().expect("priming request");
        engine.key_down(50, 0.7);

        let accepted = engine.apply_generation(GenerationResponse {
            epoch: request.epoch,
            notes: Some(EchoModel::respond(&request)),
        });
        assert_eq!(accepted, 0);
        assert!(engine.buffer().is_empty());
        assert_eq!(engine.queue_len(), 0);
    }

    #[test]
    fn test_failed_model_call_still_advances_window() {
        let mut engine = committed_engine();
        let before = engine.generation().call_model_end();
        let period = GenerationLoop::period(engine.tempo(), &engine.config().generation);
        for _ in 0..60 {
            engine.advance(0.05);
            for request in engine.take_requests() {
                engine.apply_generation(GenerationResponse {
                    epoch: request.epoch,
                    notes: None,
                });
            }
        }
        assert!(engine.generation().call_model_end() >= before + period - 1e-9);
    }

    #[test]
    fn test_late_and_out_of_range_notes_dropped() {
        let mut engine = committed_engine();
        engine.take_requests();
        let epoch = engine.generation().epoch().expect("running");
        let now = engine.clock().now();
        let queued = engine.queue_len();
        let accepted = engine.apply_generation(GenerationResponse {
            epoch,
            notes: Some(vec![
                crate::model::GeneratedNote {
                    key: 3,
                    velocity: 0.5,
                    duration: 0.2,
                    time: now - 0.5,
                },
                crate::model::GeneratedNote {
                    key: 120,
                    velocity: 0.5,
                    duration: 0.2,
                    time: now + 1.0,
                },
                crate::model::GeneratedNote {
                    key: 4,
                    velocity: 0.5,
                    duration: 0.2,
                    time: now + 1.0,
                },
            ]),
        });
        assert_eq!(accepted, 1);
        assert_eq!(engine.queue_len(), queued + 1);
    }

    #[test]
    fn test_non_finite_model_notes_dropped() {
        let mut engine = committed_engine();
        engine.take_requests();
        let epoch = engine.generation().epoch().expect("running");
        let now = engine.clock().now();
        let queued = engine.queue_len();
        let note = |key, velocity, duration| crate::model::GeneratedNote {
            key,
            velocity,
            duration,
            time: now + 0.5,
        };
        let accepted = engine.apply_generation(GenerationResponse {
            epoch,
            notes: Some(vec![
                note(7, 0.5, f64::INFINITY),
                note(8, f32::NAN, 0.2),
                note(9, 0.5, f64::NAN),
                note(10, 0.5, 0.0),
                note(11, 0.5, 0.2),
            ]),
        });
        assert_eq!(accepted, 1);
        assert_eq!(engine.queue_len(), queued + 1);

        engine.advance(2.0);
        assert!(!engine.active().contains(7));
        assert!(engine
            .sink()
            .triggers()
            .filter_map(|t| t.duration)
            .all(f64::is_finite));
    }

    #[test]
    fn test_rewind_rejected_before_commit() {
        let mut engine = engine();
        assert!(engine.rewind().is_none());
        play_seed(&mut engine);
        assert!(engine.rewind().is_none());
        assert!(engine.archive().is_empty());
    }

    #[test]
    fn test_rewind_splits_history_and_replays() {
        let mut engine = committed_engine();
        for _ in 0..120 {
            engine.advance(0.05);
            pump(&mut engine);
        }
        let old_epoch = engine.generation().epoch();
        let last_seed = engine.history().expect("history").last_seed_note_time;
        let outcome = engine.rewind().expect("rewind");

        assert!(outcome.position >= last_seed - outcome.replay_seconds - 1e-9);
        assert!((outcome.call_model_end - outcome.position - outcome.replay_seconds).abs() < 1e-9);
        assert!((engine.clock().now() - outcome.position).abs() < 1e-12);

        let history = engine.history().expect("history");
        assert!(history.notes.iter().all(|n| n.time < outcome.position));
        assert_eq!(history.parent, Some(HistoryId(0)));
        assert_eq!(engine.history_id(), Some(outcome.history));

        let queued = engine.queued_notes();
        assert_eq!(queued.len(), outcome.replayed);
        assert!(queued
            .iter()
            .all(|n| n.is_replay && n.time >= outcome.position && n.time < outcome.call_model_end));

        assert_eq!(engine.archive().len(), 1);
        assert!(engine.active().is_empty());
        assert!(!engine.generation().is_running());
        assert!((engine.generation().call_model_end() - outcome.call_model_end).abs() < 1e-12);

        // Debounced restart under a fresh epoch, starting at the replay end.
        engine.take_requests();
        engine.advance(0.3);
        assert!(!engine.generation().is_running());
        engine.advance(0.3);
        assert!(engine.generation().is_running());
        assert!(engine.generation().epoch() > old_epoch);
        let requests = engine.take_requests();
        assert_eq!(requests.len(), 1);
        assert!((requests[0].window_end - outcome.call_model_end).abs() < 1e-9);
    }

    #[test]
    fn test_response_from_before_rewind_is_discarded() {
        let mut engine = committed_engine();
        for _ in 0..40 {
            engine.advance(0.05);
            pump(&mut engine);
        }
        // Let a tick fire without answering it.
        for _ in 0..50 {
            engine.advance(0.05);
        }
        let in_flight = engine.take_requests();
        assert!(!in_flight.is_empty());

        engine.rewind().expect("rewind");
        let queued = engine.queue_len();
        let history_len = engine.history().expect("history").notes.len();
        for request in in_flight {
            let accepted = engine.apply_generation(GenerationResponse {
                epoch: request.epoch,
                notes: Some(EchoModel::respond(&request)),
            });
            assert_eq!(accepted, 0);
        }
        assert_eq!(engine.queue_len(), queued);
        assert_eq!(engine.history().expect("history").notes.len(), history_len);
    }

    #[test]
    fn test_rapid_rewinds_debounce_restart() {
        let mut engine = committed_engine();
        for _ in 0..60 {
            engine.advance(0.05);
            pump(&mut engine);
        }
        engine.rewind().expect("first");
        engine.advance(0.2);
        engine.rewind().expect("second");
        engine.advance(0.4);
        assert!(!engine.generation().is_running());
        engine.advance(0.2);
        assert!(engine.generation().is_running());
        assert_eq!(engine.archive().len(), 2);
    }

    #[test]
    fn test_idle_timeout_resets_session() {
        let mut config = DuetConfig::default();
        config.watchdog.idle_timeout_secs = 10.0;
        config.watchdog.check_secs = 1.0;
        let mut engine = engine_with(config);
        play_seed(&mut engine);
        step_until(&mut engine, 400, |e| e.phase() == SeedPhase::Idle);

        assert!(engine.history().is_none());
        assert_eq!(engine.queue_len(), 0);
        assert!(engine.buffer().is_empty());
        assert!(engine.active().is_empty());
        assert!(!engine.generation().is_running());
        assert_eq!(engine.archive().len(), 1);
        assert!(engine.sink().events.contains(&SinkEvent::StopAll));
        assert!(engine.sink().signals().contains(&Signal::IdleStart));

        // Late answers from the dead session change nothing.
        assert_eq!(pump(&mut engine), 0);
        engine.advance(5.0);
        assert_eq!(engine.queue_len(), 0);
    }

    #[test]
    fn test_activity_keeps_session_alive() {
        let mut config = DuetConfig::default();
        config.watchdog.idle_timeout_secs = 3.0;
        config.watchdog.check_secs = 0.5;
        let mut engine = engine_with(config);
        for _ in 0..10 {
            engine.key_down(30, 0.5);
            engine.advance(0.1);
            engine.key_up(30);
            engine.advance(2.0);
        }
        assert_ne!(engine.phase(), SeedPhase::Idle);
    }

    #[test]
    fn test_load_shared_replays_then_generates() {
        let mut engine = engine();
        let mut shared = History::new("shared", 90.0);
        shared.push(Note::new(2, 0.6, NoteLength::Seconds(0.2), 0.5, Actor::Bot));
        shared.push(Note::new(4, 0.6, NoteLength::Held, 1.0, Actor::Player));
        shared.push(Note::new(99, 0.6, NoteLength::Seconds(0.2), 1.1, Actor::Player));
        shared.last_seed_note_time = 1.0;

        engine.load_shared(shared);
        assert_eq!(engine.phase(), SeedPhase::Committed);
        assert_eq!(engine.queue_len(), 2);
        assert!((engine.tempo().bpm - 90.0).abs() < 1e-9);
        assert!(engine.generation().is_running());

        for _ in 0..40 {
            engine.advance(0.05);
        }
        let triggers: Vec<_> = engine.sink().triggers().collect();
        assert_eq!(triggers.len(), 2);
        assert!(triggers.iter().all(|t| t.is_replay));
        assert!(!engine.take_requests().is_empty());
        assert!(engine.rewind().is_some());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut engine = engine();
        engine.reset();
        assert!(engine.sink().events.is_empty());
        engine.key_down(3, 0.5);
        engine.reset();
        engine.reset();
        assert_eq!(engine.archive().len(), 1);
        assert_eq!(engine.phase(), SeedPhase::Idle);
    }

    #[test]
    fn test_reset_releases_archived_histories() {
        let mut engine = engine();
        for _ in 0..5 {
            engine.key_down(3, 0.5);
            engine.advance(0.2);
            engine.key_up(3);
            engine.reset();
            assert!(engine.histories().is_empty());
        }
        assert_eq!(engine.archive().len(), 5);
    }
}
