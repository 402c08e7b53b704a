// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! The scheduler: translates beats into wall-clock time, owns the beat
//! clock, invokes user callbacks on the beat, applies code updates, and
//! emits timestamped MIDI events to the engine.
//!
//! The embedded language interpreter is a collaborator, not a part of this
//! crate: user code reaches the runtime as boxed closures. A periodic
//! callback models temporal recursion by returning
//! [CallbackOutcome::Reschedule]; [CallbackOutcome::Exit] is the graceful
//! end-of-session signal.

use crate::{
    midi::{MidiChannel, MidiEventAt, MidiMessage, SysexCommand, SysexKind},
    orchestration::Engine,
    types::{MicroBeat, Tempo},
};
use log::info;
use std::{
    collections::BTreeMap,
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// What a callback asks the scheduler to do next.
#[derive(Debug)]
pub enum CallbackOutcome {
    /// Forget the callback.
    Done,
    /// Keep the callback and run it again at the given beat. This is how a
    /// live loop recurs.
    Reschedule(MicroBeat),
    /// End the session cleanly (the SystemExit of an embedded language).
    Exit,
}

/// A scheduled user callback.
pub type Callback = Box<dyn FnMut(&mut RuntimeApi) -> CallbackOutcome + Send>;

/// A code update: evaluated once, between callbacks.
pub type CodeUpdate = Box<dyn FnOnce(&mut RuntimeApi) -> CallbackOutcome + Send>;

/// Runs after each code update evaluation.
pub type PostEvalHook = Box<dyn FnMut(&mut RuntimeApi) + Send>;

#[derive(Debug)]
struct ClockState {
    bpm: f64,
    beat_us: f64,
    current_beat: MicroBeat,
    current_time: Instant,
}
impl ClockState {
    fn new_with(tempo: Tempo) -> Self {
        Self {
            bpm: tempo.value(),
            beat_us: tempo.beat_us(),
            current_beat: MicroBeat::default(),
            current_time: Instant::now(),
        }
    }

    fn set_bpm(&mut self, bpm: f64) -> f64 {
        info!("Setting BPM to {bpm}");
        self.bpm = bpm;
        self.beat_us = Tempo(bpm).beat_us();
        self.bpm
    }

    /// When the given beat is due. A beat at or before the current one is
    /// due immediately.
    fn micro_beat_to_instant(&self, at: MicroBeat) -> Instant {
        let diff_mb = if at > self.current_beat {
            at - self.current_beat
        } else {
            MicroBeat(0)
        };
        let diff_us = (diff_mb.0 as f64 * self.beat_us) / 1_000_000.0;
        self.current_time + Duration::from_micros(diff_us as u64)
    }

    /// How many µbeats elapse over the given wall-clock duration at the
    /// current tempo.
    fn duration_to_micro_beat(&self, duration: Duration) -> MicroBeat {
        let duration_us = duration.as_micros() as f64;
        MicroBeat((self.bpm * duration_us / 60.0) as u64)
    }
}

/// The operations user code may call while it runs on the runtime thread:
/// scheduling, tempo, and MIDI emission. MIDI events are stamped with the
/// logical beat's instant, so callback execution time doesn't skew them.
pub struct RuntimeApi<'a> {
    clock: &'a mut ClockState,
    engine: &'a Engine,
    new_callbacks: Vec<(MicroBeat, Callback)>,
}
impl<'a> RuntimeApi<'a> {
    /// Schedules a callback at the given beat. Within one beat, callbacks
    /// run in scheduling order.
    pub fn schedule(&mut self, at: MicroBeat, callback: Callback) {
        self.new_callbacks.push((at, callback));
    }

    /// Updates the tempo. Affects future beat-to-time conversions only; the
    /// current beat position is kept.
    pub fn set_bpm(&mut self, bpm: f64) -> f64 {
        self.clock.set_bpm(bpm)
    }

    #[allow(missing_docs)]
    pub fn bpm(&self) -> f64 {
        self.clock.bpm
    }

    #[allow(missing_docs)]
    pub fn current_beat(&self) -> MicroBeat {
        self.clock.current_beat
    }

    #[allow(missing_docs)]
    pub fn midi_note_on(&mut self, track: &str, channel: MidiChannel, note: u8, velocity: u8) {
        self.push(track, MidiMessage::note_on(channel, note, velocity));
    }

    #[allow(missing_docs)]
    pub fn midi_note_off(&mut self, track: &str, channel: MidiChannel, note: u8, velocity: u8) {
        self.push(track, MidiMessage::note_off(channel, note, velocity));
    }

    #[allow(missing_docs)]
    pub fn midi_cc(&mut self, track: &str, channel: MidiChannel, controller: u8, value: u8) {
        self.push(track, MidiMessage::control_change(channel, controller, value));
    }

    /// Sends an in-process command to a track (or to the reserved controls
    /// pseudo-track).
    pub fn midi_sysex(&mut self, track: &str, kind: SysexKind, json: &str) {
        self.push(track, MidiMessage::Sysex(SysexCommand::new(kind, json)));
    }

    fn push(&mut self, track: &str, message: MidiMessage) {
        self.engine
            .push_midi_event(MidiEventAt::new(track, message, self.clock.current_time));
    }
}

#[derive(Default)]
struct LoopState {
    running: bool,
    code: Option<CodeUpdate>,
}

#[derive(Default)]
struct LoopShared {
    state: Mutex<LoopState>,
    cv: Condvar,
}

/// The scheduling half of the system. One runtime drives one engine; the
/// runtime thread is the only thread that ever invokes user callbacks.
pub struct Runtime {
    engine: Arc<Engine>,
    clock: Arc<Mutex<ClockState>>,
    shared: Arc<LoopShared>,
    post_eval_hook: Option<PostEvalHook>,
    thread: Option<JoinHandle<()>>,
}
impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("running", &self.thread.is_some())
            .finish()
    }
}
impl Runtime {
    #[allow(missing_docs)]
    pub fn new_with(engine: &Arc<Engine>, initial_tempo: Tempo) -> Self {
        info!("Initializing runtime");
        Self {
            engine: Arc::clone(engine),
            clock: Arc::new(Mutex::new(ClockState::new_with(initial_tempo))),
            shared: Default::default(),
            post_eval_hook: None,
            thread: None,
        }
    }

    /// Installs a hook that runs after every code-update evaluation. Must be
    /// set before [Runtime::start].
    pub fn set_post_eval_hook(&mut self, hook: PostEvalHook) {
        self.post_eval_hook = Some(hook);
    }

    /// Spawns the runtime thread.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        info!("Starting runtime");

        self.shared.state.lock().unwrap().running = true;
        self.clock.lock().unwrap().current_time = Instant::now();

        let engine = Arc::clone(&self.engine);
        let clock = Arc::clone(&self.clock);
        let shared = Arc::clone(&self.shared);
        let hook = self.post_eval_hook.take();
        self.thread = Some(std::thread::spawn(move || {
            Self::run(&engine, &clock, &shared, hook);
        }));
    }

    /// Signals the runtime thread and joins it. Idempotent.
    pub fn stop(&mut self) {
        info!("Stopping runtime");
        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = false;
            self.shared.cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!("Runtime stopped");
    }

    /// Queues a code update. Single slot: a newer update overwrites an
    /// unapplied one. Wakes the loop immediately.
    pub fn push_code_update(&self, code: CodeUpdate) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.code = Some(code);
            self.shared.cv.notify_all();
        }
        info!("Code update queued");
    }

    #[allow(missing_docs)]
    pub fn bpm(&self) -> f64 {
        self.clock.lock().unwrap().bpm
    }

    #[allow(missing_docs)]
    pub fn current_beat(&self) -> MicroBeat {
        self.clock.lock().unwrap().current_beat
    }

    /// Whether the runtime thread is still running (it exits on
    /// [CallbackOutcome::Exit]).
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().unwrap().running
    }

    fn run(
        engine: &Engine,
        clock: &Mutex<ClockState>,
        shared: &LoopShared,
        mut hook: Option<PostEvalHook>,
    ) {
        // The schedule is keyed by (beat, insertion id): callbacks for an
        // earlier beat always run first, and within one beat insertion
        // order wins.
        let mut schedule: BTreeMap<(MicroBeat, u64), Callback> = BTreeMap::default();
        let mut next_id: u64 = 0;

        // Seed the self-rescheduling beat tick so the schedule is never
        // empty and the clock always has a next wake-up.
        let seed_at = clock.lock().unwrap().current_beat + MicroBeat::ONE_BEAT;
        schedule.insert(
            (seed_at, next_id),
            Box::new(|api: &mut RuntimeApi| {
                CallbackOutcome::Reschedule(api.current_beat() + MicroBeat::ONE_BEAT)
            }),
        );
        next_id += 1;

        loop {
            let (at, id) = *schedule.keys().next().expect("beat tick keeps schedule non-empty");
            let due = clock.lock().unwrap().micro_beat_to_instant(at);

            // Wait for the due time, a code update, or stop.
            let code = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if !state.running {
                        info!("Received stop signal");
                        return;
                    }
                    if state.code.is_some() {
                        break state.code.take();
                    }
                    let now = Instant::now();
                    if now >= due {
                        break None;
                    }
                    let (next, _) = shared.cv.wait_timeout(state, due - now).unwrap();
                    state = next;
                }
            };

            // Process the next callback if its time has passed.
            if Instant::now() >= due {
                let mut callback = schedule
                    .remove(&(at, id))
                    .expect("first key was just observed");

                let mut clock_guard = clock.lock().unwrap();
                // Set before invoking so the callback sees accurate timing.
                clock_guard.current_time = due;
                clock_guard.current_beat = at;

                let mut api = RuntimeApi {
                    clock: &mut *clock_guard,
                    engine,
                    new_callbacks: Vec::default(),
                };
                let outcome = callback(&mut api);
                let new_callbacks = std::mem::take(&mut api.new_callbacks);
                drop(clock_guard);

                for (new_at, new_callback) in new_callbacks {
                    schedule.insert((new_at, next_id), new_callback);
                    next_id += 1;
                }
                match outcome {
                    CallbackOutcome::Done => {}
                    CallbackOutcome::Reschedule(new_at) => {
                        schedule.insert((new_at, next_id), callback);
                        next_id += 1;
                    }
                    CallbackOutcome::Exit => {
                        info!("Received exit, stopping runtime");
                        shared.state.lock().unwrap().running = false;
                        return;
                    }
                }
            }

            // Code updates are applied after the temporal recursions so
            // beat-critical callbacks stay on time; a code update may take
            // milliseconds without pushing subsequent events off-beat.
            if let Some(code) = code {
                let mut clock_guard = clock.lock().unwrap();

                // Advance the beat by the actual elapsed time, without
                // touching current_time: subsequent callbacks must not
                // inherit the code update's latency, while new loops created
                // by this code still align to the live beat.
                let elapsed = Instant::now().duration_since(clock_guard.current_time);
                let advance = clock_guard.duration_to_micro_beat(elapsed);
                clock_guard.current_beat += advance;

                let mut api = RuntimeApi {
                    clock: &mut *clock_guard,
                    engine,
                    new_callbacks: Vec::default(),
                };
                let outcome = code(&mut api);
                if let Some(hook) = hook.as_mut() {
                    hook(&mut api);
                }
                let new_callbacks = std::mem::take(&mut api.new_callbacks);
                drop(clock_guard);

                for (new_at, new_callback) in new_callbacks {
                    schedule.insert((new_at, next_id), new_callback);
                    next_id += 1;
                }
                if let CallbackOutcome::Exit = outcome {
                    info!("Received exit, stopping runtime");
                    shared.state.lock().unwrap().running = false;
                    return;
                }
            }
        }
    }
}
impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
