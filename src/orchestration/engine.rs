// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! The engine: a block clock, a track map, and the DSP loop that turns both
//! into a continuous stereo stream.
//!
//! The loop waits on an absolute schedule (`t₀ + N·block_duration`) rather
//! than incremental sleeps, so the block clock cannot drift. Each iteration
//! drains the MIDI inbox, stamps wall-clock events onto the sample-tick
//! timeline, fans the block out to every track worker in parallel, joins the
//! results additively, and hands the finished block to every registered
//! consumer.

use super::track::{Track, TrackSettings};
use crate::{
    automation::Controls,
    elements::LevelMeter,
    midi::MidiEventAt,
    services::{AudioOutput, WavRecorder},
    traits::SampleConsumer,
    types::{
        block_duration, AudioBuffer, Levels, SampleTick, BLOCK_PROCESSING_DELAY, BLOCK_SIZE,
        INTERNAL_CONTROLS_TRACK, SAMPLE_RATE,
    },
    util::{EngineSettings, SampleBank},
    vst::PluginHost,
};
use log::{error, info, warn};
use rustc_hash::FxHashMap;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::Instant,
};

#[derive(Debug, Default)]
struct Clock {
    stop: Mutex<bool>,
    cv: Condvar,
}
impl Clock {
    /// Sleeps until the deadline unless stop is requested first. Returns
    /// true when stopping.
    fn wait_until_or_stop(&self, deadline: Instant) -> bool {
        let mut stop = self.stop.lock().unwrap();
        loop {
            if *stop {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.cv.wait_timeout(stop, deadline - now).unwrap();
            stop = next;
        }
    }

    fn request_stop(&self) {
        *self.stop.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.stop.lock().unwrap() = false;
    }
}

#[derive(Debug)]
struct EngineInner {
    clock: Clock,
    current_tick: AtomicU64,

    // Tracks are created and replaced by setup_tracks and locked briefly by
    // the DSP loop during each block.
    tracks: Mutex<BTreeMap<String, Track>>,
    setup_tracks: Mutex<()>,

    // MIDI events are pushed by the runtime (or any caller) and drained by
    // the DSP loop at each block boundary.
    msgs_by_track: Mutex<FxHashMap<String, Vec<MidiEventAt>>>,

    consumers: Mutex<Vec<Arc<dyn SampleConsumer>>>,

    controls: Arc<Controls>,
    samples: Arc<SampleBank>,
    plugins: Arc<PluginHost>,
    master_meter: LevelMeter,
}
impl EngineInner {
    /// Projects wall-clock instants onto the sample-tick timeline. The
    /// fixed look-ahead guarantees the stamped tick is still in the future
    /// when the owning track processes it, and gives external-MIDI workers
    /// enough headroom to hit hardware on time.
    fn stamp_ticks(&self, events: &mut [MidiEventAt], current_tick: SampleTick) {
        let now = Instant::now();
        for event in events.iter_mut() {
            let diff_us: i64 = match event.at().checked_duration_since(now) {
                Some(ahead) => ahead.as_micros() as i64,
                None => -(now.duration_since(event.at()).as_micros() as i64),
            };
            let mut diff_ticks = diff_us * SAMPLE_RATE as i64 / 1_000_000;
            diff_ticks += (BLOCK_PROCESSING_DELAY * BLOCK_SIZE) as i64;
            diff_ticks = diff_ticks.max(0);
            event.set_tick(current_tick + diff_ticks as SampleTick);
        }
    }

    fn run(&self) {
        info!("Engine running");

        let mut out = AudioBuffer::default();
        let block_duration = block_duration();
        let initial_time = Instant::now();
        let mut block_count: u64 = 0;

        loop {
            if self
                .clock
                .wait_until_or_stop(initial_time + block_duration * block_count as u32)
            {
                break;
            }

            let current_tick = self.current_tick.load(Ordering::Relaxed);

            let mut events_by_track = {
                let mut msgs = self.msgs_by_track.lock().unwrap();
                std::mem::take(&mut *msgs)
            };

            // Knobs update before rendering so DSP code bound to them sees
            // fresh values, including knobs this very block creates.
            let mut control_events = events_by_track
                .remove(INTERNAL_CONTROLS_TRACK)
                .unwrap_or_default();
            self.stamp_ticks(&mut control_events, current_tick);
            self.controls.add_events(control_events);
            self.controls.advance_to(current_tick);

            // Kick off all track rendering in parallel.
            {
                let tracks = self.tracks.lock().unwrap();
                for (name, track) in tracks.iter() {
                    let mut events = events_by_track.remove(name).unwrap_or_default();
                    self.stamp_ticks(&mut events, current_tick);
                    track.render_async(current_tick, events);
                }
            }

            out.reset();

            // Join in any order: the mix is a sum.
            {
                let tracks = self.tracks.lock().unwrap();
                for track in tracks.values() {
                    track.join(&mut out);
                }
            }

            self.master_meter.process(out.left(), out.right());

            self.current_tick
                .store(current_tick + BLOCK_SIZE as SampleTick, Ordering::Relaxed);

            {
                let consumers = self.consumers.lock().unwrap();
                for consumer in consumers.iter() {
                    if let Err(e) = consumer.push_audio_buffer(&out) {
                        warn!("Failed to push samples to {}: {e}", consumer.name());
                    }
                }
            }

            block_count += 1;
        }

        info!("Engine stopped");
    }
}

/// The real-time half of the system. Owns the block clock, the track graph,
/// the controls registry, and the consumer list; everything on it is callable
/// from any thread.
#[derive(Debug)]
pub struct Engine {
    inner: Arc<EngineInner>,
    dsp_thread: Mutex<Option<JoinHandle<()>>>,
    audio_output: Mutex<Option<Arc<AudioOutput>>>,
    recorder: Mutex<Option<Arc<WavRecorder>>>,
}
impl Engine {
    /// Builds an engine from settings: loads sample packs, scans plugins,
    /// and (only when enabled) opens the audio output device. Device failure
    /// with output enabled is the one fatal error here.
    pub fn new_with(settings: &EngineSettings) -> anyhow::Result<Self> {
        info!("Initializing engine");

        let audio_output = if settings.dsp.enable_output {
            Some(Arc::new(AudioOutput::new_with(
                settings.dsp.output_device.as_deref(),
            )?))
        } else {
            info!("Audio output disabled");
            None
        };

        let samples = Arc::new(SampleBank::default());
        if let Some(dir) = &settings.sample_directory {
            samples.load_directory(dir)?;
        }
        info!("Sample bank initialized");

        let plugins = Arc::new(PluginHost::new_with(&settings.plugin_paths));
        if let Err(e) = plugins.scan() {
            warn!("Failed to scan plugins: {e}");
        }

        Ok(Self {
            inner: Arc::new(EngineInner {
                clock: Clock::default(),
                current_tick: AtomicU64::new(0),
                tracks: Default::default(),
                setup_tracks: Mutex::new(()),
                msgs_by_track: Default::default(),
                consumers: Default::default(),
                controls: Arc::new(Controls::default()),
                samples,
                plugins,
                master_meter: LevelMeter::default(),
            }),
            dsp_thread: Mutex::new(None),
            audio_output: Mutex::new(audio_output),
            recorder: Mutex::new(None),
        })
    }

    /// Spawns the DSP thread and, when output is enabled, registers and
    /// starts the audio adapter. The DSP loop keeps running even if the
    /// audio device refuses to start; the error is surfaced to the caller.
    pub fn start(&self) -> anyhow::Result<()> {
        info!("Starting engine");

        // There are no tracks at engine start; they arrive later through
        // setup_tracks.
        {
            let mut dsp_thread = self.dsp_thread.lock().unwrap();
            if dsp_thread.is_some() {
                return Ok(());
            }
            self.inner.clock.reset();
            let inner = Arc::clone(&self.inner);
            *dsp_thread = Some(std::thread::spawn(move || inner.run()));
        }

        if let Some(output) = self.audio_output.lock().unwrap().clone() {
            self.register_consumer(output.clone());
            if let Err(e) = output.play() {
                error!("Failed to start audio output: {e}");
                return Err(e);
            }
        }

        Ok(())
    }

    /// Stops consumers, the DSP thread, and every track. Idempotent.
    pub fn stop(&self) -> anyhow::Result<()> {
        info!("Stopping engine");

        if let Some(output) = self.audio_output.lock().unwrap().clone() {
            let _ = output.pause();
            self.remove_consumer(&(output as Arc<dyn SampleConsumer>));
        }

        self.inner.clock.request_stop();
        if let Some(handle) = self.dsp_thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Dropping the map joins each track's worker. Take it out of the
        // mutex first so nothing waits on the tracks lock during the joins.
        let old_tracks = {
            let mut tracks = self.inner.tracks.lock().unwrap();
            std::mem::take(&mut *tracks)
        };
        drop(old_tracks);

        Ok(())
    }

    /// Appends one event to the inbox. O(1); callable from any thread.
    pub fn push_midi_event(&self, event: MidiEventAt) {
        let mut msgs = self.inner.msgs_by_track.lock().unwrap();
        msgs.entry(event.track().to_string()).or_default().push(event);
    }

    /// Reconfigures the track graph. Atomic from the DSP loop's point of
    /// view: it sees the old set or the new set, never a half-updated one.
    ///
    /// Existing tracks whose shape is unchanged are updated in place; new or
    /// reshaped tracks are built and started outside the tracks lock (the
    /// slow part), then swapped in. Tracks absent from the request are
    /// dropped, which joins their workers. The first initialization failure
    /// aborts the call with the live map untouched.
    pub fn setup_tracks(&self, settings: &[TrackSettings]) -> anyhow::Result<()> {
        // Serialize concurrent reconfigurations; the two-phase dance below
        // is only atomic against the DSP loop, not against another caller.
        let _setup = self.inner.setup_tracks.lock().unwrap();

        // Last writer wins when the same name appears twice.
        let mut requested: BTreeMap<String, TrackSettings> = BTreeMap::default();
        for track_settings in settings {
            requested.insert(track_settings.name.clone(), track_settings.clone());
        }

        let mut to_add: Vec<TrackSettings> = Vec::default();
        let mut to_update: Vec<TrackSettings> = Vec::default();
        {
            let tracks = self.inner.tracks.lock().unwrap();
            for (name, track_settings) in &requested {
                match tracks.get(name) {
                    Some(track) if track.can_fast_update(track_settings) => {
                        to_update.push(track_settings.clone())
                    }
                    _ => to_add.push(track_settings.clone()),
                }
            }
        }

        // Slow part: build and start new tracks with no engine lock held.
        let mut updated_tracks: BTreeMap<String, Track> = BTreeMap::default();
        for track_settings in to_add {
            let mut track = Track::new_with(
                &track_settings,
                &self.inner.samples,
                &self.inner.controls,
                &self.inner.plugins,
            )
            .map_err(|e| {
                error!("Failed to initialize track {}: {e}", track_settings.name);
                e
            })?;
            track.start()?;
            updated_tracks.insert(track_settings.name.clone(), track);
        }

        let old_tracks = {
            let mut tracks = self.inner.tracks.lock().unwrap();
            for track_settings in to_update {
                // Fast updates can't fail; a failure here would leave the
                // swap half-applied.
                if let Some(track) = tracks.remove(&track_settings.name) {
                    track.fast_update(&track_settings);
                    updated_tracks.insert(track_settings.name.clone(), track);
                }
            }
            std::mem::replace(&mut *tracks, updated_tracks)
        };

        // Dropped tracks join their workers here, outside the tracks lock.
        drop(old_tracks);

        Ok(())
    }

    /// Snapshots of every track's settings, ordered by name.
    pub fn tracks(&self) -> Vec<TrackSettings> {
        let tracks = self.inner.tracks.lock().unwrap();
        tracks.values().map(|track| track.settings()).collect()
    }

    #[allow(missing_docs)]
    pub fn master_levels(&self) -> Levels {
        self.inner.master_meter.levels()
    }

    /// Levels for one track, or `None` if it doesn't exist.
    pub fn track_levels(&self, name: &str) -> Option<Levels> {
        let tracks = self.inner.tracks.lock().unwrap();
        tracks.get(name).map(|track| track.levels())
    }

    /// The number of samples rendered since start.
    pub fn current_tick(&self) -> SampleTick {
        self.inner.current_tick.load(Ordering::Relaxed)
    }

    #[allow(missing_docs)]
    pub fn controls(&self) -> &Arc<Controls> {
        &self.inner.controls
    }

    #[allow(missing_docs)]
    pub fn samples(&self) -> &Arc<SampleBank> {
        &self.inner.samples
    }

    #[allow(missing_docs)]
    pub fn plugins(&self) -> &Arc<PluginHost> {
        &self.inner.plugins
    }

    /// Adds a consumer to the fan-out list.
    pub fn register_consumer(&self, consumer: Arc<dyn SampleConsumer>) {
        info!("Registering engine consumer {}", consumer.name());
        self.inner.consumers.lock().unwrap().push(consumer);
    }

    /// Removes a previously registered consumer.
    pub fn remove_consumer(&self, consumer: &Arc<dyn SampleConsumer>) {
        info!("Removing engine consumer {}", consumer.name());
        self.inner
            .consumers
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, consumer));
    }

    /// Attaches a WAV recorder writing to `path`. Replaces any recording in
    /// progress.
    pub fn start_recording(&self, path: &std::path::Path) -> anyhow::Result<()> {
        self.stop_recording()?;

        let recorder = Arc::new(WavRecorder::new_with(path)?);
        self.register_consumer(recorder.clone());
        *self.recorder.lock().unwrap() = Some(recorder);

        info!("Started recording to: {}", path.display());
        Ok(())
    }

    /// Detaches the recorder and finalizes the file. A no-op when nothing is
    /// recording.
    pub fn stop_recording(&self) -> anyhow::Result<()> {
        let Some(recorder) = self.recorder.lock().unwrap().take() else {
            return Ok(());
        };

        self.remove_consumer(&(recorder.clone() as Arc<dyn SampleConsumer>));
        recorder.finalize()?;

        info!("Stopped recording");
        Ok(())
    }
}
impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{MidiChannel, MidiMessage};
    use more_asserts::{assert_ge, assert_le};
    use std::time::Duration;

    fn event_at(at: Instant) -> MidiEventAt {
        MidiEventAt::new("t", MidiMessage::note_on(MidiChannel::new(0), 60, 100), at)
    }

    #[test]
    fn stamping_applies_the_lookahead() {
        let engine = Engine::new_with(&EngineSettings::default()).unwrap();
        let current_tick = 10_000;

        let mut events = vec![event_at(Instant::now())];
        engine.inner.stamp_ticks(&mut events, current_tick);

        // An event due "now" lands one look-ahead later, give or take the
        // stamping call's own latency.
        let tick = events[0].tick().unwrap();
        assert_ge!(
            tick,
            current_tick + ((BLOCK_PROCESSING_DELAY - 1) * BLOCK_SIZE) as u64
        );
        assert_le!(
            tick,
            current_tick + (BLOCK_PROCESSING_DELAY * BLOCK_SIZE) as u64
        );
    }

    #[test]
    fn stamping_is_monotone_in_wall_clock() {
        let engine = Engine::new_with(&EngineSettings::default()).unwrap();
        let now = Instant::now();

        let mut events = vec![
            event_at(now + Duration::from_millis(10)),
            event_at(now + Duration::from_millis(20)),
            event_at(now + Duration::from_millis(30)),
        ];
        engine.inner.stamp_ticks(&mut events, 0);

        let ticks: Vec<_> = events.iter().map(|e| e.tick().unwrap()).collect();
        assert_le!(ticks[0], ticks[1]);
        assert_le!(ticks[1], ticks[2]);

        // 10ms apart at 48kHz is 480 ticks apart.
        let gap = ticks[1] - ticks[0];
        assert_ge!(gap, 430);
        assert_le!(gap, 530);
    }

    #[test]
    fn stamping_clamps_stale_events_to_now() {
        let engine = Engine::new_with(&EngineSettings::default()).unwrap();
        let long_ago = Instant::now() - Duration::from_secs(5);

        let mut events = vec![event_at(long_ago)];
        engine.inner.stamp_ticks(&mut events, 123);

        // Far-past instants would go negative: they clamp to the block's
        // start instead of time-traveling.
        assert_eq!(events[0].tick(), Some(123));
    }
}
