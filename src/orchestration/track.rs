// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! A track owns one instrument and one effect chain, rendered by a dedicated
//! worker thread. The DSP loop drives every track through a two-phase
//! contract: [Track::render_async] publishes the block's work and returns
//! immediately; [Track::join] waits for the result and mixes it into the
//! output with per-sample volume and pan.

use crate::{
    automation::{Controls, Parameter, ParameterDef},
    cores::{
        effects::{FxChain, FxSettings},
        instruments::{build_instrument, InstrumentKind},
    },
    elements::{left_pan, right_pan, LevelMeter},
    midi::MidiEventAt,
    traits::Instrument,
    types::{AudioBuffer, Levels, SampleTick},
    util::SampleBank,
    vst::PluginHost,
};
use derivative::Derivative;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
};

/// Everything a caller specifies about a track. `extra` is the instrument's
/// opaque JSON configuration.
#[derive(Clone, Debug, Derivative, PartialEq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrackSettings {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub instrument: InstrumentKind,
    #[allow(missing_docs)]
    pub muted: bool,
    #[allow(missing_docs)]
    #[derivative(Default(value = "ParameterDef::Constant(1.0)"))]
    pub volume: ParameterDef,
    #[allow(missing_docs)]
    pub pan: ParameterDef,
    /// Instrument configuration as JSON; what's accepted depends on the
    /// instrument kind.
    pub extra: String,
    /// The effect chain, in processing order.
    pub fxs: Vec<FxSettings>,
}
impl TrackSettings {
    #[allow(missing_docs)]
    pub fn new_with(name: &str, instrument: InstrumentKind) -> Self {
        Self {
            name: name.to_string(),
            instrument,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct WorkState {
    stop: bool,
    has_work: bool,
    work_done: bool,
    tick: SampleTick,
    events: Vec<MidiEventAt>,
}

#[derive(Debug, Default)]
struct WorkShared {
    state: Mutex<WorkState>,
    work_cv: Condvar,
    done_cv: Condvar,
}

/// Mixer-facing state, read per sample at join time.
#[derive(Debug)]
struct MixState {
    settings: TrackSettings,
    volume: Parameter,
    pan: Parameter,
}
impl MixState {
    fn new_with(settings: &TrackSettings, controls: &Arc<Controls>) -> Self {
        Self {
            settings: settings.clone(),
            volume: settings.volume.resolve(controls).with_range(0.0, 1.0),
            pan: settings.pan.resolve(controls).with_range(-1.0, 1.0),
        }
    }
}

/// The render-facing state, owned by the worker during a block.
#[derive(Debug)]
struct DspState {
    instrument: Box<dyn Instrument>,
    fx: FxChain,
}

/// A live track: one instrument, one effect chain, one worker thread.
pub struct Track {
    name: String,
    work: Arc<WorkShared>,
    mix: Arc<Mutex<MixState>>,
    dsp: Arc<Mutex<DspState>>,
    render_buffer: Arc<Mutex<AudioBuffer>>,
    meter: Arc<LevelMeter>,
    controls: Arc<Controls>,
    worker: Option<JoinHandle<()>>,
}
impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("name", &self.name)
            .field("running", &self.worker.is_some())
            .finish()
    }
}
impl Track {
    /// Builds a track: instantiates its instrument and effect chain. This is
    /// the slow path (sample loading, device/plugin setup), so the engine
    /// runs it outside the locks the DSP loop takes.
    pub fn new_with(
        settings: &TrackSettings,
        samples: &Arc<SampleBank>,
        controls: &Arc<Controls>,
        plugins: &Arc<PluginHost>,
    ) -> anyhow::Result<Self> {
        let instrument = build_instrument(
            settings.instrument,
            &settings.extra,
            samples,
            controls,
            plugins,
        )?;
        let fx = FxChain::new_with(&settings.fxs, controls, plugins)?;

        Ok(Self {
            name: settings.name.clone(),
            work: Default::default(),
            mix: Arc::new(Mutex::new(MixState::new_with(settings, controls))),
            dsp: Arc::new(Mutex::new(DspState { instrument, fx })),
            render_buffer: Arc::new(Mutex::new(AudioBuffer::default())),
            meter: Default::default(),
            controls: Arc::clone(controls),
            worker: None,
        })
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A snapshot of the track's current settings.
    pub fn settings(&self) -> TrackSettings {
        self.mix.lock().unwrap().settings.clone()
    }

    #[allow(missing_docs)]
    pub fn levels(&self) -> Levels {
        self.meter.levels()
    }

    /// Starts the worker thread and the instrument.
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        info!("Starting track thread for: {}", self.name);

        self.dsp.lock().unwrap().instrument.start()?;

        {
            let mut state = self.work.state.lock().unwrap();
            state.stop = false;
            state.has_work = false;
            state.work_done = true;
        }

        let work = Arc::clone(&self.work);
        let dsp = Arc::clone(&self.dsp);
        let render_buffer = Arc::clone(&self.render_buffer);
        let meter = Arc::clone(&self.meter);
        let name = self.name.clone();
        self.worker = Some(std::thread::spawn(move || {
            Self::process_loop(&name, &work, &dsp, &render_buffer, &meter);
        }));

        Ok(())
    }

    /// Signals the worker, joins it, and stops the instrument. Idempotent.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(worker) = self.worker.take() {
            info!("Stopping track thread for: {}", self.name);
            {
                let mut state = self.work.state.lock().unwrap();
                state.stop = true;
                self.work.work_cv.notify_all();
                self.work.done_cv.notify_all();
            }
            let _ = worker.join();
        }
        self.dsp.lock().unwrap().instrument.stop()
    }

    /// Publishes one block of work to the worker and returns immediately.
    /// Called only by the DSP thread.
    pub fn render_async(&self, tick: SampleTick, events: Vec<MidiEventAt>) {
        let mut state = self.work.state.lock().unwrap();
        state.tick = tick;
        state.events = events;
        state.has_work = true;
        state.work_done = false;
        self.work.work_cv.notify_one();
    }

    /// Waits for the worker to finish the published block, then mixes the
    /// track buffer into `output` with per-sample volume and equal-power
    /// pan. A muted track contributes nothing.
    pub fn join(&self, output: &mut AudioBuffer) {
        let tick = {
            let mut state = self.work.state.lock().unwrap();
            while !state.work_done && !state.stop {
                state = self.work.done_cv.wait(state).unwrap();
            }
            if state.stop {
                return;
            }
            state.tick
        };

        let mut mix = self.mix.lock().unwrap();
        if mix.settings.muted {
            return;
        }

        let track_buffer = self.render_buffer.lock().unwrap();
        let (in_left, in_right) = (track_buffer.left(), track_buffer.right());
        let (out_left, out_right) = output.channels_mut();

        for i in 0..in_left.len() {
            let current_tick = tick + i as SampleTick;
            let volume = mix.volume.value_at(current_tick);
            let pan = mix.pan.value_at(current_tick);

            out_left[i] += in_left[i] * volume * left_pan(pan);
            out_right[i] += in_right[i] * volume * right_pan(pan);
        }
    }

    /// Whether `settings` can be applied without rebuilding the track: the
    /// instrument kind is unchanged and the effect chain matches shape.
    pub fn can_fast_update(&self, settings: &TrackSettings) -> bool {
        if settings.instrument != self.mix.lock().unwrap().settings.instrument {
            return false;
        }
        self.dsp.lock().unwrap().fx.can_fast_update(&settings.fxs)
    }

    /// Applies new settings in place. Must not fail: only called after
    /// [Track::can_fast_update] said yes, and instrument configuration
    /// problems degrade to warnings.
    pub fn fast_update(&self, settings: &TrackSettings) {
        {
            let mut mix = self.mix.lock().unwrap();
            *mix = MixState::new_with(settings, &self.controls);
        }

        let mut dsp = self.dsp.lock().unwrap();
        if let Err(e) = dsp.instrument.apply_settings(&settings.extra) {
            warn!("Failed to fast-update instrument on {}: {e}", self.name);
        }
        dsp.fx.fast_update(&settings.fxs);
    }

    fn process_loop(
        name: &str,
        work: &WorkShared,
        dsp: &Mutex<DspState>,
        render_buffer: &Mutex<AudioBuffer>,
        meter: &LevelMeter,
    ) {
        info!("Track processing thread started for: {name}");

        loop {
            let (tick, events) = {
                let mut state = work.state.lock().unwrap();
                while !state.has_work && !state.stop {
                    state = work.work_cv.wait(state).unwrap();
                }
                if state.stop {
                    break;
                }
                state.has_work = false;
                (state.tick, std::mem::take(&mut state.events))
            };

            {
                let mut buffer = render_buffer.lock().unwrap();
                buffer.reset();

                let mut dsp = dsp.lock().unwrap();
                dsp.instrument.render(tick, &events, &mut buffer);
                dsp.fx.render(tick, &mut buffer, &events);

                meter.process(buffer.left(), buffer.right());
            }

            {
                let mut state = work.state.lock().unwrap();
                state.work_done = true;
                work.done_cv.notify_one();
            }
        }

        info!("Track processing thread stopped for: {name}");
    }
}
impl Drop for Track {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cores::effects::FxKind,
        midi::{MidiMessage, SysexCommand, SysexKind},
        util::{SampleData, SamplePack},
    };
    use more_asserts::assert_gt;
    use std::time::Instant;

    fn test_bank() -> Arc<SampleBank> {
        let bank = SampleBank::default();
        let mut pack = SamplePack::default();
        pack.insert(SampleData::new_with(
            "tone",
            vec![0.5; crate::types::SAMPLE_RATE],
            vec![0.5; crate::types::SAMPLE_RATE],
        ));
        bank.add_pack("test", pack);
        Arc::new(bank)
    }

    fn sampler_track(settings: &TrackSettings) -> Track {
        let controls = Arc::new(Controls::default());
        let plugins = Arc::new(PluginHost::default());
        Track::new_with(settings, &test_bank(), &controls, &plugins).unwrap()
    }

    fn play_event(tick: SampleTick) -> MidiEventAt {
        let mut event = MidiEventAt::new(
            "t1",
            MidiMessage::Sysex(SysexCommand::new(
                SysexKind::SamplerPlay,
                r#"{"pack": "test", "name": "tone"}"#,
            )),
            Instant::now(),
        );
        event.set_tick(tick);
        event
    }

    fn render_one_block(track: &Track, tick: SampleTick, events: Vec<MidiEventAt>) -> AudioBuffer {
        let mut output = AudioBuffer::default();
        track.render_async(tick, events);
        track.join(&mut output);
        output
    }

    #[test]
    fn render_join_round_trip_produces_audio() {
        let mut track = sampler_track(&TrackSettings::new_with("t1", InstrumentKind::Sampler));
        track.start().unwrap();

        let output = render_one_block(&track, 0, vec![play_event(0)]);
        assert_gt!(output.left()[200].abs(), 0.0);

        let levels = track.levels();
        assert_gt!(levels.peak_left, 0.0);

        track.stop().unwrap();
    }

    #[test]
    fn muted_track_contributes_nothing() {
        let mut settings = TrackSettings::new_with("t1", InstrumentKind::Sampler);
        settings.muted = true;
        let mut track = sampler_track(&settings);
        track.start().unwrap();

        let output = render_one_block(&track, 0, vec![play_event(0)]);
        assert!(output.left().iter().all(|&s| s == 0.0));

        track.stop().unwrap();
    }

    #[test]
    fn volume_scales_the_mix() {
        let mut settings = TrackSettings::new_with("t1", InstrumentKind::Sampler);
        settings.volume = ParameterDef::Constant(1.0);
        settings.pan = ParameterDef::Constant(0.0);
        let mut track = sampler_track(&settings);
        track.start().unwrap();
        let loud = render_one_block(&track, 0, vec![play_event(0)]);
        track.stop().unwrap();

        settings.volume = ParameterDef::Constant(0.5);
        let mut track = sampler_track(&settings);
        track.start().unwrap();
        let quiet = render_one_block(&track, 0, vec![play_event(0)]);
        track.stop().unwrap();

        let i = 300;
        assert_gt!(loud.left()[i], 1.9 * quiet.left()[i]);
    }

    #[test]
    fn hard_left_pan_silences_the_right_channel() {
        let mut settings = TrackSettings::new_with("t1", InstrumentKind::Sampler);
        settings.pan = ParameterDef::Constant(-1.0);
        let mut track = sampler_track(&settings);
        track.start().unwrap();

        let output = render_one_block(&track, 0, vec![play_event(0)]);
        assert_gt!(output.left()[300].abs(), 0.0);
        assert!(output.right().iter().all(|&s| s.abs() < 1e-6));

        track.stop().unwrap();
    }

    #[test]
    fn fast_update_rules() {
        let mut settings = TrackSettings::new_with("t1", InstrumentKind::Sampler);
        settings
            .fxs
            .push(FxSettings::new_with("f", FxKind::Lpf, "{}"));
        let track = sampler_track(&settings);

        // Parameter changes are fast; shape changes are not.
        let mut update = settings.clone();
        update.volume = ParameterDef::Constant(0.25);
        assert!(track.can_fast_update(&update));

        let mut new_instrument = settings.clone();
        new_instrument.instrument = InstrumentKind::ExternalMidi;
        assert!(!track.can_fast_update(&new_instrument));

        let mut new_chain = settings.clone();
        new_chain.fxs.push(FxSettings::new_with("e", FxKind::Echo, "{}"));
        assert!(!track.can_fast_update(&new_chain));
    }

    #[test]
    fn fast_update_applies_mix_settings() {
        let settings = TrackSettings::new_with("t1", InstrumentKind::Sampler);
        let mut track = sampler_track(&settings);
        track.start().unwrap();

        let mut update = settings.clone();
        update.muted = true;
        track.fast_update(&update);
        assert!(track.settings().muted);

        let output = render_one_block(&track, 0, vec![play_event(0)]);
        assert!(output.left().iter().all(|&s| s == 0.0));

        track.stop().unwrap();
    }

    #[test]
    fn stop_is_idempotent_and_drop_is_clean() {
        let mut track = sampler_track(&TrackSettings::new_with("t1", InstrumentKind::Sampler));
        track.start().unwrap();
        track.stop().unwrap();
        track.stop().unwrap();
        // Drop after stop must not hang.
    }

    #[test]
    fn settings_serde_defaults() {
        let settings: TrackSettings = serde_json::from_str(r#"{"name": "sp1"}"#).unwrap();
        assert_eq!(settings.name, "sp1");
        assert_eq!(settings.instrument, InstrumentKind::Sampler);
        assert!(!settings.muted);
        assert_eq!(settings.volume, ParameterDef::Constant(1.0));
        assert_eq!(settings.pan, ParameterDef::Constant(0.0));
        assert_eq!(settings.fxs.len(), 0);
    }
}
