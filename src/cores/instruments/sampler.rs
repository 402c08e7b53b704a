// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! The sample-playback instrument. Driven entirely by in-process commands:
//! [SysexKind::SamplerPlay] starts a voice, [SysexKind::SamplerStop] releases
//! the most recent voice for a sample. Commands take effect at their stamped
//! tick within the block, so triggers are sample-accurate.

use crate::{
    automation::{Controls, Parameter, ParameterDef},
    elements::{left_pan, right_pan, Adsr},
    midi::{MidiEventAt, MidiStack, SysexCommand, SysexKind},
    traits::Instrument,
    types::{AudioBuffer, SampleTick, SampleType},
    util::{SampleBank, SampleData},
};
use log::warn;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::sync::Arc;

/// A very small attack and release wrap every voice no matter what the user
/// asked for, so raw sample data that starts or ends off zero cannot click.
const SMOOTHING_MS: f32 = 1.0;

/// Playback shorter than twice the smoothing window can't fit both ramps.
const MINIMAL_DURATION_MS: f32 = 2.0 * SMOOTHING_MS;

/// How close to the end of its range a voice triggers the anti-click
/// release, in samples.
const SMOOTHING_SAMPLES: f32 =
    MINIMAL_DURATION_MS * crate::types::SAMPLE_RATE as f32 / 1000.0;

fn default_end() -> f32 {
    1.0
}
fn default_rate() -> f32 {
    1.0
}
fn default_level() -> f32 {
    1.0
}
fn default_amp() -> ParameterDef {
    ParameterDef::Constant(1.0)
}

#[derive(Debug, Deserialize)]
struct PlayParams {
    pack: String,
    name: String,
    #[serde(default)]
    start: f32,
    #[serde(default = "default_end")]
    end: f32,
    #[serde(default)]
    pan: ParameterDef,
    #[serde(default = "default_rate")]
    rate: f32,
    #[serde(default)]
    attack: f32,
    #[serde(default)]
    decay: f32,
    #[serde(default = "default_level")]
    level: f32,
    #[serde(default)]
    release: f32,
    #[serde(default = "default_amp")]
    amp: ParameterDef,
}

#[derive(Debug, Deserialize)]
struct StopParams {
    pack: String,
    name: String,
}

#[derive(Debug)]
struct Voice {
    sample: Arc<SampleData>,
    pos: f32,
    end: f32,
    inc: f32,
    rate: f32,
    pan: Parameter,
    amp: Parameter,

    // The wrapper envelope masks discontinuities at voice start and stop;
    // the user envelope is the one the play command asked for.
    wrapper: Adsr,
    env: Adsr,

    removing: bool,
}

fn interpolate(samples: &[SampleType], pos: f32) -> SampleType {
    let i = pos as usize % samples.len();
    let j = (pos as usize + 1) % samples.len();
    let w1 = pos.fract();
    samples[i] * (1.0 - w1) + samples[j] * w1
}

/// Polyphonic sample playback over the shared [SampleBank].
#[derive(Debug)]
pub struct Sampler {
    samples: Arc<SampleBank>,
    controls: Arc<Controls>,
    midi_stack: MidiStack,

    // Active voices grouped by the identity of the sample they play, so a
    // stop command can find the most recent voice for that sample.
    voices: FxHashMap<usize, Vec<Voice>>,
}
impl Sampler {
    #[allow(missing_docs)]
    pub fn new_with(samples: &Arc<SampleBank>, controls: &Arc<Controls>) -> Self {
        Self {
            samples: Arc::clone(samples),
            controls: Arc::clone(controls),
            midi_stack: MidiStack::default(),
            voices: Default::default(),
        }
    }

    /// Number of currently playing voices, across all samples.
    pub fn active_voice_count(&self) -> usize {
        self.voices.values().map(|v| v.len()).sum()
    }

    fn play_sample(&mut self, sample: Arc<SampleData>, params: &PlayParams) {
        let range = sample.duration_samples();
        let mut start = ((range as f32 * params.start) as usize).min(range) as f32;
        let mut end = ((range as f32 * params.end) as usize).min(range) as f32;
        let mut rate = params.rate;

        // A negative rate plays backward: reuse the inverted start/end
        // mechanism instead of complicating the render path.
        if rate < 0.0 {
            std::mem::swap(&mut start, &mut end);
            rate = -rate;
        }

        // Too short to fit the anti-click ramps: skip rather than glitch.
        let duration_ms = sample.duration_ms((end - start).abs() as usize) * rate;
        if duration_ms <= MINIMAL_DURATION_MS {
            return;
        }

        let wrapper = match Adsr::new_with(SMOOTHING_MS, 0.0, SMOOTHING_MS, 1.0) {
            Ok(wrapper) => wrapper,
            Err(e) => {
                warn!("Failed to initialize wrapper envelope: {e}");
                return;
            }
        };
        let env = match Adsr::new_with(params.attack, params.decay, params.release, params.level) {
            Ok(env) => env,
            Err(e) => {
                warn!("Ignoring play with bad envelope: {e}");
                return;
            }
        };

        let mut voice = Voice {
            pos: start,
            end,
            inc: if start < end { 1.0 } else { -1.0 },
            rate,
            pan: params.pan.resolve(&self.controls).with_range(-1.0, 1.0),
            amp: params.amp.resolve(&self.controls).with_range(0.0, 1.0),
            wrapper,
            env,
            removing: false,
            sample: Arc::clone(&sample),
        };
        voice.wrapper.note_on();
        voice.env.note_on();

        self.voices
            .entry(Arc::as_ptr(&sample) as usize)
            .or_default()
            .push(voice);
    }

    fn stop_sample(&mut self, sample: &Arc<SampleData>) {
        if let Some(voices) = self.voices.get_mut(&(Arc::as_ptr(sample) as usize)) {
            // Release the most recently started voice and let its tail ring
            // out; older voices keep playing.
            if let Some(voice) = voices.iter_mut().rev().find(|v| !v.removing) {
                voice.wrapper.note_off();
            }
        }
    }

    fn handle_sysex(&mut self, command: &SysexCommand) {
        match command.kind {
            SysexKind::SamplerPlay => {
                let params: PlayParams = match serde_json::from_str(&command.json) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!("Ignoring malformed play command: {e}");
                        return;
                    }
                };
                match self.samples.sample(&params.pack, &params.name) {
                    Some(sample) => self.play_sample(sample, &params),
                    None => warn!("Unknown sample {}:{}", params.pack, params.name),
                }
            }
            SysexKind::SamplerStop => {
                let params: StopParams = match serde_json::from_str(&command.json) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!("Ignoring malformed stop command: {e}");
                        return;
                    }
                };
                if let Some(sample) = self.samples.sample(&params.pack, &params.name) {
                    self.stop_sample(&sample);
                }
            }
            SysexKind::UpdateControls => {}
        }
    }

    fn process_midi_events(&mut self, tick: SampleTick) {
        for event in self.midi_stack.events_at_tick(tick) {
            if let Some(command) = event.message().as_sysex() {
                self.handle_sysex(command);
            }
        }
    }
}
impl Instrument for Sampler {
    fn apply_settings(&mut self, _extra: &str) -> anyhow::Result<()> {
        // The sampler has no per-track configuration; everything arrives
        // through play commands.
        Ok(())
    }

    fn render(&mut self, tick: SampleTick, events: &[MidiEventAt], buffer: &mut AudioBuffer) {
        self.midi_stack.add_events(events.iter().cloned());

        for i in 0..buffer.len() {
            let current_tick = tick + i as SampleTick;

            self.process_midi_events(current_tick);

            let (left, right) = buffer.channels_mut();
            let mut acc_left = left[i];
            let mut acc_right = right[i];

            for voices in self.voices.values_mut() {
                for voice in voices.iter_mut() {
                    if voice.removing {
                        continue;
                    }

                    // Release early enough that the tail masks the
                    // end-of-range discontinuity.
                    if (voice.inc > 0.0 && voice.pos + SMOOTHING_SAMPLES >= voice.end)
                        || (voice.inc < 0.0 && voice.pos - SMOOTHING_SAMPLES <= voice.end)
                    {
                        voice.wrapper.note_off();
                    }

                    let wrapper_env = voice.wrapper.next();
                    let user_env = voice.env.next();
                    let amp = voice.amp.value_at(current_tick);
                    let env = wrapper_env * user_env * amp;
                    let pan = voice.pan.value_at(current_tick);

                    acc_left +=
                        interpolate(voice.sample.left(), voice.pos) * env * left_pan(pan);
                    acc_right +=
                        interpolate(voice.sample.right(), voice.pos) * env * right_pan(pan);

                    voice.pos += voice.inc * voice.rate;

                    if env == 0.0
                        || (voice.inc > 0.0 && voice.pos >= voice.end)
                        || (voice.inc < 0.0 && voice.pos <= voice.end)
                    {
                        voice.removing = true;
                    }
                }
            }

            left[i] = acc_left;
            right[i] = acc_right;
        }

        for voices in self.voices.values_mut() {
            voices.retain(|voice| !voice.removing);
        }
        self.voices.retain(|_, voices| !voices.is_empty());
    }

    fn name(&self) -> &'static str {
        "sampler"
    }
}
