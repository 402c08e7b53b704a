// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! A stereo feedback delay.

use super::FxSettings;
use crate::{
    automation::{Controls, Parameter, ParameterDef},
    midi::MidiEventAt,
    traits::TransformsBlock,
    types::{AudioBuffer, SampleTick, SampleType, SAMPLE_RATE},
};
use log::warn;
use serde::Deserialize;
use std::sync::Arc;

/// The longest supported delay, in seconds. The delay lines are sized for
/// this up front so changing the time never allocates.
const MAX_DELAY_SECONDS: f32 = 30.0;

/// A ring buffer whose effective length can change on the fly within its
/// preallocated capacity.
#[derive(Clone, Debug)]
struct DelayLine {
    buffer: Vec<SampleType>,
    pos: usize,
    size: usize,
}
impl Default for DelayLine {
    fn default() -> Self {
        Self {
            buffer: vec![0.0; (MAX_DELAY_SECONDS * SAMPLE_RATE as f32) as usize],
            pos: 0,
            size: 1,
        }
    }
}
impl DelayLine {
    fn set_size(&mut self, samples: usize) {
        let samples = samples.clamp(1, self.buffer.len());
        if samples != self.size {
            self.size = samples;
            if self.pos >= self.size {
                self.pos = 0;
            }
        }
    }

    /// The sample written `size` samples ago.
    fn read(&self) -> SampleType {
        self.buffer[self.pos]
    }

    fn write_and_advance(&mut self, value: SampleType) {
        self.buffer[self.pos] = value;
        self.pos += 1;
        if self.pos >= self.size {
            self.pos = 0;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EchoParams {
    time: Option<ParameterDef>,
    feedback: Option<ParameterDef>,
    dry: Option<ParameterDef>,
    wet: Option<ParameterDef>,
}

/// Stereo feedback delay: per sample, the delayed signal is fed back into
/// the line scaled by `feedback`, and the output mixes `dry` input with
/// `wet` delayed signal.
#[derive(Debug)]
pub struct Echo {
    settings: FxSettings,
    controls: Arc<Controls>,

    time: Parameter,
    feedback: Parameter,
    dry: Parameter,
    wet: Parameter,

    delay_left: DelayLine,
    delay_right: DelayLine,
}
impl Echo {
    #[allow(missing_docs)]
    pub fn new_with(settings: &FxSettings, controls: &Arc<Controls>) -> Self {
        let mut r = Self {
            settings: settings.clone(),
            controls: Arc::clone(controls),
            time: Parameter::constant(0.2).with_range(0.01, MAX_DELAY_SECONDS),
            feedback: Parameter::constant(0.3).with_range(0.0, 0.99),
            dry: Parameter::constant(0.8).with_range(0.0, 1.0),
            wet: Parameter::constant(0.5).with_range(0.0, 1.0),
            delay_left: DelayLine::default(),
            delay_right: DelayLine::default(),
        };
        r.reload_params();
        r
    }

    fn reload_params(&mut self) {
        if self.settings.extra.is_empty() {
            return;
        }
        let params: EchoParams = match serde_json::from_str(&self.settings.extra) {
            Ok(params) => params,
            Err(e) => {
                warn!("Ignoring bad echo settings for {}: {e}", self.settings.name);
                return;
            }
        };
        if let Some(time) = params.time {
            self.time = time
                .resolve(&self.controls)
                .with_range(0.01, MAX_DELAY_SECONDS);
        }
        if let Some(feedback) = params.feedback {
            self.feedback = feedback.resolve(&self.controls).with_range(0.0, 0.99);
        }
        if let Some(dry) = params.dry {
            self.dry = dry.resolve(&self.controls).with_range(0.0, 1.0);
        }
        if let Some(wet) = params.wet {
            self.wet = wet.resolve(&self.controls).with_range(0.0, 1.0);
        }
    }
}
impl TransformsBlock for Echo {
    fn can_fast_update(&self, settings: &FxSettings) -> bool {
        settings.kind == self.settings.kind
    }

    fn fast_update(&mut self, settings: &FxSettings) {
        if settings.extra != self.settings.extra {
            self.settings = settings.clone();
            self.reload_params();
        }
    }

    fn render(&mut self, tick: SampleTick, buffer: &mut AudioBuffer, _events: &[MidiEventAt]) {
        let (left, right) = buffer.channels_mut();

        for i in 0..left.len() {
            let current_tick = tick + i as SampleTick;

            let time = self.time.value_at(current_tick);
            let feedback = self.feedback.value_at(current_tick);
            let dry = self.dry.value_at(current_tick);
            let wet = self.wet.value_at(current_tick);

            let size = (time * SAMPLE_RATE as f32) as usize;
            self.delay_left.set_size(size);
            self.delay_right.set_size(size);

            let delayed_left = self.delay_left.read();
            let delayed_right = self.delay_right.read();

            self.delay_left
                .write_and_advance(left[i] + delayed_left * feedback);
            self.delay_right
                .write_and_advance(right[i] + delayed_right * feedback);

            left[i] = left[i] * dry + delayed_left * wet;
            right[i] = right[i] * dry + delayed_right * wet;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cores::effects::FxKind;
    use float_cmp::approx_eq;

    fn echo(extra: &str) -> Echo {
        let controls = Arc::new(Controls::default());
        Echo::new_with(&FxSettings::new_with("e", FxKind::Echo, extra), &controls)
    }

    #[test]
    fn impulse_comes_back_after_the_delay_time() {
        // 10ms delay = 480 samples at 48kHz.
        let mut fx = echo(r#"{"time": 0.01, "feedback": 0.0, "dry": 1.0, "wet": 1.0}"#);

        let mut buffer = AudioBuffer::new(1024);
        buffer.channels_mut().0[0] = 1.0;
        buffer.channels_mut().1[0] = 1.0;
        fx.render(0, &mut buffer, &[]);

        // The dry impulse is still at zero; the echo appears 480 samples in.
        assert_eq!(buffer.left()[0], 1.0);
        assert_eq!(buffer.left()[100], 0.0);
        assert_eq!(buffer.left()[480], 1.0);
        assert_eq!(buffer.right()[480], 1.0);
    }

    #[test]
    fn feedback_attenuates_each_repeat() {
        let mut fx = echo(r#"{"time": 0.01, "feedback": 0.5, "dry": 0.0, "wet": 1.0}"#);

        let mut buffer = AudioBuffer::new(2048);
        buffer.channels_mut().0[0] = 1.0;
        fx.render(0, &mut buffer, &[]);

        assert!(approx_eq!(f32, buffer.left()[480], 1.0, epsilon = 1e-6));
        assert!(approx_eq!(f32, buffer.left()[960], 0.5, epsilon = 1e-6));
        assert!(approx_eq!(f32, buffer.left()[1440], 0.25, epsilon = 1e-6));
    }

    #[test]
    fn dry_only_passes_through() {
        let mut fx = echo(r#"{"time": 0.01, "feedback": 0.0, "dry": 1.0, "wet": 0.0}"#);

        let mut buffer = AudioBuffer::default();
        buffer.channels_mut().0.fill(0.25);
        let expected = buffer.clone();
        fx.render(0, &mut buffer, &[]);
        assert_eq!(buffer, expected);
    }

    #[test]
    fn time_is_clamped_to_supported_range() {
        // An absurd delay time lands on the 30s maximum rather than growing
        // the line.
        let mut fx = echo(r#"{"time": 500.0}"#);
        let mut buffer = AudioBuffer::default();
        fx.render(0, &mut buffer, &[]);
        assert_eq!(fx.delay_left.size, fx.delay_left.buffer.len());
    }
}
