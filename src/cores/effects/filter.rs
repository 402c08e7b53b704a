// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Resonant low-pass and high-pass filters with automatable cutoff and
//! resonance.

use super::FxSettings;
use crate::{
    automation::{Controls, Parameter, ParameterDef},
    midi::MidiEventAt,
    traits::TransformsBlock,
    types::{AudioBuffer, SampleTick, SampleType, MAX_FREQ, MIN_FREQ, SAMPLE_RATE},
};
use log::warn;
use serde::Deserialize;
use std::{f32::consts::PI, sync::Arc};

/// Maps a normalized cutoff [0,1] to [20Hz, 20kHz] through the mel scale, so
/// equal knob movements sound like equal pitch movements.
fn map_to_frequency(normalized: f32) -> f32 {
    let mel_min = 2595.0 * (1.0 + MIN_FREQ / 700.0).log10();
    let mel_max = 2595.0 * (1.0 + MAX_FREQ / 700.0).log10();
    let mel = mel_min + normalized * (mel_max - mel_min);
    700.0 * (10.0f32.powf(mel / 2595.0) - 1.0)
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct BiquadCoefficients {
    a0: f32,
    a1: f32,
    a2: f32,
    b1: f32,
    b2: f32,
}

/// Direct-form-I biquad section, one per channel.
#[derive(Clone, Debug, Default)]
struct Biquad {
    coefficients: BiquadCoefficients,
    x1: SampleType,
    x2: SampleType,
    y1: SampleType,
    y2: SampleType,
}
impl Biquad {
    fn set_coefficients(&mut self, coefficients: BiquadCoefficients) {
        self.coefficients = coefficients;
    }

    fn process(&mut self, input: SampleType) -> SampleType {
        let c = &self.coefficients;
        let output =
            c.a0 * input + c.a1 * self.x1 + c.a2 * self.x2 - c.b1 * self.y1 - c.b2 * self.y2;
        self.x2 = self.x1;
        self.x1 = input;
        self.y2 = self.y1;
        self.y1 = output;
        output
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum FilterShape {
    LowPass,
    HighPass,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct FilterTarget {
    cutoff_hz: f32,
    resonance: f32,
}

fn coefficients_for(shape: FilterShape, target: FilterTarget) -> BiquadCoefficients {
    let cutoff = target.cutoff_hz.clamp(MIN_FREQ, MAX_FREQ);
    let resonance = target.resonance.clamp(0.0, 1.0);

    let w0 = 2.0 * PI * cutoff / SAMPLE_RATE as f32;
    let cos_w0 = w0.cos();
    let sin_w0 = w0.sin();

    // Resonance maps exponentially onto Q in [0.5, ~25].
    let q = 0.5 + 24.5 * resonance.powi(2);
    let alpha = sin_w0 / (2.0 * q);
    let a0 = 1.0 + alpha;

    match shape {
        FilterShape::LowPass => BiquadCoefficients {
            a0: (1.0 - cos_w0) / (2.0 * a0),
            a1: (1.0 - cos_w0) / a0,
            a2: (1.0 - cos_w0) / (2.0 * a0),
            b1: (-2.0 * cos_w0) / a0,
            b2: (1.0 - alpha) / a0,
        },
        FilterShape::HighPass => BiquadCoefficients {
            a0: (1.0 + cos_w0) / (2.0 * a0),
            a1: -(1.0 + cos_w0) / a0,
            a2: (1.0 + cos_w0) / (2.0 * a0),
            b1: (-2.0 * cos_w0) / a0,
            b2: (1.0 - alpha) / a0,
        },
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilterParams {
    cutoff: Option<ParameterDef>,
    resonance: Option<ParameterDef>,
}

#[derive(Debug)]
struct Filter {
    shape: FilterShape,
    settings: FxSettings,
    controls: Arc<Controls>,

    cutoff: Parameter,
    resonance: Parameter,

    target: FilterTarget,
    left: Biquad,
    right: Biquad,
}
impl Filter {
    fn new_with(shape: FilterShape, settings: &FxSettings, controls: &Arc<Controls>) -> Self {
        let mut r = Self {
            shape,
            settings: settings.clone(),
            controls: Arc::clone(controls),
            cutoff: Parameter::constant(0.5).with_range(0.0, 1.0),
            resonance: Parameter::constant(0.5).with_range(0.0, 1.0),
            target: FilterTarget {
                cutoff_hz: map_to_frequency(0.5),
                resonance: 0.5,
            },
            left: Biquad::default(),
            right: Biquad::default(),
        };
        r.reload_params();

        let coefficients = coefficients_for(r.shape, r.target);
        r.left.set_coefficients(coefficients);
        r.right.set_coefficients(coefficients);
        r
    }

    fn reload_params(&mut self) {
        if self.settings.extra.is_empty() {
            return;
        }
        let params: FilterParams = match serde_json::from_str(&self.settings.extra) {
            Ok(params) => params,
            Err(e) => {
                warn!("Ignoring bad filter settings for {}: {e}", self.settings.name);
                return;
            }
        };
        if let Some(cutoff) = params.cutoff {
            self.cutoff = cutoff.resolve(&self.controls).with_range(0.0, 1.0);
        }
        if let Some(resonance) = params.resonance {
            self.resonance = resonance.resolve(&self.controls).with_range(0.0, 1.0);
        }
    }

    fn retarget(&mut self, tick: SampleTick) {
        let target = FilterTarget {
            cutoff_hz: map_to_frequency(self.cutoff.value_at(tick)),
            resonance: self.resonance.value_at(tick),
        };
        if target != self.target {
            self.target = target;
            let coefficients = coefficients_for(self.shape, target);
            self.left.set_coefficients(coefficients);
            self.right.set_coefficients(coefficients);
        }
    }
}
impl TransformsBlock for Filter {
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
            self.retarget(tick + i as SampleTick);
            left[i] = self.left.process(left[i]);
            right[i] = self.right.process(right[i]);
        }
    }
}

/// A resonant low-pass filter. `cutoff` is normalized [0,1] over the mel
/// scale; `resonance` is [0,1].
#[derive(Debug)]
pub struct LowPassFilter(Filter);
impl LowPassFilter {
    #[allow(missing_docs)]
    pub fn new_with(settings: &FxSettings, controls: &Arc<Controls>) -> Self {
        Self(Filter::new_with(FilterShape::LowPass, settings, controls))
    }
}
impl TransformsBlock for LowPassFilter {
    fn can_fast_update(&self, settings: &FxSettings) -> bool {
        self.0.can_fast_update(settings)
    }

    fn fast_update(&mut self, settings: &FxSettings) {
        self.0.fast_update(settings)
    }

    fn render(&mut self, tick: SampleTick, buffer: &mut AudioBuffer, events: &[MidiEventAt]) {
        self.0.render(tick, buffer, events)
    }
}

/// A resonant high-pass filter with the same parameter mapping as
/// [LowPassFilter].
#[derive(Debug)]
pub struct HighPassFilter(Filter);
impl HighPassFilter {
    #[allow(missing_docs)]
    pub fn new_with(settings: &FxSettings, controls: &Arc<Controls>) -> Self {
        Self(Filter::new_with(FilterShape::HighPass, settings, controls))
    }
}
impl TransformsBlock for HighPassFilter {
    fn can_fast_update(&self, settings: &FxSettings) -> bool {
        self.0.can_fast_update(settings)
    }

    fn fast_update(&mut self, settings: &FxSettings) {
        self.0.fast_update(settings)
    }

    fn render(&mut self, tick: SampleTick, buffer: &mut AudioBuffer, events: &[MidiEventAt]) {
        self.0.render(tick, buffer, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cores::effects::FxKind;
    use more_asserts::{assert_gt, assert_lt};

    fn rms(samples: &[SampleType]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    fn fill_tone(buffer: &mut AudioBuffer, freq: f32) {
        let (left, right) = buffer.channels_mut();
        for i in 0..left.len() {
            let phase = 2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32;
            left[i] = phase.sin();
            right[i] = phase.sin();
        }
    }

    #[test]
    fn mel_mapping_covers_the_audible_range() {
        assert_lt!((map_to_frequency(0.0) - MIN_FREQ).abs(), 0.5);
        assert_lt!((map_to_frequency(1.0) - MAX_FREQ).abs(), 5.0);
        assert_gt!(map_to_frequency(0.75), map_to_frequency(0.25));
    }

    #[test]
    fn lpf_attenuates_highs_more_than_lows() {
        let controls = Arc::new(Controls::default());
        let settings = FxSettings::new_with("lpf", FxKind::Lpf, r#"{"cutoff": 0.3}"#);

        let mut low = AudioBuffer::new(4096);
        fill_tone(&mut low, 100.0);
        let mut filter = LowPassFilter::new_with(&settings, &controls);
        filter.render(0, &mut low, &[]);

        let mut high = AudioBuffer::new(4096);
        fill_tone(&mut high, 15000.0);
        let mut filter = LowPassFilter::new_with(&settings, &controls);
        filter.render(0, &mut high, &[]);

        // Skip the first half to let the filter settle.
        assert_gt!(rms(&low.left()[2048..]), 4.0 * rms(&high.left()[2048..]));
    }

    #[test]
    fn hpf_attenuates_lows_more_than_highs() {
        let controls = Arc::new(Controls::default());
        let settings = FxSettings::new_with("hpf", FxKind::Hpf, r#"{"cutoff": 0.7}"#);

        let mut low = AudioBuffer::new(4096);
        fill_tone(&mut low, 100.0);
        let mut filter = HighPassFilter::new_with(&settings, &controls);
        filter.render(0, &mut low, &[]);

        let mut high = AudioBuffer::new(4096);
        fill_tone(&mut high, 15000.0);
        let mut filter = HighPassFilter::new_with(&settings, &controls);
        filter.render(0, &mut high, &[]);

        assert_gt!(rms(&high.left()[2048..]), 4.0 * rms(&low.left()[2048..]));
    }

    #[test]
    fn fast_update_changes_parameters_only() {
        let controls = Arc::new(Controls::default());
        let mut filter = LowPassFilter::new_with(
            &FxSettings::new_with("f", FxKind::Lpf, r#"{"cutoff": 0.2}"#),
            &controls,
        );

        let update = FxSettings::new_with("f", FxKind::Lpf, r#"{"cutoff": 0.9}"#);
        assert!(filter.can_fast_update(&update));
        filter.fast_update(&update);

        let other_kind = FxSettings::new_with("f", FxKind::Hpf, "{}");
        assert!(!filter.can_fast_update(&other_kind));
    }
}
