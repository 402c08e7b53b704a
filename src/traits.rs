// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! The traits that define the contracts among parts of the system.

use crate::{
    midi::MidiEventAt,
    types::{AudioBuffer, SampleTick},
};

/// Quick import of all important traits.
pub mod prelude {
    pub use super::{Instrument, SampleConsumer, TransformsBlock};
}

/// An [Instrument] consumes timed MIDI events and produces one stereo block
/// per render call. Sampler, external MIDI, and plugin instruments are
/// co-equal implementations; a track owns exactly one.
///
/// Render must not fail: configuration problems are reported (and logged) at
/// init/update time, never mid-block.
pub trait Instrument: Send + std::fmt::Debug {
    /// Applies the instrument's opaque JSON configuration. Called once at
    /// track init and again on every fast update; must be cheap after the
    /// first call. A malformed configuration is a warning, not an error, when
    /// the instrument can keep running with its previous settings.
    fn apply_settings(&mut self, extra: &str) -> anyhow::Result<()>;

    /// Renders one block, adding into `buffer`. `events` are this track's
    /// events with stamped ticks at or after `tick`.
    fn render(&mut self, tick: SampleTick, events: &[MidiEventAt], buffer: &mut AudioBuffer);

    /// Called when the owning track starts its worker.
    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the owning track stops. Must be idempotent.
    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// A short human-readable name for logs.
    fn name(&self) -> &'static str;
}

/// A [TransformsBlock] changes a stereo block in place. It's what effects do.
/// Effects are pure per-sample processors unless they carry internal state
/// such as a delay line.
pub trait TransformsBlock: Send + std::fmt::Debug {
    /// Whether new settings can be applied in place, without reinitializing
    /// the effect. Anything that would need an allocation or I/O answers
    /// false, which routes the change through the track-replacement path.
    fn can_fast_update(&self, settings: &crate::cores::effects::FxSettings) -> bool;

    /// Applies new settings in place. Must not fail, allocate, or block on
    /// I/O; only called after [TransformsBlock::can_fast_update] said yes.
    fn fast_update(&mut self, settings: &crate::cores::effects::FxSettings);

    /// Transforms the block in place. `events` are the track's events for
    /// this block, available to effects that respond to MIDI.
    fn render(&mut self, tick: SampleTick, buffer: &mut AudioBuffer, events: &[MidiEventAt]);
}

/// A [SampleConsumer] accepts finished blocks from the DSP loop: the audio
/// output adapter and the WAV recorder are the two built-in implementations,
/// and tests register capture consumers through the same interface.
///
/// Push errors are logged by the engine and never stop the loop.
pub trait SampleConsumer: Send + Sync + std::fmt::Debug {
    /// A short name for log messages.
    fn name(&self) -> &str;

    /// Accepts one finished block. Called once per block from the DSP thread,
    /// so implementations must be quick and must not block.
    fn push_audio_buffer(&self, buffer: &AudioBuffer) -> anyhow::Result<()>;
}
