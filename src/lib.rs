// Copyright (c) 2025 Mike Tsao. All rights reserved.

#![warn(missing_docs)]

//! Vesper is a live-coding audio engine: a tempo-aware scheduler drives a
//! real-time track graph that renders sample-accurate polyphonic audio,
//! dispatches MIDI to external devices, and hosts third-party processors.
//!
//! The two halves are [orchestration::Engine] (the block-driven DSP loop)
//! and [runtime::Runtime] (the beat clock and callback scheduler); their
//! only coupling is a stream of timestamped MIDI events. An embedding host
//! supplies user code as closures and wires its language of choice on top.

/// The most commonly used imports.
pub mod prelude {
    pub use crate::{
        automation::{Controls, Knob, Parameter, ParameterDef},
        cores::{
            effects::{FxChain, FxKind, FxSettings},
            instruments::InstrumentKind,
        },
        elements::{Adsr, LevelMeter},
        midi::{MidiChannel, MidiEventAt, MidiMessage, MidiStack, SysexCommand, SysexKind},
        orchestration::{Engine, Track, TrackSettings},
        runtime::{Callback, CallbackOutcome, CodeUpdate, Runtime, RuntimeApi},
        traits::prelude::*,
        types::{
            AudioBuffer, Levels, MicroBeat, SampleTick, SampleType, Tempo, BLOCK_PROCESSING_DELAY,
            BLOCK_SIZE, CONTROL_UPDATE_FREQUENCY, INTERNAL_CONTROLS_TRACK, MIDI_CHUNK_SIZE,
            NUM_CHANNELS, SAMPLE_RATE,
        },
        util::{EngineSettings, SampleBank, SampleData, SamplePack},
        vst::{PluginHost, PluginProcessor},
    };
}

pub mod automation;
pub mod cores;
pub mod elements;
pub mod midi;
pub mod orchestration;
pub mod runtime;
pub mod services;
pub mod traits;
pub mod types;
pub mod util;
pub mod vst;
