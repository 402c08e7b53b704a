// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Consumers of finished audio blocks: the device output adapter and the
//! WAV recorder.

pub use audio::AudioOutput;
pub use recorder::WavRecorder;

mod audio;
mod recorder;
