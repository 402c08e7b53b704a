// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Supporting pieces that aren't DSP: configuration and sample-pack loading.

pub use samples::{SampleBank, SampleData, SampleLoadError, SamplePack};
pub use settings::{DspSettings, EngineSettings};

mod samples;
mod settings;
