// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! The engine and its track graph.

pub use engine::Engine;
pub use track::{Track, TrackSettings};

mod engine;
mod track;
