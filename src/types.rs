// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Common data types and the reserved constants shared by the DSP and
//! scheduling halves of the system.

use derive_more::{Add, AddAssign, Display, Sub};
use serde::{Deserialize, Serialize};

/// The type of a single audio sample.
pub type SampleType = f32;

/// Count of samples since engine start. There are [SAMPLE_RATE] ticks per
/// second, so 64 bits never wrap in practice.
pub type SampleTick = u64;

/// Samples per second.
pub const SAMPLE_RATE: usize = 48000;

/// Left and right.
pub const NUM_CHANNELS: usize = 2;

/// Size of a processing block (~10.67ms at 48kHz). This is also the
/// resolution at which MIDI events reach tracks.
pub const BLOCK_SIZE: usize = 512;

/// Number of blocks between the stamping of a MIDI event and its earliest
/// processing (~75ms). The slack absorbs scheduling jitter and gives
/// external-MIDI workers enough headroom to hit real hardware on time.
pub const BLOCK_PROCESSING_DELAY: usize = 7;

/// Resolution of external-device MIDI dispatch, independent of the block
/// size so the block size can grow without hurting timing.
pub const MIDI_CHUNK_SIZE: usize = 128;

/// How many times per second control knobs accept new targets. Values are
/// interpolated at sample rate in between, so the discretization is
/// inaudible.
pub const CONTROL_UPDATE_FREQUENCY: usize = 100;

/// The pseudo-track onto which control-update messages are sent. Not a real
/// track: the engine diverts its events to the controls registry. Both the
/// runtime and the engine must agree on this name.
pub const INTERNAL_CONTROLS_TRACK: &str = "vesper_internal_controls";

/// Lower bound of human hearing, in Hz.
pub const MIN_FREQ: f32 = 20.0;

/// Upper bound of human hearing, in Hz.
pub const MAX_FREQ: f32 = 20000.0;

/// Wall-clock duration of one processing block.
pub fn block_duration() -> std::time::Duration {
    std::time::Duration::from_micros((1_000_000 * BLOCK_SIZE / SAMPLE_RATE) as u64)
}

/// Beats × 10⁶. The scheduler is authoritative for this unit; one beat is
/// exactly [MicroBeat::ONE_BEAT].
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
    Sub,
)]
pub struct MicroBeat(pub u64);
impl MicroBeat {
    /// One beat, in µbeats.
    pub const ONE_BEAT: MicroBeat = MicroBeat(1_000_000);

    /// The whole-beat part of this position.
    pub fn beats(&self) -> u64 {
        self.0 / Self::ONE_BEAT.0
    }
}
impl From<u64> for MicroBeat {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Beats per minute.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tempo(pub f64);
impl Default for Tempo {
    fn default() -> Self {
        Self(120.0)
    }
}
impl std::fmt::Display for Tempo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:0.2} BPM", self.0))
    }
}
impl From<f64> for Tempo {
    fn from(value: f64) -> Self {
        Self(value)
    }
}
impl Tempo {
    /// A getter for the raw value.
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Duration of one beat, in microseconds.
    pub fn beat_us(&self) -> f64 {
        60.0 * 1_000_000.0 / self.0
    }
}

/// A stereo block of float samples, the universal currency of the DSP loop.
/// Both channels always have the same length; buffers are reused from block
/// to block, so rendering never allocates.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    left: Vec<SampleType>,
    right: Vec<SampleType>,
}
impl Default for AudioBuffer {
    fn default() -> Self {
        Self::new(BLOCK_SIZE)
    }
}
impl AudioBuffer {
    /// Creates a zeroed buffer of the given length.
    pub fn new(len: usize) -> Self {
        Self {
            left: vec![0.0; len],
            right: vec![0.0; len],
        }
    }

    /// The number of frames in this buffer.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    /// Zeroes both channels in place.
    pub fn reset(&mut self) {
        self.left.fill(0.0);
        self.right.fill(0.0);
    }

    #[allow(missing_docs)]
    pub fn left(&self) -> &[SampleType] {
        &self.left
    }

    #[allow(missing_docs)]
    pub fn right(&self) -> &[SampleType] {
        &self.right
    }

    /// Mutable access to both channels at once.
    pub fn channels_mut(&mut self) -> (&mut [SampleType], &mut [SampleType]) {
        (&mut self.left, &mut self.right)
    }

    /// Copies the other buffer's contents into this one. Both buffers must
    /// have the same length.
    pub fn copy_from(&mut self, other: &AudioBuffer) {
        self.left.copy_from_slice(&other.left);
        self.right.copy_from_slice(&other.right);
    }
}

/// A snapshot of peak and RMS levels for a stereo signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Levels {
    #[allow(missing_docs)]
    pub peak_left: f32,
    #[allow(missing_docs)]
    pub peak_right: f32,
    #[allow(missing_docs)]
    pub rms_left: f32,
    #[allow(missing_docs)]
    pub rms_right: f32,
}
