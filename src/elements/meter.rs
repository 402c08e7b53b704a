// Copyright (c) 2025 Mike Tsao. All rights reserved.

use crate::types::{Levels, SampleType, BLOCK_SIZE, SAMPLE_RATE};
use std::sync::atomic::{AtomicU32, Ordering};

/// A stereo peak/RMS meter safe to read from any thread while a render
/// thread feeds it. Peaks decay to ~37% in [LevelMeter::PEAK_DECAY_TIME]
/// seconds; RMS is instantaneous per block. Values are stored as f32 bits in
/// atomics so readers never contend with the audio path.
#[derive(Debug)]
pub struct LevelMeter {
    decay_coeff: f32,
    peak_left: AtomicU32,
    peak_right: AtomicU32,
    rms_left: AtomicU32,
    rms_right: AtomicU32,
}
impl Default for LevelMeter {
    fn default() -> Self {
        let blocks_per_second = SAMPLE_RATE as f32 / BLOCK_SIZE as f32;
        Self {
            decay_coeff: (-1.0 / (Self::PEAK_DECAY_TIME * blocks_per_second)).exp(),
            peak_left: AtomicU32::new(0),
            peak_right: AtomicU32::new(0),
            rms_left: AtomicU32::new(0),
            rms_right: AtomicU32::new(0),
        }
    }
}
impl LevelMeter {
    /// Peak decay time in seconds (0.3s for a snappy response).
    pub const PEAK_DECAY_TIME: f32 = 0.3;

    /// Observes one block of audio and updates the published levels.
    pub fn process(&self, left: &[SampleType], right: &[SampleType]) {
        let mut inst_peak_l = 0.0f32;
        let mut inst_peak_r = 0.0f32;
        let mut sum_sq_l = 0.0f32;
        let mut sum_sq_r = 0.0f32;

        for (&l, &r) in left.iter().zip(right.iter()) {
            inst_peak_l = inst_peak_l.max(l.abs());
            inst_peak_r = inst_peak_r.max(r.abs());
            sum_sq_l += l * l;
            sum_sq_r += r * r;
        }

        // Peak hold with decay: max of the decayed previous peak and the new
        // instantaneous peak.
        let prev_l = f32::from_bits(self.peak_left.load(Ordering::Relaxed));
        let prev_r = f32::from_bits(self.peak_right.load(Ordering::Relaxed));
        self.peak_left.store(
            inst_peak_l.max(prev_l * self.decay_coeff).to_bits(),
            Ordering::Relaxed,
        );
        self.peak_right.store(
            inst_peak_r.max(prev_r * self.decay_coeff).to_bits(),
            Ordering::Relaxed,
        );

        let len = left.len().max(1) as f32;
        self.rms_left
            .store((sum_sq_l / len).sqrt().to_bits(), Ordering::Relaxed);
        self.rms_right
            .store((sum_sq_r / len).sqrt().to_bits(), Ordering::Relaxed);
    }

    /// The current levels.
    pub fn levels(&self) -> Levels {
        Levels {
            peak_left: f32::from_bits(self.peak_left.load(Ordering::Relaxed)),
            peak_right: f32::from_bits(self.peak_right.load(Ordering::Relaxed)),
            rms_left: f32::from_bits(self.rms_left.load(Ordering::Relaxed)),
            rms_right: f32::from_bits(self.rms_right.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use more_asserts::{assert_gt, assert_lt};

    #[test]
    fn silence_reports_zero() {
        let meter = LevelMeter::default();
        meter.process(&[0.0; BLOCK_SIZE], &[0.0; BLOCK_SIZE]);
        assert_eq!(meter.levels(), Levels::default());
    }

    #[test]
    fn full_scale_square_wave() {
        let meter = LevelMeter::default();
        let block = [1.0f32; BLOCK_SIZE];
        meter.process(&block, &block);

        let levels = meter.levels();
        assert_eq!(levels.peak_left, 1.0);
        assert_eq!(levels.peak_right, 1.0);
        assert!(approx_eq!(f32, levels.rms_left, 1.0, epsilon = 1e-6));
    }

    #[test]
    fn peak_decays_between_blocks() {
        let meter = LevelMeter::default();
        meter.process(&[1.0; BLOCK_SIZE], &[1.0; BLOCK_SIZE]);

        let loud = meter.levels().peak_left;
        meter.process(&[0.0; BLOCK_SIZE], &[0.0; BLOCK_SIZE]);
        let quieter = meter.levels().peak_left;

        assert_lt!(quieter, loud);
        assert_gt!(quieter, 0.0);
        // RMS has no memory.
        assert_eq!(meter.levels().rms_left, 0.0);
    }
}
