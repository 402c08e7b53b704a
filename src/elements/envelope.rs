// Copyright (c) 2025 Mike Tsao. All rights reserved.

use crate::types::SAMPLE_RATE;
use anyhow::anyhow;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum State {
    #[default]
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// A linear ADSR envelope generator driven one sample at a time.
///
/// `note_on` enters the attack phase; `note_off` enters the release phase
/// from wherever the envelope currently is. When a phase has zero duration
/// the envelope jumps straight to the next one, so a fully zeroed envelope
/// acts as a gate. The value is always within [0, 1] and monotone within a
/// phase. Callers that need click-free starts and stops wrap their signal in
/// a short-attack, short-release instance of this same type.
#[derive(Clone, Debug, Default)]
pub struct Adsr {
    attack_ms: f32,
    decay_ms: f32,
    release_ms: f32,
    sustain_level: f32,

    envelope: f32,
    attack_inc: f32,
    decay_dec: f32,
    release_dec: f32,
    state: State,
}
impl Adsr {
    /// Creates an envelope from millisecond phase durations and a sustain
    /// level. Durations must be non-negative and the level within [0, 1].
    pub fn new_with(
        attack_ms: f32,
        decay_ms: f32,
        release_ms: f32,
        sustain_level: f32,
    ) -> anyhow::Result<Self> {
        if attack_ms < 0.0 {
            return Err(anyhow!("attack must be >= 0, got {attack_ms}"));
        }
        if decay_ms < 0.0 {
            return Err(anyhow!("decay must be >= 0, got {decay_ms}"));
        }
        if release_ms < 0.0 {
            return Err(anyhow!("release must be >= 0, got {release_ms}"));
        }
        if !(0.0..=1.0).contains(&sustain_level) {
            return Err(anyhow!("sustain level not in [0,1], got {sustain_level}"));
        }

        let mut r = Self {
            attack_ms,
            decay_ms,
            release_ms,
            sustain_level,
            ..Default::default()
        };

        // Per-sample increments for each phase. Attack moves 0 to 1, decay 1
        // to sustain, release sustain to 0.
        if attack_ms > 0.0 {
            r.attack_inc = 1.0 / (SAMPLE_RATE as f32 * (attack_ms / 1000.0));
        }
        if decay_ms > 0.0 {
            r.decay_dec = (1.0 - sustain_level) / (SAMPLE_RATE as f32 * (decay_ms / 1000.0));
        }
        if release_ms > 0.0 {
            r.release_dec = sustain_level / (SAMPLE_RATE as f32 * (release_ms / 1000.0));
        }

        Ok(r)
    }

    #[allow(missing_docs)]
    pub fn reset(&mut self) {
        self.envelope = 0.0;
        self.state = State::Idle;
    }

    /// Starts the envelope from the beginning of its first non-empty phase.
    pub fn note_on(&mut self) {
        if self.attack_ms > 0.0 {
            self.envelope = 0.0;
            self.state = State::Attack;
        } else if self.decay_ms > 0.0 {
            self.envelope = 1.0;
            self.state = State::Decay;
        } else {
            self.envelope = self.sustain_level;
            self.state = State::Sustain;
        }
    }

    /// Enters the release phase. A zero-length release cuts to idle.
    pub fn note_off(&mut self) {
        if self.state == State::Idle {
            return;
        }
        if self.release_ms > 0.0 {
            self.state = State::Release;
        } else {
            self.reset();
        }
    }

    /// Advances one sample and returns the new envelope value.
    pub fn next(&mut self) -> f32 {
        match self.state {
            State::Idle => {}
            State::Attack => {
                self.envelope += self.attack_inc;
                if self.envelope >= 1.0 {
                    if self.decay_ms > 0.0 {
                        self.envelope = 1.0;
                        self.state = State::Decay;
                    } else {
                        self.envelope = self.sustain_level;
                        self.state = State::Sustain;
                    }
                }
            }
            State::Decay => {
                self.envelope -= self.decay_dec;
                if self.envelope <= self.sustain_level {
                    self.envelope = self.sustain_level;
                    self.state = State::Sustain;
                }
            }
            State::Sustain => {
                self.envelope = self.sustain_level;
            }
            State::Release => {
                self.envelope -= self.release_dec;
                if self.envelope <= 0.0 {
                    self.envelope = 0.0;
                    self.state = State::Idle;
                }
            }
        }

        self.envelope
    }

    /// Whether the envelope has finished (or never started).
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    #[allow(missing_docs)]
    pub fn sustain_level(&self) -> f32 {
        self.sustain_level
    }
}
