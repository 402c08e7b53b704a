// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Interpolated automation: named control knobs updated at
//! [CONTROL_UPDATE_FREQUENCY](crate::types::CONTROL_UPDATE_FREQUENCY) Hz and
//! read at sample rate, plus the [Parameter] type instruments and effects use
//! to consume either a constant or a knob.

use crate::{
    midi::{MidiEventAt, MidiStack, SysexKind},
    types::{SampleTick, CONTROL_UPDATE_FREQUENCY, SAMPLE_RATE},
};
use log::warn;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

#[derive(Debug, Default)]
struct KnobState {
    from_tick: SampleTick,
    to_tick: SampleTick,
    from_value: f32,
    to_value: f32,
}
impl KnobState {
    fn value_at(&self, tick: SampleTick) -> f32 {
        if tick >= self.to_tick {
            return self.to_value;
        }
        if tick <= self.from_tick {
            return self.from_value;
        }
        let progress =
            (tick - self.from_tick) as f32 / (self.to_tick - self.from_tick) as f32;
        self.from_value + (self.to_value - self.from_value) * progress
    }
}

/// An automation value that ramps linearly from its current value to each new
/// target over one control-update period (480 samples at 48kHz). Readers take
/// the shared side of the lock at sample rate; the single writer runs at
/// 100Hz.
#[derive(Debug, Default)]
pub struct Knob {
    state: RwLock<KnobState>,
}
impl Knob {
    fn new_flat(value: f32) -> Self {
        Self {
            state: RwLock::new(KnobState {
                from_tick: 0,
                to_tick: 0,
                from_value: value,
                to_value: value,
            }),
        }
    }

    /// Starts a ramp toward `target` at the given tick. The ramp begins from
    /// the value the knob has at that tick, so back-to-back updates never
    /// jump.
    pub fn set_target(&self, tick: SampleTick, target: f32) {
        let mut state = self.state.write().unwrap();
        let current = state.value_at(tick);
        state.from_value = current;
        state.to_value = target;
        state.from_tick = tick;
        state.to_tick = tick + (SAMPLE_RATE / CONTROL_UPDATE_FREQUENCY) as SampleTick;
    }

    /// The interpolated value at the given tick.
    pub fn value_at(&self, tick: SampleTick) -> f32 {
        self.state.read().unwrap().value_at(tick)
    }
}

#[derive(Debug, Deserialize)]
struct UpdateControlsPayload {
    knobs: BTreeMap<String, f32>,
}

/// The registry of named [Knob]s. Knobs are created lazily by the first
/// update that names them; the registry outlives all tracks within a session,
/// so parameter handles never dangle.
#[derive(Debug, Default)]
pub struct Controls {
    knobs: RwLock<FxHashMap<String, Arc<Knob>>>,
    midi_stack: Mutex<MidiStack>,
}
impl Controls {
    /// Looks up a knob by name.
    pub fn knob(&self, name: &str) -> Option<Arc<Knob>> {
        self.knobs.read().unwrap().get(name).cloned()
    }

    /// Queues control events for the next [Controls::advance_to].
    pub fn add_events(&self, events: Vec<MidiEventAt>) {
        self.midi_stack.lock().unwrap().add_events(events);
    }

    /// Applies every queued update due at or before the given tick. The DSP
    /// loop calls this before releasing track workers so that knob values are
    /// current when rendering reads them.
    pub fn advance_to(&self, tick: SampleTick) {
        let due = self.midi_stack.lock().unwrap().events_at_tick(tick);
        for event in due {
            self.process_event(&event);
        }
    }

    fn process_event(&self, event: &MidiEventAt) {
        let Some(command) = event.message().as_sysex() else {
            return;
        };
        if command.kind != SysexKind::UpdateControls {
            return;
        }

        let payload: UpdateControlsPayload = match serde_json::from_str(&command.json) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Ignoring malformed control update: {e}");
                return;
            }
        };

        let tick = event.tick().unwrap_or(0);
        let mut knobs = self.knobs.write().unwrap();
        for (name, target) in payload.knobs {
            match knobs.get(&name) {
                Some(knob) => knob.set_target(tick, target),
                None => {
                    // First mention of this knob: create it flat at the
                    // target so nothing ramps from an arbitrary zero.
                    knobs.insert(name, Arc::new(Knob::new_flat(target)));
                }
            }
        }
    }
}

/// How a settings payload spells a parameter: a bare number is a constant, a
/// string names a control knob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterDef {
    #[allow(missing_docs)]
    Constant(f32),
    #[allow(missing_docs)]
    Control(String),
}
impl Default for ParameterDef {
    fn default() -> Self {
        Self::Constant(0.0)
    }
}
impl From<f32> for ParameterDef {
    fn from(value: f32) -> Self {
        Self::Constant(value)
    }
}
impl From<&str> for ParameterDef {
    fn from(value: &str) -> Self {
        Self::Control(value.to_string())
    }
}
impl ParameterDef {
    /// Binds this definition to the controls registry.
    pub fn resolve(&self, controls: &Arc<Controls>) -> Parameter {
        match self {
            Self::Constant(value) => Parameter::constant(*value),
            Self::Control(name) => Parameter::control(controls, name),
        }
    }
}

#[derive(Clone, Debug)]
enum ParameterKind {
    Constant(f32),
    Control {
        name: String,
        controls: Arc<Controls>,
        knob: Option<Arc<Knob>>,
    },
}

/// A value consumed at sample rate by instruments and effects: either a
/// constant or a reference to a named [Knob], with an optional clamp range.
///
/// Control references resolve lazily: the code-update path creates knobs
/// asynchronously, so a parameter may be built before its knob exists. The
/// lookup retries until it succeeds, then the handle is cached; while the
/// knob is missing, the constant fallback is returned.
#[derive(Clone, Debug)]
pub struct Parameter {
    kind: ParameterKind,
    fallback: f32,
    min: Option<f32>,
    max: Option<f32>,
}
impl Default for Parameter {
    fn default() -> Self {
        Self::constant(0.0)
    }
}
impl Parameter {
    #[allow(missing_docs)]
    pub fn constant(value: f32) -> Self {
        Self {
            kind: ParameterKind::Constant(value),
            fallback: value,
            min: None,
            max: None,
        }
    }

    /// A parameter bound to the named control.
    pub fn control(controls: &Arc<Controls>, name: &str) -> Self {
        Self {
            kind: ParameterKind::Control {
                name: name.to_string(),
                controls: Arc::clone(controls),
                knob: controls.knob(name),
            },
            fallback: 0.0,
            min: None,
            max: None,
        }
    }

    /// Constrains every returned value to `[min, max]`.
    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.set_range(min, max);
        self
    }

    #[allow(missing_docs)]
    pub fn set_range(&mut self, min: f32, max: f32) {
        self.min = Some(min);
        self.max = Some(max);
    }

    /// The clamped value at the given tick.
    pub fn value_at(&mut self, tick: SampleTick) -> f32 {
        let raw = match &mut self.kind {
            ParameterKind::Constant(value) => *value,
            ParameterKind::Control {
                name,
                controls,
                knob,
            } => {
                if knob.is_none() {
                    *knob = controls.knob(name);
                }
                match knob {
                    Some(knob) => knob.value_at(tick),
                    None => self.fallback,
                }
            }
        };
        self.clip(raw)
    }

    fn clip(&self, value: f32) -> f32 {
        let mut value = value;
        if let Some(min) = self.min {
            value = value.max(min);
        }
        if let Some(max) = self.max {
            value = value.min(max);
        }
        value
    }
}
