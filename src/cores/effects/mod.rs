// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! The per-track effect chain and the built-in effects.

pub use echo::Echo;
pub use filter::{HighPassFilter, LowPassFilter};
pub use plugin::PluginFx;

mod echo;
mod filter;
mod plugin;

use crate::{
    automation::Controls,
    midi::MidiEventAt,
    traits::TransformsBlock,
    types::{AudioBuffer, SampleTick},
    vst::PluginHost,
};
use anyhow::anyhow;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumIter, IntoStaticStr};

/// Which effect a chain entry is.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    EnumIter,
    Eq,
    IntoStaticStr,
    PartialEq,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FxKind {
    #[allow(missing_docs)]
    #[default]
    Lpf,
    #[allow(missing_docs)]
    Hpf,
    #[allow(missing_docs)]
    Echo,
    /// A hosted third-party processor.
    Plugin,
}

/// One entry of a track's effect chain, as requested by the caller. `extra`
/// is an effect-specific JSON document.
#[derive(Clone, Debug, Derivative, PartialEq, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct FxSettings {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub kind: FxKind,
    /// Effect parameters as JSON; what's accepted depends on the kind.
    pub extra: String,
}
impl FxSettings {
    #[allow(missing_docs)]
    pub fn new_with(name: &str, kind: FxKind, extra: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            extra: extra.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PluginFxParams {
    plugin: String,
}

/// An ordered list of effects rendered in place, in order. The chain can be
/// fast-updated only when the requested list matches the existing one in
/// names and kinds; any structural change goes through track replacement
/// instead.
#[derive(Debug, Default)]
pub struct FxChain {
    effects: Vec<(FxSettings, Box<dyn TransformsBlock>)>,
}
impl FxChain {
    /// Builds the chain, instantiating each effect. Fails on the first
    /// effect that can't be built, leaving nothing half-made.
    pub fn new_with(
        settings: &[FxSettings],
        controls: &Arc<Controls>,
        plugins: &Arc<PluginHost>,
    ) -> anyhow::Result<Self> {
        let mut effects: Vec<(FxSettings, Box<dyn TransformsBlock>)> = Vec::new();

        for fx_settings in settings {
            let fx: Box<dyn TransformsBlock> = match fx_settings.kind {
                FxKind::Lpf => Box::new(LowPassFilter::new_with(fx_settings, controls)),
                FxKind::Hpf => Box::new(HighPassFilter::new_with(fx_settings, controls)),
                FxKind::Echo => Box::new(Echo::new_with(fx_settings, controls)),
                FxKind::Plugin => {
                    let params: PluginFxParams = serde_json::from_str(&fx_settings.extra)
                        .map_err(|e| {
                            anyhow!("effect {} has bad plugin settings: {e}", fx_settings.name)
                        })?;
                    Box::new(PluginFx::new_with(fx_settings, plugins.instantiate(&params.plugin)?)?)
                }
            };
            log::info!("Initialized effect '{}'", fx_settings.name);
            effects.push((fx_settings.clone(), fx));
        }

        Ok(Self { effects })
    }

    /// True iff the requested list matches the current chain entry for entry
    /// (same names, same kinds, in order) and every effect accepts its new
    /// settings in place.
    pub fn can_fast_update(&self, settings: &[FxSettings]) -> bool {
        if settings.len() != self.effects.len() {
            return false;
        }
        self.effects
            .iter()
            .zip(settings.iter())
            .all(|((current, fx), requested)| {
                current.name == requested.name
                    && current.kind == requested.kind
                    && fx.can_fast_update(requested)
            })
    }

    /// Applies new settings in place. Only called after
    /// [FxChain::can_fast_update] said yes, so order and identity are known
    /// to match.
    pub fn fast_update(&mut self, settings: &[FxSettings]) {
        for ((current, fx), requested) in self.effects.iter_mut().zip(settings.iter()) {
            fx.fast_update(requested);
            *current = requested.clone();
        }
    }

    /// Renders every effect in order, in place.
    pub fn render(&mut self, tick: SampleTick, buffer: &mut AudioBuffer, events: &[MidiEventAt]) {
        for (_, fx) in self.effects.iter_mut() {
            fx.render(tick, buffer, events);
        }
    }

    /// The current settings of each entry, in order.
    pub fn settings(&self) -> Vec<FxSettings> {
        self.effects.iter().map(|(s, _)| s.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(settings: &[FxSettings]) -> FxChain {
        let controls = Arc::new(Controls::default());
        let plugins = Arc::new(PluginHost::default());
        FxChain::new_with(settings, &controls, &plugins).unwrap()
    }

    #[test]
    fn chain_renders_in_order() {
        // An LPF into an echo: mostly a smoke test that the chain wires up
        // and transforms in place without changing buffer shape.
        let mut chain = chain(&[
            FxSettings::new_with("f", FxKind::Lpf, r#"{"cutoff": 0.5}"#),
            FxSettings::new_with("e", FxKind::Echo, r#"{"time": 0.05}"#),
        ]);

        let mut buffer = AudioBuffer::default();
        buffer.channels_mut().0.fill(0.25);
        chain.render(0, &mut buffer, &[]);
        assert_eq!(buffer.len(), crate::types::BLOCK_SIZE);
    }

    #[test]
    fn fast_update_requires_identical_shape() {
        let chain = chain(&[
            FxSettings::new_with("f", FxKind::Lpf, "{}"),
            FxSettings::new_with("e", FxKind::Echo, "{}"),
        ]);

        // Same shape, new parameters: fine.
        assert!(chain.can_fast_update(&[
            FxSettings::new_with("f", FxKind::Lpf, r#"{"cutoff": 0.9}"#),
            FxSettings::new_with("e", FxKind::Echo, r#"{"time": 1.0}"#),
        ]));

        // Renamed, reordered, retyped, or resized: all structural.
        assert!(!chain.can_fast_update(&[
            FxSettings::new_with("f2", FxKind::Lpf, "{}"),
            FxSettings::new_with("e", FxKind::Echo, "{}"),
        ]));
        assert!(!chain.can_fast_update(&[
            FxSettings::new_with("e", FxKind::Echo, "{}"),
            FxSettings::new_with("f", FxKind::Lpf, "{}"),
        ]));
        assert!(!chain.can_fast_update(&[
            FxSettings::new_with("f", FxKind::Hpf, "{}"),
            FxSettings::new_with("e", FxKind::Echo, "{}"),
        ]));
        assert!(!chain.can_fast_update(&[FxSettings::new_with("f", FxKind::Lpf, "{}")]));
    }

    #[test]
    fn plugin_effect_fails_cleanly() {
        let controls = Arc::new(Controls::default());
        let plugins = Arc::new(PluginHost::default());
        let result = FxChain::new_with(
            &[FxSettings::new_with(
                "v",
                FxKind::Plugin,
                r#"{"plugin": "Ghost"}"#,
            )],
            &controls,
            &plugins,
        );
        assert!(result.is_err());
    }

    #[test]
    fn fx_kind_serde_names() {
        assert_eq!(serde_json::to_string(&FxKind::Lpf).unwrap(), r#""lpf""#);
        assert_eq!(
            serde_json::from_str::<FxKind>(r#""echo""#).unwrap(),
            FxKind::Echo
        );
    }
}
