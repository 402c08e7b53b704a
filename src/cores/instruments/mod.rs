// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! The instruments a track can host. Sampler, external MIDI, and plugin are
//! co-equal variants behind the [Instrument](crate::traits::Instrument)
//! trait; this module picks and builds the right one from track settings.

pub use external::ExternalMidi;
pub use plugin::PluginInstrument;
pub use sampler::Sampler;

mod external;
mod plugin;
mod sampler;

use crate::{automation::Controls, traits::Instrument, util::SampleBank, vst::PluginHost};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumIter, IntoStaticStr};

/// Which instrument a track hosts.
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
pub enum InstrumentKind {
    #[allow(missing_docs)]
    #[default]
    Sampler,
    #[allow(missing_docs)]
    ExternalMidi,
    /// A hosted third-party processor.
    Plugin,
}

#[derive(Debug, Deserialize)]
struct PluginInstrumentParams {
    plugin: String,
}

/// Builds an instrument of the given kind and applies its configuration.
/// This is the slow path: it may load samples, open devices, or instantiate
/// plugins, so callers run it outside any lock the DSP loop takes.
pub fn build_instrument(
    kind: InstrumentKind,
    extra: &str,
    samples: &Arc<SampleBank>,
    controls: &Arc<Controls>,
    plugins: &Arc<PluginHost>,
) -> anyhow::Result<Box<dyn Instrument>> {
    let mut instrument: Box<dyn Instrument> = match kind {
        InstrumentKind::Sampler => Box::new(Sampler::new_with(samples, controls)),
        InstrumentKind::ExternalMidi => Box::new(ExternalMidi::default()),
        InstrumentKind::Plugin => {
            let params: PluginInstrumentParams = serde_json::from_str(extra)
                .map_err(|e| anyhow!("bad plugin instrument settings: {e}"))?;
            Box::new(PluginInstrument::new_with(plugins.instantiate(&params.plugin)?)?)
        }
    };
    instrument.apply_settings(extra)?;
    Ok(instrument)
}
