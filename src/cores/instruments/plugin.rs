// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Adapts a hosted [PluginProcessor] to the instrument contract.

use crate::{
    midi::MidiEventAt,
    traits::Instrument,
    types::{AudioBuffer, SampleTick, BLOCK_SIZE, SAMPLE_RATE},
    vst::PluginProcessor,
};
use log::warn;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct PluginParams {
    params: BTreeMap<String, f32>,
}

/// An instrument backed by a third-party processor: MIDI events go in, a
/// stereo block comes out.
#[derive(Debug)]
pub struct PluginInstrument {
    processor: Box<dyn PluginProcessor>,
}
impl PluginInstrument {
    #[allow(missing_docs)]
    pub fn new_with(mut processor: Box<dyn PluginProcessor>) -> anyhow::Result<Self> {
        processor.activate(SAMPLE_RATE, BLOCK_SIZE)?;
        Ok(Self { processor })
    }

    /// The wrapped processor, for parameter access and editor control.
    pub fn processor_mut(&mut self) -> &mut dyn PluginProcessor {
        self.processor.as_mut()
    }
}
impl Instrument for PluginInstrument {
    fn apply_settings(&mut self, extra: &str) -> anyhow::Result<()> {
        if extra.is_empty() {
            return Ok(());
        }
        let params: PluginParams = match serde_json::from_str(extra) {
            Ok(params) => params,
            Err(e) => {
                warn!("Ignoring bad plugin instrument settings: {e}");
                return Ok(());
            }
        };

        let known = self.processor.parameters();
        for (name, value) in params.params {
            match known.get(&name) {
                Some(parameter) => {
                    if let Err(e) = self.processor.set_parameter(parameter.id, value) {
                        warn!("Failed to set plugin parameter {name}: {e}");
                    }
                }
                None => warn!("Plugin has no parameter named {name}"),
            }
        }
        Ok(())
    }

    fn render(&mut self, tick: SampleTick, events: &[MidiEventAt], buffer: &mut AudioBuffer) {
        self.processor.process(tick, buffer, events);
    }

    fn name(&self) -> &'static str {
        "plugin"
    }
}
