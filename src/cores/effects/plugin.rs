// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Adapts a hosted [PluginProcessor] to the effect-chain contract.

use super::FxSettings;
use crate::{
    midi::MidiEventAt,
    traits::TransformsBlock,
    types::{AudioBuffer, SampleTick, BLOCK_SIZE, SAMPLE_RATE},
    vst::PluginProcessor,
};

/// An effect backed by a third-party processor. Changing which plugin is
/// loaded is structural; parameter changes apply in place.
#[derive(Debug)]
pub struct PluginFx {
    settings: FxSettings,
    processor: Box<dyn PluginProcessor>,
}
impl PluginFx {
    #[allow(missing_docs)]
    pub fn new_with(
        settings: &FxSettings,
        mut processor: Box<dyn PluginProcessor>,
    ) -> anyhow::Result<Self> {
        processor.activate(SAMPLE_RATE, BLOCK_SIZE)?;
        Ok(Self {
            settings: settings.clone(),
            processor,
        })
    }

    /// The wrapped processor, for parameter access and editor control.
    pub fn processor_mut(&mut self) -> &mut dyn PluginProcessor {
        self.processor.as_mut()
    }
}
impl TransformsBlock for PluginFx {
    fn can_fast_update(&self, settings: &FxSettings) -> bool {
        // Swapping the plugin itself means a different processor: structural.
        settings.kind == self.settings.kind && settings.extra == self.settings.extra
    }

    fn fast_update(&mut self, settings: &FxSettings) {
        self.settings = settings.clone();
    }

    fn render(&mut self, tick: SampleTick, buffer: &mut AudioBuffer, events: &[MidiEventAt]) {
        self.processor.process(tick, buffer, events);
    }
}
