// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Structs that hold configuration information about various parts of the
//! system. Intended to be deserialized; every field has a sensible default,
//! so missing keys never fail.

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings for the DSP half of the engine.
#[derive(Clone, Debug, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct DspSettings {
    /// Whether to open the audio output device at start. Off by default so
    /// library embedders (and tests) opt in explicitly.
    pub enable_output: bool,

    /// Output device name, or `None` for the system default.
    pub output_device: Option<String>,
}

/// Top-level engine configuration.
#[derive(Clone, Debug, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineSettings {
    #[allow(missing_docs)]
    pub dsp: DspSettings,

    /// Directory scanned for sample packs at init. `None` starts with an
    /// empty bank.
    pub sample_directory: Option<PathBuf>,

    /// Extra plugin search paths, appended to the platform defaults.
    pub plugin_paths: Vec<PathBuf>,
}
impl EngineSettings {
    /// Parses settings from a JSON document.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads settings from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let settings = EngineSettings::from_json("{}").unwrap();
        assert!(!settings.dsp.enable_output);
        assert!(settings.dsp.output_device.is_none());
        assert!(settings.sample_directory.is_none());
        assert!(settings.plugin_paths.is_empty());
    }

    #[test]
    fn partial_document_fills_the_rest() {
        let settings =
            EngineSettings::from_json(r#"{"dsp": {"enable-output": true}}"#).unwrap();
        assert!(settings.dsp.enable_output);
        assert!(settings.sample_directory.is_none());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let settings =
            EngineSettings::from_json(r#"{"unknown-subsystem": {"x": 1}}"#).unwrap();
        assert!(!settings.dsp.enable_output);
    }
}
