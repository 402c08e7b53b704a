// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Sample packs: directories of WAV files described by a `pack.json`
//! manifest, loaded once at init and shared read-only with every sampler.

use crate::types::{SampleType, SAMPLE_RATE};
use log::info;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use thiserror::Error;

/// Why a sample or pack failed to load.
#[derive(Debug, Error)]
pub enum SampleLoadError {
    /// The engine runs at a fixed rate; resampling is not supported.
    #[error("unsupported sample rate {0} (only {SAMPLE_RATE}Hz is supported)")]
    UnsupportedRate(u32),

    /// Only mono and stereo sources are accepted.
    #[error("unsupported channel count {0} (only mono and stereo are supported)")]
    UnsupportedChannels(u16),

    /// The pack manifest was missing or malformed.
    #[error("bad pack manifest {path}: {message}")]
    BadManifest {
        #[allow(missing_docs)]
        path: PathBuf,
        #[allow(missing_docs)]
        message: String,
    },

    #[allow(missing_docs)]
    #[error(transparent)]
    Wav(#[from] hound::Error),

    #[allow(missing_docs)]
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decoded stereo sample data, immutable after load.
#[derive(Debug)]
pub struct SampleData {
    name: String,
    left: Vec<SampleType>,
    right: Vec<SampleType>,
}
impl SampleData {
    /// Attenuation applied when duplicating a mono source to both channels,
    /// to avoid clipping on playback.
    const MONO_TO_STEREO_GAIN: SampleType = 0.5;

    /// Builds a sample from raw channel data. Mono input (empty `right`) is
    /// duplicated to both channels at reduced gain.
    pub fn new_with(name: &str, left: Vec<SampleType>, right: Vec<SampleType>) -> Self {
        if right.is_empty() {
            let attenuated: Vec<SampleType> = left
                .iter()
                .map(|&s| s * Self::MONO_TO_STEREO_GAIN)
                .collect();
            Self {
                name: name.to_string(),
                left: attenuated.clone(),
                right: attenuated,
            }
        } else {
            Self {
                name: name.to_string(),
                left,
                right,
            }
        }
    }

    /// Reads a WAV file, accepting 48kHz mono or stereo in integer or float
    /// formats.
    pub fn load(name: &str, path: &Path) -> Result<Self, SampleLoadError> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        if spec.sample_rate as usize != SAMPLE_RATE {
            return Err(SampleLoadError::UnsupportedRate(spec.sample_rate));
        }
        if spec.channels == 0 || spec.channels > 2 {
            return Err(SampleLoadError::UnsupportedChannels(spec.channels));
        }

        let interleaved: Vec<SampleType> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as SampleType;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as SampleType * scale))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        if spec.channels == 1 {
            Ok(Self::new_with(name, interleaved, Vec::new()))
        } else {
            let left = interleaved.iter().step_by(2).copied().collect();
            let right = interleaved.iter().skip(1).step_by(2).copied().collect();
            Ok(Self::new_with(name, left, right))
        }
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(missing_docs)]
    pub fn left(&self) -> &[SampleType] {
        &self.left
    }

    #[allow(missing_docs)]
    pub fn right(&self) -> &[SampleType] {
        &self.right
    }

    /// Number of frames.
    pub fn duration_samples(&self) -> usize {
        self.left.len()
    }

    /// Duration of `frames` frames in milliseconds at the engine rate.
    pub fn duration_ms(&self, frames: usize) -> f32 {
        frames as f32 * 1000.0 / SAMPLE_RATE as f32
    }
}

#[derive(Debug, Deserialize)]
struct PackManifestEntry {
    name: String,
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct PackManifest {
    samples: Vec<PackManifestEntry>,
}

/// A named collection of samples.
#[derive(Debug, Default)]
pub struct SamplePack {
    samples: HashMap<String, Arc<SampleData>>,
}
impl SamplePack {
    /// Loads a pack directory: `pack.json` lists `{name, path}` entries with
    /// paths relative to the directory.
    pub fn load(dir: &Path) -> Result<Self, SampleLoadError> {
        let manifest_path = dir.join("pack.json");
        let manifest: PackManifest = serde_json::from_str(&std::fs::read_to_string(
            &manifest_path,
        )?)
        .map_err(|e| SampleLoadError::BadManifest {
            path: manifest_path,
            message: e.to_string(),
        })?;

        let mut r = Self::default();
        for entry in manifest.samples {
            let sample = SampleData::load(&entry.name, &dir.join(&entry.path))?;
            info!("Loaded sample {}", entry.name);
            r.insert(sample);
        }
        Ok(r)
    }

    /// Adds a sample, replacing any with the same name.
    pub fn insert(&mut self, sample: SampleData) {
        self.samples
            .insert(sample.name().to_string(), Arc::new(sample));
    }

    /// Exact-name lookup first, then the first sample whose name is contained
    /// in the pattern. Live-coded names are often abbreviated, so the fuzzy
    /// fallback keeps old sets playable after a pack is reorganized.
    pub fn sample(&self, pattern: &str) -> Option<Arc<SampleData>> {
        if let Some(sample) = self.samples.get(pattern) {
            return Some(Arc::clone(sample));
        }
        self.samples
            .iter()
            .find(|(name, _)| pattern.contains(name.as_str()))
            .map(|(_, sample)| Arc::clone(sample))
    }

    /// All sample names, sorted.
    pub fn sample_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.samples.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Every loaded pack, shared between the engine and all sampler instances.
#[derive(Debug, Default)]
pub struct SampleBank {
    packs: RwLock<HashMap<String, Arc<SamplePack>>>,
}
impl SampleBank {
    /// Scans a directory for pack subdirectories (those containing a
    /// `pack.json`) and loads each one. A pack that fails to load fails the
    /// whole init, since a half-available bank is confusing to play against.
    pub fn load_directory(&self, dir: &Path) -> Result<(), SampleLoadError> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() && path.join("pack.json").is_file() {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let pack = SamplePack::load(&path)?;
                info!("Loaded sample pack {name}");
                self.add_pack(&name, pack);
            }
        }
        Ok(())
    }

    /// Registers a pack under a name, replacing any existing one.
    pub fn add_pack(&self, name: &str, pack: SamplePack) {
        self.packs
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::new(pack));
    }

    #[allow(missing_docs)]
    pub fn pack(&self, name: &str) -> Option<Arc<SamplePack>> {
        self.packs.read().unwrap().get(name).cloned()
    }

    /// Resolves `pack` + `name` to a sample.
    pub fn sample(&self, pack: &str, name: &str) -> Option<Arc<SampleData>> {
        self.pack(pack).and_then(|p| p.sample(name))
    }

    /// Names of all loaded packs, sorted.
    pub fn pack_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.packs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}
