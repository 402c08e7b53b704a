// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Third-party plugin hosting, reduced to the two things the core needs: a
//! scanner that discovers `.vst3` bundles on the platform search paths, and
//! the opaque [PluginProcessor] capability that tracks drive. Loading plugin
//! binaries is a separate concern behind that trait; this build registers
//! discovered bundles but cannot instantiate them.

use crate::{
    midi::MidiEventAt,
    types::{AudioBuffer, SampleTick},
};
use anyhow::anyhow;
use log::{info, warn};
use once_cell::sync::Lazy;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};
use walkdir::WalkDir;

/// A parameter exposed by a plugin.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginParameter {
    #[allow(missing_docs)]
    pub id: u32,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub default_value: f32,
    #[allow(missing_docs)]
    pub min_value: f32,
    #[allow(missing_docs)]
    pub max_value: f32,
}

/// What the scanner learns about a bundle without loading it.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginInfo {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub path: PathBuf,
}

/// The capability a hosted processor exposes to the engine. Instruments and
/// effects wrap one of these; the engine never sees plugin-format details.
pub trait PluginProcessor: Send + std::fmt::Debug {
    /// Prepares the processor for rendering.
    fn activate(&mut self, sample_rate: usize, block_size: usize) -> anyhow::Result<()>;

    /// Processes one block in place, with this track's MIDI events.
    fn process(&mut self, tick: SampleTick, buffer: &mut AudioBuffer, events: &[MidiEventAt]);

    /// The processor's parameters, keyed by name.
    fn parameters(&self) -> BTreeMap<String, PluginParameter>;

    #[allow(missing_docs)]
    fn set_parameter(&mut self, id: u32, value: f32) -> anyhow::Result<()>;

    /// Opens the plugin's own editor window, if it has one.
    fn open_editor(&mut self) -> anyhow::Result<()> {
        Err(anyhow!("processor has no editor"))
    }

    #[allow(missing_docs)]
    fn close_editor(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

static DEFAULT_SEARCH_PATHS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    let mut paths: Vec<PathBuf> = Vec::new();

    #[cfg(target_os = "macos")]
    {
        paths.push("/Library/Audio/Plug-Ins/VST3".into());
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join("Library/Audio/Plug-Ins/VST3"));
        }
    }
    #[cfg(target_os = "windows")]
    {
        paths.push("C:\\Program Files\\Common Files\\VST3".into());
        paths.push("C:\\Program Files (x86)\\Common Files\\VST3".into());
    }
    #[cfg(target_os = "linux")]
    {
        paths.push("/usr/lib/vst3".into());
        paths.push("/usr/local/lib/vst3".into());
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".vst3"));
        }
    }

    paths
});

/// Scans for plugins and hands out processors. One per engine.
#[derive(Debug, Default)]
pub struct PluginHost {
    search_paths: Mutex<Vec<PathBuf>>,
    plugins: RwLock<BTreeMap<String, PluginInfo>>,
}
impl PluginHost {
    /// A host with the platform default search paths.
    pub fn new_with(extra_paths: &[PathBuf]) -> Self {
        let mut search_paths = DEFAULT_SEARCH_PATHS.clone();
        search_paths.extend_from_slice(extra_paths);
        Self {
            search_paths: Mutex::new(search_paths),
            plugins: Default::default(),
        }
    }

    #[allow(missing_docs)]
    pub fn add_search_path(&self, path: &Path) {
        self.search_paths.lock().unwrap().push(path.to_path_buf());
    }

    /// Walks every search path and records each `.vst3` bundle found. A
    /// missing directory is skipped silently; anything else odd is logged and
    /// skipped.
    pub fn scan(&self) -> anyhow::Result<()> {
        let search_paths = self.search_paths.lock().unwrap().clone();
        let mut plugins = self.plugins.write().unwrap();

        for root in &search_paths {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root).follow_links(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable plugin path: {e}");
                        continue;
                    }
                };
                if entry.path().extension().is_some_and(|ext| ext == "vst3") {
                    let name = entry
                        .path()
                        .file_stem()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    info!("Found plugin bundle: {name}");
                    plugins.insert(
                        name.clone(),
                        PluginInfo {
                            name,
                            path: entry.path().to_path_buf(),
                        },
                    );
                }
            }
        }

        Ok(())
    }

    /// Everything the scan found, keyed by name.
    pub fn plugins(&self) -> BTreeMap<String, PluginInfo> {
        self.plugins.read().unwrap().clone()
    }

    /// Creates a processor for the named plugin. Scanning only records
    /// bundles; loading their binaries is not available in this build, so
    /// this fails for every plugin — with a different message depending on
    /// whether the name is at least known.
    pub fn instantiate(&self, name: &str) -> anyhow::Result<Box<dyn PluginProcessor>> {
        match self.plugins.read().unwrap().get(name) {
            Some(info) => Err(anyhow!(
                "plugin {} found at {} but binary loading is not supported",
                info.name,
                info.path.display()
            )),
            None => Err(anyhow!("plugin not found: {name}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_records_bundles_in_extra_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Comb.vst3")).unwrap();
        std::fs::create_dir(dir.path().join("not-a-plugin")).unwrap();

        let host = PluginHost::new_with(&[dir.path().to_path_buf()]);
        host.scan().unwrap();

        let plugins = host.plugins();
        assert!(plugins.contains_key("Comb"));
        assert!(!plugins.contains_key("not-a-plugin"));
    }

    #[test]
    fn instantiate_distinguishes_known_from_unknown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Comb.vst3")).unwrap();

        let host = PluginHost::new_with(&[dir.path().to_path_buf()]);
        host.scan().unwrap();

        let known = host.instantiate("Comb").unwrap_err();
        assert!(known.to_string().contains("not supported"));

        let unknown = host.instantiate("Ghost").unwrap_err();
        assert!(unknown.to_string().contains("not found"));
    }

    #[test]
    fn missing_search_path_is_fine() {
        let host = PluginHost::new_with(&[PathBuf::from("/definitely/not/here")]);
        assert!(host.scan().is_ok());
    }
}
