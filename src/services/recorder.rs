// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! Records the engine's output to a 32-bit float stereo WAV file.

use crate::{
    traits::SampleConsumer,
    types::{AudioBuffer, SAMPLE_RATE},
};
use anyhow::anyhow;
use log::info;
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Mutex,
};

type Writer = hound::WavWriter<BufWriter<File>>;

#[derive(Default)]
struct RecorderState {
    writer: Option<Writer>,
    frames: u64,
}

/// A [SampleConsumer] that appends every pushed block to a WAV file. The
/// file becomes valid when [WavRecorder::finalize] patches the RIFF header;
/// detach the consumer before finalizing.
pub struct WavRecorder {
    path: PathBuf,
    state: Mutex<RecorderState>,
}
impl std::fmt::Debug for WavRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavRecorder").field("path", &self.path).finish()
    }
}
impl WavRecorder {
    /// Opens the output file, creating parent directories if missing.
    pub fn new_with(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let spec = hound::WavSpec {
            channels: crate::types::NUM_CHANNELS as u16,
            sample_rate: SAMPLE_RATE as u32,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec)?;

        info!("Started audio recording to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(RecorderState {
                writer: Some(writer),
                frames: 0,
            }),
        })
    }

    /// Flushes and closes the file. Idempotent; returns the total number of
    /// frames written.
    pub fn finalize(&self) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        if let Some(writer) = state.writer.take() {
            writer.finalize()?;
            info!(
                "Saved audio recording to {} ({} frames)",
                self.path.display(),
                state.frames
            );
        }
        Ok(state.frames)
    }

    #[allow(missing_docs)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
impl SampleConsumer for WavRecorder {
    fn name(&self) -> &str {
        "wav-recorder"
    }

    fn push_audio_buffer(&self, buffer: &AudioBuffer) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(writer) = state.writer.as_mut() else {
            return Err(anyhow!("recorder already finalized"));
        };

        let (left, right) = (buffer.left(), buffer.right());
        for i in 0..buffer.len() {
            writer.write_sample(left[i])?;
            writer.write_sample(right[i])?;
        }
        state.frames += buffer.len() as u64;
        Ok(())
    }
}
impl Drop for WavRecorder {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BLOCK_SIZE;

    #[test]
    fn records_a_valid_wav_with_exact_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");

        let recorder = WavRecorder::new_with(&path).unwrap();
        let mut buffer = AudioBuffer::default();
        buffer.channels_mut().0.fill(0.5);

        for _ in 0..3 {
            recorder.push_audio_buffer(&buffer).unwrap();
        }
        assert_eq!(recorder.finalize().unwrap(), 3 * BLOCK_SIZE as u64);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE as u32);
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);
        assert_eq!(reader.duration(), 3 * BLOCK_SIZE as u32);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c/take.wav");
        let recorder = WavRecorder::new_with(&path).unwrap();
        recorder.finalize().unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn push_after_finalize_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = WavRecorder::new_with(&dir.path().join("x.wav")).unwrap();
        recorder.finalize().unwrap();
        assert!(recorder.push_audio_buffer(&AudioBuffer::default()).is_err());
    }

    #[test]
    fn finalize_twice_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = WavRecorder::new_with(&dir.path().join("y.wav")).unwrap();
        assert_eq!(recorder.finalize().unwrap(), 0);
        assert_eq!(recorder.finalize().unwrap(), 0);
    }
}
