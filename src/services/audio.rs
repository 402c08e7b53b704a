// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! [AudioOutput] bridges the DSP loop to the cpal audio interface.
//!
//! The DSP thread pushes finished blocks into a lock-free ring; the device
//! callback pops frames from it and never allocates, logs, or blocks. The
//! cpal stream itself lives on a dedicated thread because it isn't `Send`;
//! a channel carries play/pause/quit commands to it.

use crate::{
    traits::SampleConsumer,
    types::{AudioBuffer, SampleType, BLOCK_SIZE},
};
use anyhow::anyhow;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, SizedSample, Stream, StreamConfig,
};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{Receiver, Sender};
use delegate::delegate;
use log::{error, info, warn};
use std::sync::Arc;

/// A ring buffer of stereo frames that the audio stream consumes.
struct AudioQueue(Arc<ArrayQueue<(SampleType, SampleType)>>);
impl AudioQueue {
    fn new(capacity: usize) -> Self {
        Self(Arc::new(ArrayQueue::new(capacity)))
    }

    delegate! {
        to self.0 {
            fn pop(&self) -> Option<(SampleType, SampleType)>;
            fn force_push(
                &self,
                frame: (SampleType, SampleType),
            ) -> Option<(SampleType, SampleType)>;
        }
    }
}
impl Clone for AudioQueue {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

#[derive(Debug)]
enum AudioOutputInput {
    Play,
    Pause,
    Quit,
}

/// The audio output adapter. Registered with the engine as a consumer; each
/// pushed block lands in the ring for the device callback to drain.
pub struct AudioOutput {
    queue: AudioQueue,
    inputs: Sender<AudioOutputInput>,
    sample_rate: usize,
}
impl std::fmt::Debug for AudioOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioOutput")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}
impl AudioOutput {
    /// The ring holds a few blocks of slack so the DSP thread can run a
    /// little ahead of the hardware.
    const QUEUE_BLOCKS: usize = 4;

    /// Opens the output device (the named one, or the system default) and
    /// spawns the stream thread. Fails only when no usable device exists;
    /// after that, stream problems are logged, never fatal.
    pub fn new_with(device_name: Option<&str>) -> anyhow::Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()?
                .find(|d| d.name().is_ok_and(|n| n == name))
                .ok_or_else(|| anyhow!("output device not found: {name}"))?,
            None => host
                .default_output_device()
                .ok_or_else(|| anyhow!("no default output device available"))?,
        };
        let config = device.default_output_config()?;
        let sample_rate = config.sample_rate().0 as usize;

        let queue = AudioQueue::new(BLOCK_SIZE * Self::QUEUE_BLOCKS);
        let (sender, receiver) = crossbeam_channel::unbounded();

        // Stream creation lives in its own thread because cpal streams
        // aren't Send.
        let queue_clone = queue.clone();
        std::thread::spawn(move || {
            let stream = match config.sample_format() {
                cpal::SampleFormat::F32 => {
                    Self::build_stream::<f32>(&device, &config.into(), queue_clone)
                }
                cpal::SampleFormat::I16 => {
                    Self::build_stream::<i16>(&device, &config.into(), queue_clone)
                }
                cpal::SampleFormat::U16 => {
                    Self::build_stream::<u16>(&device, &config.into(), queue_clone)
                }
                format => Err(anyhow!("unsupported sample format {format}")),
            };
            match stream {
                Ok(stream) => Self::stream_loop(stream, receiver),
                Err(e) => error!("Failed while setting up audio stream: {e}"),
            }
        });

        info!("Audio output open at {sample_rate}Hz");
        Ok(Self {
            queue,
            inputs: sender,
            sample_rate,
        })
    }

    fn stream_loop(stream: Stream, receiver: Receiver<AudioOutputInput>) {
        while let Ok(input) = receiver.recv() {
            match input {
                AudioOutputInput::Play => {
                    if let Err(e) = stream.play() {
                        error!("Failed to start audio stream: {e}");
                    }
                }
                AudioOutputInput::Pause => {
                    let _ = stream.pause();
                }
                AudioOutputInput::Quit => break,
            }
        }
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        queue: AudioQueue,
    ) -> anyhow::Result<Stream>
    where
        T: SizedSample + FromSample<SampleType>,
    {
        let channel_count = config.channels as usize;
        let err_fn = |err| error!("Audio stream error: {err}");

        let stream = device.build_output_stream(
            config,
            move |output: &mut [T], _: &cpal::OutputCallbackInfo| {
                // Real-time context: no locks, no logging, no allocation. An
                // empty ring plays silence.
                for frame in output.chunks_exact_mut(channel_count) {
                    let (left, right) = queue.pop().unwrap_or((0.0, 0.0));
                    frame[0] = T::from_sample(left);
                    if channel_count > 1 {
                        frame[1] = T::from_sample(right);
                    }
                    for sample in frame.iter_mut().skip(2) {
                        *sample = T::from_sample(0.0);
                    }
                }
            },
            err_fn,
            None,
        )?;
        Ok(stream)
    }

    /// Starts the device stream.
    pub fn play(&self) -> anyhow::Result<()> {
        self.inputs.send(AudioOutputInput::Play)?;
        Ok(())
    }

    /// Pauses the device stream.
    pub fn pause(&self) -> anyhow::Result<()> {
        self.inputs.send(AudioOutputInput::Pause)?;
        Ok(())
    }

    /// The device's native rate, which can differ from the engine rate; a
    /// mismatch plays detuned rather than failing.
    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }
}
impl SampleConsumer for AudioOutput {
    fn name(&self) -> &str {
        "audio-output"
    }

    fn push_audio_buffer(&self, buffer: &AudioBuffer) -> anyhow::Result<()> {
        let (left, right) = (buffer.left(), buffer.right());
        let mut overrun = false;
        for i in 0..buffer.len() {
            overrun |= self.queue.force_push((left[i], right[i])).is_some();
        }
        if overrun {
            warn!("Audio ring overrun; dropped oldest frames");
        }
        Ok(())
    }
}
impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.inputs.send(AudioOutputInput::Quit);
    }
}

/// Names of the available audio output devices.
pub fn list_output_devices() -> anyhow::Result<Vec<String>> {
    let host = cpal::default_host();
    Ok(host
        .output_devices()?
        .filter_map(|device| device.name().ok())
        .collect())
}
