// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! An instrument that plays external hardware: MIDI events are dispatched to
//! a device output port by a dedicated worker that follows the engine's
//! block clock at sub-block granularity. It produces no audio of its own.

use crate::{
    midi::{MidiEventAt, MidiMessage, MidiStack},
    traits::Instrument,
    types::{block_duration, AudioBuffer, SampleTick, BLOCK_SIZE, MIDI_CHUNK_SIZE, SAMPLE_RATE},
};
use log::{info, warn};
use midir::{MidiOutput, MidiOutputConnection};
use serde::Deserialize;
use std::{
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct ExternalMidiParams {
    midi_out: String,
}

#[derive(Default)]
struct State {
    stop: bool,
    current_tick: Option<SampleTick>,
    midi_stack: MidiStack,
    connection: Option<MidiOutputConnection>,
    port_name: String,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}
impl Shared {
    /// Blocks until the engine has rendered at least once (so the block
    /// clock has a reference tick) or stop is requested. Returns the first
    /// tick, or `None` on stop.
    fn wait_for_initial_tick(&self) -> Option<SampleTick> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stop {
                return None;
            }
            if let Some(tick) = state.current_tick {
                return Some(tick);
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Sleeps until the deadline unless stop is requested first. Returns
    /// true when stopping.
    fn wait_until_or_stop(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stop {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.cv.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
    }
}

/// Bridges a track to an external MIDI device. The render path only records
/// events and the clock; the worker thread owns the timing-sensitive device
/// writes so a slow driver can never stall the DSP loop.
pub struct ExternalMidi {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    settings_json: String,
}
impl Default for ExternalMidi {
    fn default() -> Self {
        Self {
            shared: Default::default(),
            worker: None,
            settings_json: String::new(),
        }
    }
}
impl std::fmt::Debug for ExternalMidi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalMidi")
            .field("running", &self.worker.is_some())
            .finish()
    }
}
impl ExternalMidi {
    fn configure_port(&self, port_name: &str) {
        let mut state = self.shared.state.lock().unwrap();
        if port_name == state.port_name {
            return;
        }

        state.connection = None;
        state.port_name.clear();

        if port_name.is_empty() {
            return;
        }

        info!("Trying to open MIDI port {port_name}...");
        let output = match MidiOutput::new("vesper") {
            Ok(output) => output,
            Err(e) => {
                warn!("MIDI backend unavailable: {e}");
                return;
            }
        };

        let port = output
            .ports()
            .into_iter()
            .find(|p| output.port_name(p).is_ok_and(|n| n == port_name));
        let Some(port) = port else {
            warn!("MIDI out port {port_name} not found");
            return;
        };

        match output.connect(&port, "vesper-out") {
            Ok(connection) => {
                info!("Found MIDI out port {port_name}");
                state.connection = Some(connection);
                state.port_name = port_name.to_string();
            }
            Err(e) => warn!("Failed to open MIDI out port {port_name}: {e}"),
        }
    }

    /// Spreads one block's events over [MIDI_CHUNK_SIZE]-sample chunks,
    /// sleeping to each chunk's wall-clock instant before sending. The last
    /// chunk finishes early enough to leave slack before the next block.
    fn schedule_midi_events(shared: &Shared, block_at: Instant, block_tick: SampleTick) {
        let mut due = MidiStack::default();
        {
            let mut state = shared.state.lock().unwrap();
            let events = state
                .midi_stack
                .events_at_tick(block_tick + BLOCK_SIZE as SampleTick);
            due.add_events(events);
        }

        let chunk_samples = MIDI_CHUNK_SIZE.min(BLOCK_SIZE);
        let chunk_duration =
            Duration::from_micros((1_000_000 * chunk_samples / SAMPLE_RATE) as u64);

        let mut chunk = 0;
        loop {
            let chunk_at = block_at + chunk_duration * chunk as u32;
            if shared.wait_until_or_stop(chunk_at) {
                return;
            }

            let events =
                due.events_at_tick(block_tick + ((1 + chunk) * chunk_samples) as SampleTick);
            {
                let mut state = shared.state.lock().unwrap();
                if let Some(connection) = state.connection.as_mut() {
                    for event in &events {
                        if let Err(e) = connection.send(&event.message().to_bytes()) {
                            warn!("Failed to send MIDI message: {e}");
                        }
                    }
                }
            }

            chunk += 1;
            if chunk * chunk_samples >= BLOCK_SIZE {
                return;
            }
        }
    }

    fn run(shared: &Shared) {
        let Some(_) = shared.wait_for_initial_tick() else {
            return;
        };

        let block_duration = block_duration();
        let initial_time = Instant::now();
        let mut next_block_at = initial_time;
        let mut block_count: u32 = 0;

        loop {
            if shared.wait_until_or_stop(next_block_at) {
                return;
            }

            let block_tick = {
                let state = shared.state.lock().unwrap();
                state.current_tick.unwrap_or(0)
            };
            Self::schedule_midi_events(shared, next_block_at, block_tick);

            block_count += 1;
            next_block_at = initial_time + block_duration * block_count;
            {
                let mut state = shared.state.lock().unwrap();
                if let Some(tick) = state.current_tick.as_mut() {
                    *tick += BLOCK_SIZE as SampleTick;
                }
            }
        }
    }
}
impl Instrument for ExternalMidi {
    fn apply_settings(&mut self, extra: &str) -> anyhow::Result<()> {
        if extra == self.settings_json {
            return Ok(());
        }

        let params: ExternalMidiParams = match serde_json::from_str(extra) {
            Ok(params) => params,
            Err(e) => {
                // A device that can't be addressed is a playable-but-silent
                // track, not a dead set.
                warn!("Invalid external MIDI settings: {e}");
                return Ok(());
            }
        };

        self.configure_port(&params.midi_out);
        self.settings_json = extra.to_string();
        Ok(())
    }

    fn render(&mut self, tick: SampleTick, events: &[MidiEventAt], _buffer: &mut AudioBuffer) {
        let mut state = self.shared.state.lock().unwrap();
        if state.current_tick.is_none() {
            state.current_tick = Some(tick);
            self.shared.cv.notify_all();
        }
        state
            .midi_stack
            .add_events(events.iter().filter(|e| {
                matches!(e.message(), MidiMessage::Channel { .. })
            }).cloned());
    }

    fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        info!("Starting external MIDI worker");
        let shared = Arc::clone(&self.shared);
        self.worker = Some(std::thread::spawn(move || Self::run(&shared)));
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
            state.connection = None;
            self.shared.cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            info!("External MIDI worker stopped");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "external-midi"
    }
}
impl Drop for ExternalMidi {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiChannel;

    #[test]
    fn missing_port_is_tolerated() {
        let mut inst = ExternalMidi::default();
        assert!(inst
            .apply_settings(r#"{"midi-out": "no-such-port"}"#)
            .is_ok());
        assert!(inst.apply_settings("garbage").is_ok());
    }

    #[test]
    fn render_leaves_audio_silent_and_sets_clock() {
        let mut inst = ExternalMidi::default();
        let mut buffer = AudioBuffer::default();
        let event = MidiEventAt::new(
            "ext1",
            MidiMessage::note_on(MidiChannel::new(0), 60, 100),
            Instant::now(),
        );

        inst.render(4096, &[event], &mut buffer);
        assert!(buffer.left().iter().all(|&s| s == 0.0));
        assert_eq!(
            inst.shared.state.lock().unwrap().current_tick,
            Some(4096)
        );
        assert_eq!(inst.shared.state.lock().unwrap().midi_stack.len(), 1);
    }

    #[test]
    fn start_stop_is_clean_and_idempotent() {
        let mut inst = ExternalMidi::default();
        inst.start().unwrap();
        inst.start().unwrap();

        let mut buffer = AudioBuffer::default();
        inst.render(0, &[], &mut buffer);

        std::thread::sleep(Duration::from_millis(30));
        inst.stop().unwrap();
        inst.stop().unwrap();
    }
}
