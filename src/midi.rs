// Copyright (c) 2025 Mike Tsao. All rights reserved.

//! MIDI message types and the timed-event plumbing between the scheduler and
//! the DSP loop.
//!
//! Standard channel-voice messages are carried as [midly::MidiMessage] so the
//! external-MIDI path can emit real wire bytes. In-process commands travel as
//! a typed [SysexCommand] rather than opaque sysex payloads; [MidiMessage::to_bytes]
//! still produces the standard `0xF0 … 0xF7` framing when a device needs it.

use crate::types::SampleTick;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use strum_macros::{Display, FromRepr, IntoStaticStr};

/// Newtype for MIDI channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiChannel(pub u8);
impl MidiChannel {
    #[allow(missing_docs)]
    pub const MIN_VALUE: u8 = 0;
    #[allow(missing_docs)]
    pub const MAX_VALUE: u8 = 15; // inclusive

    #[allow(missing_docs)]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }
}
impl From<u8> for MidiChannel {
    fn from(value: u8) -> Self {
        Self(value)
    }
}
impl From<MidiChannel> for u8 {
    fn from(value: MidiChannel) -> Self {
        value.0
    }
}

/// Discriminant of an in-process command. The numeric values are part of the
/// sysex wire layout and must not change.
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, IntoStaticStr, PartialEq)]
#[repr(u8)]
pub enum SysexKind {
    #[allow(missing_docs)]
    SamplerPlay = 1,
    #[allow(missing_docs)]
    SamplerStop = 2,
    #[allow(missing_docs)]
    UpdateControls = 3,
}

/// An in-process command: a kind plus a JSON payload. The serialization is a
/// private contract between the runtime and the engine; no external consumer
/// parses it.
#[derive(Clone, Debug, PartialEq)]
pub struct SysexCommand {
    #[allow(missing_docs)]
    pub kind: SysexKind,
    #[allow(missing_docs)]
    pub json: String,
}
impl SysexCommand {
    #[allow(missing_docs)]
    pub fn new(kind: SysexKind, json: impl Into<String>) -> Self {
        Self {
            kind,
            json: json.into(),
        }
    }

    /// Encodes as a standard sysex frame: `F0, kind, payload…, F7`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.json.len() + 3);
        bytes.push(0xF0);
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(self.json.as_bytes());
        bytes.push(0xF7);
        bytes
    }

    /// Decodes a sysex frame produced by [SysexCommand::encode]. Returns
    /// `None` for anything that isn't ours.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 || bytes[0] != 0xF0 || bytes[bytes.len() - 1] != 0xF7 {
            return None;
        }
        let kind = SysexKind::from_repr(bytes[1])?;
        let json = std::str::from_utf8(&bytes[2..bytes.len() - 1]).ok()?;
        Some(Self::new(kind, json))
    }
}

/// A MIDI message as it travels through the engine: either a standard
/// channel-voice message or a typed in-process command.
#[derive(Clone, Debug, PartialEq)]
pub enum MidiMessage {
    /// A standard channel-voice message.
    Channel {
        #[allow(missing_docs)]
        channel: MidiChannel,
        #[allow(missing_docs)]
        message: midly::MidiMessage,
    },
    /// An in-process command.
    Sysex(SysexCommand),
}
impl MidiMessage {
    #[allow(missing_docs)]
    pub fn note_on(channel: MidiChannel, key: u8, velocity: u8) -> Self {
        Self::Channel {
            channel,
            message: midly::MidiMessage::NoteOn {
                key: key.into(),
                vel: velocity.into(),
            },
        }
    }

    #[allow(missing_docs)]
    pub fn note_off(channel: MidiChannel, key: u8, velocity: u8) -> Self {
        Self::Channel {
            channel,
            message: midly::MidiMessage::NoteOff {
                key: key.into(),
                vel: velocity.into(),
            },
        }
    }

    #[allow(missing_docs)]
    pub fn control_change(channel: MidiChannel, controller: u8, value: u8) -> Self {
        Self::Channel {
            channel,
            message: midly::MidiMessage::Controller {
                controller: controller.into(),
                value: value.into(),
            },
        }
    }

    /// The in-process command, if this is one.
    pub fn as_sysex(&self) -> Option<&SysexCommand> {
        match self {
            Self::Sysex(command) => Some(command),
            _ => None,
        }
    }

    /// Standard MIDI wire bytes for this message, suitable for sending to a
    /// hardware port.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Channel { channel, message } => {
                let event = midly::live::LiveEvent::Midi {
                    channel: channel.0.into(),
                    message: *message,
                };
                let mut bytes = Vec::with_capacity(3);
                // Writing a channel-voice message into a Vec cannot fail.
                let _ = event.write_std(&mut bytes);
                bytes
            }
            Self::Sysex(command) => command.encode(),
        }
    }
}

/// A [MidiMessage] tagged with its destination track and the wall-clock
/// instant it is due. The engine stamps the sample tick at the next block
/// boundary; once set, the tick is at or after that block's start.
#[derive(Clone, Debug)]
pub struct MidiEventAt {
    track: String,
    message: MidiMessage,
    at: Instant,
    tick: Option<SampleTick>,
}
impl MidiEventAt {
    #[allow(missing_docs)]
    pub fn new(track: impl Into<String>, message: MidiMessage, at: Instant) -> Self {
        Self {
            track: track.into(),
            message,
            at,
            tick: None,
        }
    }

    #[allow(missing_docs)]
    pub fn track(&self) -> &str {
        &self.track
    }

    #[allow(missing_docs)]
    pub fn message(&self) -> &MidiMessage {
        &self.message
    }

    #[allow(missing_docs)]
    pub fn at(&self) -> Instant {
        self.at
    }

    #[allow(missing_docs)]
    pub fn tick(&self) -> Option<SampleTick> {
        self.tick
    }

    #[allow(missing_docs)]
    pub fn set_tick(&mut self, tick: SampleTick) {
        self.tick = Some(tick);
    }
}

/// An append-only inbox of pending events with a tick-indexed drain.
/// Instruments use it to hold events that land mid-block until rendering
/// reaches their tick.
#[derive(Debug, Default)]
pub struct MidiStack {
    events: Vec<MidiEventAt>,
}
impl MidiStack {
    /// Appends events, preserving arrival order.
    pub fn add_events(&mut self, events: impl IntoIterator<Item = MidiEventAt>) {
        self.events.extend(events);
    }

    /// Returns, in arrival order, every event whose tick is at or before the
    /// given tick, removing them from the stack. An event that was never
    /// stamped is considered due immediately.
    pub fn events_at_tick(&mut self, tick: SampleTick) -> Vec<MidiEventAt> {
        let mut due = Vec::new();
        let mut kept = Vec::with_capacity(self.events.len());
        for event in self.events.drain(..) {
            if event.tick().map_or(true, |t| t <= tick) {
                due.push(event);
            } else {
                kept.push(event);
            }
        }
        self.events = kept;
        due
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_at_tick(track: &str, tick: SampleTick) -> MidiEventAt {
        let mut e = MidiEventAt::new(
            track,
            MidiMessage::note_on(MidiChannel::new(0), 60, 100),
            Instant::now(),
        );
        e.set_tick(tick);
        e
    }

    #[test]
    fn sysex_frame_round_trips() {
        let command = SysexCommand::new(SysexKind::SamplerPlay, r#"{"pack":"909","name":"kick"}"#);
        let bytes = command.encode();
        assert_eq!(bytes[0], 0xF0);
        assert_eq!(*bytes.last().unwrap(), 0xF7);
        assert_eq!(SysexCommand::decode(&bytes), Some(command));
    }

    #[test]
    fn sysex_decode_rejects_foreign_frames() {
        assert_eq!(SysexCommand::decode(&[0xF0, 0x7F, 0xF7]), None);
        assert_eq!(SysexCommand::decode(&[0x90, 60, 100]), None);
        assert_eq!(SysexCommand::decode(&[]), None);
    }

    #[test]
    fn note_on_wire_bytes() {
        let bytes = MidiMessage::note_on(MidiChannel::new(2), 60, 100).to_bytes();
        assert_eq!(bytes, vec![0x92, 60, 100]);
    }

    #[test]
    fn stack_drains_in_arrival_order() {
        let mut stack = MidiStack::default();
        stack.add_events([
            event_at_tick("a", 10),
            event_at_tick("b", 5),
            event_at_tick("c", 20),
        ]);

        let due = stack.events_at_tick(10);
        let tracks: Vec<&str> = due.iter().map(|e| e.track()).collect();
        assert_eq!(tracks, vec!["a", "b"]);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn stack_drain_is_idempotent() {
        let mut stack = MidiStack::default();
        stack.add_events([event_at_tick("a", 3)]);

        assert_eq!(stack.events_at_tick(3).len(), 1);
        assert!(stack.events_at_tick(3).is_empty());
    }

    #[test]
    fn unstamped_events_are_due_immediately() {
        let mut stack = MidiStack::default();
        stack.add_events([MidiEventAt::new(
            "a",
            MidiMessage::note_off(MidiChannel::new(0), 60, 0),
            Instant::now(),
        )]);
        assert_eq!(stack.events_at_tick(0).len(), 1);
    }
}
