//! Synthesis engine abstraction.
//!
//! The playback core never renders audio itself; it drives an opaque
//! engine through the [`SynthEngine`] trait. Implementations are
//! dependency-injected at construction time: the SoundFont backend for
//! real output, and the capture engine for deterministic tests and
//! headless runs.

mod capture;
mod soundfont;

pub use capture::{CaptureLog, CaptureSynth, CapturedCall};
pub use soundfont::SoundFontSynth;

use crate::error::EngineError;
use serde::{Deserialize, Serialize};

/// Handle identifying an instrument bank loaded into a synthesis engine.
///
/// Handles are only meaningful to the engine that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BankHandle(pub u64);

/// Kind of a scheduled or immediate note event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEventKind {
    NoteOn,
    NoteOff,
}

/// A note event routed to one of the engine's 16 channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteEvent {
    pub kind: NoteEventKind,
    pub key: u8,
    pub velocity: u8,
}

impl NoteEvent {
    pub fn on(key: u8, velocity: u8) -> Self {
        Self {
            kind: NoteEventKind::NoteOn,
            key,
            velocity,
        }
    }

    pub fn off(key: u8) -> Self {
        Self {
            kind: NoteEventKind::NoteOff,
            key,
            velocity: 0,
        }
    }
}

/// A preset enumerated from a loaded instrument bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    /// Native bank number within the instrument (before any offset).
    pub bank: u32,
    /// Program number (0-127).
    pub program: u8,
    /// Display name from the instrument data, or a fallback.
    pub name: String,
}

/// Opaque software-synthesis engine shared by all tracks.
///
/// The engine owns a monotonically advancing clock measured in ticks.
/// The clock advances during [`render`](SynthEngine::render) at the
/// current time scale (ticks per second), and scheduled events fire
/// sample-accurately as the clock passes them.
///
/// Scheduling contract: `schedule_event` takes a tick *relative to the
/// clock position at the time of the call*; the engine converts it to an
/// absolute clock tick internally. `clear_scheduled` drops every pending
/// event for a channel without sounding it, which is the teardown half of
/// the core's teardown-and-rebuild scheduling policy.
pub trait SynthEngine: Send {
    /// Loads an instrument bank from raw bytes.
    fn load_bank(&mut self, data: &[u8]) -> Result<BankHandle, EngineError>;

    /// Unloads a bank. Channels routed to it fall silent.
    fn unload_bank(&mut self, bank: BankHandle);

    /// Requests an additive bank-number offset for a loaded bank.
    ///
    /// Engines may decline (for example on overlap with another bank);
    /// callers must confirm through [`bank_offset`](SynthEngine::bank_offset)
    /// read-back rather than trusting the request.
    fn set_bank_offset(&mut self, bank: BankHandle, offset: u32);

    /// Returns the offset currently in effect for a bank, if any.
    fn bank_offset(&self, bank: BankHandle) -> Option<u32>;

    /// Enumerates the presets of a loaded bank, sorted by (bank, program).
    fn presets(&self, bank: BankHandle) -> Vec<Preset>;

    /// Routes a channel to a bank and selects a program on it.
    fn select_program(
        &mut self,
        channel: u8,
        bank: BankHandle,
        bank_number: u32,
        program: u8,
    ) -> Result<(), EngineError>;

    /// Schedules a note event `at_tick` ticks after the current clock.
    fn schedule_event(&mut self, channel: u8, at_tick: u64, event: NoteEvent);

    /// Drops all pending scheduled events for a channel.
    fn clear_scheduled(&mut self, channel: u8);

    /// Sounds a note immediately (previews, live input).
    fn note_on(&mut self, channel: u8, key: u8, velocity: u8);

    /// Releases an immediately sounded note.
    fn note_off(&mut self, channel: u8, key: u8);

    /// Sets the continuous channel volume (0-127).
    fn set_channel_volume(&mut self, channel: u8, volume: u8);

    /// Silences every voice on a channel. With `immediate` the cut is
    /// hard; otherwise voices run their release envelope.
    fn all_notes_off(&mut self, channel: u8, immediate: bool);

    /// Returns the active time scale in ticks per second.
    fn time_scale(&self) -> f64;

    /// Sets the time scale. Only safe at the processing-callback
    /// boundary while audio is running; the playback engine enforces
    /// this by queueing tempo changes.
    fn set_time_scale(&mut self, ticks_per_second: f64);

    /// Returns the engine clock position in whole ticks.
    fn current_tick(&self) -> u64;

    /// Renders the next stereo buffer and advances the clock.
    fn render(&mut self, left: &mut [f32], right: &mut [f32]);
}
