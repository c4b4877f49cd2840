//! Sequencing and playback engine.
//!
//! This module houses the transport, the bank allocator, the per-track
//! sequencers, the playback engine that coordinates them, and the
//! controller façade that bridges the note store to the engine.

mod bank;
mod controller;
mod playback;
mod sequencer;
pub mod transport;

pub use bank::BankAllocator;
pub use controller::EngineController;
pub use playback::{AddTrackOptions, PlaybackEngine};
pub use sequencer::{SequencerState, TrackSequencer};
pub use transport::Transport;

/// Default sample rate for audio synthesis (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44_100;

/// Default ticks per quarter note - standard MIDI resolution.
pub const TICKS_PER_BEAT: u32 = 480;

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Session-wide settings, constructed by the host and passed into
/// [`PlaybackEngine::new`]. No process-wide statics: multiple isolated
/// sessions can run side by side.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Audio sample rate in Hz.
    pub sample_rate: u32,
    /// Ticks per quarter note, fixed for the session.
    pub ppq: u32,
    /// Tempo the transport starts at.
    pub default_bpm: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            ppq: TICKS_PER_BEAT,
            default_bpm: DEFAULT_TEMPO,
        }
    }
}
