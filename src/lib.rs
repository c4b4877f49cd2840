//! polyseq - a multi-track MIDI sequencing and playback engine.
//!
//! Takes editable, tick-addressed note data for any number of tracks
//! and drives one shared software-synthesis engine so that every track
//! stays aligned to a single global transport: per-track start offsets,
//! tempo changes without timeline jumps, drift-free seeking, and
//! collision-free sharing of the engine's program/bank address space.
//!
//! # Layers
//!
//! - [`notes`] - the canonical note store with publish/subscribe and
//!   debounced blob persistence
//! - [`engine`] - the transport, bank allocator, per-track sequencers,
//!   the playback engine, and the controller façade the editing layer
//!   calls
//! - [`synth`] - the synthesis-engine trait plus the SoundFont backend
//!   and a deterministic capture backend
//! - [`output`] - realtime rodio output and offline WAV bounce
//! - [`assets`] - instrument binaries, resolved by the host's cache

pub mod assets;
pub mod engine;
pub mod error;
pub mod notes;
pub mod output;
pub mod synth;

pub use assets::{DirAssets, InstrumentAssets, InstrumentId, MemoryAssets};
pub use engine::{
    AddTrackOptions, EngineController, PlaybackEngine, SessionConfig, DEFAULT_TEMPO, SAMPLE_RATE,
    TICKS_PER_BEAT,
};
pub use error::EngineError;
pub use notes::{MemoryBlobStore, Note, NoteBlobStore, NoteId, NoteStore, TrackId};
pub use output::{bounce_to_wav, AudioOutput};
pub use synth::{CaptureSynth, SoundFontSynth, SynthEngine};
