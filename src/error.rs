//! Error types for the sequencing and playback core.
//!
//! All fallible public operations in the engine return [`EngineError`].
//! Failures that the design clamps or degrades (seek targets out of range,
//! channel exhaustion, bank-offset mismatches during playback) are handled
//! in place and logged rather than surfaced here.

use crate::notes::TrackId;
use crate::synth::BankHandle;
use thiserror::Error;

/// Errors surfaced by the playback core.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An operation referenced a track that was never attached or has
    /// already been removed. Always surfaced, never swallowed.
    #[error("unknown track {0}")]
    UnknownTrack(TrackId),

    /// An instrument asset could not be loaded into the synthesis engine.
    /// The track is left unattached rather than partially initialized.
    #[error("failed to load instrument {id}: {reason}")]
    InstrumentLoad { id: String, reason: String },

    /// The synthesis engine reported a different bank offset than the one
    /// requested. Logged as a warning by the allocator; carried here for
    /// callers that want to inspect the disagreement.
    #[error("bank offset mismatch: requested {requested}, engine reports {actual:?}")]
    BankOffsetMismatch {
        requested: u32,
        actual: Option<u32>,
    },

    /// An operation referenced an instrument bank that is not loaded.
    #[error("unknown instrument bank {0:?}")]
    UnknownBank(BankHandle),

    /// The persistence collaborator failed to store or load a note blob.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A note blob could not be decoded back into the note model.
    #[error("malformed note blob: {0}")]
    BlobFormat(String),

    /// Underlying I/O failure (asset reads, bounce output).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
