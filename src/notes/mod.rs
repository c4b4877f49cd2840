//! Editable note data and its persistence.
//!
//! The note model is deliberately small: a track is a set of notes, a
//! note is a pitch with tick timing and a velocity. Everything else the
//! engine needs is derived at schedule time.

pub mod blob;
mod note;
mod store;

pub use note::{Note, NoteId};
pub use store::{
    MemoryBlobStore, NoteBlobStore, NoteStore, StoreSnapshot, SubscriptionId, SAVE_DEBOUNCE,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a track.
///
/// Track identity originates outside the core (the host's project
/// store), so IDs must be stable across sessions; a v4 UUID rather than
/// a per-process counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackId(Uuid);

impl TrackId {
    /// Generates a fresh random track ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an ID handed in by the host.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TrackId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_ids_unique() {
        assert_ne!(TrackId::new(), TrackId::new());
    }

    #[test]
    fn test_track_id_serde_round_trip() {
        let id = TrackId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: TrackId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
