//! Note representation.
//!
//! A note is a single note-on/note-off pair with tick-based timing,
//! pitch, and velocity. Notes are the only musical data the core stores;
//! everything the scheduler emits is derived from them.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique note IDs.
/// Atomic so parallel blob encoding cannot hand out duplicates.
static NOTE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a note within a track.
/// Allows edits to address notes without index-based lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteId(u64);

impl NoteId {
    /// Generates a new unique note ID.
    ///
    /// Thread-safe: uses atomic increment internally.
    pub fn new() -> Self {
        Self(NOTE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw ID value (for serialization/debugging).
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for NoteId {
    fn default() -> Self {
        Self::new()
    }
}

/// A single note with tick-based timing and dynamics.
///
/// Notes are owned by their track's entry in the [`NoteStore`] and are
/// always copied, never aliased, when handed to a sequencer for
/// scheduling. Edits during playback therefore cannot mutate an
/// in-flight schedule.
///
/// [`NoteStore`]: crate::notes::NoteStore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Unique identifier for this note instance.
    pub id: NoteId,

    /// MIDI note number (0-127). 60 = Middle C (C4).
    pub pitch: u8,

    /// Note velocity (0-127). 0 is silent, 127 is maximum.
    pub velocity: u8,

    /// Start position in ticks from the beginning of the track's own
    /// timeline (before any start offset is applied).
    pub start_tick: u64,

    /// Duration in ticks. Determines when the note-off is emitted.
    pub length_ticks: u64,
}

impl Note {
    /// Creates a new note with the given parameters.
    ///
    /// Pitch and velocity are clamped to the 0-127 range.
    ///
    /// # Examples
    ///
    /// ```
    /// use polyseq::notes::Note;
    ///
    /// // Middle C, quarter note at the start of the track
    /// let note = Note::new(60, 100, 0, 480);
    /// ```
    pub fn new(pitch: u8, velocity: u8, start_tick: u64, length_ticks: u64) -> Self {
        Self {
            id: NoteId::new(),
            pitch: pitch.min(127),
            velocity: velocity.min(127),
            start_tick,
            length_ticks,
        }
    }

    /// Returns the end tick of this note (start + length).
    pub fn end_tick(&self) -> u64 {
        self.start_tick.saturating_add(self.length_ticks)
    }

    /// Checks if this note is sounding at a specific local tick.
    pub fn is_active_at(&self, tick: u64) -> bool {
        tick >= self.start_tick && tick < self.end_tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_creation() {
        let note = Note::new(60, 100, 0, 480);
        assert_eq!(note.pitch, 60);
        assert_eq!(note.velocity, 100);
        assert_eq!(note.start_tick, 0);
        assert_eq!(note.length_ticks, 480);
    }

    #[test]
    fn test_note_clamping() {
        let note = Note::new(200, 200, 0, 480);
        assert_eq!(note.pitch, 127);
        assert_eq!(note.velocity, 127);
    }

    #[test]
    fn test_note_active() {
        let note = Note::new(60, 100, 100, 200);
        assert!(!note.is_active_at(99));
        assert!(note.is_active_at(100));
        assert!(note.is_active_at(200));
        assert!(!note.is_active_at(300));
    }

    #[test]
    fn test_unique_ids() {
        let a = Note::new(60, 100, 0, 480);
        let b = Note::new(60, 100, 0, 480);
        assert_ne!(a.id, b.id);
    }
}
