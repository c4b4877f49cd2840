//! Note blob codec.
//!
//! The persistence collaborator stores each track's notes as an opaque
//! blob; this module fixes the blob format to a single-music-track
//! Standard MIDI File so any sequencer can read what the store writes.
//! Pitch, tick position, length, and velocity round-trip exactly at the
//! session resolution.
//!
//! Encoding is a small hand-rolled SMF writer (delta times as
//! variable-length quantities); decoding goes through midly and rescales
//! tick resolution when the source PPQ differs from the session's.

use crate::error::EngineError;
use crate::notes::Note;
use midly::{Smf, Timing, TrackEventKind};
use std::collections::HashMap;

/// All blob events are written on one channel; the channel a track
/// plays on is runtime state, not note data.
const BLOB_CHANNEL: u8 = 0;

/// Writes a variable-length quantity (VLQ) used for delta times.
///
/// VLQ encodes 7 bits per byte, MSB set on every byte but the last.
fn write_vlq(value: u32, buffer: &mut Vec<u8>) {
    if value == 0 {
        buffer.push(0);
        return;
    }

    let mut temp = value;
    let mut bytes = Vec::with_capacity(4);
    while temp > 0 {
        bytes.push((temp & 0x7F) as u8);
        temp >>= 7;
    }
    for (i, &byte) in bytes.iter().rev().enumerate() {
        if i < bytes.len() - 1 {
            buffer.push(byte | 0x80);
        } else {
            buffer.push(byte);
        }
    }
}

/// A timed event destined for the single music track.
struct TimedEvent {
    tick: u64,
    /// Lower sorts first among same-tick events, so note-offs precede
    /// note-ons of the next note.
    priority: u8,
    bytes: [u8; 3],
    len: usize,
}

fn note_on(tick: u64, pitch: u8, velocity: u8) -> TimedEvent {
    TimedEvent {
        tick,
        priority: 1,
        bytes: [0x90 | BLOB_CHANNEL, pitch, velocity],
        len: 3,
    }
}

fn note_off(tick: u64, pitch: u8) -> TimedEvent {
    TimedEvent {
        tick,
        priority: 0,
        bytes: [0x80 | BLOB_CHANNEL, pitch, 0],
        len: 3,
    }
}

/// Result of decoding a note blob.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlob {
    /// Recovered notes, sorted by start tick, rescaled to the target
    /// resolution.
    pub notes: Vec<Note>,
    /// Tempo from the blob header, if present.
    pub bpm: Option<f64>,
    /// Time signature from the blob header, if present.
    pub time_signature: Option<(u8, u8)>,
}

/// Encodes a note set as a single-track SMF (format 0).
///
/// # Arguments
///
/// * `notes` - The notes to persist
/// * `ppq` - Session tick resolution, written as the file division
/// * `bpm` - Session tempo, written as a tempo meta event
/// * `time_signature` - Session time signature (numerator, denominator)
pub fn encode_notes(notes: &[Note], ppq: u32, bpm: f64, time_signature: (u8, u8)) -> Vec<u8> {
    let mut track = Vec::new();

    // Tempo meta: FF 51 03, microseconds per quarter note.
    let usec_per_beat = (60_000_000.0 / bpm.max(1.0)).round() as u32;
    track.extend_from_slice(&[0x00, 0xFF, 0x51, 0x03]);
    track.push((usec_per_beat >> 16) as u8);
    track.push((usec_per_beat >> 8) as u8);
    track.push(usec_per_beat as u8);

    // Time signature meta: FF 58 04 nn dd cc bb.
    let (numerator, denominator) = time_signature;
    track.extend_from_slice(&[
        0x00,
        0xFF,
        0x58,
        0x04,
        numerator,
        denominator_to_power(denominator),
        24, // Clocks per metronome click
        8,  // 32nd notes per quarter
    ]);

    let mut events: Vec<TimedEvent> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        events.push(note_on(note.start_tick, note.pitch, note.velocity));
        events.push(note_off(note.end_tick().max(note.start_tick + 1), note.pitch));
    }
    events.sort_by_key(|e| (e.tick, e.priority));

    let mut last_tick = 0u64;
    for event in &events {
        let delta = event.tick.saturating_sub(last_tick);
        write_vlq(delta.min(0x0FFF_FFFF) as u32, &mut track);
        track.extend_from_slice(&event.bytes[..event.len]);
        last_tick = event.tick;
    }

    // End of track: FF 2F 00.
    track.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);

    let mut blob = Vec::with_capacity(track.len() + 22);
    blob.extend_from_slice(b"MThd");
    blob.extend_from_slice(&6u32.to_be_bytes());
    blob.extend_from_slice(&0u16.to_be_bytes()); // Format 0
    blob.extend_from_slice(&1u16.to_be_bytes()); // One track
    blob.extend_from_slice(&(ppq.min(0x7FFF) as u16).to_be_bytes());
    blob.extend_from_slice(b"MTrk");
    blob.extend_from_slice(&(track.len() as u32).to_be_bytes());
    blob.extend_from_slice(&track);
    blob
}

/// Decodes a note blob back into the note model.
///
/// Notes from every track and channel in the file are merged into one
/// set (the blob is per track; channels are runtime state). Tick
/// positions are rescaled when the source resolution differs from
/// `target_ppq`.
pub fn decode_notes(data: &[u8], target_ppq: u32) -> Result<DecodedBlob, EngineError> {
    let smf = Smf::parse(data).map_err(|e| EngineError::BlobFormat(e.to_string()))?;

    let source_ppq = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int() as u32,
        Timing::Timecode(_, _) => {
            return Err(EngineError::BlobFormat(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };

    let mut notes: Vec<Note> = Vec::new();
    let mut bpm: Option<f64> = None;
    let mut time_signature: Option<(u8, u8)> = None;
    // Active notes keyed by (channel, pitch) -> (start_tick, velocity).
    let mut active: HashMap<(u8, u8), (u64, u8)> = HashMap::new();

    for track in &smf.tracks {
        let mut current_tick = 0u64;
        for event in track {
            current_tick += scale_ticks(event.delta.as_int() as u64, source_ppq, target_ppq);

            match event.kind {
                TrackEventKind::Meta(meta) => match meta {
                    midly::MetaMessage::Tempo(usec_per_beat) => {
                        let usec = usec_per_beat.as_int();
                        if usec > 0 {
                            bpm = Some(60_000_000.0 / usec as f64);
                        }
                    }
                    midly::MetaMessage::TimeSignature(num, denom_power, _, _) => {
                        time_signature = Some((num, 1u8 << denom_power));
                    }
                    _ => {}
                },
                TrackEventKind::Midi { channel, message } => {
                    let ch = channel.as_int();
                    match message {
                        midly::MidiMessage::NoteOn { key, vel } => {
                            let pitch = key.as_int();
                            let velocity = vel.as_int();
                            if velocity > 0 {
                                active.insert((ch, pitch), (current_tick, velocity));
                            } else if let Some((start, vel)) = active.remove(&(ch, pitch)) {
                                // Velocity-zero note-on is a note-off.
                                let length = current_tick.saturating_sub(start).max(1);
                                notes.push(Note::new(pitch, vel, start, length));
                            }
                        }
                        midly::MidiMessage::NoteOff { key, .. } => {
                            let pitch = key.as_int();
                            if let Some((start, vel)) = active.remove(&(ch, pitch)) {
                                let length = current_tick.saturating_sub(start).max(1);
                                notes.push(Note::new(pitch, vel, start, length));
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        // Close anything left hanging in a truncated file with a
        // one-beat default length.
        for ((_, pitch), (start, vel)) in active.drain() {
            notes.push(Note::new(pitch, vel, start, target_ppq as u64));
        }
    }

    notes.sort_by_key(|n| n.start_tick);
    Ok(DecodedBlob {
        notes,
        bpm,
        time_signature,
    })
}

/// Rescales a tick count between resolutions.
fn scale_ticks(ticks: u64, source_ppq: u32, target_ppq: u32) -> u64 {
    if source_ppq == target_ppq || source_ppq == 0 {
        ticks
    } else {
        ticks * target_ppq as u64 / source_ppq as u64
    }
}

/// Time signature denominators are stored as powers of two.
fn denominator_to_power(denominator: u8) -> u8 {
    match denominator {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        16 => 4,
        32 => 5,
        _ => 2, // Default to quarter note
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlq_encoding() {
        let mut buffer = Vec::new();

        write_vlq(0, &mut buffer);
        assert_eq!(buffer, vec![0x00]);
        buffer.clear();

        write_vlq(127, &mut buffer);
        assert_eq!(buffer, vec![0x7F]);
        buffer.clear();

        write_vlq(128, &mut buffer);
        assert_eq!(buffer, vec![0x81, 0x00]);
        buffer.clear();

        write_vlq(0x4000, &mut buffer);
        assert_eq!(buffer, vec![0x81, 0x80, 0x00]);
    }

    #[test]
    fn test_round_trip_exact() {
        let notes = vec![
            Note::new(60, 100, 0, 480),
            Note::new(64, 90, 480, 240),
            Note::new(67, 127, 480, 960),
            Note::new(36, 1, 4800, 1),
        ];
        let blob = encode_notes(&notes, 480, 120.0, (4, 4));
        let decoded = decode_notes(&blob, 480).unwrap();

        assert_eq!(decoded.notes.len(), notes.len());
        for (original, recovered) in notes.iter().zip(&decoded.notes) {
            assert_eq!(recovered.pitch, original.pitch);
            assert_eq!(recovered.velocity, original.velocity);
            assert_eq!(recovered.start_tick, original.start_tick);
            assert_eq!(recovered.length_ticks, original.length_ticks);
        }
    }

    #[test]
    fn test_meta_round_trip() {
        let blob = encode_notes(&[], 480, 90.0, (3, 8));
        let decoded = decode_notes(&blob, 480).unwrap();
        assert!((decoded.bpm.unwrap() - 90.0).abs() < 0.01);
        assert_eq!(decoded.time_signature, Some((3, 8)));
    }

    #[test]
    fn test_resolution_rescale() {
        let notes = vec![Note::new(60, 100, 960, 480)];
        let blob = encode_notes(&notes, 960, 120.0, (4, 4));
        let decoded = decode_notes(&blob, 480).unwrap();
        assert_eq!(decoded.notes[0].start_tick, 480);
        assert_eq!(decoded.notes[0].length_ticks, 240);
    }

    #[test]
    fn test_same_pitch_back_to_back() {
        let notes = vec![Note::new(60, 100, 0, 480), Note::new(60, 80, 480, 480)];
        let blob = encode_notes(&notes, 480, 120.0, (4, 4));
        let decoded = decode_notes(&blob, 480).unwrap();
        assert_eq!(decoded.notes.len(), 2);
        assert_eq!(decoded.notes[0].length_ticks, 480);
        assert_eq!(decoded.notes[1].start_tick, 480);
        assert_eq!(decoded.notes[1].velocity, 80);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            decode_notes(&[0u8; 32], 480),
            Err(EngineError::BlobFormat(_))
        ));
    }
}
