//! Per-track event scheduler.
//!
//! A [`TrackSequencer`] binds one track to one instrument bank and one
//! channel of the shared synthesis engine. It converts between the
//! track's local timeline (shifted by the track's start offset) and the
//! engine's global timeline, and installs note events into the engine's
//! per-channel queue.
//!
//! Scheduling policy: the queue is always torn down and rebuilt when the
//! playhead moves, whether by play, by seek, or through a note update.
//! Relative repositioning of a live queue is
//! never attempted. In-flight notes are not resumed across a seek; the
//! teardown silences them and only notes starting at or after the new
//! position are rescheduled.

use crate::engine::transport::{ms_to_ticks, ticks_to_ms};
use crate::notes::{Note, TrackId};
use crate::synth::{BankHandle, NoteEvent, SynthEngine};
use tracing::{debug, warn};

/// How close (in ticks) the internal playhead must already be to the
/// requested position for `play` to skip the queue rebuild.
const PLAYHEAD_TOLERANCE_TICKS: i64 = 1;

/// Generic program numbers tried in order when preset enumeration
/// yields nothing usable (piano, strings, lead).
const FALLBACK_PROGRAMS: [u8; 3] = [0, 48, 80];

/// Lifecycle of a track sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Attached but not initialized, or stopped.
    Idle,
    /// Program selected, ready to play.
    Prepared,
    /// Events installed and sounding.
    Playing,
    /// Silenced with position retained.
    Paused,
}

/// Scheduler for a single track on the shared synthesis engine.
///
/// All methods that talk to the engine borrow it from the caller; the
/// playback engine owns the engine instance and serializes access by
/// construction.
pub struct TrackSequencer {
    track_id: TrackId,
    channel: u8,
    bank: BankHandle,
    /// Native bank number and program selected at initialize time.
    bank_number: u32,
    program: u8,
    /// Defensive copy of the track's notes, sorted by start tick.
    notes: Vec<Note>,
    start_offset_ticks: i64,
    /// Authoritative when the offset was given in real time; re-derived
    /// into ticks on every tempo change.
    offset_ms: Option<f64>,
    muted: bool,
    saved_volume: u8,
    state: SequencerState,
    /// Track-local playhead: `transport position − start offset`.
    /// Signed, because a track whose offset exceeds the transport
    /// position has not started yet.
    local_tick: i64,
}

impl TrackSequencer {
    pub fn new(
        track_id: TrackId,
        bank: BankHandle,
        channel: u8,
        start_offset_ticks: i64,
        volume: u8,
    ) -> Self {
        Self {
            track_id,
            channel: channel.min(15),
            bank,
            bank_number: 0,
            program: 0,
            notes: Vec::new(),
            start_offset_ticks,
            offset_ms: None,
            muted: false,
            saved_volume: volume.min(127),
            state: SequencerState::Idle,
            local_tick: 0,
        }
    }

    /// Copies the note set, selects a program at the allocated bank, and
    /// applies the channel volume. Transitions to `Prepared`.
    ///
    /// The first enumerated preset wins; if enumeration fails, a short
    /// list of generic programs is tried in order.
    pub fn initialize(
        &mut self,
        synth: &mut dyn SynthEngine,
        notes: &[Note],
    ) -> Result<(), crate::error::EngineError> {
        self.notes = notes.to_vec();
        self.notes.sort_by_key(|n| n.start_tick);

        let presets = synth.presets(self.bank);
        match presets.first() {
            Some(preset) => {
                self.bank_number = preset.bank;
                self.program = preset.program;
                synth.select_program(self.channel, self.bank, preset.bank, preset.program)?;
            }
            None => {
                warn!(
                    track = %self.track_id,
                    "preset enumeration empty, trying fallback programs"
                );
                let mut selected = false;
                for program in FALLBACK_PROGRAMS {
                    if synth
                        .select_program(self.channel, self.bank, 0, program)
                        .is_ok()
                    {
                        self.bank_number = 0;
                        self.program = program;
                        selected = true;
                        break;
                    }
                }
                if !selected {
                    return Err(crate::error::EngineError::UnknownBank(self.bank));
                }
            }
        }

        synth.set_channel_volume(self.channel, self.effective_volume());
        self.state = SequencerState::Prepared;
        Ok(())
    }

    /// Maps a global transport position to this track's local timeline.
    pub fn global_to_local(&self, global_ticks: u64) -> i64 {
        global_ticks as i64 - self.start_offset_ticks
    }

    /// Keeps the local playhead in step with the transport while
    /// playing. Called from the engine's processing tick.
    pub fn sync_position(&mut self, global_ticks: u64) {
        if self.state == SequencerState::Playing {
            self.local_tick = self.global_to_local(global_ticks);
        }
    }

    /// Starts (or repositions) playback from a global position.
    ///
    /// If the internal playhead already sits within tolerance of the
    /// target while playing, nothing is rebuilt; otherwise the event
    /// queue is torn down and every note at or after the local position
    /// is scheduled at its relative tick.
    pub fn play(&mut self, synth: &mut dyn SynthEngine, global_ticks: u64) {
        let local = self.global_to_local(global_ticks);
        if self.state == SequencerState::Playing
            && (local - self.local_tick).abs() <= PLAYHEAD_TOLERANCE_TICKS
        {
            return;
        }
        if self.state == SequencerState::Playing {
            synth.all_notes_off(self.channel, false);
        }
        synth.clear_scheduled(self.channel);
        synth.set_channel_volume(self.channel, self.effective_volume());
        self.schedule_from(synth, local);
        self.local_tick = local;
        self.state = SequencerState::Playing;
    }

    /// Silences the channel and clears pending events, keeping the
    /// local position for a later resume.
    pub fn pause(&mut self, synth: &mut dyn SynthEngine, global_ticks: u64) {
        if self.state != SequencerState::Playing {
            return;
        }
        self.local_tick = self.global_to_local(global_ticks);
        synth.all_notes_off(self.channel, false);
        synth.clear_scheduled(self.channel);
        self.state = SequencerState::Paused;
    }

    /// Hard-stops the track: immediate silence, full queue teardown,
    /// local position reset to zero.
    pub fn stop(&mut self, synth: &mut dyn SynthEngine) {
        synth.all_notes_off(self.channel, true);
        synth.clear_scheduled(self.channel);
        self.local_tick = 0;
        self.state = SequencerState::Idle;
    }

    /// Moves the playhead to a global position.
    ///
    /// Seeking always silences and rebuilds the queue; it never adjusts
    /// a live queue relative to its old position. If the track was
    /// playing it stays playing from the new position.
    pub fn seek(&mut self, synth: &mut dyn SynthEngine, global_ticks: u64) {
        let was_playing = self.state == SequencerState::Playing;
        synth.all_notes_off(self.channel, true);
        synth.clear_scheduled(self.channel);
        self.local_tick = self.global_to_local(global_ticks);
        if was_playing {
            self.schedule_from(synth, self.local_tick);
        }
    }

    /// Replaces the note set with a fresh copy.
    ///
    /// While playing, stale future events are cancelled and the
    /// remainder of the new set is scheduled from the current position.
    pub fn update_notes(&mut self, synth: &mut dyn SynthEngine, notes: &[Note]) {
        self.notes = notes.to_vec();
        self.notes.sort_by_key(|n| n.start_tick);
        if self.state == SequencerState::Playing {
            synth.all_notes_off(self.channel, false);
            synth.clear_scheduled(self.channel);
            self.schedule_from(synth, self.local_tick);
        }
    }

    /// Sets the start offset in ticks. Clears any real-time offset and
    /// reschedules if playing.
    pub fn set_offset_ticks(
        &mut self,
        synth: &mut dyn SynthEngine,
        global_ticks: u64,
        offset_ticks: i64,
    ) {
        self.start_offset_ticks = offset_ticks;
        self.offset_ms = None;
        self.reschedule_at(synth, global_ticks);
    }

    /// Sets the start offset in milliseconds, converted at the current
    /// time scale. The millisecond value stays authoritative across
    /// tempo changes.
    pub fn set_offset_ms(
        &mut self,
        synth: &mut dyn SynthEngine,
        global_ticks: u64,
        offset_ms: f64,
        ticks_per_second: f64,
    ) {
        self.offset_ms = Some(offset_ms);
        self.start_offset_ticks = ms_to_ticks(offset_ms, ticks_per_second);
        self.reschedule_at(synth, global_ticks);
    }

    /// Reads the start offset back in milliseconds at a time scale.
    pub fn offset_ms(&self, ticks_per_second: f64) -> f64 {
        ticks_to_ms(self.start_offset_ticks, ticks_per_second)
    }

    /// Re-derives a real-time offset in new tick units after a tempo
    /// change. Returns whether the tick offset moved (in which case the
    /// caller reschedules).
    pub fn retune_offset(&mut self, ticks_per_second: f64) -> bool {
        let Some(ms) = self.offset_ms else {
            return false;
        };
        let ticks = ms_to_ticks(ms, ticks_per_second);
        if ticks == self.start_offset_ticks {
            return false;
        }
        debug!(
            track = %self.track_id,
            from = self.start_offset_ticks,
            to = ticks,
            "re-derived real-time offset in new tick units"
        );
        self.start_offset_ticks = ticks;
        true
    }

    /// Sets the track volume. Takes effect immediately through the
    /// continuous channel-volume control unless muted.
    pub fn set_volume(&mut self, synth: &mut dyn SynthEngine, volume: u8) {
        self.saved_volume = volume.min(127);
        synth.set_channel_volume(self.channel, self.effective_volume());
    }

    /// Mutes or unmutes the track, acting immediately on the channel
    /// volume. The saved volume is restored on unmute.
    pub fn set_muted(&mut self, synth: &mut dyn SynthEngine, muted: bool) {
        self.muted = muted;
        synth.set_channel_volume(self.channel, self.effective_volume());
    }

    /// End of the track on the global timeline, in ticks.
    pub fn global_end_tick(&self) -> u64 {
        let local_end = self
            .notes
            .iter()
            .map(|n| n.end_tick())
            .max()
            .unwrap_or(0) as i64;
        (local_end + self.start_offset_ticks).max(0) as u64
    }

    pub fn track_id(&self) -> TrackId {
        self.track_id
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn bank(&self) -> BankHandle {
        self.bank
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn local_tick(&self) -> i64 {
        self.local_tick
    }

    pub fn start_offset_ticks(&self) -> i64 {
        self.start_offset_ticks
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn volume(&self) -> u8 {
        self.saved_volume
    }

    /// Native (bank, program) pair selected at initialize time.
    pub fn selected_program(&self) -> (u32, u8) {
        (self.bank_number, self.program)
    }

    fn effective_volume(&self) -> u8 {
        if self.muted {
            0
        } else {
            self.saved_volume
        }
    }

    /// Installs note-on/note-off pairs for every note at or after the
    /// local position, each at its tick distance from that position.
    fn schedule_from(&self, synth: &mut dyn SynthEngine, local_tick: i64) {
        let mut scheduled = 0usize;
        for note in &self.notes {
            let start = note.start_tick as i64;
            if start < local_tick {
                continue;
            }
            let rel = (start - local_tick) as u64;
            synth.schedule_event(
                self.channel,
                rel,
                NoteEvent::on(note.pitch, note.velocity),
            );
            synth.schedule_event(
                self.channel,
                rel + note.length_ticks.max(1),
                NoteEvent::off(note.pitch),
            );
            scheduled += 1;
        }
        debug!(
            track = %self.track_id,
            channel = self.channel,
            from = local_tick,
            notes = scheduled,
            "installed schedule"
        );
    }

    fn reschedule_at(&mut self, synth: &mut dyn SynthEngine, global_ticks: u64) {
        if self.state == SequencerState::Playing {
            self.seek(synth, global_ticks);
        } else {
            self.local_tick = self.global_to_local(global_ticks);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{CaptureSynth, CapturedCall, NoteEventKind};

    fn sequencer(synth: &mut CaptureSynth, offset: i64) -> TrackSequencer {
        let bank = synth.load_bank(&[]).unwrap();
        let mut seq = TrackSequencer::new(TrackId::new(), bank, 0, offset, 100);
        seq.initialize(synth, &[Note::new(60, 100, 0, 480)]).unwrap();
        seq
    }

    #[test]
    fn test_local_global_consistency() {
        let mut synth = CaptureSynth::new();
        let mut seq = sequencer(&mut synth, 240);
        seq.seek(&mut synth, 1000);
        assert_eq!(seq.local_tick(), 760);
    }

    #[test]
    fn test_local_goes_negative_before_track_start() {
        let mut synth = CaptureSynth::new();
        let mut seq = sequencer(&mut synth, 960);
        seq.seek(&mut synth, 480);
        assert_eq!(seq.local_tick(), -480);
    }

    #[test]
    fn test_play_schedules_on_and_off() {
        let mut synth = CaptureSynth::new();
        let log = synth.log();
        let mut seq = sequencer(&mut synth, 0);
        seq.play(&mut synth, 0);

        let schedules = log.schedules(0);
        assert_eq!(
            schedules,
            vec![
                (0, NoteEventKind::NoteOn, 60),
                (480, NoteEventKind::NoteOff, 60),
            ]
        );
        assert_eq!(seq.state(), SequencerState::Playing);
    }

    #[test]
    fn test_note_before_playhead_not_scheduled() {
        let mut synth = CaptureSynth::new();
        let log = synth.log();
        let mut seq = sequencer(&mut synth, 0);
        // The only note starts at local 0, already behind local 240.
        seq.play(&mut synth, 240);
        assert!(log.schedules(0).is_empty());
    }

    #[test]
    fn test_seek_rebuilds_and_silences_in_flight() {
        let mut synth = CaptureSynth::new();
        let log = synth.log();
        let mut seq = sequencer(&mut synth, 0);
        seq.play(&mut synth, 0);
        log.clear();

        // Mid-note seek: the note-on already passed, so nothing is
        // rescheduled and the sounding note is cut by the teardown.
        seq.seek(&mut synth, 240);
        let calls = log.calls();
        assert!(calls.contains(&CapturedCall::AllNotesOff {
            channel: 0,
            immediate: true
        }));
        assert!(calls.contains(&CapturedCall::ClearScheduled { channel: 0 }));
        assert!(log.schedules(0).is_empty());
        assert_eq!(seq.state(), SequencerState::Playing);
        assert_eq!(seq.local_tick(), 240);
        assert!(synth.pending().is_empty());
    }

    #[test]
    fn test_idempotent_stop() {
        let mut synth = CaptureSynth::new();
        let log = synth.log();
        let mut seq = sequencer(&mut synth, 0);
        seq.play(&mut synth, 0);
        seq.sync_position(400);
        seq.stop(&mut synth);
        assert_eq!(seq.local_tick(), 0);
        assert_eq!(seq.state(), SequencerState::Idle);

        log.clear();
        seq.play(&mut synth, 0);
        // Second run starts from local zero again.
        assert_eq!(log.schedules(0)[0], (0, NoteEventKind::NoteOn, 60));
    }

    #[test]
    fn test_pause_retains_position() {
        let mut synth = CaptureSynth::new();
        let log = synth.log();
        let mut seq = sequencer(&mut synth, 0);
        seq.play(&mut synth, 0);
        seq.pause(&mut synth, 240);
        assert_eq!(seq.state(), SequencerState::Paused);
        assert_eq!(seq.local_tick(), 240);
        assert!(log.calls().contains(&CapturedCall::AllNotesOff {
            channel: 0,
            immediate: false
        }));
    }

    #[test]
    fn test_update_notes_reschedules_from_current_position() {
        let mut synth = CaptureSynth::new();
        let log = synth.log();
        let mut seq = sequencer(&mut synth, 0);
        seq.play(&mut synth, 0);
        seq.sync_position(200);
        log.clear();

        seq.update_notes(
            &mut synth,
            &[Note::new(64, 90, 480, 240), Note::new(62, 90, 0, 100)],
        );
        // The note at tick 0 is already behind the playhead.
        assert_eq!(
            log.schedules(0),
            vec![
                (280, NoteEventKind::NoteOn, 64),
                (520, NoteEventKind::NoteOff, 64),
            ]
        );
    }

    #[test]
    fn test_offset_ms_round_trip_across_tempo_change() {
        let mut synth = CaptureSynth::new();
        let mut seq = sequencer(&mut synth, 0);
        // 2000 ms at 960 ticks/s = 1920 ticks.
        seq.set_offset_ms(&mut synth, 0, 2000.0, 960.0);
        assert_eq!(seq.start_offset_ticks(), 1920);

        // 90 BPM at 480 PPQ = 720 ticks/s; same wall-clock offset.
        assert!(seq.retune_offset(720.0));
        assert_eq!(seq.start_offset_ticks(), 1440);
        assert!((seq.offset_ms(720.0) - 2000.0).abs() < 1.5);
    }

    #[test]
    fn test_tick_offset_not_retuned() {
        let mut synth = CaptureSynth::new();
        let mut seq = sequencer(&mut synth, 0);
        seq.set_offset_ticks(&mut synth, 0, 960);
        assert!(!seq.retune_offset(720.0));
        assert_eq!(seq.start_offset_ticks(), 960);
    }

    #[test]
    fn test_mute_acts_through_channel_volume() {
        let mut synth = CaptureSynth::new();
        let log = synth.log();
        let mut seq = sequencer(&mut synth, 0);
        log.clear();
        seq.set_muted(&mut synth, true);
        assert!(log.calls().contains(&CapturedCall::ChannelVolume {
            channel: 0,
            volume: 0
        }));
        seq.set_muted(&mut synth, false);
        assert!(log.calls().contains(&CapturedCall::ChannelVolume {
            channel: 0,
            volume: 100
        }));
    }

    #[test]
    fn test_fallback_program_when_enumeration_fails() {
        let mut synth = CaptureSynth::new();
        synth.set_presets(Vec::new());
        let log = synth.log();
        let bank = synth.load_bank(&[]).unwrap();
        let mut seq = TrackSequencer::new(TrackId::new(), bank, 0, 0, 100);
        seq.initialize(&mut synth, &[]).unwrap();
        assert_eq!(seq.selected_program(), (0, FALLBACK_PROGRAMS[0]));
        assert!(log.calls().iter().any(|c| matches!(
            c,
            CapturedCall::SelectProgram { program: 0, .. }
        )));
    }
}
