//! Multi-track playback engine.
//!
//! Owns the shared synthesis engine, the global transport, the bank
//! allocator, and one [`TrackSequencer`] per attached track. Transport
//! operations fan out to every sequencer; a failure on one track is
//! logged and does not block the others, and the transport's running
//! flag flips only after the fan-out has completed.
//!
//! Tempo changes while running are queued and flushed at the next
//! processing tick ([`PlaybackEngine::process`]), the only point where
//! changing the engine's time scale is safe. When the transport is
//! stopped there is no real-time hazard and the change applies at once.

use crate::engine::bank::BankAllocator;
use crate::engine::sequencer::{SequencerState, TrackSequencer};
use crate::engine::transport::Transport;
use crate::engine::SessionConfig;
use crate::error::EngineError;
use crate::notes::{Note, TrackId};
use crate::synth::{NoteEvent, SynthEngine};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Channel reserved for percussion instruments.
const PERCUSSION_CHANNEL: u8 = 9;

/// Channel reused when all melodic channels are taken.
const OVERFLOW_CHANNEL: u8 = 1;

/// Per-track options for [`PlaybackEngine::add_track`].
#[derive(Debug, Clone)]
pub struct AddTrackOptions {
    /// Start offset on the global timeline, in ticks.
    pub offset_ticks: i64,
    /// Start offset in milliseconds. When set it overrides
    /// `offset_ticks` and stays authoritative across tempo changes.
    pub offset_ms: Option<f64>,
    /// Initial channel volume (0-127).
    pub volume: u8,
    /// Routes the track to the reserved percussion channel.
    pub percussion: bool,
}

impl Default for AddTrackOptions {
    fn default() -> Self {
        Self {
            offset_ticks: 0,
            offset_ms: None,
            volume: 100,
            percussion: false,
        }
    }
}

/// Coordinates all attached tracks against one global transport.
pub struct PlaybackEngine {
    synth: Box<dyn SynthEngine>,
    banks: BankAllocator,
    transport: Transport,
    tracks: HashMap<TrackId, TrackSequencer>,
    /// Tempo change waiting for the next processing tick.
    pending_bpm: Option<f64>,
    /// Engine clock reading when the transport last started or sought.
    clock_anchor: u64,
    /// Transport position at the same moment.
    position_anchor: u64,
}

impl PlaybackEngine {
    /// Creates an engine around a dependency-injected synthesis backend.
    pub fn new(mut synth: Box<dyn SynthEngine>, config: SessionConfig) -> Self {
        let transport = Transport::new(config.default_bpm, config.ppq);
        synth.set_time_scale(transport.ticks_per_second());
        Self {
            synth,
            banks: BankAllocator::new(),
            transport,
            tracks: HashMap::new(),
            pending_bpm: None,
            clock_anchor: 0,
            position_anchor: 0,
        }
    }

    /// Attaches a track: loads its instrument into the shared engine,
    /// installs a collision-free bank offset, assigns a channel, and
    /// prepares a sequencer. Re-adding an attached track replaces it.
    ///
    /// On instrument failure the track is left unattached rather than
    /// partially initialized.
    pub fn add_track(
        &mut self,
        track_id: TrackId,
        notes: &[Note],
        instrument_data: &[u8],
        options: AddTrackOptions,
    ) -> Result<(), EngineError> {
        if self.tracks.contains_key(&track_id) {
            self.remove_track(track_id)?;
        }

        let bank = self.synth.load_bank(instrument_data)?;
        let offset = self.banks.install(self.synth.as_mut(), bank);
        let channel = self.assign_channel(options.percussion);

        let mut sequencer = TrackSequencer::new(
            track_id,
            bank,
            channel,
            options.offset_ticks,
            options.volume,
        );
        if let Err(e) = sequencer.initialize(self.synth.as_mut(), notes) {
            self.synth.unload_bank(bank);
            self.banks.release(bank);
            return Err(e);
        }
        let position = self.transport.position_ticks();
        if let Some(ms) = options.offset_ms {
            sequencer.set_offset_ms(
                self.synth.as_mut(),
                position,
                ms,
                self.transport.ticks_per_second(),
            );
        }
        if self.transport.is_running() {
            sequencer.play(self.synth.as_mut(), position);
        }

        info!(
            track = %track_id,
            channel,
            bank_offset = offset,
            notes = notes.len(),
            "attached track"
        );
        self.tracks.insert(track_id, sequencer);
        Ok(())
    }

    /// Detaches a track, silencing it and releasing its instrument bank
    /// and offset.
    pub fn remove_track(&mut self, track_id: TrackId) -> Result<(), EngineError> {
        let mut sequencer = self
            .tracks
            .remove(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        sequencer.stop(self.synth.as_mut());
        let bank = sequencer.bank();
        self.synth.unload_bank(bank);
        self.banks.release(bank);
        info!(track = %track_id, "detached track");
        Ok(())
    }

    /// Starts playback from the current transport position.
    pub fn play(&mut self) {
        let position = self.transport.position_ticks();
        for sequencer in self.tracks.values_mut() {
            sequencer.play(self.synth.as_mut(), position);
        }
        self.anchor(position);
        self.transport.set_running(true);
        info!(position, "transport running");
    }

    /// Pauses playback, retaining every track's position.
    pub fn pause(&mut self) {
        let position = self.transport.position_ticks();
        for sequencer in self.tracks.values_mut() {
            sequencer.pause(self.synth.as_mut(), position);
        }
        self.transport.set_running(false);
        info!(position, "transport paused");
    }

    /// Stops playback unconditionally: immediate silence on every
    /// track, position reset to zero. Any queued tempo change applies
    /// now that the real-time hazard is gone.
    pub fn stop(&mut self) {
        for sequencer in self.tracks.values_mut() {
            sequencer.stop(self.synth.as_mut());
        }
        self.transport.set_position_ticks(0);
        self.transport.set_running(false);
        if let Some(bpm) = self.pending_bpm.take() {
            self.apply_bpm(bpm);
        }
        info!("transport stopped");
    }

    /// Moves the playhead, clamped to `[0, duration]`. Every track
    /// tears down and rebuilds its schedule at the new position.
    pub fn seek(&mut self, position_ticks: u64) {
        let clamped = position_ticks.min(self.duration_ticks());
        self.transport.set_position_ticks(clamped);
        self.anchor(clamped);
        for sequencer in self.tracks.values_mut() {
            sequencer.seek(self.synth.as_mut(), clamped);
        }
        debug!(requested = position_ticks, position = clamped, "seek");
    }

    /// Sets the global tempo, clamped to the supported range.
    ///
    /// While running the change is queued and flushed at the next
    /// processing tick; stopped, it applies immediately.
    pub fn set_global_bpm(&mut self, bpm: f64) {
        if self.transport.is_running() {
            debug!(bpm, "tempo change queued for next processing tick");
            self.pending_bpm = Some(bpm);
        } else {
            self.apply_bpm(bpm);
        }
    }

    /// Engine-internal processing tick: flushes pending changes,
    /// renders the next buffer, and advances the transport from the
    /// synthesis engine's clock. Invoked from the audio callback.
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        if let Some(bpm) = self.pending_bpm.take() {
            self.apply_bpm(bpm);
        }
        self.synth.render(left, right);
        if self.transport.is_running() {
            let elapsed = self.synth.current_tick().saturating_sub(self.clock_anchor);
            let position = self.position_anchor + elapsed;
            self.transport.set_position_ticks(position);
            for sequencer in self.tracks.values_mut() {
                sequencer.sync_position(position);
            }
        }
    }

    /// Mutes or unmutes a track.
    pub fn mute_track(&mut self, track_id: TrackId, muted: bool) -> Result<(), EngineError> {
        let sequencer = self
            .tracks
            .get_mut(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        sequencer.set_muted(self.synth.as_mut(), muted);
        Ok(())
    }

    /// Sets a track's volume (0-127), effective immediately.
    pub fn set_track_volume(&mut self, track_id: TrackId, volume: u8) -> Result<(), EngineError> {
        let sequencer = self
            .tracks
            .get_mut(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        sequencer.set_volume(self.synth.as_mut(), volume);
        Ok(())
    }

    /// Sets a track's start offset in ticks.
    pub fn set_track_offset_ticks(
        &mut self,
        track_id: TrackId,
        offset_ticks: i64,
    ) -> Result<(), EngineError> {
        let position = self.transport.position_ticks();
        let sequencer = self
            .tracks
            .get_mut(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        sequencer.set_offset_ticks(self.synth.as_mut(), position, offset_ticks);
        Ok(())
    }

    /// Sets a track's start offset in milliseconds at the current
    /// tempo. The value is preserved across tempo changes.
    pub fn set_track_offset_ms(
        &mut self,
        track_id: TrackId,
        offset_ms: f64,
    ) -> Result<(), EngineError> {
        let position = self.transport.position_ticks();
        let tps = self.transport.ticks_per_second();
        let sequencer = self
            .tracks
            .get_mut(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        sequencer.set_offset_ms(self.synth.as_mut(), position, offset_ms, tps);
        Ok(())
    }

    /// Reads a track's start offset back in milliseconds.
    pub fn track_offset_ms(&self, track_id: TrackId) -> Result<f64, EngineError> {
        let sequencer = self
            .tracks
            .get(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        Ok(sequencer.offset_ms(self.transport.ticks_per_second()))
    }

    /// Replaces a track's note set in place. While playing, the track
    /// reschedules from its current position.
    pub fn update_track_notes(
        &mut self,
        track_id: TrackId,
        notes: &[Note],
    ) -> Result<(), EngineError> {
        let sequencer = self
            .tracks
            .get_mut(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?;
        sequencer.update_notes(self.synth.as_mut(), notes);
        Ok(())
    }

    /// Sounds a one-shot preview note on a track's channel: an
    /// immediate note-on with a scheduled grace note-off.
    pub fn preview_note(
        &mut self,
        track_id: TrackId,
        pitch: u8,
        velocity: u8,
        duration_ticks: u64,
    ) -> Result<(), EngineError> {
        let channel = self
            .tracks
            .get(&track_id)
            .ok_or(EngineError::UnknownTrack(track_id))?
            .channel();
        self.synth.note_on(channel, pitch, velocity);
        self.synth
            .schedule_event(channel, duration_ticks.max(1), NoteEvent::off(pitch));
        Ok(())
    }

    /// Tears the session down: silences every channel, force-clears all
    /// scheduled events (including preview note-offs), and detaches all
    /// tracks.
    pub fn dispose(&mut self) {
        for channel in 0..16 {
            self.synth.all_notes_off(channel, true);
            self.synth.clear_scheduled(channel);
        }
        let ids: Vec<TrackId> = self.tracks.keys().copied().collect();
        for track_id in ids {
            if let Err(e) = self.remove_track(track_id) {
                warn!(track = %track_id, error = %e, "detach during dispose failed");
            }
        }
        self.transport.set_running(false);
        self.transport.set_position_ticks(0);
        self.pending_bpm = None;
    }

    /// IDs of all attached tracks.
    pub fn track_ids(&self) -> Vec<TrackId> {
        self.tracks.keys().copied().collect()
    }

    /// Current transport position in ticks.
    pub fn position_ticks(&self) -> u64 {
        self.transport.position_ticks()
    }

    /// Whether the transport is running.
    pub fn is_playing(&self) -> bool {
        self.transport.is_running()
    }

    /// Current tempo in beats per minute.
    pub fn bpm(&self) -> f64 {
        self.transport.bpm()
    }

    /// Session tick resolution.
    pub fn ppq(&self) -> u32 {
        self.transport.ppq()
    }

    /// End of the last note across all tracks, on the global timeline.
    pub fn duration_ticks(&self) -> u64 {
        self.tracks
            .values()
            .map(|s| s.global_end_tick())
            .max()
            .unwrap_or(0)
    }

    /// Read access to a track's sequencer.
    pub fn sequencer(&self, track_id: TrackId) -> Option<&TrackSequencer> {
        self.tracks.get(&track_id)
    }

    fn apply_bpm(&mut self, bpm: f64) {
        self.transport.set_bpm(bpm);
        let tps = self.transport.ticks_per_second();
        self.synth.set_time_scale(tps);
        let running = self.transport.is_running();
        let position = self.transport.position_ticks();
        for sequencer in self.tracks.values_mut() {
            // Real-time offsets change their tick value with the tempo;
            // those tracks need their schedules rebuilt.
            if sequencer.retune_offset(tps) && running {
                sequencer.seek(self.synth.as_mut(), position);
            }
        }
        info!(bpm = self.transport.bpm(), "tempo applied");
    }

    /// Picks the first free melodic channel, skipping the percussion
    /// channel. Exhaustion degrades to a shared channel with a warning
    /// rather than failing the add.
    fn assign_channel(&self, percussion: bool) -> u8 {
        if percussion {
            return PERCUSSION_CHANNEL;
        }
        let used: Vec<u8> = self.tracks.values().map(|s| s.channel()).collect();
        for channel in 0..16 {
            if channel != PERCUSSION_CHANNEL && !used.contains(&channel) {
                return channel;
            }
        }
        warn!(
            "all melodic channels in use, reusing channel {}",
            OVERFLOW_CHANNEL
        );
        OVERFLOW_CHANNEL
    }

    fn anchor(&mut self, position: u64) {
        self.clock_anchor = self.synth.current_tick();
        self.position_anchor = position;
    }
}
