//! Controller façade bridging the note store to the playback engine.
//!
//! The editing layer talks to this type only. It subscribes to the
//! store, converts note mutations into in-place track updates on the
//! engine, and owns the bookkeeping that maps tracks to their
//! instrument storage keys. Instrument changes are the one case that
//! still detaches and re-attaches a track; note edits update in place.

use crate::assets::{InstrumentAssets, InstrumentId};
use crate::engine::playback::{AddTrackOptions, PlaybackEngine};
use crate::engine::transport::{MAX_BPM, MIN_BPM};
use crate::error::EngineError;
use crate::notes::{NoteStore, SubscriptionId, TrackId};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info};

/// Locks the engine, recovering from a poisoned mutex: a panicked
/// audio callback should not wedge the control surface.
fn lock(engine: &Arc<Mutex<PlaybackEngine>>) -> MutexGuard<'_, PlaybackEngine> {
    engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The single public surface the editing layer calls.
pub struct EngineController {
    store: Rc<NoteStore>,
    engine: Arc<Mutex<PlaybackEngine>>,
    assets: Arc<dyn InstrumentAssets>,
    /// Which instrument each connected track plays.
    connections: HashMap<TrackId, InstrumentId>,
    subscription: SubscriptionId,
}

impl EngineController {
    /// Wires the store to the engine. A global store subscription keeps
    /// connected tracks' schedules in step with their note sets.
    pub fn new(
        store: Rc<NoteStore>,
        engine: Arc<Mutex<PlaybackEngine>>,
        assets: Arc<dyn InstrumentAssets>,
    ) -> Self {
        let engine_for_edits = engine.clone();
        let subscription = store.subscribe_all(move |track, notes| {
            match lock(&engine_for_edits).update_track_notes(track, notes) {
                Ok(()) => {}
                // Tracks exist in the store before they are connected.
                Err(EngineError::UnknownTrack(_)) => {
                    debug!(track = %track, "edit on unconnected track ignored")
                }
                Err(e) => debug!(track = %track, error = %e, "in-place update failed"),
            }
        });
        Self {
            store,
            engine,
            assets,
            connections: HashMap::new(),
            subscription,
        }
    }

    /// Bootstraps a track: ensures it exists in the store (restoring
    /// persisted notes when available), fetches its instrument bytes,
    /// and attaches it to the engine.
    pub fn connect_track(
        &mut self,
        track: TrackId,
        instrument: InstrumentId,
        options: AddTrackOptions,
    ) -> Result<(), EngineError> {
        if !self.store.has_track(track) {
            self.store.create_track(track);
            self.store.restore_track(track)?;
        }
        let notes = self.store.notes(track)?;
        let data = self.assets.instrument_data(&instrument)?;
        lock(&self.engine).add_track(track, &notes, &data, options)?;
        info!(track = %track, instrument = %instrument, "connected track");
        self.connections.insert(track, instrument);
        Ok(())
    }

    /// Swaps a connected track's instrument. The engine does not
    /// support changing a track's bank in place, so this detaches and
    /// re-attaches, carrying the track's offset, volume, and mute state
    /// across.
    pub fn set_track_instrument(
        &mut self,
        track: TrackId,
        instrument: InstrumentId,
    ) -> Result<(), EngineError> {
        if !self.connections.contains_key(&track) {
            return Err(EngineError::UnknownTrack(track));
        }
        let notes = self.store.notes(track)?;
        let data = self.assets.instrument_data(&instrument)?;

        let mut engine = lock(&self.engine);
        let (options, muted) = match engine.sequencer(track) {
            Some(seq) => (
                AddTrackOptions {
                    offset_ticks: seq.start_offset_ticks(),
                    offset_ms: None,
                    volume: seq.volume(),
                    percussion: seq.channel() == 9,
                },
                seq.is_muted(),
            ),
            None => (AddTrackOptions::default(), false),
        };
        engine.remove_track(track)?;
        engine.add_track(track, &notes, &data, options)?;
        if muted {
            engine.mute_track(track, true)?;
        }
        drop(engine);

        info!(track = %track, instrument = %instrument, "swapped track instrument");
        self.connections.insert(track, instrument);
        Ok(())
    }

    /// Detaches a track from the engine. Its notes stay in the store
    /// and its persisted blob stays in the blob store.
    pub fn disconnect_track(&mut self, track: TrackId) -> Result<(), EngineError> {
        self.connections
            .remove(&track)
            .ok_or(EngineError::UnknownTrack(track))?;
        lock(&self.engine).remove_track(track)
    }

    /// Instrument a connected track currently plays.
    pub fn track_instrument(&self, track: TrackId) -> Option<&InstrumentId> {
        self.connections.get(&track)
    }

    /// Access to the note store for the editing layer.
    pub fn store(&self) -> &NoteStore {
        &self.store
    }

    pub fn play(&self) {
        lock(&self.engine).play();
    }

    pub fn pause(&self) {
        lock(&self.engine).pause();
    }

    pub fn stop(&self) {
        lock(&self.engine).stop();
    }

    pub fn seek(&self, position_ticks: u64) {
        lock(&self.engine).seek(position_ticks);
    }

    /// Sets the global tempo and keeps the store's session meta (used
    /// when persisting blobs) in step.
    ///
    /// The engine defers the change to its next processing tick while
    /// running, so the meta mirrors the clamped request rather than an
    /// engine read-back that could still report the old tempo.
    pub fn set_global_bpm(&self, bpm: f64) {
        lock(&self.engine).set_global_bpm(bpm);
        self.store
            .set_session_meta(bpm.clamp(MIN_BPM, MAX_BPM), (4, 4));
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.engine).is_playing()
    }

    pub fn position_ticks(&self) -> u64 {
        lock(&self.engine).position_ticks()
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        lock(&self.engine).track_ids()
    }

    /// Host-loop housekeeping: flushes debounced note blobs that have
    /// come due.
    pub fn maintain(&self, now: Instant) {
        self.store.flush_due(now);
    }

    /// Tears the session down: engine silenced and emptied, every
    /// dirty track flushed.
    pub fn dispose(&mut self) {
        lock(&self.engine).dispose();
        self.store.flush_all();
        self.connections.clear();
    }
}

impl Drop for EngineController {
    fn drop(&mut self) {
        self.store.unsubscribe(self.subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemoryAssets;
    use crate::engine::SessionConfig;
    use crate::notes::{MemoryBlobStore, Note};
    use crate::synth::{CaptureLog, CaptureSynth, CapturedCall, NoteEventKind};

    fn session() -> (EngineController, CaptureLog) {
        let synth = CaptureSynth::new();
        let log = synth.log();
        let engine = Arc::new(Mutex::new(PlaybackEngine::new(
            Box::new(synth),
            SessionConfig::default(),
        )));
        let store = Rc::new(NoteStore::new(Arc::new(MemoryBlobStore::new()), 480));
        let mut assets = MemoryAssets::new();
        assets.insert("piano.sf2".into(), vec![0]);
        assets.insert("strings.sf2".into(), vec![1]);
        let controller = EngineController::new(store, engine, Arc::new(assets));
        (controller, log)
    }

    #[test]
    fn test_connect_bootstraps_track() {
        let (mut controller, _) = session();
        let track = TrackId::new();
        controller
            .connect_track(track, "piano.sf2".into(), AddTrackOptions::default())
            .unwrap();
        assert!(controller.store().has_track(track));
        assert_eq!(controller.track_ids(), vec![track]);
        assert_eq!(
            controller.track_instrument(track),
            Some(&InstrumentId::new("piano.sf2"))
        );
    }

    #[test]
    fn test_missing_instrument_leaves_track_unconnected() {
        let (mut controller, _) = session();
        let track = TrackId::new();
        assert!(matches!(
            controller.connect_track(track, "nope.sf2".into(), AddTrackOptions::default()),
            Err(EngineError::InstrumentLoad { .. })
        ));
        assert!(controller.track_ids().is_empty());
    }

    #[test]
    fn test_store_edits_flow_into_live_schedule() {
        let (mut controller, log) = session();
        let track = TrackId::new();
        controller
            .connect_track(track, "piano.sf2".into(), AddTrackOptions::default())
            .unwrap();
        controller.play();
        log.clear();

        controller
            .store()
            .insert_note(track, Note::new(60, 100, 480, 480))
            .unwrap();

        let calls = log.calls();
        assert!(calls.contains(&CapturedCall::ClearScheduled { channel: 0 }));
        assert!(log
            .schedules(0)
            .contains(&(480, NoteEventKind::NoteOn, 60)));
    }

    #[test]
    fn test_edits_before_connect_are_ignored() {
        let (controller, log) = session();
        let track = TrackId::new();
        controller.store().create_track(track);
        log.clear();
        controller
            .store()
            .insert_note(track, Note::new(60, 100, 0, 480))
            .unwrap();
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_instrument_swap_preserves_mix_state() {
        let (mut controller, _) = session();
        let track = TrackId::new();
        controller
            .connect_track(
                track,
                "piano.sf2".into(),
                AddTrackOptions {
                    offset_ticks: 240,
                    volume: 80,
                    ..Default::default()
                },
            )
            .unwrap();
        controller
            .set_track_instrument(track, "strings.sf2".into())
            .unwrap();

        let engine = controller.engine.clone();
        let engine = lock(&engine);
        let seq = engine.sequencer(track).unwrap();
        assert_eq!(seq.start_offset_ticks(), 240);
        assert_eq!(seq.volume(), 80);
    }

    #[test]
    fn test_queued_bpm_mirrored_into_session_meta() {
        let (mut controller, _) = session();
        let track = TrackId::new();
        controller
            .connect_track(track, "piano.sf2".into(), AddTrackOptions::default())
            .unwrap();
        controller.play();

        // The engine applies the change at its next processing tick;
        // the session meta must not lag behind and persist the old
        // tempo in the meantime.
        controller.set_global_bpm(90.0);
        assert_eq!(controller.store().snapshot().bpm, 90.0);

        let mut left = vec![0.0; 256];
        let mut right = vec![0.0; 256];
        lock(&controller.engine).process(&mut left, &mut right);
        assert_eq!(lock(&controller.engine).bpm(), 90.0);
        assert_eq!(controller.store().snapshot().bpm, 90.0);
    }

    #[test]
    fn test_bpm_mirror_clamped() {
        let (controller, _) = session();
        controller.set_global_bpm(1000.0);
        assert_eq!(controller.store().snapshot().bpm, MAX_BPM);
    }

    #[test]
    fn test_disconnect_keeps_store_data() {
        let (mut controller, _) = session();
        let track = TrackId::new();
        controller
            .connect_track(track, "piano.sf2".into(), AddTrackOptions::default())
            .unwrap();
        controller
            .store()
            .insert_note(track, Note::new(60, 100, 0, 480))
            .unwrap();
        controller.disconnect_track(track).unwrap();
        assert!(controller.track_ids().is_empty());
        assert_eq!(controller.store().notes(track).unwrap().len(), 1);
    }
}
