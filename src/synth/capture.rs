//! Deterministic capture engine for tests and headless runs.
//!
//! [`CaptureSynth`] implements [`SynthEngine`] without any audio
//! dependency: every call is recorded in an inspectable log, offsets and
//! event queues are honored, and `render` outputs silence while still
//! advancing the clock. A flag makes it decline bank-offset requests so
//! the allocator's read-back verification path can be exercised.

use super::{BankHandle, NoteEvent, NoteEventKind, Preset, SynthEngine};
use crate::error::EngineError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Sample rate the capture engine pretends to run at.
const CAPTURE_SAMPLE_RATE: u32 = 44_100;

/// One recorded call into the capture engine.
#[derive(Debug, Clone, PartialEq)]
pub enum CapturedCall {
    LoadBank {
        handle: BankHandle,
    },
    UnloadBank {
        handle: BankHandle,
    },
    SetBankOffset {
        handle: BankHandle,
        offset: u32,
        accepted: bool,
    },
    SelectProgram {
        channel: u8,
        handle: BankHandle,
        bank: u32,
        program: u8,
    },
    /// `tick` is relative to the clock at the time of scheduling.
    Schedule {
        channel: u8,
        tick: u64,
        kind: NoteEventKind,
        key: u8,
        velocity: u8,
    },
    ClearScheduled {
        channel: u8,
    },
    NoteOn {
        channel: u8,
        key: u8,
        velocity: u8,
    },
    NoteOff {
        channel: u8,
        key: u8,
    },
    ChannelVolume {
        channel: u8,
        volume: u8,
    },
    AllNotesOff {
        channel: u8,
        immediate: bool,
    },
    SetTimeScale {
        ticks_per_second: f64,
    },
}

/// Shared, cloneable view of a capture engine's call log.
///
/// Keep a clone before boxing the engine; the log stays readable after
/// the engine has been moved into a `PlaybackEngine`.
#[derive(Debug, Clone, Default)]
pub struct CaptureLog(Arc<Mutex<Vec<CapturedCall>>>);

impl CaptureLog {
    /// Returns a snapshot of every recorded call, in order.
    pub fn calls(&self) -> Vec<CapturedCall> {
        self.0.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Clears the log. Useful between test phases.
    pub fn clear(&self) {
        if let Ok(mut g) = self.0.lock() {
            g.clear();
        }
    }

    /// Returns the recorded `Schedule` calls for one channel as
    /// `(relative_tick, kind, key)` triples.
    pub fn schedules(&self, channel: u8) -> Vec<(u64, NoteEventKind, u8)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                CapturedCall::Schedule {
                    channel: ch,
                    tick,
                    kind,
                    key,
                    ..
                } if ch == channel => Some((tick, kind, key)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: CapturedCall) {
        if let Ok(mut g) = self.0.lock() {
            g.push(call);
        }
    }
}

/// A [`SynthEngine`] that records instead of sounding.
pub struct CaptureSynth {
    log: CaptureLog,
    next_handle: u64,
    loaded: Vec<BankHandle>,
    offsets: HashMap<BankHandle, u32>,
    presets: Vec<Preset>,
    /// When set, `set_bank_offset` records the request but leaves the
    /// registry untouched, so read-back verification disagrees.
    reject_offsets: bool,
    /// When set, `load_bank` fails as if the asset were corrupt.
    fail_loads: bool,
    /// Pending events as (absolute_tick, channel, event).
    queue: Vec<(u64, u8, NoteEvent)>,
    clock: f64,
    time_scale: f64,
}

impl CaptureSynth {
    pub fn new() -> Self {
        Self {
            log: CaptureLog::default(),
            next_handle: 1,
            loaded: Vec::new(),
            offsets: HashMap::new(),
            presets: vec![Preset {
                bank: 0,
                program: 0,
                name: "Capture".to_string(),
            }],
            reject_offsets: false,
            fail_loads: false,
            queue: Vec::new(),
            clock: 0.0,
            time_scale: 960.0,
        }
    }

    /// Returns a cloneable handle to the call log.
    pub fn log(&self) -> CaptureLog {
        self.log.clone()
    }

    /// Makes subsequent `set_bank_offset` calls silently ineffective.
    pub fn reject_bank_offsets(&mut self, reject: bool) {
        self.reject_offsets = reject;
    }

    /// Makes subsequent `load_bank` calls fail.
    pub fn fail_loads(&mut self, fail: bool) {
        self.fail_loads = fail;
    }

    /// Replaces the preset list reported for every bank. An empty list
    /// simulates an instrument whose enumeration fails.
    pub fn set_presets(&mut self, presets: Vec<Preset>) {
        self.presets = presets;
    }

    /// Returns the pending event queue as (absolute_tick, channel, event).
    pub fn pending(&self) -> &[(u64, u8, NoteEvent)] {
        &self.queue
    }
}

impl Default for CaptureSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthEngine for CaptureSynth {
    fn load_bank(&mut self, _data: &[u8]) -> Result<BankHandle, EngineError> {
        if self.fail_loads {
            return Err(EngineError::InstrumentLoad {
                id: "capture".to_string(),
                reason: "load failure injected".to_string(),
            });
        }
        let handle = BankHandle(self.next_handle);
        self.next_handle += 1;
        self.loaded.push(handle);
        self.log.push(CapturedCall::LoadBank { handle });
        Ok(handle)
    }

    fn unload_bank(&mut self, bank: BankHandle) {
        self.loaded.retain(|h| *h != bank);
        self.offsets.remove(&bank);
        self.log.push(CapturedCall::UnloadBank { handle: bank });
    }

    fn set_bank_offset(&mut self, bank: BankHandle, offset: u32) {
        let accepted = !self.reject_offsets && self.loaded.contains(&bank);
        if accepted {
            self.offsets.insert(bank, offset);
        }
        self.log.push(CapturedCall::SetBankOffset {
            handle: bank,
            offset,
            accepted,
        });
    }

    fn bank_offset(&self, bank: BankHandle) -> Option<u32> {
        self.offsets.get(&bank).copied()
    }

    fn presets(&self, _bank: BankHandle) -> Vec<Preset> {
        self.presets.clone()
    }

    fn select_program(
        &mut self,
        channel: u8,
        bank: BankHandle,
        bank_number: u32,
        program: u8,
    ) -> Result<(), EngineError> {
        if !self.loaded.contains(&bank) {
            return Err(EngineError::UnknownBank(bank));
        }
        self.log.push(CapturedCall::SelectProgram {
            channel,
            handle: bank,
            bank: bank_number,
            program,
        });
        Ok(())
    }

    fn schedule_event(&mut self, channel: u8, at_tick: u64, event: NoteEvent) {
        let abs = self.clock as u64 + at_tick;
        self.queue.push((abs, channel, event));
        self.queue.sort_by_key(|(tick, _, _)| *tick);
        self.log.push(CapturedCall::Schedule {
            channel,
            tick: at_tick,
            kind: event.kind,
            key: event.key,
            velocity: event.velocity,
        });
    }

    fn clear_scheduled(&mut self, channel: u8) {
        self.queue.retain(|(_, ch, _)| *ch != channel);
        self.log.push(CapturedCall::ClearScheduled { channel });
    }

    fn note_on(&mut self, channel: u8, key: u8, velocity: u8) {
        self.log.push(CapturedCall::NoteOn {
            channel,
            key,
            velocity,
        });
    }

    fn note_off(&mut self, channel: u8, key: u8) {
        self.log.push(CapturedCall::NoteOff { channel, key });
    }

    fn set_channel_volume(&mut self, channel: u8, volume: u8) {
        self.log.push(CapturedCall::ChannelVolume { channel, volume });
    }

    fn all_notes_off(&mut self, channel: u8, immediate: bool) {
        self.log.push(CapturedCall::AllNotesOff { channel, immediate });
    }

    fn time_scale(&self) -> f64 {
        self.time_scale
    }

    fn set_time_scale(&mut self, ticks_per_second: f64) {
        self.time_scale = ticks_per_second;
        self.log.push(CapturedCall::SetTimeScale { ticks_per_second });
    }

    fn current_tick(&self) -> u64 {
        self.clock as u64
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        left.fill(0.0);
        right.fill(0.0);
        self.clock += left.len() as f64 * self.time_scale / CAPTURE_SAMPLE_RATE as f64;
        // Due events have sounded; drop them.
        let now = self.clock as u64;
        self.queue.retain(|(tick, _, _)| *tick > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_read_back() {
        let mut synth = CaptureSynth::new();
        let bank = synth.load_bank(&[]).unwrap();
        synth.set_bank_offset(bank, 100);
        assert_eq!(synth.bank_offset(bank), Some(100));
    }

    #[test]
    fn test_rejected_offset_read_back_disagrees() {
        let mut synth = CaptureSynth::new();
        let bank = synth.load_bank(&[]).unwrap();
        synth.reject_bank_offsets(true);
        synth.set_bank_offset(bank, 100);
        assert_eq!(synth.bank_offset(bank), None);
    }

    #[test]
    fn test_clear_scheduled_only_touches_channel() {
        let mut synth = CaptureSynth::new();
        synth.schedule_event(0, 10, NoteEvent::on(60, 100));
        synth.schedule_event(1, 10, NoteEvent::on(64, 100));
        synth.clear_scheduled(0);
        assert_eq!(synth.pending().len(), 1);
        assert_eq!(synth.pending()[0].1, 1);
    }

    #[test]
    fn test_clock_advances_with_render() {
        let mut synth = CaptureSynth::new();
        synth.set_time_scale(960.0);
        let mut left = vec![0.0; 44_100];
        let mut right = vec![0.0; 44_100];
        synth.render(&mut left, &mut right);
        assert_eq!(synth.current_tick(), 960);
    }
}
