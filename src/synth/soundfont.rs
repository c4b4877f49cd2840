//! SoundFont synthesis backend.
//!
//! [`SoundFontSynth`] implements [`SynthEngine`] on top of rustysynth.
//! Each loaded instrument bank gets its own `Synthesizer` instance; the
//! render pass sums them into one stereo buffer, splitting at scheduled
//! event boundaries so note-ons and note-offs land sample-accurately.
//!
//! Bank offsets are a registry on this side: because every bank owns a
//! private synthesizer, program selects address the bank's native
//! numbers directly, and the offset exists to keep the global
//! program/bank address space collision-free. Overlapping offset
//! requests are declined, which the allocator detects through read-back.

use super::{BankHandle, NoteEvent, NoteEventKind, Preset, SynthEngine};
use crate::error::EngineError;
use rustysynth::{SoundFont, Synthesizer, SynthesizerSettings};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Offsets are handed out in strides of 100 banks; two assignments
/// closer than this are considered overlapping.
const OFFSET_SPAN: u32 = 100;

/// One loaded instrument bank with its private synthesizer.
struct LoadedBank {
    synth: Synthesizer,
    presets: Vec<Preset>,
    offset: Option<u32>,
}

/// A pending scheduled event at an absolute clock tick.
struct Scheduled {
    tick: u64,
    /// Insertion order, to keep same-tick events stable.
    seq: u64,
    channel: u8,
    event: NoteEvent,
}

/// SoundFont-backed implementation of [`SynthEngine`].
pub struct SoundFontSynth {
    sample_rate: u32,
    banks: HashMap<BankHandle, LoadedBank>,
    next_handle: u64,
    next_seq: u64,
    /// Which bank each of the 16 channels routes to.
    routes: [Option<BankHandle>; 16],
    /// Pending events sorted by (tick, seq).
    queue: Vec<Scheduled>,
    /// Engine clock in ticks, fractional between samples.
    clock: f64,
    /// Ticks per second.
    time_scale: f64,
    scratch_left: Vec<f32>,
    scratch_right: Vec<f32>,
}

impl SoundFontSynth {
    /// Creates an engine rendering at the given sample rate with an
    /// initial time scale (ticks per second).
    pub fn new(sample_rate: u32, time_scale: f64) -> Self {
        Self {
            sample_rate,
            banks: HashMap::new(),
            next_handle: 1,
            next_seq: 0,
            routes: [None; 16],
            queue: Vec::new(),
            clock: 0.0,
            time_scale,
            scratch_left: Vec::new(),
            scratch_right: Vec::new(),
        }
    }

    fn offsets_overlap(a: u32, b: u32) -> bool {
        a.abs_diff(b) < OFFSET_SPAN
    }

    /// Extracts the preset list from a SoundFont, sorted by
    /// (bank, program), with a name fallback for unnamed presets.
    fn extract_presets(soundfont: &SoundFont) -> Vec<Preset> {
        let mut presets: Vec<Preset> = soundfont
            .get_presets()
            .iter()
            .filter(|p| (0..128).contains(&p.get_patch_number()))
            .map(|p| {
                let program = p.get_patch_number() as u8;
                let name = p.get_name().to_string();
                Preset {
                    bank: p.get_bank_number().max(0) as u32,
                    program,
                    name: if name.is_empty() {
                        format!("Program {}", program)
                    } else {
                        name
                    },
                }
            })
            .collect();
        presets.sort_by_key(|p| (p.bank, p.program));
        presets
    }

    /// Fires one event on the synthesizer its channel routes to.
    fn dispatch(&mut self, channel: u8, event: NoteEvent) {
        let Some(handle) = self.routes[channel as usize & 0x0F] else {
            debug!(channel, "event on unrouted channel dropped");
            return;
        };
        if let Some(bank) = self.banks.get_mut(&handle) {
            match event.kind {
                NoteEventKind::NoteOn => {
                    bank.synth
                        .note_on(channel as i32, event.key as i32, event.velocity as i32)
                }
                NoteEventKind::NoteOff => bank.synth.note_off(channel as i32, event.key as i32),
            }
        }
    }

    /// Renders `count` samples from every bank, summed into the output
    /// slices starting at `at`.
    fn render_segment(&mut self, left: &mut [f32], right: &mut [f32], at: usize, count: usize) {
        if self.scratch_left.len() < count {
            self.scratch_left.resize(count, 0.0);
            self.scratch_right.resize(count, 0.0);
        }
        for bank in self.banks.values_mut() {
            bank.synth.render(
                &mut self.scratch_left[..count],
                &mut self.scratch_right[..count],
            );
            for i in 0..count {
                left[at + i] += self.scratch_left[i];
                right[at + i] += self.scratch_right[i];
            }
        }
    }
}

impl SynthEngine for SoundFontSynth {
    fn load_bank(&mut self, data: &[u8]) -> Result<BankHandle, EngineError> {
        let mut cursor = Cursor::new(data);
        let soundfont =
            Arc::new(
                SoundFont::new(&mut cursor).map_err(|e| EngineError::InstrumentLoad {
                    id: "soundfont".to_string(),
                    reason: format!("{:?}", e),
                })?,
            );
        let settings = SynthesizerSettings::new(self.sample_rate as i32);
        let synth =
            Synthesizer::new(&soundfont, &settings).map_err(|e| EngineError::InstrumentLoad {
                id: "soundfont".to_string(),
                reason: format!("{:?}", e),
            })?;

        let handle = BankHandle(self.next_handle);
        self.next_handle += 1;
        let presets = Self::extract_presets(&soundfont);
        debug!(?handle, presets = presets.len(), "loaded instrument bank");
        self.banks.insert(
            handle,
            LoadedBank {
                synth,
                presets,
                offset: None,
            },
        );
        Ok(handle)
    }

    fn unload_bank(&mut self, bank: BankHandle) {
        if self.banks.remove(&bank).is_none() {
            warn!(?bank, "unload of unknown bank ignored");
            return;
        }
        for route in self.routes.iter_mut() {
            if *route == Some(bank) {
                *route = None;
            }
        }
        let routes = self.routes;
        self.queue
            .retain(|s| routes[s.channel as usize & 0x0F].is_some());
    }

    fn set_bank_offset(&mut self, bank: BankHandle, offset: u32) {
        let overlapping = self
            .banks
            .iter()
            .any(|(h, b)| *h != bank && b.offset.is_some_and(|o| Self::offsets_overlap(o, offset)));
        if overlapping {
            warn!(?bank, offset, "bank offset overlaps a live assignment, declined");
            return;
        }
        match self.banks.get_mut(&bank) {
            Some(loaded) => loaded.offset = Some(offset),
            None => warn!(?bank, offset, "offset request for unknown bank ignored"),
        }
    }

    fn bank_offset(&self, bank: BankHandle) -> Option<u32> {
        self.banks.get(&bank).and_then(|b| b.offset)
    }

    fn presets(&self, bank: BankHandle) -> Vec<Preset> {
        self.banks
            .get(&bank)
            .map(|b| b.presets.clone())
            .unwrap_or_default()
    }

    fn select_program(
        &mut self,
        channel: u8,
        bank: BankHandle,
        bank_number: u32,
        program: u8,
    ) -> Result<(), EngineError> {
        let ch = (channel & 0x0F) as usize;
        let loaded = self
            .banks
            .get_mut(&bank)
            .ok_or(EngineError::UnknownBank(bank))?;
        self.routes[ch] = Some(bank);
        // Native bank numbers address the bank's own synthesizer, so
        // CC0 carries the number without the global offset applied.
        loaded
            .synth
            .process_midi_message(ch as i32, 0xB0, 0x00, bank_number.min(127) as i32);
        loaded
            .synth
            .process_midi_message(ch as i32, 0xC0, program as i32, 0);
        Ok(())
    }

    fn schedule_event(&mut self, channel: u8, at_tick: u64, event: NoteEvent) {
        let tick = self.clock as u64 + at_tick;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Scheduled {
            tick,
            seq,
            channel: channel & 0x0F,
            event,
        });
        self.queue.sort_by_key(|s| (s.tick, s.seq));
    }

    fn clear_scheduled(&mut self, channel: u8) {
        self.queue.retain(|s| s.channel != channel & 0x0F);
    }

    fn note_on(&mut self, channel: u8, key: u8, velocity: u8) {
        self.dispatch(channel, NoteEvent::on(key, velocity));
    }

    fn note_off(&mut self, channel: u8, key: u8) {
        self.dispatch(channel, NoteEvent::off(key));
    }

    fn set_channel_volume(&mut self, channel: u8, volume: u8) {
        let ch = (channel & 0x0F) as usize;
        if let Some(handle) = self.routes[ch] {
            if let Some(bank) = self.banks.get_mut(&handle) {
                // Control change 7 is channel volume.
                bank.synth
                    .process_midi_message(ch as i32, 0xB0, 7, volume as i32);
            }
        }
    }

    fn all_notes_off(&mut self, channel: u8, immediate: bool) {
        let ch = (channel & 0x0F) as usize;
        if let Some(handle) = self.routes[ch] {
            if let Some(bank) = self.banks.get_mut(&handle) {
                // CC 120 = all sound off (hard cut), CC 123 = all notes off.
                let controller = if immediate { 120 } else { 123 };
                bank.synth
                    .process_midi_message(ch as i32, 0xB0, controller, 0);
            }
        }
    }

    fn time_scale(&self) -> f64 {
        self.time_scale
    }

    fn set_time_scale(&mut self, ticks_per_second: f64) {
        if ticks_per_second > 0.0 {
            self.time_scale = ticks_per_second;
        }
    }

    fn current_tick(&self) -> u64 {
        self.clock as u64
    }

    fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        let total = left.len().min(right.len());
        left[..total].fill(0.0);
        right[..total].fill(0.0);

        let ticks_per_sample = self.time_scale / self.sample_rate as f64;
        let mut done = 0;
        while done < total {
            // Fire everything that is due at the current clock.
            while self
                .queue
                .first()
                .is_some_and(|s| (s.tick as f64) <= self.clock)
            {
                let next = self.queue.remove(0);
                self.dispatch(next.channel, next.event);
            }

            // Render up to the next event boundary (or the buffer end).
            let remaining = total - done;
            let count = match self.queue.first() {
                Some(next) => {
                    let ticks_away = next.tick as f64 - self.clock;
                    let samples_away = (ticks_away / ticks_per_sample).ceil() as usize;
                    samples_away.clamp(1, remaining)
                }
                None => remaining,
            };
            self.render_segment(left, right, done, count);
            self.clock += count as f64 * ticks_per_sample;
            done += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    #[test]
    fn test_offset_overlap() {
        assert!(SoundFontSynth::offsets_overlap(0, 99));
        assert!(!SoundFontSynth::offsets_overlap(0, 100));
        assert!(SoundFontSynth::offsets_overlap(200, 150));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut synth = SoundFontSynth::new(44_100, 960.0);
        assert!(synth.load_bank(&[0u8; 16]).is_err());
    }

    #[test]
    #[ignore] // Requires SoundFont file
    fn test_load_and_render() {
        let data = fs::read(PathBuf::from("assets/TimGM6mb.sf2")).unwrap();
        let mut synth = SoundFontSynth::new(44_100, 960.0);
        let bank = synth.load_bank(&data).unwrap();
        assert!(!synth.presets(bank).is_empty());

        synth.select_program(0, bank, 0, 0).unwrap();
        synth.schedule_event(0, 0, NoteEvent::on(60, 100));
        synth.schedule_event(0, 480, NoteEvent::off(60));
        let mut left = vec![0.0; 44_100];
        let mut right = vec![0.0; 44_100];
        synth.render(&mut left, &mut right);
        assert!(left.iter().any(|s| s.abs() > 0.0));
    }
}
