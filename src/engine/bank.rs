//! Bank-offset allocation for the shared synthesis engine.
//!
//! Every instrument loaded into the engine gets an additive bank-number
//! offset so its presets cannot collide with another instrument's in the
//! shared program/bank address space. Offsets are handed out in strides
//! of 100, leaving 100 banks of headroom per instrument.

use crate::error::EngineError;
use crate::synth::{BankHandle, SynthEngine};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Distance between consecutive offsets.
const OFFSET_STRIDE: u32 = 100;

/// Tracks which bank offset each live instrument owns.
#[derive(Debug, Default)]
pub struct BankAllocator {
    assignments: HashMap<BankHandle, u32>,
}

impl BankAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the smallest free stride-aligned offset to a bank.
    ///
    /// Allocating for a bank that already holds an offset returns the
    /// existing assignment.
    pub fn allocate(&mut self, bank: BankHandle) -> u32 {
        if let Some(existing) = self.assignments.get(&bank) {
            return *existing;
        }
        let mut offset = 0;
        while self.assignments.values().any(|o| *o == offset) {
            offset += OFFSET_STRIDE;
        }
        self.assignments.insert(bank, offset);
        debug!(?bank, offset, "allocated bank offset");
        offset
    }

    /// Releases a bank's offset so it can be reused.
    pub fn release(&mut self, bank: BankHandle) {
        if self.assignments.remove(&bank).is_none() {
            warn!(?bank, "release of unallocated bank ignored");
        }
    }

    /// Returns the offset currently assigned to a bank, if any.
    pub fn offset_of(&self, bank: BankHandle) -> Option<u32> {
        self.assignments.get(&bank).copied()
    }

    /// Allocates an offset, applies it to the engine, and verifies the
    /// engine actually accepted it.
    ///
    /// An undetected offset collision silently corrupts another track's
    /// timbre, so the read-back disagreement is logged loudly; playback
    /// continues either way and the allocated offset is returned.
    pub fn install(&mut self, synth: &mut dyn SynthEngine, bank: BankHandle) -> u32 {
        let offset = self.allocate(bank);
        synth.set_bank_offset(bank, offset);
        let actual = synth.bank_offset(bank);
        if actual != Some(offset) {
            let mismatch = EngineError::BankOffsetMismatch {
                requested: offset,
                actual,
            };
            warn!(?bank, %mismatch, "engine did not accept bank offset");
        }
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::CaptureSynth;

    fn handles(n: u64) -> Vec<BankHandle> {
        (1..=n).map(BankHandle).collect()
    }

    #[test]
    fn test_offsets_distinct() {
        let mut alloc = BankAllocator::new();
        let offsets: Vec<u32> = handles(5).into_iter().map(|h| alloc.allocate(h)).collect();
        assert_eq!(offsets, vec![0, 100, 200, 300, 400]);
    }

    #[test]
    fn test_allocate_idempotent() {
        let mut alloc = BankAllocator::new();
        let bank = BankHandle(1);
        assert_eq!(alloc.allocate(bank), 0);
        assert_eq!(alloc.allocate(bank), 0);
        assert_eq!(alloc.allocate(BankHandle(2)), 100);
    }

    #[test]
    fn test_release_reuses_smallest() {
        let mut alloc = BankAllocator::new();
        for h in handles(3) {
            alloc.allocate(h);
        }
        alloc.release(BankHandle(2)); // Held offset 100
        assert_eq!(alloc.offset_of(BankHandle(2)), None);
        assert_eq!(alloc.allocate(BankHandle(4)), 100);
    }

    #[test]
    fn test_install_read_back_agrees() {
        let mut synth = CaptureSynth::new();
        let bank = synth.load_bank(&[]).unwrap();
        let mut alloc = BankAllocator::new();
        let offset = alloc.install(&mut synth, bank);
        assert_eq!(synth.bank_offset(bank), Some(offset));
        assert_eq!(alloc.offset_of(bank), Some(offset));
    }

    #[test]
    fn test_install_survives_rejection() {
        let mut synth = CaptureSynth::new();
        let bank = synth.load_bank(&[]).unwrap();
        synth.reject_bank_offsets(true);
        let mut alloc = BankAllocator::new();
        // The mismatch is logged, not raised; the assignment stays live.
        let offset = alloc.install(&mut synth, bank);
        assert_eq!(offset, 0);
        assert_eq!(synth.bank_offset(bank), None);
        assert_eq!(alloc.offset_of(bank), Some(0));
    }
}
