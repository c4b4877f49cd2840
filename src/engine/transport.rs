//! Global transport state and tick/time conversions.
//!
//! One transport instance exists per playback engine. Every track reads
//! it to derive its own local position; only the engine mutates it.

/// Lowest tempo the transport accepts, in beats per minute.
pub const MIN_BPM: f64 = 20.0;

/// Highest tempo the transport accepts, in beats per minute.
pub const MAX_BPM: f64 = 300.0;

/// Engine-wide playback position, tempo, and running state.
#[derive(Debug, Clone)]
pub struct Transport {
    position_ticks: u64,
    bpm: f64,
    ppq: u32,
    running: bool,
}

impl Transport {
    /// Creates a stopped transport at position zero.
    ///
    /// `ppq` (ticks per quarter note) is fixed for the session.
    pub fn new(bpm: f64, ppq: u32) -> Self {
        Self {
            position_ticks: 0,
            bpm: bpm.clamp(MIN_BPM, MAX_BPM),
            ppq,
            running: false,
        }
    }

    /// Returns the current playback position in ticks.
    pub fn position_ticks(&self) -> u64 {
        self.position_ticks
    }

    /// Moves the playhead. Callers clamp to the session duration first.
    pub fn set_position_ticks(&mut self, ticks: u64) {
        self.position_ticks = ticks;
    }

    /// Returns the tempo in beats per minute.
    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Sets the tempo, clamped to the supported range.
    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm.clamp(MIN_BPM, MAX_BPM);
    }

    /// Returns the session's tick resolution (ticks per quarter note).
    pub fn ppq(&self) -> u32 {
        self.ppq
    }

    /// Returns whether the transport is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Flips the running flag. The engine only does this after all
    /// per-track fan-out operations have completed or failed.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Returns the active time scale in ticks per second.
    pub fn ticks_per_second(&self) -> f64 {
        ticks_per_second(self.bpm, self.ppq)
    }
}

/// Computes the time scale for a tempo and resolution:
/// `bpm * ppq / 60` ticks per second.
pub fn ticks_per_second(bpm: f64, ppq: u32) -> f64 {
    bpm * ppq as f64 / 60.0
}

/// Converts a real-time offset in milliseconds to ticks at the given
/// time scale. Inverse of [`ticks_to_ms`] up to rounding.
pub fn ms_to_ticks(offset_ms: f64, ticks_per_second: f64) -> i64 {
    (offset_ms * ticks_per_second / 1000.0).round() as i64
}

/// Converts a tick offset back to milliseconds at the given time scale.
pub fn ticks_to_ms(ticks: i64, ticks_per_second: f64) -> f64 {
    ticks as f64 * 1000.0 / ticks_per_second
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_per_second() {
        // 120 BPM at 480 PPQ: 120 * 480 / 60 = 960 ticks per second.
        assert_eq!(ticks_per_second(120.0, 480), 960.0);
        assert_eq!(ticks_per_second(90.0, 480), 720.0);
    }

    #[test]
    fn test_ms_tick_round_trip() {
        let tps = ticks_per_second(120.0, 480);
        let tick_ms = 1000.0 / tps;
        for offset_ms in [0.0, 1.0, 333.3, 2000.0, 12_345.6, 60_000.0] {
            let ticks = ms_to_ticks(offset_ms, tps);
            let back = ticks_to_ms(ticks, tps);
            assert!(
                (back - offset_ms).abs() <= tick_ms,
                "offset {} ms -> {} ticks -> {} ms",
                offset_ms,
                ticks,
                back
            );
        }
    }

    #[test]
    fn test_bpm_clamped() {
        let mut transport = Transport::new(120.0, 480);
        transport.set_bpm(1000.0);
        assert_eq!(transport.bpm(), MAX_BPM);
        transport.set_bpm(1.0);
        assert_eq!(transport.bpm(), MIN_BPM);
    }

    #[test]
    fn test_transport_defaults() {
        let transport = Transport::new(120.0, 480);
        assert_eq!(transport.position_ticks(), 0);
        assert!(!transport.is_running());
        assert_eq!(transport.ppq(), 480);
    }
}
