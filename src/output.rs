//! Realtime audio output and offline bounce.
//!
//! [`AudioOutput`] bridges a shared [`PlaybackEngine`] to a rodio
//! stream with a pull-based source: each 256-sample buffer is produced
//! by the engine's processing tick, which is therefore driven at audio
//! rate as the concurrency model requires. [`bounce_to_wav`] renders
//! offline through the same processing path.

use crate::engine::{PlaybackEngine, SAMPLE_RATE};
use anyhow::{Context, Result};
use hound::{SampleFormat, WavSpec, WavWriter};
use rodio::{OutputStream, OutputStreamHandle, Source};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Audio buffer size for low-latency playback.
/// Smaller = lower latency but higher CPU usage.
const BUFFER_SIZE: usize = 256;

/// Buffer size for offline rendering chunks.
const RENDER_BUFFER_SIZE: usize = 4096;

/// Release tail appended after the last note when bouncing.
const BOUNCE_TAIL_SECONDS: f64 = 2.0;

/// Audio source that pulls samples out of the playback engine.
/// Implements rodio's Source trait.
struct EngineSource {
    engine: Arc<Mutex<PlaybackEngine>>,
    left_buf: Vec<f32>,
    right_buf: Vec<f32>,
    buf_pos: usize,
    /// Current channel (0 = left, 1 = right).
    channel: usize,
}

impl EngineSource {
    fn new(engine: Arc<Mutex<PlaybackEngine>>) -> Self {
        Self {
            engine,
            left_buf: vec![0.0; BUFFER_SIZE],
            right_buf: vec![0.0; BUFFER_SIZE],
            buf_pos: BUFFER_SIZE, // Start at end to trigger first render
            channel: 0,
        }
    }
}

impl Iterator for EngineSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buf_pos >= BUFFER_SIZE {
            // The engine always renders - silence when idle, but
            // preview notes and queued changes are still processed.
            if let Ok(mut engine) = self.engine.lock() {
                engine.process(&mut self.left_buf, &mut self.right_buf);
            } else {
                self.left_buf.fill(0.0);
                self.right_buf.fill(0.0);
            }
            self.buf_pos = 0;
        }

        // Interleave stereo samples: L, R, L, R, ...
        let sample = if self.channel == 0 {
            self.left_buf[self.buf_pos]
        } else {
            self.right_buf[self.buf_pos]
        };
        self.channel = 1 - self.channel;
        if self.channel == 0 {
            self.buf_pos += 1;
        }
        Some(sample)
    }
}

impl Source for EngineSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None // Infinite stream
    }
}

/// Keeps a rodio stream alive that drives the engine's processing
/// tick from the audio callback.
pub struct AudioOutput {
    /// Must be kept alive for audio to flow.
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
}

impl AudioOutput {
    /// Opens the default audio device and starts pulling from the
    /// engine.
    pub fn start(engine: Arc<Mutex<PlaybackEngine>>) -> Result<Self> {
        let (stream, stream_handle) =
            OutputStream::try_default().context("Failed to open audio output")?;
        let source = EngineSource::new(engine);
        stream_handle
            .play_raw(source)
            .context("Failed to start audio playback")?;
        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
        })
    }
}

/// Renders a session offline into a 16-bit stereo WAV file.
///
/// Drives the same processing tick the realtime path uses, from the
/// current position until `until_ticks` plus a release tail.
///
/// # Arguments
///
/// * `engine` - The engine to render; caller decides what is playing
/// * `until_ticks` - Global position at which rendering stops
/// * `output_path` - Path for the output WAV file
/// * `progress_callback` - Optional callback with progress (0.0 to 1.0)
pub fn bounce_to_wav<P, F>(
    engine: &mut PlaybackEngine,
    until_ticks: u64,
    output_path: P,
    mut progress_callback: Option<F>,
) -> Result<()>
where
    P: AsRef<Path>,
    F: FnMut(f32),
{
    let spec = WavSpec {
        channels: 2,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(output_path.as_ref(), spec).with_context(|| {
        format!(
            "Failed to create output WAV file: {}",
            output_path.as_ref().display()
        )
    })?;

    let ticks_per_second = engine.bpm() * engine.ppq() as f64 / 60.0;
    let remaining_ticks = until_ticks.saturating_sub(engine.position_ticks()) as f64;
    let seconds = remaining_ticks / ticks_per_second + BOUNCE_TAIL_SECONDS;
    let total_samples = (seconds * SAMPLE_RATE as f64) as usize;

    let mut left_buf = vec![0.0f32; RENDER_BUFFER_SIZE];
    let mut right_buf = vec![0.0f32; RENDER_BUFFER_SIZE];
    let mut current_sample = 0usize;

    while current_sample < total_samples {
        let count = (total_samples - current_sample).min(RENDER_BUFFER_SIZE);
        engine.process(&mut left_buf[..count], &mut right_buf[..count]);

        // Interleaved stereo, f32 (-1.0 to 1.0) to i16.
        for i in 0..count {
            let left_sample = (left_buf[i] * 32767.0).clamp(-32768.0, 32767.0) as i16;
            let right_sample = (right_buf[i] * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer.write_sample(left_sample)?;
            writer.write_sample(right_sample)?;
        }

        current_sample += count;
        if let Some(ref mut callback) = progress_callback {
            callback(current_sample as f32 / total_samples as f32);
        }
    }

    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(())
}
