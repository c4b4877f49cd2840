//! Headless session runner.
//!
//! Builds a complete session without any UI: loads a SoundFont from the
//! command line, seeds the note store with a short two-track
//! arrangement, connects the tracks through the engine controller, and
//! bounces the result to a WAV file.
//!
//! ```bash
//! cargo run --bin headless -- --soundfont assets/TimGM6mb.sf2 --out demo.wav
//! ```

use anyhow::{Context, Result};
use polyseq::engine::{AddTrackOptions, EngineController, PlaybackEngine, SessionConfig};
use polyseq::notes::{MemoryBlobStore, Note, NoteStore, TrackId};
use polyseq::output::bounce_to_wav;
use polyseq::synth::SoundFontSynth;
use polyseq::{DirAssets, InstrumentId, TICKS_PER_BEAT};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

/// Command-line options for the runner.
struct CliOptions {
    /// Path to the SoundFont file.
    soundfont: PathBuf,
    /// Output WAV path.
    out: PathBuf,
    /// Tempo in beats per minute.
    bpm: f64,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `--soundfont <path>` or `-sf <path>`: SoundFont file (required)
    /// - `--out <path>` or `-o <path>`: output WAV (default demo.wav)
    /// - `--bpm <bpm>`: tempo (default 120)
    /// - `--help` or `-h`: print help and exit
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut soundfont: Option<PathBuf> = None;
        let mut out = PathBuf::from("demo.wav");
        let mut bpm = 120.0;
        let mut i = 1;

        while i < args.len() {
            match args[i].as_str() {
                "--soundfont" | "-sf" => {
                    i += 1;
                    soundfont = Some(PathBuf::from(
                        args.get(i).context("--soundfont requires a path")?,
                    ));
                }
                "--out" | "-o" => {
                    i += 1;
                    out = PathBuf::from(args.get(i).context("--out requires a path")?);
                }
                "--bpm" => {
                    i += 1;
                    bpm = args
                        .get(i)
                        .context("--bpm requires a value")?
                        .parse()
                        .context("--bpm must be a number")?;
                }
                "--help" | "-h" => {
                    eprintln!("headless - bounce a demo polyseq session to WAV");
                    eprintln!();
                    eprintln!(
                        "Usage: {} --soundfont PATH [OPTIONS]",
                        args.first().map(String::as_str).unwrap_or("headless")
                    );
                    eprintln!();
                    eprintln!("Options:");
                    eprintln!("  -sf, --soundfont PATH  SoundFont file (.sf2) to play through");
                    eprintln!("  -o,  --out PATH        Output WAV file (default demo.wav)");
                    eprintln!("       --bpm BPM         Tempo (default 120)");
                    eprintln!("  -h,  --help            Print this help message");
                    std::process::exit(0);
                }
                other if other.ends_with(".sf2") => soundfont = Some(PathBuf::from(other)),
                other => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
            i += 1;
        }

        Ok(Self {
            soundfont: soundfont.context("a SoundFont is required (--soundfont PATH)")?,
            out,
            bpm,
        })
    }
}

/// A I-V-vi-IV pad over a walking bass line, one measure each.
fn seed_arrangement(store: &NoteStore, pad: TrackId, bass: TrackId) -> Result<()> {
    store.create_track(pad);
    store.create_track(bass);

    let beat = TICKS_PER_BEAT as u64;
    let measure = beat * 4;

    let chords: [[u8; 3]; 4] = [[60, 64, 67], [67, 71, 74], [69, 72, 76], [65, 69, 72]];
    let mut pad_notes = Vec::new();
    for (m, chord) in chords.iter().enumerate() {
        for &pitch in chord {
            pad_notes.push(Note::new(pitch, 80, m as u64 * measure, measure));
        }
    }
    store.replace_notes(pad, &pad_notes)?;

    let roots: [u8; 4] = [36, 43, 45, 41];
    let mut bass_notes = Vec::new();
    for (m, &root) in roots.iter().enumerate() {
        for b in 0..4u64 {
            let pitch = if b == 2 { root + 7 } else { root };
            bass_notes.push(Note::new(pitch, 100, m as u64 * measure + b * beat, beat));
        }
    }
    store.replace_notes(bass, &bass_notes)?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let options = CliOptions::parse()?;
    let config = SessionConfig {
        default_bpm: options.bpm,
        ..Default::default()
    };

    let synth = SoundFontSynth::new(config.sample_rate, config.default_bpm * config.ppq as f64 / 60.0);
    let engine = Arc::new(Mutex::new(PlaybackEngine::new(Box::new(synth), config)));
    let store = Rc::new(NoteStore::new(Arc::new(MemoryBlobStore::new()), config.ppq));
    store.set_session_meta(options.bpm, (4, 4));

    let asset_dir = options
        .soundfont
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let instrument: InstrumentId = options
        .soundfont
        .file_name()
        .and_then(|n| n.to_str())
        .context("SoundFont path has no file name")?
        .into();
    let assets = Arc::new(DirAssets::new(asset_dir));

    let mut controller = EngineController::new(store.clone(), engine.clone(), assets);

    let pad = TrackId::new();
    let bass = TrackId::new();
    seed_arrangement(&store, pad, bass)?;
    controller.connect_track(pad, instrument.clone(), AddTrackOptions::default())?;
    controller.connect_track(
        bass,
        instrument,
        AddTrackOptions {
            volume: 110,
            ..Default::default()
        },
    )?;

    controller.play();
    let duration = {
        let engine = engine.lock().unwrap_or_else(|e| e.into_inner());
        engine.duration_ticks()
    };
    {
        let mut engine = engine.lock().unwrap_or_else(|e| e.into_inner());
        bounce_to_wav(&mut *engine, duration, &options.out, None::<fn(f32)>)?;
    }
    controller.dispose();

    println!("Wrote {}", options.out.display());
    Ok(())
}
