//! Player runtime.
//!
//! Builds the engine config from file + flags, opens a manager and drives it
//! with a fixed-rate update loop until every sound is done or Ctrl-C.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use audio_engine::cursor::MemoryAudio;
use audio_engine::device;
use audio_engine::status::{SoundSnapshot, stats_line};
use audio_engine::{
    AudioManager, AudioSound, BackendKind, DeviceRegistry, EngineConfig, SoundMode, SoundStatus,
    create_manager,
};

use crate::cli::Args;

const FRAME: Duration = Duration::from_millis(16);
const REPORT_EVERY: Duration = Duration::from_secs(1);
const TONE_RATE: u32 = 48_000;

/// Print output devices to stdout.
pub fn list_devices() -> Result<()> {
    for d in device::list_output_devices()? {
        let marker = if d.is_default { "*" } else { " " };
        println!(
            "{marker} {} ({}-{} Hz, up to {} ch)",
            d.name, d.min_rate, d.max_rate, d.max_channels
        );
    }
    Ok(())
}

pub fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut cfg = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if args.device.is_some() {
        cfg.device = args.device.clone();
    }
    if let Some(limit) = args.concurrent_limit {
        cfg.concurrent_sound_limit = limit;
    }
    if let Some(secs) = args.buffer_seconds {
        cfg.buffering_seconds = secs;
    }
    if args.null {
        cfg.backend = BackendKind::Null;
    }
    Ok(cfg.normalized())
}

pub fn run(args: &Args) -> Result<()> {
    if args.files.is_empty() && args.tone.is_none() {
        bail!("nothing to play: pass audio files or --tone");
    }
    let cfg = build_config(args)?;
    let registry = DeviceRegistry::cpal();
    let manager = create_manager(&cfg, registry.clone());
    if !manager.is_valid() && cfg.backend != BackendKind::Null {
        tracing::warn!("no usable audio device; playing silently");
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        if let Err(e) = ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed)) {
            tracing::warn!("cannot install Ctrl-C handler: {e}");
        }
    }

    let mut pending = load_sounds(manager.as_ref(), args);
    let mut active: Vec<Box<dyn AudioSound>> = Vec::new();
    let mut last_report = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        if active.is_empty() || args.together {
            while let Some(sound) = pending.pop() {
                sound.play();
                tracing::info!(name = %sound.get_name(), length_secs = sound.length(), "playing");
                active.push(sound);
                if !args.together {
                    break;
                }
            }
        }

        manager.update();
        active.retain(|sound| {
            let done = sound.status() != SoundStatus::Playing;
            if done {
                tracing::info!(name = %sound.get_name(), "finished");
            }
            !done
        });
        if active.is_empty() && pending.is_empty() {
            break;
        }

        if last_report.elapsed() >= REPORT_EVERY {
            for sound in &active {
                let snap = SoundSnapshot::of(sound.as_ref());
                tracing::info!(name = %snap.name, progress = %snap.progress(), "position");
            }
            tracing::debug!("{}", stats_line(&manager.stats()));
            last_report = Instant::now();
        }
        std::thread::sleep(FRAME);
    }

    if stop.load(Ordering::Relaxed) {
        tracing::info!("interrupted");
    }
    drop(active);
    drop(pending);
    manager.shutdown();
    registry.shutdown();
    Ok(())
}

/// Sounds to play, last one first so `pop` yields them in order.
fn load_sounds(manager: &dyn AudioManager, args: &Args) -> Vec<Box<dyn AudioSound>> {
    let mode = if args.stream {
        SoundMode::Stream
    } else {
        SoundMode::Heuristic
    };
    let mut sounds = Vec::new();
    if let Some(secs) = args.tone {
        let tone = MemoryAudio::tone("tone-440hz", TONE_RATE, 1, secs, 440.0);
        sounds.push(manager.get_sound_from_source(Arc::new(tone), false, mode));
    }
    for path in &args.files {
        let name = path.to_string_lossy();
        let sound = manager.get_sound(&name, false, mode);
        if sound.status() == SoundStatus::NotReady || (manager.is_valid() && sound.id() == 0) {
            tracing::warn!(name = %name, "skipping unplayable file");
            continue;
        }
        sounds.push(sound);
    }
    for sound in &sounds {
        sound.set_loop_count(args.loop_count);
        sound.set_play_rate(args.play_rate);
        if let Some(volume) = args.volume {
            sound.set_volume(volume);
        }
    }
    sounds.reverse();
    sounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "concurrent_sound_limit = 4\nbuffering_seconds = 1.5").unwrap();
        let path = file.path().to_string_lossy().to_string();
        let args = Args::parse_from([
            "player-cli",
            "--config",
            &path,
            "--concurrent-limit",
            "2",
            "--null",
            "a.wav",
        ]);
        let cfg = build_config(&args).unwrap();
        assert_eq!(cfg.concurrent_sound_limit, 2);
        assert_eq!(cfg.buffering_seconds, 1.5);
        assert_eq!(cfg.backend, BackendKind::Null);
    }

    #[test]
    fn null_backend_run_finishes_immediately() {
        let args = Args::parse_from(["player-cli", "--null", "--tone", "0.5"]);
        run(&args).unwrap();
    }

    #[test]
    fn nothing_to_play_is_an_error() {
        let args = Args::parse_from(["player-cli"]);
        assert!(run(&args).is_err());
    }
}
