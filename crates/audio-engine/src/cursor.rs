//! Decoder boundary: audio sources and the cursors that read them.
//!
//! A source is anything that can be opened into a cursor; the cursor hands out
//! interleaved 16-bit PCM frames. Sample counts in this module are always
//! frames (one sample per channel).

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::decode::FileAudio;
use crate::error::AudioResult;

/// `ready()` value meaning the whole source is available without blocking.
pub const FULLY_BUFFERED: usize = 0x4000_0000;

/// An open, positioned reader over one audio source.
pub trait AudioCursor: Send {
    fn audio_channels(&self) -> u16;
    fn audio_rate(&self) -> u32;
    /// Duration in seconds.
    fn length(&self) -> f64;
    /// Current read position in seconds.
    fn tell(&self) -> f64;
    fn seek(&mut self, t: f64) -> AudioResult<()>;
    /// Frames readable without blocking, or [`FULLY_BUFFERED`].
    fn ready(&self) -> usize;
    /// Read up to `frames` frames into `out` and return how many were read.
    fn read_samples(&mut self, frames: usize, out: &mut [i16]) -> usize;
    fn can_seek(&self) -> bool;
    /// A live source gave up; no more data will ever arrive.
    fn aborted(&self) -> bool {
        false
    }
}

/// Something that can be opened for reading, like a file or a generated tone.
pub trait AudioSource: Send + Sync {
    /// Stable filename, or `None` for anonymous/generated audio.
    fn filename(&self) -> Option<&Path>;

    /// Human-readable name used in logs and `get_name()`.
    fn name(&self) -> String {
        self.filename()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<anonymous>".to_string())
    }

    fn open(&self) -> AudioResult<Box<dyn AudioCursor>>;
}

/// Resolves the names passed to `get_sound` into sources.
pub trait SourceLoader: Send + Sync {
    fn load(&self, name: &str) -> Option<Arc<dyn AudioSource>>;
}

/// Resolves names against the filesystem.
///
/// Absolute paths are used as-is. Relative names are tried against each
/// search directory in order; the first existing file wins, and a name that
/// exists nowhere falls back to the working directory.
#[derive(Clone, Debug, Default)]
pub struct FileLoader {
    search_path: Vec<PathBuf>,
}

impl FileLoader {
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }

    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return None;
        }
        let path = PathBuf::from(trimmed);
        if path.is_absolute() {
            return Some(path);
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(&path))
            .find(|candidate| candidate.is_file())
            .or(Some(path))
    }
}

impl SourceLoader for FileLoader {
    fn load(&self, name: &str) -> Option<Arc<dyn AudioSource>> {
        let path = self.resolve(name)?;
        Some(Arc::new(FileAudio::new(path)))
    }
}

/// Name-to-source table for sounds that never touch the filesystem.
#[derive(Default)]
pub struct MemoryLoader {
    sources: HashMap<String, Arc<dyn AudioSource>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, source: Arc<dyn AudioSource>) {
        self.sources.insert(name.into(), source);
    }

    pub fn with(mut self, name: impl Into<String>, source: Arc<dyn AudioSource>) -> Self {
        self.insert(name, source);
        self
    }
}

impl SourceLoader for MemoryLoader {
    fn load(&self, name: &str) -> Option<Arc<dyn AudioSource>> {
        self.sources.get(name).cloned()
    }
}

/// Interleaved PCM held in memory.
///
/// A named source behaves like a file; `anonymous` and `live` sources are
/// never eligible for full decode.
pub struct MemoryAudio {
    name: Option<PathBuf>,
    rate: u32,
    channels: u16,
    samples: Arc<[i16]>,
    live: bool,
    unknown_length: bool,
    opens: AtomicUsize,
}

impl MemoryAudio {
    pub fn new(name: impl Into<PathBuf>, rate: u32, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            name: Some(name.into()),
            rate,
            channels,
            samples: samples.into(),
            live: false,
            unknown_length: false,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn anonymous(rate: u32, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            name: None,
            ..Self::new("", rate, channels, samples)
        }
    }

    /// A sine tone of `seconds` length, same signal on every channel.
    pub fn tone(
        name: impl Into<PathBuf>,
        rate: u32,
        channels: u16,
        seconds: f64,
        freq_hz: f64,
    ) -> Self {
        let frames = (seconds * rate as f64).round() as usize;
        let mut samples = Vec::with_capacity(frames * channels as usize);
        for i in 0..frames {
            let phase = TAU * freq_hz * i as f64 / rate as f64;
            let value = (phase.sin() * 0.25 * i16::MAX as f64) as i16;
            for _ in 0..channels {
                samples.push(value);
            }
        }
        Self::new(name, rate, channels, samples)
    }

    /// Mark the source as live: not randomly accessible, streamed only.
    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    /// Report a length of zero, like a container without a frame count.
    pub fn unknown_length(mut self) -> Self {
        self.unknown_length = true;
        self
    }

    /// How many cursors have been opened on this source.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

impl AudioSource for MemoryAudio {
    fn filename(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    fn open(&self) -> AudioResult<Box<dyn AudioCursor>> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryCursor {
            samples: self.samples.clone(),
            rate: self.rate,
            channels: self.channels,
            frames: self.frames(),
            pos: 0,
            live: self.live,
            unknown_length: self.unknown_length,
        }))
    }
}

struct MemoryCursor {
    samples: Arc<[i16]>,
    rate: u32,
    channels: u16,
    frames: usize,
    pos: usize,
    live: bool,
    unknown_length: bool,
}

impl AudioCursor for MemoryCursor {
    fn audio_channels(&self) -> u16 {
        self.channels
    }

    fn audio_rate(&self) -> u32 {
        self.rate
    }

    fn length(&self) -> f64 {
        if self.rate == 0 || self.unknown_length {
            return 0.0;
        }
        self.frames as f64 / self.rate as f64
    }

    fn tell(&self) -> f64 {
        if self.rate == 0 {
            return 0.0;
        }
        self.pos as f64 / self.rate as f64
    }

    fn seek(&mut self, t: f64) -> AudioResult<()> {
        let frame = (t.max(0.0) * self.rate as f64).round() as usize;
        self.pos = frame.min(self.frames);
        Ok(())
    }

    fn ready(&self) -> usize {
        if self.live {
            self.frames - self.pos
        } else {
            FULLY_BUFFERED
        }
    }

    fn read_samples(&mut self, frames: usize, out: &mut [i16]) -> usize {
        let channels = self.channels as usize;
        if channels == 0 {
            return 0;
        }
        let fits = out.len() / channels;
        let take = frames.min(fits).min(self.frames - self.pos);
        let start = self.pos * channels;
        let end = start + take * channels;
        out[..take * channels].copy_from_slice(&self.samples[start..end]);
        self.pos += take;
        take
    }

    fn can_seek(&self) -> bool {
        !self.live
    }
}
