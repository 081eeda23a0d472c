pub use audio_engine_types::{ManagerStats, SoundMode, SoundStatus};

use crate::sound::AudioSound;

/// Point-in-time view of one sound, for progress displays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoundSnapshot {
    pub name: String,
    pub status: SoundStatus,
    pub elapsed_ms: u64,
    /// One loop; `None` when the source length is unknown.
    pub duration_ms: Option<u64>,
}

impl SoundSnapshot {
    pub fn of(sound: &dyn AudioSound) -> Self {
        let length = sound.length();
        Self {
            name: sound.get_name(),
            status: sound.status(),
            elapsed_ms: secs_to_ms(sound.get_time()),
            duration_ms: (length > 0.0).then(|| secs_to_ms(length)),
        }
    }

    /// `mm:ss/mm:ss`, or just the elapsed part for unknown lengths.
    pub fn progress(&self) -> String {
        match self.duration_ms {
            Some(total) => format!("{}/{}", clock_text(self.elapsed_ms), clock_text(total)),
            None => clock_text(self.elapsed_ms),
        }
    }
}

/// One-line summary of manager counters for logs.
pub fn stats_line(stats: &ManagerStats) -> String {
    let mut line = format!(
        "sounds={} playing={} free_voices={} cached={} expiring={}+{}",
        stats.sounds,
        stats.playing,
        stats.free_voices,
        stats.cached_samples,
        stats.expiring_samples,
        stats.expiring_streams,
    );
    if let (Some(frames), Some(events)) = (stats.underrun_frames, stats.underrun_events) {
        line.push_str(&format!(" underruns={events} ({frames} frames)"));
    }
    if !stats.valid {
        line.push_str(" [invalid]");
    }
    line
}

fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

fn clock_text(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
