use serde::{Deserialize, Serialize};

/// Observable playback state of a single sound instance.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SoundStatus {
    /// The sound has no usable data (failed to load, or its manager shut down).
    NotReady,
    /// Loaded and idle: never started, stopped, evicted or finished.
    Ready,
    /// Holding a voice with audio still queued or loop iterations remaining.
    Playing,
}

/// How the audio data behind a sound is held in memory.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SoundMode {
    /// Decode the whole source into one buffer when it is eligible.
    Sample,
    /// Always decode incrementally from a live cursor.
    Stream,
    /// Decode fully only when the estimated decoded size is small enough.
    #[default]
    Heuristic,
}

/// Point-in-time counters describing one audio manager.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerStats {
    /// `false` once the output device failed to open or the manager shut down.
    pub valid: bool,
    /// Sound instances known to the manager (playing or not).
    pub sounds: usize,
    /// Sound instances currently holding a voice.
    pub playing: usize,
    /// Voices parked on the shared free list.
    pub free_voices: usize,
    /// Resident samples in the cache, referenced or not.
    pub cached_samples: usize,
    /// Unreferenced resident samples waiting for eviction.
    pub expiring_samples: usize,
    /// Unreferenced open streams waiting for eviction.
    pub expiring_streams: usize,
    /// Frames of silence emitted by the output callback.
    pub underrun_frames: Option<u64>,
    /// Number of output callbacks that ran dry.
    pub underrun_events: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sound_mode_defaults_to_heuristic() {
        assert_eq!(SoundMode::default(), SoundMode::Heuristic);
    }

    #[test]
    fn sound_status_serializes_snake_case() {
        let json = serde_json::to_string(&SoundStatus::NotReady).unwrap();
        assert_eq!(json, "\"not_ready\"");
        let back: SoundStatus = serde_json::from_str("\"playing\"").unwrap();
        assert_eq!(back, SoundStatus::Playing);
    }

    #[test]
    fn manager_stats_default_is_invalid_and_empty() {
        let stats = ManagerStats::default();
        assert!(!stats.valid);
        assert_eq!(stats.playing, 0);
        assert!(stats.underrun_events.is_none());
    }
}
