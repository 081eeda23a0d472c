//! Engine configuration.
//!
//! Every option can be set in code; `EngineConfig::load` additionally reads a
//! TOML file where missing keys keep their defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Which manager variant `backend::create_manager` builds.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Software mixer rendered through a CPAL output stream.
    #[default]
    Cpal,
    /// No device at all; every sound is silent.
    Null,
}

/// Tuning and defaults shared by the cache, pipeline, pool and manager.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Output device substring selector; `None` picks the host default.
    pub device: Option<String>,
    pub backend: BackendKind,
    /// Initial manager active flag.
    pub active: bool,
    /// Initial manager volume.
    pub volume: f32,
    /// Unreferenced resident samples kept around before eviction.
    pub cache_limit: usize,
    /// Maximum simultaneously playing sounds per manager; 0 means unlimited.
    pub concurrent_sound_limit: usize,
    /// Look-ahead kept queued on a voice for streaming sources.
    pub buffering_seconds: f32,
    /// Decoded-size ceiling (bytes) for heuristic-mode samples.
    pub preload_threshold: usize,
    /// Units per meter for 3D distances.
    pub distance_factor: f32,
    pub doppler_factor: f32,
    pub drop_off_factor: f32,
    /// Voices the software mixer will hand out before allocation fails.
    pub max_voices: usize,
    /// Directories searched, in order, for relative sound names.
    pub search_path: Vec<PathBuf>,
    /// Retries when deleting a buffer the mixer still reports busy.
    pub buffer_delete_retries: u32,
    /// Base delay between buffer delete retries; doubled on each try.
    pub buffer_delete_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: None,
            backend: BackendKind::Cpal,
            active: true,
            volume: 1.0,
            cache_limit: 15,
            concurrent_sound_limit: 0,
            buffering_seconds: 3.0,
            preload_threshold: 1_000_000,
            distance_factor: 1.0,
            doppler_factor: 1.0,
            drop_off_factor: 1.0,
            max_voices: 32,
            search_path: Vec::new(),
            buffer_delete_retries: 5,
            buffer_delete_delay_ms: 1,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg = toml::from_str::<EngineConfig>(raw)?;
        Ok(cfg.normalized())
    }

    /// Clamp values that would otherwise stall or divide by zero.
    pub fn normalized(mut self) -> Self {
        if !self.buffering_seconds.is_finite() || self.buffering_seconds <= 0.0 {
            self.buffering_seconds = 3.0;
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            self.volume = 0.0;
        }
        self.max_voices = self.max_voices.max(1);
        self.device = self.device.and_then(|name| {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });
        self
    }
}
