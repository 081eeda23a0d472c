//! Silent stand-ins.
//!
//! [`NullSound`] is what callers get when a sound cannot be created; it
//! accepts every call and reports `Ready`. [`NullManager`] is the backend for
//! configurations without an audio device.

use std::sync::{Arc, Mutex};

use audio_engine_types::{ManagerStats, SoundMode, SoundStatus};
use crossbeam_channel::Sender;

use crate::backend::{AudioManager, ListenerAttributes};
use crate::config::EngineConfig;
use crate::cursor::AudioSource;
use crate::sound::{AudioSound, FinishedEvent, SoundId};

#[derive(Clone, Copy, Debug, Default)]
pub struct NullSound;

impl NullSound {
    pub fn new() -> Self {
        Self
    }
}

impl AudioSound for NullSound {
    fn id(&self) -> SoundId {
        0
    }

    fn play(&self) {}

    fn stop(&self) {}

    fn set_loop_count(&self, _count: u32) {}

    fn get_loop_count(&self) -> u32 {
        1
    }

    fn set_time(&self, _seconds: f64) {}

    fn get_time(&self) -> f64 {
        0.0
    }

    fn set_volume(&self, _volume: f32) {}

    fn get_volume(&self) -> f32 {
        0.0
    }

    fn set_balance(&self, _balance: f32) {}

    fn get_balance(&self) -> f32 {
        0.0
    }

    fn set_play_rate(&self, _rate: f32) {}

    fn get_play_rate(&self) -> f32 {
        1.0
    }

    fn set_active(&self, _active: bool) {}

    fn get_active(&self) -> bool {
        false
    }

    fn set_finished_event(&self, _sender: Option<Sender<FinishedEvent>>) {}

    fn get_name(&self) -> String {
        String::new()
    }

    fn length(&self) -> f64 {
        0.0
    }

    fn set_3d_attributes(&self, _position: [f32; 3], _velocity: [f32; 3]) {}

    fn get_3d_attributes(&self) -> ([f32; 3], [f32; 3]) {
        ([0.0; 3], [0.0; 3])
    }

    fn set_3d_min_distance(&self, _distance: f32) {}

    fn get_3d_min_distance(&self) -> f32 {
        0.0
    }

    fn set_3d_max_distance(&self, _distance: f32) {}

    fn get_3d_max_distance(&self) -> f32 {
        0.0
    }

    fn set_3d_drop_off_factor(&self, _factor: f32) {}

    fn get_3d_drop_off_factor(&self) -> f32 {
        0.0
    }

    fn is_positional(&self) -> bool {
        false
    }

    fn status(&self) -> SoundStatus {
        SoundStatus::Ready
    }
}

#[derive(Clone, Copy, Debug)]
struct NullSettings {
    volume: f32,
    active: bool,
    play_rate: f32,
    cache_limit: usize,
    concurrent_limit: usize,
    listener: ListenerAttributes,
    distance_factor: f32,
    doppler_factor: f32,
    drop_off_factor: f32,
}

/// Manager that never opens a device. Settings are remembered so getters
/// stay consistent; every sound is a [`NullSound`].
pub struct NullManager {
    settings: Mutex<NullSettings>,
}

impl NullManager {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            settings: Mutex::new(NullSettings {
                volume: cfg.volume,
                active: cfg.active,
                play_rate: 1.0,
                cache_limit: cfg.cache_limit,
                concurrent_limit: cfg.concurrent_sound_limit,
                listener: ListenerAttributes::default(),
                distance_factor: cfg.distance_factor,
                doppler_factor: cfg.doppler_factor,
                drop_off_factor: cfg.drop_off_factor,
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut NullSettings) -> R) -> R {
        let mut settings = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut settings)
    }
}

impl AudioManager for NullManager {
    fn get_sound(&self, _name: &str, _positional: bool, _mode: SoundMode) -> Box<dyn AudioSound> {
        Box::new(NullSound)
    }

    fn get_sound_from_source(
        &self,
        _source: Arc<dyn AudioSource>,
        _positional: bool,
        _mode: SoundMode,
    ) -> Box<dyn AudioSound> {
        Box::new(NullSound)
    }

    fn uncache_sound(&self, _name: &str) {}

    fn clear_cache(&self) {}

    fn set_cache_limit(&self, limit: usize) {
        self.with(|s| s.cache_limit = limit);
    }

    fn get_cache_limit(&self) -> usize {
        self.with(|s| s.cache_limit)
    }

    fn set_volume(&self, volume: f32) {
        self.with(|s| s.volume = volume);
    }

    fn get_volume(&self) -> f32 {
        self.with(|s| s.volume)
    }

    fn set_active(&self, active: bool) {
        self.with(|s| s.active = active);
    }

    fn get_active(&self) -> bool {
        self.with(|s| s.active)
    }

    fn set_play_rate(&self, rate: f32) {
        self.with(|s| s.play_rate = rate);
    }

    fn get_play_rate(&self) -> f32 {
        self.with(|s| s.play_rate)
    }

    fn set_concurrent_sound_limit(&self, limit: usize) {
        self.with(|s| s.concurrent_limit = limit);
    }

    fn get_concurrent_sound_limit(&self) -> usize {
        self.with(|s| s.concurrent_limit)
    }

    fn reduce_sounds_playing_to(&self, _count: usize) {}

    fn stop_all_sounds(&self) {}

    fn update(&self) {}

    fn shutdown(&self) {}

    fn is_valid(&self) -> bool {
        false
    }

    fn audio_3d_set_listener_attributes(&self, attributes: ListenerAttributes) {
        self.with(|s| s.listener = attributes);
    }

    fn audio_3d_get_listener_attributes(&self) -> ListenerAttributes {
        self.with(|s| s.listener)
    }

    fn audio_3d_set_distance_factor(&self, factor: f32) {
        self.with(|s| s.distance_factor = factor);
    }

    fn audio_3d_get_distance_factor(&self) -> f32 {
        self.with(|s| s.distance_factor)
    }

    fn audio_3d_set_doppler_factor(&self, factor: f32) {
        self.with(|s| s.doppler_factor = factor);
    }

    fn audio_3d_get_doppler_factor(&self) -> f32 {
        self.with(|s| s.doppler_factor)
    }

    fn audio_3d_set_drop_off_factor(&self, factor: f32) {
        self.with(|s| s.drop_off_factor = factor);
    }

    fn audio_3d_get_drop_off_factor(&self) -> f32 {
        self.with(|s| s.drop_off_factor)
    }

    fn stats(&self) -> ManagerStats {
        ManagerStats::default()
    }
}
