//! Manager interface shared by the mixer-backed and null variants.

use std::sync::Arc;

use audio_engine_types::{ManagerStats, SoundMode};

use crate::config::{BackendKind, EngineConfig};
use crate::cursor::AudioSource;
use crate::hal::{Listener, Vec3};
use crate::manager::Manager;
use crate::null::NullManager;
use crate::registry::DeviceRegistry;
use crate::sound::AudioSound;

/// Listener pose in the caller's Z-up space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ListenerAttributes {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub forward: [f32; 3],
    pub up: [f32; 3],
}

impl Default for ListenerAttributes {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            velocity: [0.0; 3],
            forward: [0.0, 1.0, 0.0],
            up: [0.0, 0.0, 1.0],
        }
    }
}

impl ListenerAttributes {
    pub(crate) fn to_listener(self) -> Listener {
        let conv = |v: [f32; 3]| Vec3::from_z_up(v[0], v[1], v[2]);
        Listener {
            position: conv(self.position),
            velocity: conv(self.velocity),
            forward: conv(self.forward),
            up: conv(self.up),
        }
    }
}

/// Everything an embedding application does with an audio manager.
///
/// No call fails. A manager whose device could not be opened reports
/// `is_valid() == false` and hands out silent sounds.
pub trait AudioManager: Send + Sync {
    /// Resolve `name` through the manager's loader and create a sound for it.
    fn get_sound(&self, name: &str, positional: bool, mode: SoundMode) -> Box<dyn AudioSound>;
    fn get_sound_from_source(
        &self,
        source: Arc<dyn AudioSource>,
        positional: bool,
        mode: SoundMode,
    ) -> Box<dyn AudioSound>;

    fn uncache_sound(&self, name: &str);
    fn clear_cache(&self);
    fn set_cache_limit(&self, limit: usize);
    fn get_cache_limit(&self) -> usize;

    fn set_volume(&self, volume: f32);
    fn get_volume(&self) -> f32;
    fn set_active(&self, active: bool);
    fn get_active(&self) -> bool;
    fn set_play_rate(&self, rate: f32);
    fn get_play_rate(&self) -> f32;

    /// 0 means unlimited.
    fn set_concurrent_sound_limit(&self, limit: usize);
    fn get_concurrent_sound_limit(&self) -> usize;
    /// Stop the oldest playing sounds until at most `count` remain.
    fn reduce_sounds_playing_to(&self, count: usize);
    fn stop_all_sounds(&self);

    /// Advance every playing sound; call once per frame.
    fn update(&self);
    fn shutdown(&self);
    fn is_valid(&self) -> bool;

    fn audio_3d_set_listener_attributes(&self, attributes: ListenerAttributes);
    fn audio_3d_get_listener_attributes(&self) -> ListenerAttributes;
    fn audio_3d_set_distance_factor(&self, factor: f32);
    fn audio_3d_get_distance_factor(&self) -> f32;
    fn audio_3d_set_doppler_factor(&self, factor: f32);
    fn audio_3d_get_doppler_factor(&self) -> f32;
    fn audio_3d_set_drop_off_factor(&self, factor: f32);
    fn audio_3d_get_drop_off_factor(&self) -> f32;

    fn stats(&self) -> ManagerStats;
}

/// Build the manager variant selected by `cfg.backend`.
pub fn create_manager(cfg: &EngineConfig, registry: Arc<DeviceRegistry>) -> Box<dyn AudioManager> {
    match cfg.backend {
        BackendKind::Cpal => Box::new(Manager::new(cfg, registry)),
        BackendKind::Null => {
            tracing::info!("using the null audio backend");
            Box::new(NullManager::new(cfg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::SoftwareMixer;

    #[test]
    fn default_listener_faces_into_the_screen() {
        let l = ListenerAttributes::default().to_listener();
        assert_eq!(l, Listener::default());
    }

    #[test]
    fn null_backend_never_touches_the_device() {
        let registry = DeviceRegistry::with_mixer(Arc::new(SoftwareMixer::new(8_000, 4)));
        let cfg = EngineConfig {
            backend: BackendKind::Null,
            ..EngineConfig::default()
        };
        let mgr = create_manager(&cfg, registry.clone());
        assert!(!mgr.is_valid());
        assert!(!registry.is_open());
    }

    #[test]
    fn mixer_backend_attaches_to_the_registry() {
        let registry = DeviceRegistry::with_mixer(Arc::new(SoftwareMixer::new(8_000, 4)));
        let mgr = create_manager(&EngineConfig::default(), registry.clone());
        assert!(mgr.is_valid());
        assert_eq!(registry.active_managers(), 1);
        drop(mgr);
        assert_eq!(registry.active_managers(), 0);
    }
}
