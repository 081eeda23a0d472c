//! Deterministic doubles for manager tests.

use std::sync::Arc;

use audio_engine_types::SoundMode;

use crate::backend::AudioManager;
use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::cursor::{MemoryAudio, MemoryLoader};
use crate::manager::Manager;
use crate::mixer::SoftwareMixer;
use crate::registry::DeviceRegistry;
use crate::sound::AudioSound;

pub const RATE: u32 = 1_000;

/// Mono tone at the test rate.
pub fn tone(name: &str, seconds: f64) -> Arc<MemoryAudio> {
    Arc::new(MemoryAudio::tone(name, RATE, 1, seconds, 50.0))
}

/// A manager on a hand-rendered mixer and a manual clock.
pub struct Rig {
    pub mixer: Arc<SoftwareMixer>,
    pub clock: ManualClock,
    pub registry: Arc<DeviceRegistry>,
    pub loader: Arc<MemoryLoader>,
    pub manager: Manager,
}

impl Rig {
    pub fn new(sounds: &[(&str, f64)]) -> Self {
        Self::with_voices(sounds, 32)
    }

    pub fn with_voices(sounds: &[(&str, f64)], max_voices: usize) -> Self {
        let mut loader = MemoryLoader::new();
        for &(name, seconds) in sounds {
            loader.insert(name, tone(name, seconds));
        }
        let loader = Arc::new(loader);
        let mixer = Arc::new(SoftwareMixer::new(RATE, max_voices));
        let registry = DeviceRegistry::with_mixer(mixer.clone());
        let clock = ManualClock::new(0.0);
        let manager = Manager::with_parts(
            &Self::config(),
            registry.clone(),
            loader.clone(),
            Arc::new(clock.clone()),
        );
        Self {
            mixer,
            clock,
            registry,
            loader,
            manager,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            buffering_seconds: 0.5,
            ..EngineConfig::default()
        }
    }

    /// Another manager on the same device, loader and clock.
    pub fn second_manager(&self) -> Manager {
        Manager::with_parts(
            &Self::config(),
            self.registry.clone(),
            self.loader.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    pub fn sound(&self, name: &str) -> Box<dyn AudioSound> {
        self.manager.get_sound(name, false, SoundMode::Heuristic)
    }

    /// Render, advance the clock and update, `step` seconds at a time.
    pub fn run(&self, seconds: f64, step: f64) {
        let steps = (seconds / step).round() as usize;
        let frames = (step * RATE as f64).round() as usize;
        for _ in 0..steps {
            self.mixer.render_frames(frames);
            self.clock.advance(step);
            self.manager.update();
        }
    }
}
