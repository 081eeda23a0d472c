pub mod backend;
pub mod cache;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod decode;
pub mod device;
pub mod error;
pub mod hal;
pub mod manager;
pub mod mixer;
pub mod null;
pub mod playback;
pub mod pool;
pub mod registry;
pub mod resample;
pub mod sound;
pub mod status;
pub mod stream;

#[cfg(test)]
mod testing;

pub use backend::{AudioManager, ListenerAttributes, create_manager};
pub use config::{BackendKind, EngineConfig};
pub use error::{AudioError, AudioResult};
pub use manager::Manager;
pub use null::{NullManager, NullSound};
pub use registry::DeviceRegistry;
pub use sound::{AudioSound, FinishedEvent, MixerSound, SoundId};
pub use status::{ManagerStats, SoundMode, SoundStatus};
