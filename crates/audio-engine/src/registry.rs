//! Process-scoped device registry.
//!
//! One registry owns the opened output device, the free list of voices and
//! the count of managers using them. The device is opened when the first
//! manager attaches and closed when the last one detaches. Managers receive
//! the registry at construction; nothing here is a global.
//!
//! Lock order: a manager's lock is always taken before the registry's.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Result;

use crate::config::EngineConfig;
use crate::error::{AudioError, AudioResult};
use crate::hal::{MixerBackend, VoiceId};
use crate::manager::ManagerShared;
use crate::playback::{self, OutputCounters, OutputThread};
use crate::pool::VoicePool;

/// A mixer plus whatever keeps it producing sound.
pub struct OpenedDevice {
    pub mixer: Arc<dyn MixerBackend>,
    pub counters: Option<OutputCounters>,
    _output: Option<OutputThread>,
}

impl OpenedDevice {
    /// A mixer nobody pulls from automatically; the owner renders it by hand.
    pub fn headless(mixer: Arc<dyn MixerBackend>) -> Self {
        Self {
            mixer,
            counters: None,
            _output: None,
        }
    }

    /// Open the configured CPAL output device.
    pub fn cpal(cfg: &EngineConfig) -> Result<Self> {
        let (mixer, counters, output) = playback::spawn_output(cfg)?;
        Ok(Self {
            mixer,
            counters: Some(counters),
            _output: Some(output),
        })
    }
}

pub type DeviceOpener = Box<dyn Fn(&EngineConfig) -> Result<OpenedDevice> + Send + Sync>;

pub struct DeviceRegistry {
    opener: DeviceOpener,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    device: Option<OpenedDevice>,
    active_managers: usize,
    voices: VoicePool,
    managers: Vec<Weak<ManagerShared>>,
}

impl DeviceRegistry {
    pub fn new(opener: DeviceOpener) -> Arc<Self> {
        Arc::new(Self {
            opener,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Registry that opens the CPAL device named in the first manager's config.
    pub fn cpal() -> Arc<Self> {
        Self::new(Box::new(OpenedDevice::cpal))
    }

    /// Registry whose "device" is an existing mixer, typically rendered by a test.
    pub fn with_mixer(mixer: Arc<dyn MixerBackend>) -> Arc<Self> {
        Self::new(Box::new(move |_: &EngineConfig| Ok(OpenedDevice::headless(mixer.clone()))))
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a manager, opening the device if it is the first one.
    pub(crate) fn attach(
        &self,
        cfg: &EngineConfig,
        manager: Weak<ManagerShared>,
    ) -> AudioResult<Arc<dyn MixerBackend>> {
        let mut st = self.lock();
        if st.device.is_none() {
            let device =
                (self.opener)(cfg).map_err(|e| AudioError::DeviceLoss(format!("{e:#}")))?;
            tracing::info!("audio device opened");
            st.device = Some(device);
        }
        let mixer = match &st.device {
            Some(device) => device.mixer.clone(),
            None => return Err(AudioError::DeviceLoss("device vanished".to_string())),
        };
        st.active_managers += 1;
        st.managers.retain(|m| m.strong_count() > 0);
        st.managers.push(manager);
        Ok(mixer)
    }

    /// Unregister a manager; the last one out closes the device.
    pub(crate) fn detach(&self, manager: &Weak<ManagerShared>) {
        let mut st = self.lock();
        st.managers
            .retain(|m| m.strong_count() > 0 && !Weak::ptr_eq(m, manager));
        if st.active_managers == 0 {
            tracing::warn!("detach without a matching attach");
            return;
        }
        st.active_managers -= 1;
        if st.active_managers == 0 {
            let RegistryState { device, voices, .. } = &mut *st;
            if let Some(device) = device.take() {
                voices.destroy_all(device.mixer.as_ref());
                drop(device);
                tracing::info!("audio device closed");
            }
        }
    }

    pub(crate) fn take_voice(&self) -> Option<VoiceId> {
        self.lock().voices.take()
    }

    pub(crate) fn give_voice(&self, voice: VoiceId) {
        self.lock().voices.give(voice);
    }

    pub fn free_voices(&self) -> usize {
        self.lock().voices.len()
    }

    pub fn active_managers(&self) -> usize {
        self.lock().active_managers
    }

    pub fn is_open(&self) -> bool {
        self.lock().device.is_some()
    }

    /// `(underrun_frames, underrun_events)` when the device reports them.
    pub fn underruns(&self) -> Option<(u64, u64)> {
        let st = self.lock();
        let counters = st.device.as_ref()?.counters.as_ref()?;
        Some((
            counters.underrun_frames.load(Ordering::Relaxed),
            counters.underrun_events.load(Ordering::Relaxed),
        ))
    }

    /// Shut down every manager still attached; the device closes with the last.
    pub fn shutdown(&self) {
        let managers: Vec<Arc<ManagerShared>> = {
            let st = self.lock();
            st.managers.iter().filter_map(Weak::upgrade).collect()
        };
        for manager in managers {
            manager.shutdown();
        }
    }
}
