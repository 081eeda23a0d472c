//! Sound handles.
//!
//! A [`MixerSound`] is only an id plus a reference to its manager; the state
//! behind it lives in the manager under the manager's lock. Cloning a handle
//! is cheap. When the last handle goes away a stopped sound is released at
//! once, while a playing one keeps playing until it finishes or is evicted.

use std::path::Path;
use std::sync::Arc;

use audio_engine_types::{SoundMode, SoundStatus};
use crossbeam_channel::Sender;

use crate::cache::DataId;
use crate::cursor::AudioSource;
use crate::manager::ManagerShared;
use crate::stream::StreamState;

pub type SoundId = u64;

/// Sent on a sound's finished channel when it plays to the end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedEvent {
    pub sound: SoundId,
    pub name: String,
}

/// Per-instance playback interface shared by every backend.
///
/// Positions and velocities use the caller's Z-up coordinates. None of these
/// calls fail; a sound that cannot play stays silent and logs why.
pub trait AudioSound: Send + Sync {
    /// Identifier unique within the owning manager; 0 for null sounds.
    fn id(&self) -> SoundId;

    fn play(&self);
    fn stop(&self);

    /// `true` loops forever, `false` plays once.
    fn set_loop(&self, looping: bool) {
        self.set_loop_count(if looping { 0 } else { 1 });
    }
    fn get_loop(&self) -> bool {
        self.get_loop_count() == 0
    }
    /// Number of times to play; 0 means forever. Applies from the next `play`.
    fn set_loop_count(&self, count: u32);
    fn get_loop_count(&self) -> u32;

    /// Offset the next `play` starts from; restarts a playing sound there.
    fn set_time(&self, seconds: f64);
    fn get_time(&self) -> f64;

    fn set_volume(&self, volume: f32);
    fn get_volume(&self) -> f32;
    /// -1.0 is hard left, 1.0 hard right. Ignored for positional sounds.
    fn set_balance(&self, balance: f32);
    fn get_balance(&self) -> f32;
    fn set_play_rate(&self, rate: f32);
    fn get_play_rate(&self) -> f32;

    fn set_active(&self, active: bool);
    fn get_active(&self) -> bool;

    fn set_finished_event(&self, sender: Option<Sender<FinishedEvent>>);

    fn get_name(&self) -> String;
    /// Duration of one loop in seconds.
    fn length(&self) -> f64;

    fn set_3d_attributes(&self, position: [f32; 3], velocity: [f32; 3]);
    fn get_3d_attributes(&self) -> ([f32; 3], [f32; 3]);
    fn set_3d_min_distance(&self, distance: f32);
    fn get_3d_min_distance(&self) -> f32;
    fn set_3d_max_distance(&self, distance: f32);
    fn get_3d_max_distance(&self) -> f32;
    fn set_3d_drop_off_factor(&self, factor: f32);
    fn get_3d_drop_off_factor(&self) -> f32;
    fn is_positional(&self) -> bool;

    fn status(&self) -> SoundStatus;
}

/// Caller-visible settings of one sound.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SoundParams {
    pub volume: f32,
    pub balance: f32,
    pub play_rate: f32,
    pub loop_count: u32,
    pub start_time: f64,
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub min_distance: f32,
    pub max_distance: f32,
    pub drop_off: f32,
    pub active: bool,
    /// Deactivated while looping; resumes on reactivation.
    pub paused: bool,
}

impl SoundParams {
    pub fn new(active: bool) -> Self {
        Self {
            volume: 1.0,
            balance: 0.0,
            play_rate: 1.0,
            loop_count: 1,
            start_time: 0.0,
            position: [0.0; 3],
            velocity: [0.0; 3],
            min_distance: 1.0,
            max_distance: 1_000_000_000.0,
            drop_off: 1.0,
            active,
            paused: false,
        }
    }
}

/// Everything the manager tracks for one sound.
pub(crate) struct SoundState {
    pub source: Arc<dyn AudioSource>,
    pub name: String,
    pub mode: SoundMode,
    pub positional: bool,
    pub length: f64,
    pub data: Option<DataId>,
    /// Cleared when the sound is torn down; the handle then reports `NotReady`.
    pub valid: bool,
    pub handles: usize,
    pub params: SoundParams,
    pub stream: StreamState,
    pub finished_tx: Option<Sender<FinishedEvent>>,
}

impl SoundState {
    pub fn new(
        source: Arc<dyn AudioSource>,
        mode: SoundMode,
        positional: bool,
        length: f64,
        data: DataId,
        active: bool,
    ) -> Self {
        let name = source
            .filename()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.name());
        Self {
            source,
            name,
            mode,
            positional,
            length,
            data: Some(data),
            valid: true,
            handles: 1,
            params: SoundParams::new(active),
            stream: StreamState::default(),
            finished_tx: None,
        }
    }

    pub fn status(&self) -> SoundStatus {
        if !self.valid {
            SoundStatus::NotReady
        } else if self.stream.is_drained() {
            SoundStatus::Ready
        } else {
            SoundStatus::Playing
        }
    }
}

/// Handle to a sound owned by a [`crate::manager::Manager`].
pub struct MixerSound {
    id: SoundId,
    shared: Arc<ManagerShared>,
}

impl MixerSound {
    pub(crate) fn new(id: SoundId, shared: Arc<ManagerShared>) -> Self {
        Self { id, shared }
    }

    fn read<R>(&self, default: R, f: impl FnOnce(&SoundState) -> R) -> R {
        self.shared
            .with_state(|st| st.sound(self.id).map(f).unwrap_or(default))
    }
}

impl Clone for MixerSound {
    fn clone(&self) -> Self {
        self.shared.with_state(|st| st.retain_sound(self.id));
        Self {
            id: self.id,
            shared: self.shared.clone(),
        }
    }
}

impl Drop for MixerSound {
    fn drop(&mut self) {
        self.shared.with_state(|st| st.release_handle(self.id));
    }
}

impl std::fmt::Debug for MixerSound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixerSound").field("id", &self.id).finish()
    }
}

impl AudioSound for MixerSound {
    fn id(&self) -> SoundId {
        self.id
    }

    fn play(&self) {
        self.shared.with_state(|st| st.play_sound(self.id));
    }

    fn stop(&self) {
        self.shared.with_state(|st| st.stop_sound(self.id));
    }

    fn set_loop_count(&self, count: u32) {
        self.shared
            .with_state(|st| st.set_sound_loop_count(self.id, count));
    }

    fn get_loop_count(&self) -> u32 {
        self.read(1, |s| s.params.loop_count)
    }

    fn set_time(&self, seconds: f64) {
        self.shared.with_state(|st| st.set_sound_time(self.id, seconds));
    }

    fn get_time(&self) -> f64 {
        self.shared.with_state(|st| st.sound_time(self.id))
    }

    fn set_volume(&self, volume: f32) {
        self.shared
            .with_state(|st| st.set_sound_volume(self.id, volume));
    }

    fn get_volume(&self) -> f32 {
        self.read(0.0, |s| s.params.volume)
    }

    fn set_balance(&self, balance: f32) {
        self.shared
            .with_state(|st| st.set_sound_balance(self.id, balance));
    }

    fn get_balance(&self) -> f32 {
        self.read(0.0, |s| s.params.balance)
    }

    fn set_play_rate(&self, rate: f32) {
        self.shared
            .with_state(|st| st.set_sound_play_rate(self.id, rate));
    }

    fn get_play_rate(&self) -> f32 {
        self.read(1.0, |s| s.params.play_rate)
    }

    fn set_active(&self, active: bool) {
        self.shared
            .with_state(|st| st.set_sound_active(self.id, active));
    }

    fn get_active(&self) -> bool {
        self.read(false, |s| s.params.active)
    }

    fn set_finished_event(&self, sender: Option<Sender<FinishedEvent>>) {
        self.shared.with_state(|st| {
            if let Some(sound) = st.sound_mut(self.id) {
                sound.finished_tx = sender;
            }
        });
    }

    fn get_name(&self) -> String {
        self.read(String::new(), |s| s.name.clone())
    }

    fn length(&self) -> f64 {
        self.read(0.0, |s| s.length)
    }

    fn set_3d_attributes(&self, position: [f32; 3], velocity: [f32; 3]) {
        self.shared
            .with_state(|st| st.set_sound_3d_attributes(self.id, position, velocity));
    }

    fn get_3d_attributes(&self) -> ([f32; 3], [f32; 3]) {
        self.read(([0.0; 3], [0.0; 3]), |s| {
            (s.params.position, s.params.velocity)
        })
    }

    fn set_3d_min_distance(&self, distance: f32) {
        self.shared
            .with_state(|st| st.set_sound_min_distance(self.id, distance));
    }

    fn get_3d_min_distance(&self) -> f32 {
        self.read(0.0, |s| s.params.min_distance)
    }

    fn set_3d_max_distance(&self, distance: f32) {
        self.shared
            .with_state(|st| st.set_sound_max_distance(self.id, distance));
    }

    fn get_3d_max_distance(&self) -> f32 {
        self.read(0.0, |s| s.params.max_distance)
    }

    fn set_3d_drop_off_factor(&self, factor: f32) {
        self.shared
            .with_state(|st| st.set_sound_drop_off(self.id, factor));
    }

    fn get_3d_drop_off_factor(&self) -> f32 {
        self.read(0.0, |s| s.params.drop_off)
    }

    fn is_positional(&self) -> bool {
        self.read(false, |s| s.positional)
    }

    fn status(&self) -> SoundStatus {
        self.read(SoundStatus::NotReady, SoundState::status)
    }
}
