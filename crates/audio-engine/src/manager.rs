//! Mixer-backed audio manager.
//!
//! A manager owns the sound-data cache, the set of playing sounds and the
//! per-sound state behind every [`MixerSound`] handle. All of it sits behind
//! one mutex. Operations that tear sounds down only mark them; orphaned
//! sounds are reaped after every locked call, and finished notifications are
//! sent once the lock is released.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use audio_engine_types::{ManagerStats, SoundMode, SoundStatus};
use crossbeam_channel::Sender;

use crate::backend::{AudioManager, ListenerAttributes};
use crate::cache::{SoundCache, SoundData};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::cursor::{AudioSource, FileLoader, SourceLoader};
use crate::error::{AudioError, AudioResult};
use crate::hal::{DeleteRetry, MixerBackend, VoiceParam, Vec3};
use crate::null::NullSound;
use crate::pool::PlayingSet;
use crate::registry::DeviceRegistry;
use crate::sound::{AudioSound, FinishedEvent, MixerSound, SoundId, SoundState};
use crate::stream::{INFINITE_LOOPS, Pipe};

/// Meters per second; scaled by the distance factor.
const SPEED_OF_SOUND: f32 = 343.3;

pub(crate) struct ManagerState {
    valid: bool,
    mixer: Option<Arc<dyn MixerBackend>>,
    registry: Arc<DeviceRegistry>,
    clock: Arc<dyn Clock>,
    cache: SoundCache,
    sounds: HashMap<SoundId, SoundState>,
    playing: PlayingSet<SoundId>,
    next_sound: SoundId,
    retry: DeleteRetry,
    buffering_seconds: f64,
    preload_threshold: usize,
    volume: f32,
    active: bool,
    play_rate: f32,
    concurrent_limit: usize,
    distance_factor: f32,
    doppler_factor: f32,
    drop_off_factor: f32,
    listener: ListenerAttributes,
    events: Vec<(Sender<FinishedEvent>, FinishedEvent)>,
}

pub(crate) struct ManagerShared {
    state: Mutex<ManagerState>,
    loader: Arc<dyn SourceLoader>,
    me: Weak<ManagerShared>,
}

impl ManagerShared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` under the lock, reap orphans, then deliver finished events.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ManagerState) -> R) -> R {
        let (result, events) = {
            let mut st = self.lock();
            let result = f(&mut st);
            st.reap_orphans();
            (result, std::mem::take(&mut st.events))
        };
        for (tx, event) in events {
            if tx.send(event).is_err() {
                tracing::debug!("finished-event receiver is gone");
            }
        }
        result
    }

    pub(crate) fn shutdown(&self) {
        self.with_state(|st| st.shutdown(&self.me));
    }
}

impl ManagerState {
    fn new(cfg: &EngineConfig, registry: Arc<DeviceRegistry>, clock: Arc<dyn Clock>) -> Self {
        let retry = DeleteRetry::from_config(cfg);
        Self {
            valid: false,
            mixer: None,
            registry,
            clock,
            cache: SoundCache::new(cfg.cache_limit, retry),
            sounds: HashMap::new(),
            playing: PlayingSet::new(),
            next_sound: 1,
            retry,
            buffering_seconds: cfg.buffering_seconds as f64,
            preload_threshold: cfg.preload_threshold,
            volume: cfg.volume,
            active: cfg.active,
            play_rate: 1.0,
            concurrent_limit: cfg.concurrent_sound_limit,
            distance_factor: cfg.distance_factor,
            doppler_factor: cfg.doppler_factor,
            drop_off_factor: cfg.drop_off_factor,
            listener: ListenerAttributes::default(),
            events: Vec::new(),
        }
    }

    fn open(&mut self, mixer: Arc<dyn MixerBackend>) {
        mixer.set_listener(self.listener.to_listener());
        self.mixer = Some(mixer);
        self.valid = true;
        self.apply_distance_model();
    }

    pub(crate) fn sound(&self, id: SoundId) -> Option<&SoundState> {
        self.sounds.get(&id)
    }

    pub(crate) fn sound_mut(&mut self, id: SoundId) -> Option<&mut SoundState> {
        self.sounds.get_mut(&id)
    }

    fn sound_ids(&self) -> Vec<SoundId> {
        self.sounds.keys().copied().collect()
    }

    pub(crate) fn retain_sound(&mut self, id: SoundId) {
        if let Some(sound) = self.sounds.get_mut(&id) {
            sound.handles += 1;
        }
    }

    pub(crate) fn release_handle(&mut self, id: SoundId) {
        if let Some(sound) = self.sounds.get_mut(&id) {
            sound.handles = sound.handles.saturating_sub(1);
        }
    }

    /// Remove sounds nobody holds that are no longer playing.
    fn reap_orphans(&mut self) {
        let orphans: Vec<SoundId> = self
            .sounds
            .iter()
            .filter(|(id, s)| s.handles == 0 && !self.playing.contains(**id))
            .map(|(id, _)| *id)
            .collect();
        for id in orphans {
            self.cleanup_sound(id);
            self.sounds.remove(&id);
            tracing::trace!(sound = id, "reaped sound");
        }
    }

    fn pipe<'a>(&self, mixer: &'a dyn MixerBackend) -> Pipe<'a> {
        Pipe {
            mixer,
            retry: self.retry,
            buffering_seconds: self.buffering_seconds,
        }
    }

    fn create_sound(
        &mut self,
        source: Arc<dyn AudioSource>,
        positional: bool,
        mode: SoundMode,
    ) -> Option<SoundId> {
        if !self.valid {
            return None;
        }
        let mixer = self.mixer.clone()?;
        let data = match self
            .cache
            .acquire(mixer.as_ref(), source.clone(), mode, self.preload_threshold)
        {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(name = %source.name(), "could not load audio: {e}");
                return None;
            }
        };
        let (length, channels) = self
            .cache
            .get(data)
            .map(|d| (d.length, d.channels))
            .unwrap_or((0.0, 0));
        if positional && channels != 1 {
            tracing::warn!(
                name = %source.name(),
                channels,
                "positional sound is not mono; it will not be spatialized"
            );
        }

        let id = self.next_sound;
        self.next_sound += 1;
        let sound = SoundState::new(source, mode, positional, length, data, self.active);
        tracing::debug!(sound = id, name = %sound.name, length_secs = length, "created sound");
        self.sounds.insert(id, sound);
        self.release_sound_data(id, false);
        Some(id)
    }

    /// Make sure the sound holds a cache reference.
    fn require_sound_data(&mut self, id: SoundId) -> bool {
        let Some(mixer) = self.mixer.clone() else {
            return false;
        };
        let Some(sound) = self.sounds.get_mut(&id) else {
            return false;
        };
        if sound.data.is_some() {
            return true;
        }
        let acquired = self.cache.acquire(
            mixer.as_ref(),
            sound.source.clone(),
            sound.mode,
            self.preload_threshold,
        );
        match acquired {
            Ok(data) => {
                sound.data = Some(data);
                true
            }
            Err(e) => {
                tracing::error!(sound = id, name = %sound.name, "could not reopen audio: {e}");
                self.cleanup_sound(id);
                false
            }
        }
    }

    /// Drop the sound's cache reference. Resident samples are kept unless forced.
    fn release_sound_data(&mut self, id: SoundId, force: bool) {
        let Some(mixer) = self.mixer.clone() else {
            return;
        };
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        let Some(data) = sound.data else {
            return;
        };
        let is_sample = self.cache.get(data).is_some_and(SoundData::is_sample);
        if force || !is_sample {
            sound.data = None;
            self.cache.release(mixer.as_ref(), data);
        }
    }

    pub(crate) fn play_sound(&mut self, id: SoundId) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        if !sound.valid {
            return;
        }
        if !sound.params.active {
            if sound.params.loop_count == 0 {
                sound.params.paused = true;
            }
            return;
        }

        self.stop_sound(id);
        if !self.require_sound_data(id) {
            return;
        }
        if !self.starting_sound(id) {
            self.release_sound_data(id, false);
            return;
        }
        if let Err(e) = self.start_voice(id) {
            tracing::error!(sound = id, "failed to start playback: {e}");
            self.cleanup_sound(id);
        }
    }

    /// Give the sound a voice, making room under the limits first.
    fn starting_sound(&mut self, id: SoundId) -> bool {
        match self.sounds.get(&id) {
            Some(sound) if sound.stream.voice.is_some() => return true,
            Some(_) => {}
            None => return false,
        }
        self.update_playing();
        if self.concurrent_limit > 0 {
            self.reduce_playing_to(self.concurrent_limit - 1);
        }

        let Some(mixer) = self.mixer.clone() else {
            return false;
        };
        let voice = match self.registry.take_voice() {
            Some(voice) => Some(voice),
            None => match mixer.gen_voice() {
                Ok(voice) => Some(voice),
                Err(e) => {
                    tracing::warn!(sound = id, "voice allocation failed, evicting the oldest sound: {e}");
                    self.reduce_playing_to(self.playing.len().saturating_sub(1));
                    self.registry
                        .take_voice()
                        .or_else(|| mixer.gen_voice().ok())
                }
            },
        };
        let Some(voice) = voice else {
            tracing::warn!(sound = id, "no voice available; the sound stays silent");
            return false;
        };

        match self.sounds.get_mut(&id) {
            Some(sound) => {
                sound.stream.voice = Some(voice);
                self.playing.insert(id);
                true
            }
            None => {
                self.registry.give_voice(voice);
                false
            }
        }
    }

    fn start_voice(&mut self, id: SoundId) -> AudioResult<()> {
        let mixer = self
            .mixer
            .clone()
            .ok_or_else(|| AudioError::DeviceLoss("manager has no device".to_string()))?;
        let now = self.clock.now();
        let manager_rate = self.play_rate as f64;
        self.apply_voice_params(id);
        let pipe = self.pipe(mixer.as_ref());

        let Some(sound) = self.sounds.get_mut(&id) else {
            return Ok(());
        };
        let voice = sound
            .stream
            .voice
            .ok_or_else(|| AudioError::InvalidOperation("starting a sound without a voice".to_string()))?;
        let Some(data) = sound.data.and_then(|d| self.cache.get_mut(d)) else {
            return Err(AudioError::InvalidOperation(
                "starting a sound without data".to_string(),
            ));
        };

        let start = sound.params.start_time;
        let playing_rate = sound.params.play_rate as f64 * manager_rate;
        sound.stream.begin(sound.params.loop_count, playing_rate);
        if data.is_sample() {
            sound.stream.push_fresh_buffers(data, &pipe)?;
            mixer.set_sec_offset(voice, start)?;
            if let Some(front) = sound.stream.queue.front_mut() {
                front.time_offset = start;
            }
        } else {
            if let Some(cursor) = data.cursor_mut() {
                if cursor.tell() != start {
                    cursor.seek(start)?;
                }
            }
            sound.stream.push_fresh_buffers(data, &pipe)?;
        }
        sound.stream.restart_stalled(mixer.as_ref())?;

        sound.stream.calibrator.reset(now, start, playing_rate);
        sound.stream.current_time = start;
        sound.params.start_time = 0.0;
        tracing::debug!(
            sound = id,
            name = %sound.name,
            voice = voice.0,
            offset_secs = start,
            rate = playing_rate,
            "playing"
        );
        Ok(())
    }

    pub(crate) fn stop_sound(&mut self, id: SoundId) {
        let Some(mixer) = self.mixer.clone() else {
            return;
        };
        let now = self.clock.now();
        let pipe = self.pipe(mixer.as_ref());
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        if !sound.valid {
            return;
        }
        if sound.stream.voice.is_some() {
            sound.stream.cache_time(now, sound.length);
        }
        let sample = sound
            .data
            .and_then(|d| self.cache.get(d))
            .and_then(SoundData::sample);
        if let Some(voice) = sound.stream.halt(sample, &pipe) {
            self.registry.give_voice(voice);
        }
        self.playing.remove(id);
        self.release_sound_data(id, false);
    }

    /// Stop, flag finished and queue the notification.
    fn finish_sound(&mut self, id: SoundId) {
        self.stop_sound(id);
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        sound.stream.current_time = sound.length;
        tracing::debug!(sound = id, name = %sound.name, "finished");
        if let Some(tx) = &sound.finished_tx {
            self.events.push((
                tx.clone(),
                FinishedEvent {
                    sound: id,
                    name: sound.name.clone(),
                },
            ));
        }
    }

    /// Tear the sound down for good; its handles report `NotReady` afterwards.
    fn cleanup_sound(&mut self, id: SoundId) {
        if !self.sounds.get(&id).is_some_and(|s| s.valid) {
            return;
        }
        self.stop_sound(id);
        self.release_sound_data(id, true);
        if let Some(sound) = self.sounds.get_mut(&id) {
            sound.valid = false;
        }
    }

    /// One pipeline tick for every playing sound.
    pub(crate) fn update_playing(&mut self) {
        let Some(mixer) = self.mixer.clone() else {
            return;
        };
        let now = self.clock.now();
        let pipe = self.pipe(mixer.as_ref());
        let mut finished = Vec::new();
        let mut broken = Vec::new();

        for id in self.playing.snapshot() {
            let Some(sound) = self.sounds.get_mut(&id) else {
                self.playing.remove(id);
                continue;
            };
            let data = sound.data.and_then(|d| self.cache.get_mut(d));
            match sound.stream.tick(data, sound.length, now, &pipe) {
                Ok(()) if sound.stream.is_drained() => finished.push(id),
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(sound = id, name = %sound.name, "playback failed: {e}");
                    broken.push(id);
                }
            }
        }

        for id in broken {
            self.cleanup_sound(id);
        }
        for id in finished {
            self.finish_sound(id);
        }
    }

    pub(crate) fn reduce_playing_to(&mut self, count: usize) {
        self.update_playing();
        for id in self.playing.excess_over(count) {
            tracing::debug!(sound = id, limit = count, "evicting playing sound");
            self.stop_sound(id);
        }
    }

    fn stop_all(&mut self) {
        for id in self.playing.snapshot() {
            self.stop_sound(id);
        }
    }

    fn shutdown(&mut self, me: &Weak<ManagerShared>) {
        if !self.valid {
            return;
        }
        self.stop_all();
        for id in self.sound_ids() {
            self.cleanup_sound(id);
        }
        if let Some(mixer) = self.mixer.take() {
            self.cache.shutdown(mixer.as_ref());
        }
        self.valid = false;
        self.registry.detach(me);
        tracing::info!("audio manager shut down");
    }

    fn set_voice_param(&self, id: SoundId, param: VoiceParam) {
        let Some(mixer) = &self.mixer else {
            return;
        };
        let Some(voice) = self.sounds.get(&id).and_then(|s| s.stream.voice) else {
            return;
        };
        if let Err(e) = mixer.set_voice_param(voice, param) {
            tracing::warn!(sound = id, "failed to set {param:?}: {e}");
        }
    }

    fn apply_voice_params(&self, id: SoundId) {
        let Some(sound) = self.sounds.get(&id) else {
            return;
        };
        let p = &sound.params;
        let (position, velocity) = if sound.positional {
            (
                Vec3::from_z_up(p.position[0], p.position[1], p.position[2]),
                Vec3::from_z_up(p.velocity[0], p.velocity[1], p.velocity[2]),
            )
        } else {
            (Vec3::ZERO, Vec3::ZERO)
        };
        let params = [
            VoiceParam::Relative(!sound.positional),
            VoiceParam::Gain(p.volume * self.volume),
            VoiceParam::Pitch(p.play_rate * self.play_rate),
            VoiceParam::Pan(p.balance),
            VoiceParam::ReferenceDistance(p.min_distance * self.distance_factor),
            VoiceParam::MaxDistance(p.max_distance * self.distance_factor),
            VoiceParam::Rolloff(p.drop_off * self.drop_off_factor),
            VoiceParam::Position(position),
            VoiceParam::Velocity(velocity),
        ];
        for param in params {
            self.set_voice_param(id, param);
        }
    }

    fn apply_distance_model(&self) {
        let Some(mixer) = &self.mixer else {
            return;
        };
        if self.distance_factor > 0.0 {
            mixer.set_speed_of_sound(SPEED_OF_SOUND * self.distance_factor);
            mixer.set_doppler_factor(self.doppler_factor);
        } else {
            tracing::debug!(
                factor = self.distance_factor,
                "distance factor is not positive; doppler disabled"
            );
            mixer.set_doppler_factor(0.0);
        }
    }

    pub(crate) fn set_sound_loop_count(&mut self, id: SoundId, count: u32) {
        if let Some(sound) = self.sounds.get_mut(&id) {
            sound.params.loop_count = if count >= INFINITE_LOOPS { 0 } else { count };
        }
    }

    pub(crate) fn set_sound_time(&mut self, id: SoundId, seconds: f64) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        sound.params.start_time = seconds.max(0.0);
        if sound.stream.voice.is_some() {
            self.play_sound(id);
        }
    }

    pub(crate) fn sound_time(&mut self, id: SoundId) -> f64 {
        let now = self.clock.now();
        match self.sounds.get_mut(&id) {
            Some(s) if s.valid && s.stream.voice.is_some() => s.stream.cache_time(now, s.length),
            Some(s) => s.stream.current_time,
            None => 0.0,
        }
    }

    pub(crate) fn set_sound_volume(&mut self, id: SoundId, volume: f32) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        sound.params.volume = volume;
        self.set_voice_param(id, VoiceParam::Gain(volume * self.volume));
    }

    pub(crate) fn set_sound_balance(&mut self, id: SoundId, balance: f32) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        let balance = balance.clamp(-1.0, 1.0);
        sound.params.balance = balance;
        self.set_voice_param(id, VoiceParam::Pan(balance));
    }

    pub(crate) fn set_sound_play_rate(&mut self, id: SoundId, rate: f32) {
        let now = self.clock.now();
        let playing = rate * self.play_rate;
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        sound.params.play_rate = rate;
        if sound.stream.voice.is_some() {
            sound.stream.calibrator.set_play_rate(now, playing as f64);
            sound.stream.playing_rate = playing as f64;
        }
        self.set_voice_param(id, VoiceParam::Pitch(playing));
    }

    pub(crate) fn set_sound_active(&mut self, id: SoundId, active: bool) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        if !sound.valid || sound.params.active == active {
            return;
        }
        sound.params.active = active;
        if active {
            if sound.params.paused && sound.params.loop_count == 0 {
                sound.params.paused = false;
                self.play_sound(id);
            }
        } else if sound.status() == SoundStatus::Playing {
            if sound.params.loop_count == 0 {
                sound.params.paused = true;
            }
            self.stop_sound(id);
        }
    }

    pub(crate) fn set_sound_3d_attributes(
        &mut self,
        id: SoundId,
        position: [f32; 3],
        velocity: [f32; 3],
    ) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        sound.params.position = position;
        sound.params.velocity = velocity;
        if sound.positional {
            let conv = |v: [f32; 3]| Vec3::from_z_up(v[0], v[1], v[2]);
            self.set_voice_param(id, VoiceParam::Position(conv(position)));
            self.set_voice_param(id, VoiceParam::Velocity(conv(velocity)));
        }
    }

    pub(crate) fn set_sound_min_distance(&mut self, id: SoundId, distance: f32) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        sound.params.min_distance = distance;
        self.set_voice_param(
            id,
            VoiceParam::ReferenceDistance(distance * self.distance_factor),
        );
    }

    pub(crate) fn set_sound_max_distance(&mut self, id: SoundId, distance: f32) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        sound.params.max_distance = distance;
        self.set_voice_param(id, VoiceParam::MaxDistance(distance * self.distance_factor));
    }

    pub(crate) fn set_sound_drop_off(&mut self, id: SoundId, factor: f32) {
        let Some(sound) = self.sounds.get_mut(&id) else {
            return;
        };
        sound.params.drop_off = factor;
        self.set_voice_param(id, VoiceParam::Rolloff(factor * self.drop_off_factor));
    }

    fn set_volume(&mut self, volume: f32) {
        if self.volume == volume {
            return;
        }
        self.volume = volume;
        for id in self.sound_ids() {
            if let Some(v) = self.sounds.get(&id).map(|s| s.params.volume) {
                self.set_sound_volume(id, v);
            }
        }
    }

    fn set_active(&mut self, active: bool) {
        if self.active == active {
            return;
        }
        self.active = active;
        for id in self.sound_ids() {
            self.set_sound_active(id, active);
        }
    }

    fn set_play_rate(&mut self, rate: f32) {
        if self.play_rate == rate {
            return;
        }
        self.play_rate = rate;
        for id in self.sound_ids() {
            if let Some(r) = self.sounds.get(&id).map(|s| s.params.play_rate) {
                self.set_sound_play_rate(id, r);
            }
        }
    }

    fn set_concurrent_limit(&mut self, limit: usize) {
        self.concurrent_limit = limit;
        if limit > 0 {
            self.reduce_playing_to(limit);
        }
    }

    fn set_listener(&mut self, attributes: ListenerAttributes) {
        self.listener = attributes;
        if let Some(mixer) = &self.mixer {
            mixer.set_listener(attributes.to_listener());
        }
    }

    fn set_distance_factor(&mut self, factor: f32) {
        self.distance_factor = factor;
        self.apply_distance_model();
        for id in self.sound_ids() {
            let Some((min, max)) = self
                .sounds
                .get(&id)
                .map(|s| (s.params.min_distance, s.params.max_distance))
            else {
                continue;
            };
            self.set_sound_min_distance(id, min);
            self.set_sound_max_distance(id, max);
        }
    }

    fn set_doppler_factor(&mut self, factor: f32) {
        self.doppler_factor = factor;
        self.apply_distance_model();
    }

    fn set_drop_off_factor(&mut self, factor: f32) {
        self.drop_off_factor = factor;
        for id in self.sound_ids() {
            if let Some(f) = self.sounds.get(&id).map(|s| s.params.drop_off) {
                self.set_sound_drop_off(id, f);
            }
        }
    }

    fn uncache(&mut self, path: &Path) {
        if let Some(mixer) = &self.mixer {
            self.cache.uncache(mixer.as_ref(), path);
        }
    }

    fn clear_cache(&mut self) {
        if let Some(mixer) = &self.mixer {
            self.cache.clear(mixer.as_ref());
        }
    }

    fn set_cache_limit(&mut self, limit: usize) {
        match &self.mixer {
            Some(mixer) => self.cache.set_cache_limit(mixer.as_ref(), limit),
            None => tracing::debug!("cache limit ignored on an invalid manager"),
        }
    }

    fn stats(&self) -> ManagerStats {
        let underruns = self.mixer.as_ref().and(self.registry.underruns());
        ManagerStats {
            valid: self.valid,
            sounds: self.sounds.len(),
            playing: self.playing.len(),
            free_voices: self.registry.free_voices(),
            cached_samples: self.cache.resident_samples(),
            expiring_samples: self.cache.expiring_samples(),
            expiring_streams: self.cache.expiring_streams(),
            underrun_frames: underruns.map(|(frames, _)| frames),
            underrun_events: underruns.map(|(_, events)| events),
        }
    }
}

/// Audio manager backed by a [`MixerBackend`] from a [`DeviceRegistry`].
pub struct Manager {
    shared: Arc<ManagerShared>,
}

impl Manager {
    /// Manager resolving names against the filesystem, timed by the system clock.
    pub fn new(cfg: &EngineConfig, registry: Arc<DeviceRegistry>) -> Self {
        Self::with_parts(
            cfg,
            registry,
            Arc::new(FileLoader::new(cfg.search_path.clone())),
            Arc::new(SystemClock::new()),
        )
    }

    pub fn with_parts(
        cfg: &EngineConfig,
        registry: Arc<DeviceRegistry>,
        loader: Arc<dyn SourceLoader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cfg = cfg.clone().normalized();
        let shared = Arc::new_cyclic(|me| ManagerShared {
            state: Mutex::new(ManagerState::new(&cfg, registry.clone(), clock)),
            loader,
            me: me.clone(),
        });
        match registry.attach(&cfg, Arc::downgrade(&shared)) {
            Ok(mixer) => {
                shared.with_state(|st| st.open(mixer));
                tracing::info!(
                    cache_limit = cfg.cache_limit,
                    concurrent_limit = cfg.concurrent_sound_limit,
                    "audio manager ready"
                );
            }
            Err(e) => tracing::error!("audio manager disabled: {e}"),
        }
        Self { shared }
    }

    /// Concrete handle for `name`, or `None` when it cannot be loaded.
    pub fn load_sound(&self, name: &str, positional: bool, mode: SoundMode) -> Option<MixerSound> {
        if !self.is_valid() {
            return None;
        }
        match self.shared.loader.load(name) {
            Some(source) => self.load_sound_from_source(source, positional, mode),
            None => {
                tracing::error!(name, "could not find audio");
                None
            }
        }
    }

    pub fn load_sound_from_source(
        &self,
        source: Arc<dyn AudioSource>,
        positional: bool,
        mode: SoundMode,
    ) -> Option<MixerSound> {
        let id = self
            .shared
            .with_state(|st| st.create_sound(source, positional, mode))?;
        Some(MixerSound::new(id, self.shared.clone()))
    }
}

fn boxed_or_null(sound: Option<MixerSound>) -> Box<dyn AudioSound> {
    match sound {
        Some(sound) => Box::new(sound),
        None => Box::new(NullSound::new()),
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl AudioManager for Manager {
    fn get_sound(&self, name: &str, positional: bool, mode: SoundMode) -> Box<dyn AudioSound> {
        boxed_or_null(self.load_sound(name, positional, mode))
    }

    fn get_sound_from_source(
        &self,
        source: Arc<dyn AudioSource>,
        positional: bool,
        mode: SoundMode,
    ) -> Box<dyn AudioSound> {
        boxed_or_null(self.load_sound_from_source(source, positional, mode))
    }

    fn uncache_sound(&self, name: &str) {
        let Some(source) = self.shared.loader.load(name) else {
            return;
        };
        if let Some(path) = source.filename() {
            self.shared.with_state(|st| st.uncache(path));
        }
    }

    fn clear_cache(&self) {
        self.shared.with_state(ManagerState::clear_cache);
    }

    fn set_cache_limit(&self, limit: usize) {
        self.shared.with_state(|st| st.set_cache_limit(limit));
    }

    fn get_cache_limit(&self) -> usize {
        self.shared.with_state(|st| st.cache.cache_limit())
    }

    fn set_volume(&self, volume: f32) {
        self.shared.with_state(|st| st.set_volume(volume));
    }

    fn get_volume(&self) -> f32 {
        self.shared.with_state(|st| st.volume)
    }

    fn set_active(&self, active: bool) {
        self.shared.with_state(|st| st.set_active(active));
    }

    fn get_active(&self) -> bool {
        self.shared.with_state(|st| st.active)
    }

    fn set_play_rate(&self, rate: f32) {
        self.shared.with_state(|st| st.set_play_rate(rate));
    }

    fn get_play_rate(&self) -> f32 {
        self.shared.with_state(|st| st.play_rate)
    }

    fn set_concurrent_sound_limit(&self, limit: usize) {
        self.shared.with_state(|st| st.set_concurrent_limit(limit));
    }

    fn get_concurrent_sound_limit(&self) -> usize {
        self.shared.with_state(|st| st.concurrent_limit)
    }

    fn reduce_sounds_playing_to(&self, count: usize) {
        self.shared.with_state(|st| st.reduce_playing_to(count));
    }

    fn stop_all_sounds(&self) {
        self.shared.with_state(ManagerState::stop_all);
    }

    fn update(&self) {
        self.shared.with_state(ManagerState::update_playing);
    }

    fn shutdown(&self) {
        self.shared.shutdown();
    }

    fn is_valid(&self) -> bool {
        self.shared.with_state(|st| st.valid)
    }

    fn audio_3d_set_listener_attributes(&self, attributes: ListenerAttributes) {
        self.shared.with_state(|st| st.set_listener(attributes));
    }

    fn audio_3d_get_listener_attributes(&self) -> ListenerAttributes {
        self.shared.with_state(|st| st.listener)
    }

    fn audio_3d_set_distance_factor(&self, factor: f32) {
        self.shared.with_state(|st| st.set_distance_factor(factor));
    }

    fn audio_3d_get_distance_factor(&self) -> f32 {
        self.shared.with_state(|st| st.distance_factor)
    }

    fn audio_3d_set_doppler_factor(&self, factor: f32) {
        self.shared.with_state(|st| st.set_doppler_factor(factor));
    }

    fn audio_3d_get_doppler_factor(&self) -> f32 {
        self.shared.with_state(|st| st.doppler_factor)
    }

    fn audio_3d_set_drop_off_factor(&self, factor: f32) {
        self.shared.with_state(|st| st.set_drop_off_factor(factor));
    }

    fn audio_3d_get_drop_off_factor(&self) -> f32 {
        self.shared.with_state(|st| st.drop_off_factor)
    }

    fn stats(&self) -> ManagerStats {
        self.shared.with_state(|st| st.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryAudio;
    use crate::testing::{Rig, tone};
    use crossbeam_channel::unbounded;

    fn voice_of(rig: &Rig, sound: &dyn AudioSound) -> Option<crate::hal::VoiceId> {
        rig.manager
            .shared
            .with_state(|st| st.sound(sound.id()).and_then(|s| s.stream.voice))
    }

    #[test]
    fn concurrency_limit_evicts_oldest_first() {
        let rig = Rig::new(&[("a.wav", 1.0), ("b.wav", 1.0), ("c.wav", 1.0)]);
        rig.manager.set_concurrent_sound_limit(2);
        let a = rig.sound("a.wav");
        let b = rig.sound("b.wav");
        let c = rig.sound("c.wav");
        a.play();
        b.play();
        c.play();
        assert_eq!(a.status(), SoundStatus::Ready);
        assert_eq!(b.status(), SoundStatus::Playing);
        assert_eq!(c.status(), SoundStatus::Playing);
        assert_eq!(rig.manager.stats().playing, 2);
    }

    #[test]
    fn lowering_the_limit_stops_excess_sounds() {
        let rig = Rig::new(&[("a.wav", 1.0), ("b.wav", 1.0)]);
        let a = rig.sound("a.wav");
        let b = rig.sound("b.wav");
        a.play();
        b.play();
        rig.manager.set_concurrent_sound_limit(0);
        assert_eq!(rig.manager.stats().playing, 2);
        rig.manager.set_concurrent_sound_limit(1);
        assert_eq!(a.status(), SoundStatus::Ready);
        assert_eq!(b.status(), SoundStatus::Playing);
    }

    #[test]
    fn end_to_end_eviction_and_finish() {
        let rig = Rig::new(&[("a.wav", 0.5), ("b.wav", 0.5)]);
        rig.manager.set_concurrent_sound_limit(1);
        let s1 = rig.sound("a.wav");
        s1.set_loop_count(2);
        s1.play();
        let s2 = rig.sound("b.wav");
        let (tx, rx) = unbounded();
        s2.set_finished_event(Some(tx));
        s2.play();
        assert_eq!(s1.status(), SoundStatus::Ready);
        assert_eq!(s2.status(), SoundStatus::Playing);

        rig.run(2.0 * s2.length(), 0.05);
        assert_eq!(s2.status(), SoundStatus::Ready);
        let events: Vec<FinishedEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sound, s2.id());
        assert_eq!(events[0].name, "b.wav");
        assert_eq!(s2.get_time(), s2.length());
    }

    #[test]
    fn loop_count_drains_only_after_the_last_iteration() {
        let rig = Rig::new(&[("a.wav", 0.2)]);
        let s = rig.sound("a.wav");
        s.set_loop_count(3);
        assert_eq!(s.get_loop_count(), 3);
        s.play();
        rig.run(0.55, 0.05);
        assert_eq!(s.status(), SoundStatus::Playing);
        rig.run(0.1, 0.05);
        assert_eq!(s.status(), SoundStatus::Ready);
    }

    #[test]
    fn huge_loop_counts_mean_forever() {
        let rig = Rig::new(&[("a.wav", 0.2)]);
        let s = rig.sound("a.wav");
        s.set_loop_count(INFINITE_LOOPS + 5);
        assert_eq!(s.get_loop_count(), 0);
        assert!(s.get_loop());
        s.set_loop(false);
        assert_eq!(s.get_loop_count(), 1);
    }

    #[test]
    fn reported_time_never_steps_back_within_a_loop() {
        let rig = Rig::new(&[("a.wav", 0.5)]);
        let s = rig.sound("a.wav");
        s.set_loop_count(4);
        s.play();
        let length = s.length();
        let mut last = s.get_time();
        let mut wraps = 0;
        // The device consumes audio at 80% of wall-clock speed.
        for _ in 0..60 {
            rig.mixer.render_frames(40);
            rig.clock.advance(0.05);
            rig.manager.update();
            let t = s.get_time();
            if t < last - 1e-9 {
                // Only a loop boundary may move time back, from the end to the start.
                assert!(
                    last > length - 0.1 && t < 0.1,
                    "time went from {last} to {t} inside a loop"
                );
                wraps += 1;
            }
            last = t;
        }
        assert!(wraps >= 2, "expected loop wraps, saw {wraps}");
    }

    #[test]
    fn stopped_sound_freezes_its_time() {
        let rig = Rig::new(&[("a.wav", 2.0)]);
        let s = rig.sound("a.wav");
        s.play();
        rig.run(0.5, 0.05);
        s.stop();
        let frozen = s.get_time();
        assert!((frozen - 0.5).abs() < 0.05, "frozen at {frozen}");
        rig.clock.advance(1.0);
        assert_eq!(s.get_time(), frozen);
    }

    #[test]
    fn set_time_restarts_a_playing_sound_at_the_offset() {
        let rig = Rig::new(&[("a.wav", 2.0)]);
        let s = rig.sound("a.wav");
        s.play();
        rig.run(0.2, 0.05);
        s.set_time(1.5);
        assert_eq!(s.status(), SoundStatus::Playing);
        assert!((s.get_time() - 1.5).abs() < 1e-9);
        rig.run(0.6, 0.05);
        assert_eq!(s.status(), SoundStatus::Ready);
    }

    #[test]
    fn missing_and_malformed_sources_become_null_sounds() {
        let rig = Rig::new(&[]);
        let missing = rig.sound("nope.wav");
        assert_eq!(missing.id(), 0);
        assert_eq!(missing.status(), SoundStatus::Ready);

        let surround = Arc::new(MemoryAudio::new("six.wav", 1_000, 6, vec![0; 600]));
        let s = rig
            .manager
            .get_sound_from_source(surround, false, SoundMode::Sample);
        assert_eq!(s.id(), 0);
        assert_eq!(rig.manager.stats().sounds, 0);
    }

    #[test]
    fn failed_device_gives_invalid_manager_and_null_sounds() {
        let registry = DeviceRegistry::new(Box::new(|_: &EngineConfig| Err(anyhow::anyhow!("unplugged"))));
        let mgr = Manager::new(&EngineConfig::default(), registry.clone());
        assert!(!mgr.is_valid());
        let s = mgr.get_sound_from_source(tone("a.wav", 0.1), false, SoundMode::Sample);
        s.play();
        assert_eq!(s.status(), SoundStatus::Ready);
        assert_eq!(s.id(), 0);
        drop(mgr);
        assert_eq!(registry.active_managers(), 0);
    }

    #[test]
    fn corrupted_queue_tears_the_sound_down() {
        let rig = Rig::new(&[("a.wav", 0.1)]);
        let s = rig.sound("a.wav");
        s.play();
        assert!(voice_of(&rig, s.as_ref()).is_some());
        // Forget which buffer was queued so the drained one looks foreign.
        rig.manager.shared.with_state(|st| {
            if let Some(sound) = st.sound_mut(s.id()) {
                sound.stream.queue[0].buffer = crate::hal::BufferId(u32::MAX);
            }
        });

        rig.run(0.2, 0.05);
        assert_eq!(s.status(), SoundStatus::NotReady);
        s.play();
        assert_eq!(s.status(), SoundStatus::NotReady);
    }

    #[test]
    fn voice_exhaustion_evicts_the_oldest_sound() {
        let rig = Rig::with_voices(&[("a.wav", 1.0), ("b.wav", 1.0)], 1);
        let a = rig.sound("a.wav");
        let b = rig.sound("b.wav");
        a.play();
        b.play();
        assert_eq!(a.status(), SoundStatus::Ready);
        assert_eq!(b.status(), SoundStatus::Playing);
        assert_eq!(rig.mixer.voice_count(), 1);
    }

    #[test]
    fn deactivation_pauses_loops_and_stops_one_shots() {
        let rig = Rig::new(&[("loop.wav", 0.5), ("once.wav", 0.5)]);
        let looped = rig.sound("loop.wav");
        let once = rig.sound("once.wav");
        looped.set_loop(true);
        looped.play();
        once.play();

        rig.manager.set_active(false);
        assert_eq!(looped.status(), SoundStatus::Ready);
        assert_eq!(once.status(), SoundStatus::Ready);
        assert!(!looped.get_active());

        // Playing while inactive only remembers the request for loops.
        once.play();
        assert_eq!(once.status(), SoundStatus::Ready);

        rig.manager.set_active(true);
        assert_eq!(looped.status(), SoundStatus::Playing);
        assert_eq!(once.status(), SoundStatus::Ready);
    }

    #[test]
    fn dropped_handles_reap_after_playback() {
        let rig = Rig::new(&[("a.wav", 0.2), ("b.wav", 0.2)]);
        let a = rig
            .manager
            .load_sound("a.wav", false, SoundMode::Heuristic)
            .unwrap();
        a.play();
        let copy = a.clone();
        drop(a);
        assert_eq!(rig.manager.stats().sounds, 1);
        drop(copy);
        // Still playing, so it survives its last handle.
        assert_eq!(rig.manager.stats().sounds, 1);
        rig.run(0.3, 0.05);
        assert_eq!(rig.manager.stats().sounds, 0);

        let b = rig.sound("b.wav");
        assert_eq!(rig.manager.stats().sounds, 1);
        drop(b);
        assert_eq!(rig.manager.stats().sounds, 0);
    }

    #[test]
    fn sounds_share_resident_samples_and_uncache_frees_them() {
        let rig = Rig::new(&[("a.wav", 0.2)]);
        let first = rig.sound("a.wav");
        let second = rig.sound("a.wav");
        assert_ne!(first.id(), second.id());
        first.play();
        second.play();
        assert_eq!(rig.manager.stats().cached_samples, 1);
        assert_eq!(rig.mixer.buffer_count(), 1);

        drop(first);
        drop(second);
        rig.run(0.3, 0.05);
        assert_eq!(rig.manager.stats().expiring_samples, 1);
        rig.manager.uncache_sound("a.wav");
        assert_eq!(rig.manager.stats().cached_samples, 0);
        assert_eq!(rig.mixer.buffer_count(), 0);
    }

    #[test]
    fn streamed_sounds_release_their_cursor_when_stopped() {
        let rig = Rig::new(&[("a.wav", 1.0)]);
        let s = rig
            .manager
            .get_sound("a.wav", false, SoundMode::Stream);
        assert_eq!(rig.manager.stats().expiring_streams, 1);
        s.play();
        assert_eq!(rig.manager.stats().expiring_streams, 0);
        s.stop();
        assert_eq!(rig.manager.stats().expiring_streams, 1);
        s.play();
        rig.run(1.1, 0.05);
        assert_eq!(s.status(), SoundStatus::Ready);
    }

    #[test]
    fn shutdown_is_idempotent_and_invalidates_sounds() {
        let rig = Rig::new(&[("a.wav", 1.0)]);
        let s = rig.sound("a.wav");
        s.play();
        rig.manager.shutdown();
        rig.manager.shutdown();
        assert!(!rig.manager.is_valid());
        assert_eq!(s.status(), SoundStatus::NotReady);
        assert_eq!(rig.registry.active_managers(), 0);
        assert!(!rig.registry.is_open());
        assert_eq!(rig.mixer.buffer_count(), 0);
        s.play();
        assert_eq!(s.status(), SoundStatus::NotReady);
    }

    #[test]
    fn managers_share_one_device_and_voice_list() {
        let rig = Rig::new(&[("a.wav", 0.1)]);
        let other = rig.second_manager();
        assert_eq!(rig.registry.active_managers(), 2);

        let s = rig.sound("a.wav");
        s.play();
        s.stop();
        assert_eq!(rig.registry.free_voices(), 1);
        let t = other.get_sound("a.wav", false, SoundMode::Sample);
        t.play();
        assert_eq!(rig.registry.free_voices(), 0);
        assert_eq!(rig.mixer.voice_count(), 1);

        drop(t);
        drop(other);
        assert!(rig.registry.is_open());
        rig.registry.shutdown();
        assert!(!rig.registry.is_open());
        assert!(!rig.manager.is_valid());
    }

    #[test]
    fn manager_volume_composes_with_sound_volume() {
        let rig = Rig::new(&[("a.wav", 1.0)]);
        let s = rig.sound("a.wav");
        s.set_volume(0.5);
        rig.manager.set_volume(0.5);
        assert_eq!(s.get_volume(), 0.5);
        assert_eq!(rig.manager.get_volume(), 0.5);
        s.play();
        let out = rig.mixer.render_frames(10);
        let peak = out.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        // The tone peaks at a quarter of full scale before both gains.
        assert!(peak > 0.05 && peak < 0.07, "peak {peak}");
    }

    #[test]
    fn settings_round_trip() {
        let rig = Rig::new(&[("dir/a.wav", 1.0)]);
        let s = rig.sound("dir/a.wav");
        assert_eq!(s.get_name(), "a.wav");
        s.set_balance(-0.25);
        s.set_play_rate(2.0);
        s.set_3d_attributes([1.0, 2.0, 3.0], [0.0, 1.0, 0.0]);
        s.set_3d_min_distance(4.0);
        s.set_3d_max_distance(40.0);
        s.set_3d_drop_off_factor(0.5);
        assert_eq!(s.get_balance(), -0.25);
        assert_eq!(s.get_play_rate(), 2.0);
        assert_eq!(s.get_3d_attributes(), ([1.0, 2.0, 3.0], [0.0, 1.0, 0.0]));
        assert_eq!(s.get_3d_min_distance(), 4.0);
        assert_eq!(s.get_3d_max_distance(), 40.0);
        assert_eq!(s.get_3d_drop_off_factor(), 0.5);

        rig.manager.audio_3d_set_distance_factor(3.28);
        rig.manager.audio_3d_set_doppler_factor(0.5);
        rig.manager.audio_3d_set_drop_off_factor(2.0);
        assert_eq!(rig.manager.audio_3d_get_distance_factor(), 3.28);
        assert_eq!(rig.manager.audio_3d_get_doppler_factor(), 0.5);
        assert_eq!(rig.manager.audio_3d_get_drop_off_factor(), 2.0);
        assert_eq!(s.get_3d_min_distance(), 4.0);

        let pose = ListenerAttributes {
            position: [1.0, 0.0, 0.0],
            ..ListenerAttributes::default()
        };
        rig.manager.audio_3d_set_listener_attributes(pose);
        assert_eq!(rig.manager.audio_3d_get_listener_attributes(), pose);
    }

    #[test]
    fn play_rate_scales_how_fast_sounds_finish() {
        let rig = Rig::new(&[("a.wav", 1.0)]);
        let s = rig.sound("a.wav");
        s.set_play_rate(2.0);
        s.play();
        rig.run(0.6, 0.05);
        assert_eq!(s.status(), SoundStatus::Ready);
    }
}
