//! Software implementation of [`MixerBackend`].
//!
//! Buffers are stored as interleaved `f32` at the output rate (converted once
//! in `buffer_data`). `render` mixes every playing voice into an interleaved
//! stereo block; it is called from the output callback, or by hand when the
//! mixer runs headless.
//!
//! Voice semantics follow the usual buffer-queue model:
//! - a voice walks its queue front to back, counting fully consumed buffers
//!   as "processed" until the owner unqueues them
//! - running out of queued audio stops the voice (an underrun)
//! - `stop` marks the whole queue processed

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{AudioError, AudioResult};
use crate::hal::{BufferId, Listener, MixerBackend, Vec3, VoiceId, VoiceParam};
use crate::resample::resample_interleaved;

/// Output layout produced by [`SoftwareMixer::render`].
pub const MIX_CHANNELS: usize = 2;

pub struct SoftwareMixer {
    output_rate: u32,
    max_voices: usize,
    state: Mutex<MixerState>,
}

#[derive(Default)]
struct PcmBuffer {
    samples: Vec<f32>,
    channels: u16,
    frames: usize,
}

impl PcmBuffer {
    fn frame(&self, idx: usize) -> (f32, f32) {
        let idx = idx.min(self.frames.saturating_sub(1));
        match self.channels {
            1 => {
                let s = self.samples[idx];
                (s, s)
            }
            _ => {
                let base = idx * self.channels as usize;
                (self.samples[base], self.samples[base + 1])
            }
        }
    }

    /// Linearly interpolated frame at a fractional position.
    fn frame_at(&self, pos: f64) -> (f32, f32) {
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let (l0, r0) = self.frame(idx);
        if frac <= 0.0 || idx + 1 >= self.frames {
            return (l0, r0);
        }
        let (l1, r1) = self.frame(idx + 1);
        (l0 + (l1 - l0) * frac, r0 + (r1 - r0) * frac)
    }
}

struct VoiceState {
    queue: VecDeque<BufferId>,
    processed: usize,
    /// Read position in frames inside `queue[processed]`.
    frame_pos: f64,
    playing: bool,
    gain: f32,
    pitch: f32,
    pan: f32,
    position: Vec3,
    velocity: Vec3,
    reference_distance: f32,
    max_distance: f32,
    rolloff: f32,
    relative: bool,
}

impl Default for VoiceState {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            processed: 0,
            frame_pos: 0.0,
            playing: false,
            gain: 1.0,
            pitch: 1.0,
            pan: 0.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            reference_distance: 1.0,
            max_distance: f32::MAX,
            rolloff: 1.0,
            relative: false,
        }
    }
}

impl VoiceState {
    fn is_spatial(&self, channels: u16) -> bool {
        !self.relative && channels == 1
    }

    /// Left/right gains for the current buffer layout.
    fn gains(&self, listener: &Listener, channels: u16) -> (f32, f32) {
        if !self.is_spatial(channels) {
            return balance(self.gain, self.pan);
        }

        let offset = self.position.sub(listener.position);
        let distance = offset
            .length()
            .clamp(self.reference_distance, self.max_distance.max(self.reference_distance));
        let denom = self.reference_distance + self.rolloff * (distance - self.reference_distance);
        let attenuation = if denom > f32::EPSILON {
            (self.reference_distance / denom).min(1.0)
        } else {
            1.0
        };

        let side = match (offset.normalized(), listener.forward.cross(listener.up).normalized()) {
            (Some(dir), Some(right)) => dir.dot(right),
            _ => 0.0,
        };
        balance(self.gain * attenuation, side)
    }

    /// Pitch multiplier from relative listener/voice motion.
    fn doppler_shift(&self, listener: &Listener, factor: f32, speed_of_sound: f32) -> f32 {
        if self.relative || factor <= 0.0 || speed_of_sound <= 0.0 {
            return 1.0;
        }
        let Some(dir) = self.position.sub(listener.position).normalized() else {
            return 1.0;
        };
        let limit = speed_of_sound / factor;
        let vls = listener.velocity.dot(dir).min(limit);
        let vss = self.velocity.dot(dir).min(limit);
        let denom = speed_of_sound - factor * vss;
        if denom <= f32::EPSILON {
            return 1.0;
        }
        ((speed_of_sound - factor * vls) / denom).clamp(0.1, 10.0)
    }
}

fn balance(gain: f32, pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    (gain * (1.0 - pan).min(1.0), gain * (1.0 + pan).min(1.0))
}

struct MixerState {
    next_buffer: u32,
    next_voice: u32,
    buffers: HashMap<BufferId, Arc<PcmBuffer>>,
    voices: HashMap<VoiceId, VoiceState>,
    listener: Listener,
    doppler_factor: f32,
    speed_of_sound: f32,
}

impl MixerState {
    fn voice(&mut self, voice: VoiceId) -> AudioResult<&mut VoiceState> {
        self.voices
            .get_mut(&voice)
            .ok_or_else(|| AudioError::InvalidOperation(format!("unknown voice {}", voice.0)))
    }
}

impl SoftwareMixer {
    pub fn new(output_rate: u32, max_voices: usize) -> Self {
        Self {
            output_rate,
            max_voices: max_voices.max(1),
            state: Mutex::new(MixerState {
                next_buffer: 1,
                next_voice: 1,
                buffers: HashMap::new(),
                voices: HashMap::new(),
                listener: Listener::default(),
                doppler_factor: 1.0,
                speed_of_sound: 343.3,
            }),
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live buffer objects, including ones not queued anywhere.
    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    /// Allocated voices, playing or not.
    pub fn voice_count(&self) -> usize {
        self.lock().voices.len()
    }

    pub fn playing_voices(&self) -> usize {
        self.lock().voices.values().filter(|v| v.playing).count()
    }

    /// Mix `frames` frames and return them as interleaved stereo.
    pub fn render_frames(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * MIX_CHANNELS];
        self.render(&mut out);
        out
    }

    /// Mix all playing voices into `out` (interleaved stereo, overwritten).
    pub fn render(&self, out: &mut [f32]) -> RenderReport {
        out.fill(0.0);
        let mut report = RenderReport::default();
        let mut st = self.lock();
        let MixerState {
            voices,
            buffers,
            listener,
            doppler_factor,
            speed_of_sound,
            ..
        } = &mut *st;

        for voice in voices.values_mut().filter(|v| v.playing) {
            let channels = voice
                .queue
                .get(voice.processed)
                .and_then(|id| buffers.get(id))
                .map(|b| b.channels)
                .unwrap_or(1);
            let (left, right) = voice.gains(listener, channels);
            let doppler = if voice.is_spatial(channels) {
                voice.doppler_shift(listener, *doppler_factor, *speed_of_sound)
            } else {
                1.0
            };
            let step = (voice.pitch.max(0.0) * doppler) as f64;
            if let Some(missed) = mix_voice(voice, buffers, out, left, right, step) {
                report.underruns += 1;
                report.starved_frames += missed;
            }
        }
        report
    }
}

/// What happened during one `render` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderReport {
    /// Voices that ran out of queued audio.
    pub underruns: usize,
    /// Frames those voices could not fill.
    pub starved_frames: usize,
}

fn mix_voice(
    voice: &mut VoiceState,
    buffers: &HashMap<BufferId, Arc<PcmBuffer>>,
    out: &mut [f32],
    left: f32,
    right: f32,
    step: f64,
) -> Option<usize> {
    let empty = PcmBuffer::default();
    let total = out.len() / MIX_CHANNELS;
    for (done, frame) in out.chunks_exact_mut(MIX_CHANNELS).enumerate() {
        let buffer = loop {
            let Some(id) = voice.queue.get(voice.processed) else {
                voice.playing = false;
                voice.frame_pos = 0.0;
                return Some(total - done);
            };
            let buffer = buffers.get(id).map(|b| b.as_ref()).unwrap_or(&empty);
            if voice.frame_pos < buffer.frames as f64 {
                break buffer;
            }
            voice.frame_pos -= buffer.frames as f64;
            voice.processed += 1;
        };

        let (l, r) = buffer.frame_at(voice.frame_pos);
        frame[0] += l * left;
        frame[1] += r * right;
        voice.frame_pos += step;
    }
    None
}

impl MixerBackend for SoftwareMixer {
    fn gen_buffer(&self) -> AudioResult<BufferId> {
        let mut st = self.lock();
        let id = BufferId(st.next_buffer);
        st.next_buffer = st.next_buffer.wrapping_add(1).max(1);
        st.buffers.insert(id, Arc::new(PcmBuffer::default()));
        Ok(id)
    }

    fn buffer_data(
        &self,
        buffer: BufferId,
        pcm: &[i16],
        channels: u16,
        rate: u32,
    ) -> AudioResult<()> {
        if channels != 1 && channels != 2 {
            return Err(AudioError::Format { channels });
        }
        let floats: Vec<f32> = pcm.iter().map(|&s| s as f32 / 32_768.0).collect();
        let samples = resample_interleaved(&floats, channels as usize, rate, self.output_rate)?;
        let frames = samples.len() / channels as usize;

        let mut st = self.lock();
        let slot = st
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| AudioError::InvalidOperation(format!("unknown buffer {}", buffer.0)))?;
        *slot = Arc::new(PcmBuffer {
            samples,
            channels,
            frames,
        });
        Ok(())
    }

    fn delete_buffer(&self, buffer: BufferId) -> AudioResult<()> {
        let mut st = self.lock();
        if st.voices.values().any(|v| v.queue.contains(&buffer)) {
            return Err(AudioError::BufferBusy(buffer.0));
        }
        st.buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or_else(|| AudioError::InvalidOperation(format!("unknown buffer {}", buffer.0)))
    }

    fn gen_voice(&self) -> AudioResult<VoiceId> {
        let mut st = self.lock();
        if st.voices.len() >= self.max_voices {
            return Err(AudioError::Allocation("voices"));
        }
        let id = VoiceId(st.next_voice);
        st.next_voice = st.next_voice.wrapping_add(1).max(1);
        st.voices.insert(id, VoiceState::default());
        Ok(id)
    }

    fn delete_voice(&self, voice: VoiceId) -> AudioResult<()> {
        self.lock()
            .voices
            .remove(&voice)
            .map(|_| ())
            .ok_or_else(|| AudioError::InvalidOperation(format!("unknown voice {}", voice.0)))
    }

    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> AudioResult<()> {
        let mut st = self.lock();
        if let Some(missing) = buffers.iter().find(|b| !st.buffers.contains_key(b)) {
            return Err(AudioError::InvalidOperation(format!(
                "unknown buffer {}",
                missing.0
            )));
        }
        st.voice(voice)?.queue.extend(buffers.iter().copied());
        Ok(())
    }

    fn buffers_processed(&self, voice: VoiceId) -> AudioResult<usize> {
        Ok(self.lock().voice(voice)?.processed)
    }

    fn unqueue_buffer(&self, voice: VoiceId) -> AudioResult<BufferId> {
        let mut st = self.lock();
        let v = st.voice(voice)?;
        if v.processed == 0 {
            return Err(AudioError::InvalidOperation(format!(
                "voice {} has no processed buffers",
                voice.0
            )));
        }
        v.processed -= 1;
        v.queue
            .pop_front()
            .ok_or_else(|| AudioError::InvalidOperation(format!("voice {} queue empty", voice.0)))
    }

    fn detach_buffers(&self, voice: VoiceId) -> AudioResult<()> {
        let mut st = self.lock();
        let v = st.voice(voice)?;
        v.playing = false;
        v.queue.clear();
        v.processed = 0;
        v.frame_pos = 0.0;
        Ok(())
    }

    fn play(&self, voice: VoiceId) -> AudioResult<()> {
        let mut st = self.lock();
        let v = st.voice(voice)?;
        v.playing = v.processed < v.queue.len();
        Ok(())
    }

    fn stop(&self, voice: VoiceId) -> AudioResult<()> {
        let mut st = self.lock();
        let v = st.voice(voice)?;
        v.playing = false;
        v.processed = v.queue.len();
        v.frame_pos = 0.0;
        Ok(())
    }

    fn is_playing(&self, voice: VoiceId) -> AudioResult<bool> {
        Ok(self.lock().voice(voice)?.playing)
    }

    fn set_sec_offset(&self, voice: VoiceId, seconds: f64) -> AudioResult<()> {
        let rate = self.output_rate as f64;
        let mut st = self.lock();
        let v = st.voice(voice)?;
        v.frame_pos = seconds.max(0.0) * rate;
        Ok(())
    }

    fn set_voice_param(&self, voice: VoiceId, param: VoiceParam) -> AudioResult<()> {
        let mut st = self.lock();
        let v = st.voice(voice)?;
        match param {
            VoiceParam::Gain(g) => v.gain = g.max(0.0),
            VoiceParam::Pitch(p) => v.pitch = p.max(0.0),
            VoiceParam::Pan(p) => v.pan = p.clamp(-1.0, 1.0),
            VoiceParam::Position(p) => v.position = p,
            VoiceParam::Velocity(vel) => v.velocity = vel,
            VoiceParam::ReferenceDistance(d) => v.reference_distance = d.max(0.0),
            VoiceParam::MaxDistance(d) => v.max_distance = d.max(0.0),
            VoiceParam::Rolloff(r) => v.rolloff = r.max(0.0),
            VoiceParam::Relative(rel) => v.relative = rel,
        }
        Ok(())
    }

    fn set_listener(&self, listener: Listener) {
        self.lock().listener = listener;
    }

    fn set_doppler_factor(&self, factor: f32) {
        self.lock().doppler_factor = factor.max(0.0);
    }

    fn set_speed_of_sound(&self, speed: f32) {
        if speed > 0.0 {
            self.lock().speed_of_sound = speed;
        }
    }
}
