//! Hardware mixing interface.
//!
//! Modeled on a buffer-queue mixing API: PCM lives in buffer objects, voices
//! play queues of buffers, and the caller polls how many queued buffers a
//! voice has fully consumed. Positions use the mixer's right-handed, Y-up
//! coordinate space; see [`Vec3::from_z_up`].

use std::thread;
use std::time::Duration;

use crate::error::{AudioError, AudioResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u32);

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Convert from the caller's Z-up space (Y into the screen) into mixer space.
    pub fn from_z_up(x: f32, y: f32, z: f32) -> Self {
        Self::new(x, z, -y)
    }

    /// Inverse of [`Vec3::from_z_up`], returned as `(x, y, z)`.
    pub fn to_z_up(self) -> (f32, f32, f32) {
        (self.x, -self.z, self.y)
    }

    pub fn dot(self, other: Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn sub(self, other: Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    pub fn normalized(self) -> Option<Vec3> {
        let len = self.length();
        if len > f32::EPSILON {
            Some(Vec3::new(self.x / len, self.y / len, self.z / len))
        } else {
            None
        }
    }
}

/// Listener pose in mixer space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Listener {
    pub position: Vec3,
    pub velocity: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            forward: Vec3::new(0.0, 0.0, -1.0),
            up: Vec3::new(0.0, 1.0, 0.0),
        }
    }
}

/// Per-voice parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VoiceParam {
    Gain(f32),
    Pitch(f32),
    /// Stereo balance for non-positional voices, -1 (left) to 1 (right).
    Pan(f32),
    Position(Vec3),
    Velocity(Vec3),
    ReferenceDistance(f32),
    MaxDistance(f32),
    Rolloff(f32),
    /// Position is relative to the listener (non-positional sounds sit at the origin).
    Relative(bool),
}

/// The capability set the engine needs from a mixing device.
pub trait MixerBackend: Send + Sync {
    fn gen_buffer(&self) -> AudioResult<BufferId>;
    /// Fill a buffer with interleaved 16-bit PCM.
    fn buffer_data(&self, buffer: BufferId, pcm: &[i16], channels: u16, rate: u32)
    -> AudioResult<()>;
    /// Fails with [`AudioError::BufferBusy`] while a voice still holds the buffer.
    fn delete_buffer(&self, buffer: BufferId) -> AudioResult<()>;

    fn gen_voice(&self) -> AudioResult<VoiceId>;
    fn delete_voice(&self, voice: VoiceId) -> AudioResult<()>;

    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> AudioResult<()>;
    /// Queued buffers the voice has fully consumed.
    fn buffers_processed(&self, voice: VoiceId) -> AudioResult<usize>;
    /// Remove the oldest processed buffer from the voice's queue.
    fn unqueue_buffer(&self, voice: VoiceId) -> AudioResult<BufferId>;
    /// Stop the voice and release every queued buffer.
    fn detach_buffers(&self, voice: VoiceId) -> AudioResult<()>;

    fn play(&self, voice: VoiceId) -> AudioResult<()>;
    fn stop(&self, voice: VoiceId) -> AudioResult<()>;
    fn is_playing(&self, voice: VoiceId) -> AudioResult<bool>;
    /// Move the read position inside the first unprocessed buffer.
    fn set_sec_offset(&self, voice: VoiceId, seconds: f64) -> AudioResult<()>;
    fn set_voice_param(&self, voice: VoiceId, param: VoiceParam) -> AudioResult<()>;

    fn set_listener(&self, listener: Listener);
    fn set_doppler_factor(&self, factor: f32);
    fn set_speed_of_sound(&self, speed: f32);
}

/// How hard to try when a buffer is still held by a voice.
#[derive(Clone, Copy, Debug)]
pub struct DeleteRetry {
    pub retries: u32,
    pub delay: Duration,
}

impl DeleteRetry {
    pub fn from_config(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            retries: cfg.buffer_delete_retries,
            delay: Duration::from_millis(cfg.buffer_delete_delay_ms),
        }
    }

    pub fn delete(&self, mixer: &dyn MixerBackend, buffer: BufferId) {
        delete_buffer_with_retry(mixer, buffer, self.retries, self.delay);
    }
}

impl Default for DeleteRetry {
    fn default() -> Self {
        Self::from_config(&crate::config::EngineConfig::default())
    }
}

/// Delete a buffer, retrying with exponential back-off while the mixer reports it busy.
pub fn delete_buffer_with_retry(
    mixer: &dyn MixerBackend,
    buffer: BufferId,
    retries: u32,
    delay: Duration,
) {
    let mut tries = 0;
    loop {
        match mixer.delete_buffer(buffer) {
            Ok(()) => return,
            Err(AudioError::BufferBusy(_)) if tries < retries => {
                thread::sleep(delay * (1 << tries));
                tries += 1;
            }
            Err(e) => {
                tracing::error!(buffer = buffer.0, "failed to delete a buffer: {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_up_conversion_round_trips() {
        let v = Vec3::from_z_up(1.0, 2.0, 3.0);
        assert_eq!(v, Vec3::new(1.0, 3.0, -2.0));
        assert_eq!(v.to_z_up(), (1.0, 2.0, 3.0));
    }

    #[test]
    fn cross_product_of_default_listener_points_right() {
        let l = Listener::default();
        let right = l.forward.cross(l.up);
        assert_eq!(right, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn normalizing_zero_vector_is_none() {
        assert!(Vec3::ZERO.normalized().is_none());
        let n = Vec3::new(3.0, 0.0, 4.0).normalized().unwrap();
        assert!((n.length() - 1.0).abs() < 1e-6);
    }
}
