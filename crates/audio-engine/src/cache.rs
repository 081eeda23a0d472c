//! Reference-counted sound data cache.
//!
//! Each entry is either a resident sample (decoded once into a single mixer
//! buffer and shared by every sound playing it) or an open stream (owned by
//! one sound at a time). Entries whose reference count drops to zero are not
//! freed right away; they move to an expiration queue and are evicted oldest
//! release first once the queue is over its limit.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use audio_engine_types::SoundMode;

use crate::cursor::{AudioCursor, AudioSource, FULLY_BUFFERED};
use crate::error::{AudioError, AudioResult};
use crate::hal::{BufferId, DeleteRetry, MixerBackend};

/// Unreferenced open streams kept for reuse.
pub const STREAM_EXPIRY_LIMIT: usize = 5;

/// Sources longer than this always stream.
pub const MAX_SAMPLE_SECONDS: f64 = 3600.0;

/// Frames per read while decoding a whole sample.
const DECODE_CHUNK_FRAMES: usize = 65_536;

pub type DataId = u64;

/// Audio held by an entry.
pub enum DataBody {
    /// Fully decoded into one shared mixer buffer.
    Sample(BufferId),
    /// Live cursor owned by the sound currently using the entry.
    Stream(Box<dyn AudioCursor>),
}

pub struct SoundData {
    pub source: Arc<dyn AudioSource>,
    pub filename: Option<PathBuf>,
    pub rate: u32,
    pub channels: u16,
    pub length: f64,
    pub body: DataBody,
    refs: usize,
}

impl SoundData {
    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn sample(&self) -> Option<BufferId> {
        match self.body {
            DataBody::Sample(buffer) => Some(buffer),
            DataBody::Stream(_) => None,
        }
    }

    pub fn is_sample(&self) -> bool {
        self.sample().is_some()
    }

    pub fn cursor_mut(&mut self) -> Option<&mut (dyn AudioCursor + 'static)> {
        match &mut self.body {
            DataBody::Stream(cursor) => Some(cursor.as_mut()),
            DataBody::Sample(_) => None,
        }
    }
}

/// Whether a freshly opened source should be decoded into a resident sample.
pub fn wants_sample(
    mode: SoundMode,
    has_filename: bool,
    cursor: &dyn AudioCursor,
    preload_threshold: usize,
) -> bool {
    if mode == SoundMode::Stream || !has_filename {
        return false;
    }
    if cursor.ready() != FULLY_BUFFERED || !cursor.can_seek() {
        return false;
    }
    let length = cursor.length();
    if length > MAX_SAMPLE_SECONDS {
        return false;
    }
    if mode == SoundMode::Heuristic {
        // Without a duration the decoded size cannot be bounded.
        if !length.is_finite() || length <= 0.0 {
            return false;
        }
        let bytes = length * cursor.audio_rate() as f64 * cursor.audio_channels() as f64 * 2.0;
        if bytes > preload_threshold as f64 {
            return false;
        }
    }
    true
}

pub struct SoundCache {
    next_id: DataId,
    entries: HashMap<DataId, SoundData>,
    samples: HashMap<PathBuf, DataId>,
    expiring_samples: VecDeque<DataId>,
    expiring_streams: VecDeque<DataId>,
    cache_limit: usize,
    retry: DeleteRetry,
}

impl SoundCache {
    pub fn new(cache_limit: usize, retry: DeleteRetry) -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
            samples: HashMap::new(),
            expiring_samples: VecDeque::new(),
            expiring_streams: VecDeque::new(),
            cache_limit,
            retry,
        }
    }

    pub fn get(&self, id: DataId) -> Option<&SoundData> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: DataId) -> Option<&mut SoundData> {
        self.entries.get_mut(&id)
    }

    /// Find or create the data for `source` and take a reference on it.
    pub fn acquire(
        &mut self,
        mixer: &dyn MixerBackend,
        source: Arc<dyn AudioSource>,
        mode: SoundMode,
        preload_threshold: usize,
    ) -> AudioResult<DataId> {
        let filename = source.filename().map(Path::to_path_buf);

        if let Some(path) = &filename {
            if mode != SoundMode::Stream {
                if let Some(&id) = self.samples.get(path) {
                    self.increment(id);
                    return Ok(id);
                }
            }
            if mode != SoundMode::Sample {
                let hit = self
                    .expiring_streams
                    .iter()
                    .copied()
                    .find(|id| self.entries[id].filename.as_ref() == Some(path));
                if let Some(id) = hit {
                    tracing::debug!(path = %path.display(), "reusing expiring stream");
                    self.increment(id);
                    return Ok(id);
                }
            }
        }

        let mut cursor = source.open()?;
        let channels = cursor.audio_channels();
        if channels != 1 && channels != 2 {
            return Err(AudioError::Format { channels });
        }
        let rate = cursor.audio_rate();
        let mut length = cursor.length();

        let body = if wants_sample(mode, filename.is_some(), cursor.as_ref(), preload_threshold) {
            let (buffer, frames) = decode_sample(mixer, &self.retry, cursor.as_mut())?;
            if rate > 0 {
                length = frames as f64 / rate as f64;
            }
            DataBody::Sample(buffer)
        } else {
            DataBody::Stream(cursor)
        };

        let id = self.next_id;
        self.next_id += 1;
        if let (DataBody::Sample(_), Some(path)) = (&body, &filename) {
            self.samples.insert(path.clone(), id);
        }
        tracing::debug!(
            name = %source.name(),
            sample = matches!(body, DataBody::Sample(_)),
            channels,
            rate_hz = rate,
            length_secs = length,
            "loaded sound data"
        );
        self.entries.insert(
            id,
            SoundData {
                source,
                filename,
                rate,
                channels,
                length,
                body,
                refs: 1,
            },
        );
        Ok(id)
    }

    fn increment(&mut self, id: DataId) {
        let Some(data) = self.entries.get_mut(&id) else {
            return;
        };
        data.refs += 1;
        if data.refs == 1 {
            let queue = if data.is_sample() {
                &mut self.expiring_samples
            } else {
                &mut self.expiring_streams
            };
            queue.retain(|&queued| queued != id);
        }
    }

    /// Drop a reference; unreferenced data waits on its expiration queue.
    pub fn release(&mut self, mixer: &dyn MixerBackend, id: DataId) {
        let Some(data) = self.entries.get_mut(&id) else {
            return;
        };
        if data.refs == 0 {
            tracing::warn!(data = id, "sound data released more often than acquired");
            return;
        }
        data.refs -= 1;
        if data.refs == 0 {
            if data.is_sample() {
                self.expiring_samples.push_back(id);
            } else {
                self.expiring_streams.push_back(id);
            }
            self.discard_excess(mixer);
        }
    }

    fn discard_excess(&mut self, mixer: &dyn MixerBackend) {
        while self.expiring_samples.len() > self.cache_limit {
            if let Some(id) = self.expiring_samples.pop_front() {
                self.delete_entry(mixer, id);
            }
        }
        while self.expiring_streams.len() > STREAM_EXPIRY_LIMIT {
            if let Some(id) = self.expiring_streams.pop_front() {
                self.delete_entry(mixer, id);
            }
        }
    }

    fn delete_entry(&mut self, mixer: &dyn MixerBackend, id: DataId) {
        let Some(data) = self.entries.remove(&id) else {
            return;
        };
        tracing::debug!(name = %data.source.name(), "evicting sound data");
        if let Some(path) = &data.filename {
            if self.samples.get(path) == Some(&id) {
                self.samples.remove(path);
            }
        }
        if let DataBody::Sample(buffer) = data.body {
            self.retry.delete(mixer, buffer);
        }
    }

    pub fn cache_limit(&self) -> usize {
        self.cache_limit
    }

    pub fn set_cache_limit(&mut self, mixer: &dyn MixerBackend, limit: usize) {
        self.cache_limit = limit;
        self.discard_excess(mixer);
    }

    /// Evict every unreferenced sample.
    pub fn clear(&mut self, mixer: &dyn MixerBackend) {
        while let Some(id) = self.expiring_samples.pop_front() {
            self.delete_entry(mixer, id);
        }
    }

    /// Forget unreferenced entries loaded from `path`.
    pub fn uncache(&mut self, mixer: &dyn MixerBackend, path: &Path) {
        let stale: Vec<DataId> = self
            .expiring_samples
            .iter()
            .chain(self.expiring_streams.iter())
            .copied()
            .filter(|id| self.entries[id].filename.as_deref() == Some(path))
            .collect();
        for id in stale {
            self.expiring_samples.retain(|&q| q != id);
            self.expiring_streams.retain(|&q| q != id);
            self.delete_entry(mixer, id);
        }
    }

    /// Free everything, referenced or not.
    pub fn shutdown(&mut self, mixer: &dyn MixerBackend) {
        self.expiring_samples.clear();
        self.expiring_streams.clear();
        let ids: Vec<DataId> = self.entries.keys().copied().collect();
        for id in ids {
            self.delete_entry(mixer, id);
        }
    }

    pub fn resident_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn expiring_samples(&self) -> usize {
        self.expiring_samples.len()
    }

    pub fn expiring_streams(&self) -> usize {
        self.expiring_streams.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a cursor to the end and upload it into one new buffer.
fn decode_sample(
    mixer: &dyn MixerBackend,
    retry: &DeleteRetry,
    cursor: &mut dyn AudioCursor,
) -> AudioResult<(BufferId, usize)> {
    let channels = cursor.audio_channels() as usize;
    let rate = cursor.audio_rate();
    let expected = (cursor.length() * rate as f64).ceil() as usize;
    let mut pcm: Vec<i16> = Vec::with_capacity(expected * channels);
    let mut chunk = vec![0i16; DECODE_CHUNK_FRAMES * channels];
    loop {
        let got = cursor.read_samples(DECODE_CHUNK_FRAMES, &mut chunk);
        if got == 0 {
            break;
        }
        pcm.extend_from_slice(&chunk[..got * channels]);
    }

    let buffer = mixer.gen_buffer()?;
    if let Err(e) = mixer.buffer_data(buffer, &pcm, channels as u16, rate) {
        retry.delete(mixer, buffer);
        return Err(e);
    }
    Ok((buffer, pcm.len() / channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryAudio;
    use crate::mixer::SoftwareMixer;

    fn tone(name: &str, seconds: f64) -> Arc<MemoryAudio> {
        Arc::new(MemoryAudio::tone(name, 8_000, 1, seconds, 440.0))
    }

    fn cache(limit: usize) -> (SoundCache, SoftwareMixer) {
        (
            SoundCache::new(limit, DeleteRetry::default()),
            SoftwareMixer::new(8_000, 8),
        )
    }

    #[test]
    fn same_identity_shares_one_sample() {
        let (mut cache, mixer) = cache(1);
        let a = tone("a.wav", 0.1);
        let first = cache.acquire(&mixer, a.clone(), SoundMode::Heuristic, 1_000_000).unwrap();
        let second = cache.acquire(&mixer, a.clone(), SoundMode::Sample, 1_000_000).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.get(first).unwrap().refs(), 2);
        assert_eq!(a.open_count(), 1);

        cache.release(&mixer, first);
        cache.release(&mixer, first);
        assert!(cache.get(first).is_some());
        assert_eq!(cache.expiring_samples(), 1);

        let b = cache.acquire(&mixer, tone("b.wav", 0.1), SoundMode::Sample, 1_000_000).unwrap();
        assert!(cache.get(first).is_some());
        cache.release(&mixer, b);
        assert!(cache.get(first).is_none());
        assert_eq!(mixer.buffer_count(), 1);
    }

    #[test]
    fn eviction_is_oldest_release_first() {
        let (mut cache, mixer) = cache(1);
        let (a, b, c) = (tone("a.wav", 0.1), tone("b.wav", 0.1), tone("c.wav", 0.1));

        let id_a = cache.acquire(&mixer, a.clone(), SoundMode::Sample, 0).unwrap();
        cache.release(&mixer, id_a);
        let id_b = cache.acquire(&mixer, b.clone(), SoundMode::Sample, 0).unwrap();
        cache.release(&mixer, id_b);
        let _id_c = cache.acquire(&mixer, c, SoundMode::Sample, 0).unwrap();

        assert!(cache.get(id_a).is_none());
        assert!(cache.get(id_b).is_some());

        cache.acquire(&mixer, a.clone(), SoundMode::Sample, 0).unwrap();
        assert_eq!(a.open_count(), 2);
        assert_eq!(cache.acquire(&mixer, b.clone(), SoundMode::Sample, 0).unwrap(), id_b);
        assert_eq!(b.open_count(), 1);
    }

    #[test]
    fn heuristic_mode_streams_large_sources() {
        let (mut cache, mixer) = cache(4);
        // 0.1 s of mono 8 kHz is 1600 bytes decoded.
        let small = cache.acquire(&mixer, tone("s.wav", 0.1), SoundMode::Heuristic, 2_000).unwrap();
        let large = cache.acquire(&mixer, tone("l.wav", 0.2), SoundMode::Heuristic, 2_000).unwrap();
        assert!(cache.get(small).unwrap().is_sample());
        assert!(!cache.get(large).unwrap().is_sample());
    }

    #[test]
    fn sources_without_a_duration_stream_in_heuristic_mode() {
        let (mut cache, mixer) = cache(4);
        let blind = Arc::new(MemoryAudio::tone("adts.aac", 8_000, 1, 0.1, 440.0).unknown_length());
        let id = cache.acquire(&mixer, blind.clone(), SoundMode::Heuristic, 1_000_000).unwrap();
        assert!(!cache.get(id).unwrap().is_sample());
        assert_eq!(mixer.buffer_count(), 0);

        // An explicit request still decodes it, and the length comes from the data.
        let forced = cache.acquire(&mixer, blind, SoundMode::Sample, 1_000_000).unwrap();
        let data = cache.get(forced).unwrap();
        assert!(data.is_sample());
        assert!((data.length - 0.1).abs() < 1e-6);
    }

    #[test]
    fn anonymous_and_live_sources_always_stream() {
        let (mut cache, mixer) = cache(4);
        let anon = Arc::new(MemoryAudio::anonymous(8_000, 1, vec![0; 80]));
        let live = Arc::new(MemoryAudio::new("radio", 8_000, 1, vec![0; 80]).live());
        let a = cache.acquire(&mixer, anon, SoundMode::Sample, usize::MAX).unwrap();
        let l = cache.acquire(&mixer, live, SoundMode::Sample, usize::MAX).unwrap();
        assert!(!cache.get(a).unwrap().is_sample());
        assert!(!cache.get(l).unwrap().is_sample());
    }

    #[test]
    fn streams_are_reused_only_once_released() {
        let (mut cache, mixer) = cache(4);
        let src = tone("music.ogg", 0.1);
        let first = cache.acquire(&mixer, src.clone(), SoundMode::Stream, 0).unwrap();
        let second = cache.acquire(&mixer, src.clone(), SoundMode::Stream, 0).unwrap();
        assert_ne!(first, second);

        cache.release(&mixer, first);
        assert_eq!(cache.expiring_streams(), 1);
        let third = cache.acquire(&mixer, src.clone(), SoundMode::Heuristic, 0).unwrap();
        assert_eq!(third, first);
        assert_eq!(src.open_count(), 2);
    }

    #[test]
    fn stream_expiry_queue_is_bounded() {
        let (mut cache, mixer) = cache(4);
        let ids: Vec<DataId> = (0..STREAM_EXPIRY_LIMIT + 2)
            .map(|i| {
                cache
                    .acquire(&mixer, tone(&format!("s{i}.ogg"), 0.1), SoundMode::Stream, 0)
                    .unwrap()
            })
            .collect();
        for &id in &ids {
            cache.release(&mixer, id);
        }
        assert_eq!(cache.expiring_streams(), STREAM_EXPIRY_LIMIT);
        assert!(cache.get(ids[0]).is_none());
        assert!(cache.get(ids[1]).is_none());
        assert!(cache.get(ids[2]).is_some());
    }

    #[test]
    fn failed_upload_frees_its_buffer() {
        let (mut cache, mixer) = cache(4);
        // A zero rate cannot be converted to the mixer rate.
        let src = Arc::new(MemoryAudio::new("zero-rate.wav", 0, 1, vec![0; 80]));
        assert!(cache.acquire(&mixer, src, SoundMode::Sample, usize::MAX).is_err());
        assert_eq!(mixer.buffer_count(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn rejects_surround_sources() {
        let (mut cache, mixer) = cache(4);
        let src = Arc::new(MemoryAudio::new("6ch.wav", 8_000, 6, vec![0; 60]));
        let err = cache.acquire(&mixer, src, SoundMode::Heuristic, 0).unwrap_err();
        assert!(matches!(err, AudioError::Format { channels: 6 }));
    }

    #[test]
    fn lowering_limit_and_clear_evict_samples() {
        let (mut cache, mixer) = cache(4);
        for name in ["a.wav", "b.wav", "c.wav"] {
            let id = cache.acquire(&mixer, tone(name, 0.1), SoundMode::Sample, 0).unwrap();
            cache.release(&mixer, id);
        }
        assert_eq!(cache.expiring_samples(), 3);
        cache.set_cache_limit(&mixer, 1);
        assert_eq!(cache.expiring_samples(), 1);
        cache.clear(&mixer);
        assert!(cache.is_empty());
        assert_eq!(mixer.buffer_count(), 0);
    }

    #[test]
    fn uncache_drops_only_unreferenced_entries() {
        let (mut cache, mixer) = cache(4);
        let held = cache.acquire(&mixer, tone("a.wav", 0.1), SoundMode::Sample, 0).unwrap();
        cache.uncache(&mixer, Path::new("a.wav"));
        assert!(cache.get(held).is_some());

        cache.release(&mixer, held);
        cache.uncache(&mixer, Path::new("a.wav"));
        assert!(cache.get(held).is_none());
        assert_eq!(cache.resident_samples(), 0);
    }
}
