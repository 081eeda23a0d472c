//! Per-sound buffer pipeline.
//!
//! A playing sound keeps a queue of buffers committed to its voice. Each tick
//! drains what the voice has finished, refills up to the look-ahead, and
//! restarts the voice if it ran dry while audio was still queued. Resident
//! samples queue the same shared buffer once per loop; streams decode fresh
//! chunks from their cursor and wrap it back to the start at each loop end.

use std::collections::VecDeque;

use crate::cache::{DataBody, SoundData};
use crate::clock::ClockCalibrator;
use crate::cursor::AudioCursor;
use crate::error::{AudioError, AudioResult};
use crate::hal::{BufferId, DeleteRetry, MixerBackend, VoiceId};

/// Loop budget used for "loop forever".
pub const INFINITE_LOOPS: u32 = 1_000_000_000;

/// Copies of a resident sample kept queued at once.
const MAX_QUEUED_SAMPLES: usize = 100;

/// Size of one decoded stream chunk.
const STREAM_READ_BYTES: usize = 65_536;

/// Cap on how far ahead of the cursor one read may look.
const MAX_READ_SECONDS: f64 = 60.0;

/// One mixer buffer committed to a voice.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueuedBuffer {
    pub buffer: BufferId,
    pub frames: usize,
    /// Loop iteration the audio belongs to.
    pub loop_index: u32,
    /// Where inside one loop the buffer starts, in seconds.
    pub time_offset: f64,
}

/// Shared inputs for one pipeline step.
pub struct Pipe<'a> {
    pub mixer: &'a dyn MixerBackend,
    pub retry: DeleteRetry,
    pub buffering_seconds: f64,
}

#[derive(Debug, Default)]
pub struct StreamState {
    pub voice: Option<VoiceId>,
    pub queue: VecDeque<QueuedBuffer>,
    pub loops_completed: u32,
    pub playing_loops: u32,
    /// Effective rate the voice plays at (sound rate times manager rate).
    pub playing_rate: f64,
    pub calibrator: ClockCalibrator,
    /// Last time handed to callers.
    pub current_time: f64,
    /// Decode buffer reused by every stream read.
    scratch: Vec<i16>,
}

impl StreamState {
    /// Reset loop bookkeeping for a new run.
    pub fn begin(&mut self, loop_count: u32, playing_rate: f64) {
        self.playing_loops = if loop_count == 0 {
            INFINITE_LOOPS
        } else {
            loop_count
        };
        self.loops_completed = 0;
        self.playing_rate = playing_rate;
    }

    /// Nothing queued and no loops left, or no voice at all.
    pub fn is_drained(&self) -> bool {
        self.voice.is_none()
            || (self.queue.is_empty() && self.loops_completed >= self.playing_loops)
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.iter().map(|q| q.frames).sum()
    }

    fn queue_buffer(&mut self, mixer: &dyn MixerBackend, entry: QueuedBuffer) -> AudioResult<()> {
        let Some(voice) = self.voice else {
            return Err(AudioError::InvalidOperation(
                "queueing without a voice".to_string(),
            ));
        };
        mixer.queue_buffers(voice, &[entry.buffer])?;
        self.queue.push_back(entry);
        Ok(())
    }

    /// Top the queue up to the look-ahead target.
    pub fn push_fresh_buffers(&mut self, data: &mut SoundData, pipe: &Pipe<'_>) -> AudioResult<()> {
        if self.voice.is_none() {
            return Ok(());
        }
        match &mut data.body {
            DataBody::Sample(buffer) => {
                let buffer = *buffer;
                let frames = (data.length * data.rate as f64).round() as usize;
                while self.loops_completed < self.playing_loops
                    && self.queue.len() < MAX_QUEUED_SAMPLES
                {
                    self.queue_buffer(
                        pipe.mixer,
                        QueuedBuffer {
                            buffer,
                            frames,
                            loop_index: self.loops_completed,
                            time_offset: 0.0,
                        },
                    )?;
                    self.loops_completed += 1;
                }
            }
            DataBody::Stream(cursor) => {
                let mut pcm = std::mem::take(&mut self.scratch);
                pcm.resize(STREAM_READ_BYTES / 2, 0);
                let pushed = self.push_stream_buffers(
                    cursor.as_mut(),
                    data.channels,
                    data.rate,
                    data.length,
                    pipe,
                    &mut pcm,
                );
                self.scratch = pcm;
                pushed?;
            }
        }
        Ok(())
    }

    fn push_stream_buffers(
        &mut self,
        cursor: &mut dyn AudioCursor,
        channels: u16,
        rate: u32,
        length: f64,
        pipe: &Pipe<'_>,
        pcm: &mut [i16],
    ) -> AudioResult<()> {
        let width = channels.max(1) as usize;
        let target = (pipe.buffering_seconds * rate as f64) as usize;
        let mut fill = self.queued_frames();
        while self.loops_completed < self.playing_loops && fill < target {
            let loop_index = self.loops_completed;
            let time_offset = cursor.tell();
            let frames = self.read_stream_data(cursor, length, pcm);
            if frames == 0 {
                break;
            }

            let buffer = pipe.mixer.gen_buffer()?;
            let queued = pipe
                .mixer
                .buffer_data(buffer, &pcm[..frames * width], channels, rate)
                .and_then(|()| {
                    self.queue_buffer(
                        pipe.mixer,
                        QueuedBuffer {
                            buffer,
                            frames,
                            loop_index,
                            time_offset,
                        },
                    )
                });
            if let Err(e) = queued {
                pipe.retry.delete(pipe.mixer, buffer);
                return Err(e);
            }
            fill += frames;
        }
        Ok(())
    }

    /// Decode up to `pcm.len()` samples, wrapping at loop ends. Returns frames read.
    fn read_stream_data(&mut self, cursor: &mut dyn AudioCursor, length: f64, pcm: &mut [i16]) -> usize {
        let channels = cursor.audio_channels().max(1) as usize;
        let rate = cursor.audio_rate() as f64;
        let mut space = pcm.len() / channels;
        let mut fill = 0;
        let mut idle_wraps = 0;

        while space > 0 && self.loops_completed < self.playing_loops {
            let remain = if length > 0.0 {
                (length - cursor.tell()).min(MAX_READ_SECONDS)
            } else {
                MAX_READ_SECONDS
            };
            let wanted = (remain * rate) as usize;
            if wanted > 0 {
                let ready = cursor.ready();
                if ready == 0 {
                    if cursor.aborted() {
                        self.loops_completed = self.playing_loops;
                    }
                    break;
                }
                let frames = wanted.min(space).min(ready);
                let got = cursor.read_samples(frames, &mut pcm[fill * channels..]);
                if got > 0 {
                    fill += got;
                    space -= got;
                    idle_wraps = 0;
                    continue;
                }
            }

            // End of this loop iteration.
            self.loops_completed += 1;
            idle_wraps += 1;
            if self.loops_completed >= self.playing_loops {
                break;
            }
            if idle_wraps > 1 {
                tracing::warn!("stream produced no audio for a whole loop; giving up");
                self.loops_completed = self.playing_loops;
                break;
            }
            if let Err(e) = cursor.seek(0.0) {
                tracing::warn!("cannot rewind stream for looping: {e}");
                self.loops_completed = self.playing_loops;
                break;
            }
        }
        fill
    }

    /// Unqueue every buffer the voice has finished and feed the clock.
    pub fn pull_used_buffers(
        &mut self,
        sample: Option<BufferId>,
        length: f64,
        now: f64,
        pipe: &Pipe<'_>,
    ) -> AudioResult<()> {
        let Some(voice) = self.voice else {
            return Ok(());
        };
        while !self.queue.is_empty() {
            if pipe.mixer.buffers_processed(voice)? == 0 {
                break;
            }
            let buffer = pipe.mixer.unqueue_buffer(voice)?;

            if self.queue.front().map(|q| q.buffer) == Some(buffer) {
                self.queue.pop_front();
                if let Some(front) = self.queue.front() {
                    let observed = front.time_offset + front.loop_index as f64 * length;
                    self.calibrator.correct(now, observed, self.playing_rate);
                }
            } else {
                // Some mixers hand buffers back out of order after an interruption.
                let Some(pos) = self.queue.iter().position(|q| q.buffer == buffer) else {
                    return Err(AudioError::StreamCorruption(format!(
                        "voice {} returned buffer {} that was never queued",
                        voice.0, buffer.0
                    )));
                };
                self.queue.remove(pos);
            }

            if Some(buffer) != sample {
                pipe.retry.delete(pipe.mixer, buffer);
            }
        }
        Ok(())
    }

    /// Play the voice again if it underran with audio still queued.
    pub fn restart_stalled(&mut self, mixer: &dyn MixerBackend) -> AudioResult<()> {
        if let Some(voice) = self.voice {
            if !self.queue.is_empty() && !mixer.is_playing(voice)? {
                tracing::debug!(voice = voice.0, "restarting stalled voice");
                mixer.play(voice)?;
            }
        }
        Ok(())
    }

    /// Refresh `current_time` from the calibrated clock.
    pub fn cache_time(&mut self, now: f64, length: f64) -> f64 {
        let t = self.calibrator.time(now);
        self.current_time = if length <= 0.0 {
            t
        } else if t >= length * self.playing_loops as f64 {
            length
        } else {
            t % length
        };
        self.current_time
    }

    /// One update step: drain, refill, restart.
    pub fn tick(
        &mut self,
        data: Option<&mut SoundData>,
        length: f64,
        now: f64,
        pipe: &Pipe<'_>,
    ) -> AudioResult<()> {
        let sample = data.as_ref().and_then(|d| d.sample());
        self.pull_used_buffers(sample, length, now, pipe)?;
        if let Some(data) = data {
            self.push_fresh_buffers(data, pipe)?;
        }
        self.restart_stalled(pipe.mixer)?;
        self.cache_time(now, length);
        Ok(())
    }

    /// Stop the voice, drop the queue and hand the voice back.
    pub fn halt(&mut self, sample: Option<BufferId>, pipe: &Pipe<'_>) -> Option<VoiceId> {
        let voice = self.voice.take();
        if let Some(voice) = voice {
            if let Err(e) = pipe.mixer.stop(voice).and_then(|()| pipe.mixer.detach_buffers(voice)) {
                tracing::warn!(voice = voice.0, "failed to stop voice: {e}");
            }
        }
        for queued in self.queue.drain(..) {
            if Some(queued.buffer) != sample {
                pipe.retry.delete(pipe.mixer, queued.buffer);
            }
        }
        voice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SoundCache;
    use crate::cursor::MemoryAudio;
    use crate::mixer::SoftwareMixer;
    use audio_engine_types::SoundMode;
    use std::sync::Arc;

    const RATE: u32 = 1_000;

    fn pipe(mixer: &SoftwareMixer) -> Pipe<'_> {
        Pipe {
            mixer,
            retry: DeleteRetry::default(),
            buffering_seconds: 0.5,
        }
    }

    fn load(cache: &mut SoundCache, mixer: &SoftwareMixer, seconds: f64, mode: SoundMode) -> u64 {
        let src = Arc::new(MemoryAudio::tone("t.wav", RATE, 1, seconds, 50.0));
        cache.acquire(mixer, src, mode, usize::MAX).unwrap()
    }

    #[test]
    fn resident_sample_is_queued_once_per_loop() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let mut cache = SoundCache::new(4, DeleteRetry::default());
        let id = load(&mut cache, &mixer, 0.2, SoundMode::Sample);
        let data = cache.get_mut(id).unwrap();

        let mut st = StreamState {
            voice: Some(mixer.gen_voice().unwrap()),
            ..StreamState::default()
        };
        st.begin(3, 1.0);
        st.push_fresh_buffers(data, &pipe(&mixer)).unwrap();
        assert_eq!(st.queue.len(), 3);
        assert_eq!(st.loops_completed, 3);
        assert!(st.queue.iter().all(|q| Some(q.buffer) == data.sample()));
        assert_eq!(st.queue[2].loop_index, 2);
    }

    #[test]
    fn infinite_sample_loops_are_capped() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let mut cache = SoundCache::new(4, DeleteRetry::default());
        let id = load(&mut cache, &mixer, 0.01, SoundMode::Sample);
        let mut st = StreamState {
            voice: Some(mixer.gen_voice().unwrap()),
            ..StreamState::default()
        };
        st.begin(0, 1.0);
        st.push_fresh_buffers(cache.get_mut(id).unwrap(), &pipe(&mixer)).unwrap();
        assert_eq!(st.queue.len(), MAX_QUEUED_SAMPLES);
        assert!(!st.is_drained());
    }

    #[test]
    fn stream_fills_to_look_ahead_and_wraps_loops() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let mut cache = SoundCache::new(4, DeleteRetry::default());
        let id = load(&mut cache, &mixer, 0.3, SoundMode::Stream);
        let p = pipe(&mixer);
        let mut st = StreamState {
            voice: Some(mixer.gen_voice().unwrap()),
            ..StreamState::default()
        };
        st.begin(2, 1.0);
        st.push_fresh_buffers(cache.get_mut(id).unwrap(), &p).unwrap();
        // One chunk covers the whole 0.6 s of two loops; that tops up the 0.5 s target.
        assert_eq!(st.queued_frames(), 600);
        assert_eq!(st.loops_completed, 2);
        assert!(!st.is_drained());

        mixer.play(st.voice.unwrap()).unwrap();
        mixer.render_frames(650);
        st.pull_used_buffers(None, 0.3, 0.65, &p).unwrap();
        assert!(st.queue.is_empty());
        assert!(st.is_drained());
        assert_eq!(mixer.buffer_count(), 0);
    }

    #[test]
    fn stream_chunks_record_offsets() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let mut cache = SoundCache::new(4, DeleteRetry::default());
        // Long enough that every read is a full chunk.
        let id = load(&mut cache, &mixer, 100.0, SoundMode::Stream);
        let p = Pipe {
            buffering_seconds: 40.0,
            ..pipe(&mixer)
        };
        let mut st = StreamState {
            voice: Some(mixer.gen_voice().unwrap()),
            ..StreamState::default()
        };
        st.begin(1, 1.0);
        st.push_fresh_buffers(cache.get_mut(id).unwrap(), &p).unwrap();
        assert_eq!(st.queue[0].frames, 32_768);
        assert_eq!(st.queue[0].time_offset, 0.0);
        assert!((st.queue[1].time_offset - 32.768).abs() < 1e-9);
        assert_eq!(st.queue[1].loop_index, 0);
    }

    #[test]
    fn stream_reads_reuse_one_decode_buffer() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let mut cache = SoundCache::new(4, DeleteRetry::default());
        let id = load(&mut cache, &mixer, 100.0, SoundMode::Stream);
        let mut st = StreamState {
            voice: Some(mixer.gen_voice().unwrap()),
            ..StreamState::default()
        };
        st.begin(1, 1.0);
        let near = Pipe {
            buffering_seconds: 40.0,
            ..pipe(&mixer)
        };
        st.push_fresh_buffers(cache.get_mut(id).unwrap(), &near).unwrap();
        let scratch = st.scratch.as_ptr();
        assert_eq!(st.queue.len(), 2);

        let far = Pipe {
            buffering_seconds: 90.0,
            ..pipe(&mixer)
        };
        st.push_fresh_buffers(cache.get_mut(id).unwrap(), &far).unwrap();
        assert_eq!(st.queue.len(), 3);
        assert_eq!(st.scratch.as_ptr(), scratch);
        assert_eq!(st.scratch.len(), STREAM_READ_BYTES / 2);
    }

    #[test]
    fn drained_buffers_correct_the_clock() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let mut cache = SoundCache::new(4, DeleteRetry::default());
        let id = load(&mut cache, &mixer, 0.4, SoundMode::Sample);
        let p = pipe(&mixer);
        let mut st = StreamState {
            voice: Some(mixer.gen_voice().unwrap()),
            ..StreamState::default()
        };
        st.begin(3, 1.0);
        st.calibrator.reset(0.0, 0.0, 1.0);
        let data = cache.get_mut(id).unwrap();
        st.push_fresh_buffers(data, &p).unwrap();
        mixer.play(st.voice.unwrap()).unwrap();

        // The first loop finishes but the wall clock claims far less time passed.
        mixer.render_frames(420);
        st.pull_used_buffers(data.sample(), 0.4, 0.05, &p).unwrap();
        assert_eq!(st.queue.len(), 2);
        assert!(st.calibrator.rate() > 1.0);
        // The shared sample buffer survives the drain.
        assert_eq!(mixer.buffer_count(), 1);
    }

    #[test]
    fn unknown_buffer_is_stream_corruption() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let voice = mixer.gen_voice().unwrap();
        let stray = mixer.gen_buffer().unwrap();
        mixer.buffer_data(stray, &[0; 10], 1, RATE).unwrap();
        mixer.queue_buffers(voice, &[stray]).unwrap();

        let mut st = StreamState {
            voice: Some(voice),
            ..StreamState::default()
        };
        st.begin(1, 1.0);
        let own = mixer.gen_buffer().unwrap();
        st.queue.push_back(QueuedBuffer {
            buffer: own,
            frames: 10,
            loop_index: 0,
            time_offset: 0.0,
        });
        mixer.stop(voice).unwrap();

        let err = st.pull_used_buffers(None, 1.0, 0.0, &pipe(&mixer)).unwrap_err();
        assert!(matches!(err, AudioError::StreamCorruption(_)));
    }

    #[test]
    fn stalled_voice_is_restarted() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let mut cache = SoundCache::new(4, DeleteRetry::default());
        let id = load(&mut cache, &mixer, 0.1, SoundMode::Sample);
        let voice = mixer.gen_voice().unwrap();
        let mut st = StreamState {
            voice: Some(voice),
            ..StreamState::default()
        };
        st.begin(1, 1.0);
        st.push_fresh_buffers(cache.get_mut(id).unwrap(), &pipe(&mixer)).unwrap();
        assert!(!mixer.is_playing(voice).unwrap());
        st.restart_stalled(&mixer).unwrap();
        assert!(mixer.is_playing(voice).unwrap());
    }

    #[test]
    fn live_stream_abort_ends_all_loops() {
        struct Aborted;
        impl AudioCursor for Aborted {
            fn audio_channels(&self) -> u16 {
                1
            }
            fn audio_rate(&self) -> u32 {
                RATE
            }
            fn length(&self) -> f64 {
                10.0
            }
            fn tell(&self) -> f64 {
                0.0
            }
            fn seek(&mut self, _t: f64) -> AudioResult<()> {
                Ok(())
            }
            fn ready(&self) -> usize {
                0
            }
            fn read_samples(&mut self, _frames: usize, _out: &mut [i16]) -> usize {
                0
            }
            fn can_seek(&self) -> bool {
                false
            }
            fn aborted(&self) -> bool {
                true
            }
        }

        let mut st = StreamState::default();
        st.begin(0, 1.0);
        let got = st.read_stream_data(&mut Aborted, 10.0, &mut [0; 64]);
        assert_eq!(got, 0);
        assert_eq!(st.loops_completed, INFINITE_LOOPS);
    }

    #[test]
    fn cached_time_folds_into_one_loop() {
        let mut st = StreamState::default();
        st.begin(2, 1.0);
        st.calibrator.reset(0.0, 0.0, 1.0);
        assert!((st.cache_time(1.5, 1.0) - 0.5).abs() < 1e-9);
        assert_eq!(st.cache_time(2.5, 1.0), 1.0);
    }

    #[test]
    fn halt_returns_voice_and_frees_stream_buffers() {
        let mixer = SoftwareMixer::new(RATE, 4);
        let mut cache = SoundCache::new(4, DeleteRetry::default());
        let id = load(&mut cache, &mixer, 0.3, SoundMode::Stream);
        let p = pipe(&mixer);
        let voice = mixer.gen_voice().unwrap();
        let mut st = StreamState {
            voice: Some(voice),
            ..StreamState::default()
        };
        st.begin(1, 1.0);
        st.push_fresh_buffers(cache.get_mut(id).unwrap(), &p).unwrap();
        assert!(mixer.buffer_count() > 0);

        assert_eq!(st.halt(None, &p), Some(voice));
        assert!(st.queue.is_empty());
        assert!(st.voice.is_none());
        assert_eq!(mixer.buffer_count(), 0);
    }
}
