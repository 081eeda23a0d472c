//! File-backed audio sources.
//!
//! Uses Symphonia to:
//! - probe the input container/codec
//! - decode packets on demand into interleaved `i16` frames
//! - seek accurately, discarding the pre-roll the demuxer lands before the target

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::cursor::{AudioCursor, AudioSource, FULLY_BUFFERED};
use crate::error::{AudioError, AudioResult};

/// An audio file on disk.
#[derive(Clone, Debug)]
pub struct FileAudio {
    path: PathBuf,
}

impl FileAudio {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AudioSource for FileAudio {
    fn filename(&self) -> Option<&Path> {
        Some(&self.path)
    }

    fn open(&self) -> AudioResult<Box<dyn AudioCursor>> {
        Ok(Box::new(SymphoniaCursor::open(&self.path)?))
    }
}

/// Pull-based decoder over one file.
pub struct SymphoniaCursor {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    rate: u32,
    channels: u16,
    length: f64,
    /// Decoded interleaved samples not yet handed out.
    pending: VecDeque<i16>,
    /// Frames handed out since the start of the file.
    position: u64,
    /// Frames still to drop after an accurate seek.
    skip_frames: u64,
    eof: bool,
}

impl SymphoniaCursor {
    pub fn open(path: &Path) -> AudioResult<Self> {
        let file = File::open(path).map_err(|e| AudioError::open(path.display().to_string(), e))?;

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| AudioError::open(path.display().to_string(), "no default audio track"))?;
        let track_id = track.id;
        let codec_params: CodecParameters = track.codec_params.clone();

        let channels = codec_params
            .channels
            .ok_or_else(|| AudioError::open(path.display().to_string(), "unknown channels"))?
            .count() as u16;
        let rate = codec_params
            .sample_rate
            .ok_or_else(|| AudioError::open(path.display().to_string(), "unknown sample rate"))?;
        let length = duration_secs_from_codec_params(&codec_params).unwrap_or(0.0);

        let decoder =
            symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

        tracing::debug!(
            path = %path.display(),
            codec = codec_name_from_params(&codec_params).unwrap_or("unknown"),
            channels,
            rate_hz = rate,
            length_secs = length,
            "opened audio file"
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            rate,
            channels,
            length,
            pending: VecDeque::new(),
            position: 0,
            skip_frames: 0,
            eof: false,
        })
    }

    /// Decode one more packet into `pending`; `false` at end of stream.
    fn decode_next(&mut self) -> bool {
        let channels = self.channels.max(1) as usize;
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(_) => {
                    self.eof = true;
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    tracing::debug!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(e) => {
                    tracing::warn!("decoder error: {e}");
                    self.eof = true;
                    return false;
                }
            };

            let mut sample_buf = SampleBuffer::<i16>::new(decoded.frames() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);

            let mut samples = sample_buf.samples();
            if self.skip_frames > 0 {
                let skip = (self.skip_frames as usize).min(samples.len() / channels);
                samples = &samples[skip * channels..];
                self.skip_frames -= skip as u64;
            }
            self.pending.extend(samples.iter().copied());
            return true;
        }
    }
}

impl AudioCursor for SymphoniaCursor {
    fn audio_channels(&self) -> u16 {
        self.channels
    }

    fn audio_rate(&self) -> u32 {
        self.rate
    }

    fn length(&self) -> f64 {
        self.length
    }

    fn tell(&self) -> f64 {
        self.position as f64 / self.rate as f64
    }

    fn seek(&mut self, t: f64) -> AudioResult<()> {
        let t = t.max(0.0);
        let secs = t.floor();
        let time = Time::new(secs as u64, t - secs);
        let seeked = self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        )?;
        self.decoder.reset();
        self.pending.clear();
        self.eof = false;
        self.skip_frames = seeked.required_ts.saturating_sub(seeked.actual_ts);
        self.position = seeked.required_ts;
        Ok(())
    }

    fn ready(&self) -> usize {
        FULLY_BUFFERED
    }

    fn read_samples(&mut self, frames: usize, out: &mut [i16]) -> usize {
        let channels = self.channels.max(1) as usize;
        let want = frames.min(out.len() / channels);
        while self.pending.len() < want * channels && !self.eof {
            if !self.decode_next() {
                break;
            }
        }

        let got = (self.pending.len() / channels).min(want);
        for (slot, sample) in out[..got * channels]
            .iter_mut()
            .zip(self.pending.drain(..got * channels))
        {
            *slot = sample;
        }
        self.position += got as u64;
        got
    }

    fn can_seek(&self) -> bool {
        true
    }
}

/// Best-effort duration in seconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_secs_from_codec_params(codec_params: &CodecParameters) -> Option<f64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(frames as f64 / rate as f64)
}

/// Best-effort codec label used for diagnostics.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}
