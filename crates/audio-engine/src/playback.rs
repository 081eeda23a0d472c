//! Playback stage (CPAL output stream).
//!
//! Builds the CPAL output stream and provides the real-time audio callback.
//! The callback:
//! - asks the software mixer for one block of interleaved stereo
//! - maps stereo onto the device layout (stereo→mono average, extra channels silent)
//! - converts `f32` samples to the device sample format
//!
//! The stream lives on its own thread so the rest of the engine never has to
//! hold a `cpal::Stream`, which is not `Send` on every platform.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Sender, bounded};

use crate::config::EngineConfig;
use crate::device;
use crate::mixer::{MIX_CHANNELS, SoftwareMixer};

/// Counters shared with the output callback.
#[derive(Clone, Debug, Default)]
pub struct OutputCounters {
    /// Frames pulled from the mixer.
    pub played_frames: Arc<AtomicU64>,
    /// Frames voices could not fill because their queue ran dry.
    pub underrun_frames: Arc<AtomicU64>,
    /// Number of voices that ran dry.
    pub underrun_events: Arc<AtomicU64>,
}

/// Build a CPAL output stream that plays whatever `mixer` renders.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    mixer: &Arc<SoftwareMixer>,
    counters: OutputCounters,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, mixer, counters),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, mixer, counters),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, mixer, counters),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, mixer, counters),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: &Arc<SoftwareMixer>,
    counters: OutputCounters,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = (config.channels as usize).max(1);
    let mixer_cb = mixer.clone();
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let frames = data.len() / channels_out;
            scratch.resize(frames * MIX_CHANNELS, 0.0);
            let report = mixer_cb.render(&mut scratch);

            for (frame, out) in data.chunks_exact_mut(channels_out).enumerate() {
                let l = scratch[frame * MIX_CHANNELS];
                let r = scratch[frame * MIX_CHANNELS + 1];
                for (ch, slot) in out.iter_mut().enumerate() {
                    *slot = <T as cpal::Sample>::from_sample::<f32>(map_stereo(
                        l,
                        r,
                        channels_out,
                        ch,
                    ));
                }
            }

            counters
                .played_frames
                .fetch_add(frames as u64, Ordering::Relaxed);
            if report.underruns > 0 {
                counters
                    .underrun_events
                    .fetch_add(report.underruns as u64, Ordering::Relaxed);
                counters
                    .underrun_frames
                    .fetch_add(report.starved_frames as u64, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Output sample for `dst_ch` of a `dst_channels` device given one stereo frame.
fn map_stereo(l: f32, r: f32, dst_channels: usize, dst_ch: usize) -> f32 {
    let out = match (dst_channels, dst_ch) {
        (1, _) => 0.5 * (l + r),
        (_, 0) => l,
        (_, 1) => r,
        _ => 0.0,
    };
    out.clamp(-1.0, 1.0)
}

/// A running output stream owned by a dedicated thread.
///
/// Dropping it stops the stream and joins the thread.
pub struct OutputThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for OutputThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("audio output thread panicked");
            }
        }
    }
}

/// Open the configured CPAL device and start pulling from a new mixer.
pub fn spawn_output(
    cfg: &EngineConfig,
) -> Result<(Arc<SoftwareMixer>, OutputCounters, OutputThread)> {
    let (ready_tx, ready_rx) = bounded::<Result<(Arc<SoftwareMixer>, OutputCounters)>>(1);
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let needle = cfg.device.clone();
    let max_voices = cfg.max_voices;

    let handle = thread::Builder::new()
        .name("audio-output".to_string())
        .spawn(move || match open_stream(needle.as_deref(), max_voices) {
            Ok((mixer, counters, stream)) => {
                let _ = ready_tx.send(Ok((mixer, counters)));
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("audio output closed");
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
            }
        })
        .context("spawn audio output thread")?;

    let thread = OutputThread {
        stop_tx,
        handle: Some(handle),
    };
    match ready_rx.recv() {
        Ok(Ok((mixer, counters))) => Ok((mixer, counters, thread)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(anyhow!("audio output thread exited before opening the device")),
    }
}

fn open_stream(
    needle: Option<&str>,
    max_voices: usize,
) -> Result<(Arc<SoftwareMixer>, OutputCounters, cpal::Stream)> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, needle)?;
    let supported = device::pick_output_config(&device, Some(device::PREFERRED_RATE))?;
    let mut stream_config = supported.config();
    if let Some(size) = device::pick_buffer_size(&supported) {
        stream_config.buffer_size = size;
    }

    let mixer = Arc::new(SoftwareMixer::new(stream_config.sample_rate, max_voices));
    let counters = OutputCounters::default();
    let stream = build_output_stream(
        &device,
        &stream_config,
        supported.sample_format(),
        &mixer,
        counters.clone(),
    )?;
    stream.play().context("start output stream")?;

    tracing::info!(
        device = %device.description().map(|d| d.name().to_string()).unwrap_or_default(),
        rate_hz = stream_config.sample_rate,
        channels = stream_config.channels,
        format = ?supported.sample_format(),
        "audio output opened"
    );
    Ok((mixer, counters, stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_passes_through_to_stereo() {
        assert_eq!(map_stereo(0.25, -0.5, 2, 0), 0.25);
        assert_eq!(map_stereo(0.25, -0.5, 2, 1), -0.5);
    }

    #[test]
    fn mono_devices_get_the_average() {
        assert_eq!(map_stereo(0.5, 0.25, 1, 0), 0.375);
    }

    #[test]
    fn surround_devices_only_use_front_pair() {
        assert_eq!(map_stereo(0.5, 0.25, 6, 0), 0.5);
        assert_eq!(map_stereo(0.5, 0.25, 6, 1), 0.25);
        assert_eq!(map_stereo(0.5, 0.25, 6, 4), 0.0);
    }

    #[test]
    fn mapping_clips_hot_mixes() {
        assert_eq!(map_stereo(3.0, -3.0, 2, 0), 1.0);
        assert_eq!(map_stereo(3.0, -3.0, 2, 1), -1.0);
    }
}
