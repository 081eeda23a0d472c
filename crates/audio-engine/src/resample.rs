//! Buffer rate conversion.
//!
//! Uses Rubato to convert a whole interleaved `f32` buffer from its source rate
//! to the mixer output rate. Runs synchronously when a buffer is filled, so the
//! render path only ever applies the pitch ratio.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::error::{AudioError, AudioResult};

/// Input chunk size in frames for the conversion loop.
const CHUNK_FRAMES: usize = 1024;

/// Zero chunks fed after the input to flush the filter delay.
const MAX_FLUSH_CHUNKS: usize = 8;

/// Convert interleaved samples from `src_rate` to `dst_rate`.
///
/// The output holds exactly `round(frames * dst_rate / src_rate)` frames,
/// aligned with the input: the filter delay is trimmed from the front.
pub fn resample_interleaved(
    input: &[f32],
    channels: usize,
    src_rate: u32,
    dst_rate: u32,
) -> AudioResult<Vec<f32>> {
    if channels == 0 || src_rate == 0 || dst_rate == 0 {
        return Err(AudioError::InvalidOperation(format!(
            "cannot resample {channels} channels from {src_rate} Hz to {dst_rate} Hz"
        )));
    }
    if src_rate == dst_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let f_ratio = dst_rate as f64 / src_rate as f64;
    let in_frames = input.len() / channels;
    let expected_frames = (in_frames as f64 * f_ratio).round() as usize;

    let sinc_len = 128;
    let oversampling_factor = 256;
    let interpolation = SincInterpolationType::Cubic;
    let window = WindowFunction::BlackmanHarris2;
    let f_cutoff = calculate_cutoff(sinc_len, window);

    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff,
        interpolation,
        oversampling_factor,
        window,
    };

    let mut resampler: Box<dyn Resampler<f32>> = Box::new(
        Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            CHUNK_FRAMES,
            channels,
            FixedAsync::Input,
        )
        .map_err(|e| AudioError::InvalidOperation(format!("resampler init: {e}")))?,
    );

    let delay_frames = resampler.output_delay();
    let wanted_frames = expected_frames + delay_frames;
    let out_capacity_frames = (CHUNK_FRAMES as f64 * f_ratio * 1.1).ceil() as usize + 64;
    let mut out_interleaved = vec![0.0f32; channels * out_capacity_frames];
    let mut output = Vec::with_capacity((wanted_frames + out_capacity_frames) * channels);
    let silence = vec![0.0f32; channels * CHUNK_FRAMES];

    let mut indexing = Indexing {
        input_offset: 0,
        output_offset: 0,
        active_channels_mask: None,
        partial_len: None,
    };

    let mut pos = 0;
    let mut flushed = 0;
    while output.len() / channels < wanted_frames {
        let (chunk, frames) = if pos < in_frames {
            let take = (in_frames - pos).min(CHUNK_FRAMES);
            let chunk = &input[pos * channels..(pos + take) * channels];
            pos += take;
            (chunk, take)
        } else if flushed < MAX_FLUSH_CHUNKS {
            flushed += 1;
            (&silence[..], CHUNK_FRAMES)
        } else {
            break;
        };

        let input_adapter = InterleavedSlice::new(chunk, channels, frames)
            .map_err(|e| AudioError::InvalidOperation(format!("interleaved slice (input): {e}")))?;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut out_interleaved, channels, out_capacity_frames)
                .map_err(|e| {
                    AudioError::InvalidOperation(format!("interleaved slice (output): {e}"))
                })?;

        indexing.input_offset = 0;
        indexing.output_offset = 0;
        indexing.partial_len = if frames < CHUNK_FRAMES {
            Some(frames)
        } else {
            None
        };

        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| AudioError::InvalidOperation(format!("resampler process: {e}")))?;

        output.extend_from_slice(&out_interleaved[..nbr_out * channels]);
    }

    output.drain(..(delay_frames * channels).min(output.len()));
    output.resize(expected_frames * channels, 0.0);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_passthrough() {
        let input = vec![0.1, 0.2, 0.3, 0.4];
        let out = resample_interleaved(&input, 2, 48_000, 48_000).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn rejects_zero_rates() {
        assert!(resample_interleaved(&[0.0; 4], 2, 0, 48_000).is_err());
        assert!(resample_interleaved(&[0.0; 4], 0, 8_000, 48_000).is_err());
    }

    #[test]
    fn upsampling_produces_expected_length() {
        let input: Vec<f32> = (0..3_000).map(|i| ((i as f32) * 0.05).sin() * 0.5).collect();
        let out = resample_interleaved(&input, 1, 8_000, 16_000).unwrap();
        assert_eq!(out.len(), 6_000);
        assert!(out.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn output_is_aligned_with_the_input() {
        let input = vec![0.25f32; 800];
        let out = resample_interleaved(&input, 1, 8_000, 48_000).unwrap();
        assert_eq!(out.len(), 4_800);
        // Edges only see half the filter, but must carry signal.
        assert!(out[0] > 0.08, "first frame {}", out[0]);
        assert!(out[4_799] > 0.08, "last frame {}", out[4_799]);
        assert!((out[2_400] - 0.25).abs() < 0.01, "middle frame {}", out[2_400]);
        assert!(out[450..4_350].iter().all(|s| (s - 0.25).abs() < 0.02));
    }

    #[test]
    fn downsampling_stereo_keeps_frames_whole() {
        let input = vec![0.25f32; 2 * 4_410];
        let out = resample_interleaved(&input, 2, 44_100, 22_050).unwrap();
        assert_eq!(out.len(), 2 * 2_205);
    }
}
