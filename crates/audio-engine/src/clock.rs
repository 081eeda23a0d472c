//! Wall clock and the per-sound calibrated playback clock.
//!
//! The mixer only tells us where playback is when a queued buffer finishes,
//! which is coarse and late. `ClockCalibrator` extrapolates between those
//! reports with a linear model and nudges its rate toward what the buffer
//! reports say, so `get_time()` moves smoothly every frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Seconds since an arbitrary, fixed origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Monotonic process clock.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    pub fn set(&self, t: f64) {
        self.bits.store(t.to_bits(), Ordering::Relaxed);
    }

    pub fn advance(&self, secs: f64) {
        self.set(self.now() + secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Errors beyond this many seconds are treated as a discontinuity.
const SNAP_THRESHOLD: f64 = 0.5;
/// Weight of the previous average in the error moving average.
const ERROR_DECAY: f64 = 0.95;

/// Rate correction for an error sample and its moving average.
///
/// Errors are `observed - predicted`: positive means the prediction is
/// behind the audio and needs to catch up.
fn correction_factor(error: f64, average: f64) -> f64 {
    let both_above = |limit: f64| error > limit && average > limit;
    if both_above(0.15) {
        1.5
    } else if both_above(0.05) {
        1.2
    } else if both_above(0.01) {
        1.03
    } else if error < -0.01 && average < -0.01 {
        0.98
    } else {
        1.0
    }
}

/// Linear wall-time to audio-time model with drift correction.
#[derive(Clone, Debug)]
pub struct ClockCalibrator {
    base_wall: f64,
    base_audio: f64,
    rate: f64,
    error_avg: f64,
    /// Highest time handed out since the last reset.
    latched: f64,
}

impl Default for ClockCalibrator {
    fn default() -> Self {
        Self {
            base_wall: 0.0,
            base_audio: 0.0,
            rate: 1.0,
            error_avg: 0.0,
            latched: 0.0,
        }
    }
}

impl ClockCalibrator {
    /// Start a new run at `audio` seconds, forgetting history.
    pub fn reset(&mut self, now: f64, audio: f64, play_rate: f64) {
        self.anchor(now, audio, play_rate);
        self.error_avg = 0.0;
        self.latched = audio;
    }

    fn anchor(&mut self, now: f64, audio: f64, rate: f64) {
        self.base_wall = now;
        self.base_audio = audio;
        self.rate = rate.max(0.0);
    }

    pub fn predict(&self, now: f64) -> f64 {
        self.base_audio + (now - self.base_wall) * self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn error_average(&self) -> f64 {
        self.error_avg
    }

    /// Feed an observed playback position.
    pub fn correct(&mut self, now: f64, observed: f64, play_rate: f64) {
        let predicted = self.predict(now);
        let error = observed - predicted;
        self.error_avg = self.error_avg * ERROR_DECAY + error * (1.0 - ERROR_DECAY);

        if error.abs() > SNAP_THRESHOLD {
            tracing::trace!(predicted, observed, "clock snapped");
            self.anchor(now, observed, play_rate);
            self.error_avg = 0.0;
            return;
        }

        let factor = correction_factor(error, self.error_avg);
        self.anchor(now, predicted, factor * play_rate);
    }

    /// Re-anchor at the current prediction with a new playback rate.
    pub fn set_play_rate(&mut self, now: f64, play_rate: f64) {
        let predicted = self.predict(now);
        self.anchor(now, predicted, play_rate);
    }

    /// Time reported to callers; never goes backwards between resets.
    pub fn time(&mut self, now: f64) -> f64 {
        self.latched = self.latched.max(self.predict(now));
        self.latched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1.0);
        let other = clock.clone();
        clock.advance(0.5);
        assert_eq!(other.now(), 1.5);
    }

    #[test]
    fn prediction_is_linear_in_wall_time() {
        let mut cal = ClockCalibrator::default();
        cal.reset(10.0, 2.0, 1.0);
        assert_eq!(cal.predict(11.5), 3.5);
        cal.set_play_rate(11.5, 2.0);
        assert_eq!(cal.predict(12.0), 4.5);
    }

    #[test]
    fn small_positive_error_speeds_up() {
        let mut cal = ClockCalibrator::default();
        cal.reset(0.0, 0.0, 1.0);
        for i in 1..=40 {
            let now = i as f64 * 0.1;
            cal.correct(now, cal.predict(now) + 0.04, 1.0);
        }
        assert!(cal.rate() > 1.0);
    }

    #[test]
    fn running_ahead_slows_down_without_jumping() {
        let mut cal = ClockCalibrator::default();
        cal.reset(0.0, 0.0, 1.0);
        let mut last = cal.time(0.0);
        for i in 1..=40 {
            let now = i as f64 * 0.1;
            let before = cal.predict(now);
            cal.correct(now, before - 0.05, 1.0);
            assert_eq!(cal.predict(now), before);
            let t = cal.time(now);
            assert!(t >= last);
            last = t;
        }
        assert_eq!(cal.rate(), 0.98);
    }

    #[test]
    fn large_error_snaps_and_time_stays_monotonic() {
        let mut cal = ClockCalibrator::default();
        cal.reset(0.0, 0.0, 1.0);
        assert_eq!(cal.time(2.0), 2.0);

        // Observed far behind: the model snaps back, the reported time holds.
        cal.correct(2.0, 1.0, 1.0);
        assert_eq!(cal.predict(2.0), 1.0);
        assert_eq!(cal.error_average(), 0.0);
        assert_eq!(cal.time(2.5), 2.0);
        assert!((cal.time(3.5) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn correction_factors_follow_error_bands() {
        assert_eq!(correction_factor(0.0, 0.0), 1.0);
        assert_eq!(correction_factor(0.02, 0.02), 1.03);
        assert_eq!(correction_factor(0.1, 0.1), 1.2);
        assert_eq!(correction_factor(0.3, 0.2), 1.5);
        assert_eq!(correction_factor(0.3, 0.0), 1.0);
        assert_eq!(correction_factor(-0.02, -0.02), 0.98);
    }
}
