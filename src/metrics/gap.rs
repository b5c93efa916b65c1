//! PTS-gap drop estimation
//!
//! Best-effort heuristic: when consecutive video packets are further apart
//! than one nominal frame duration, the frames that should have been between
//! them are counted as missing. Cameras that vary their frame rate, or whose
//! firmware reports its own loss statistics, will disagree with this number.

use ffmpeg_next::Rational;

/// Gaps longer than this are treated as discontinuities, not loss
pub const MAX_GAP_SECS: f64 = 3.0;
/// Upper bound on frames attributed to a single gap
pub const MAX_MISSING_PER_GAP: u64 = 120;

/// Estimates missing frames from packet timestamp gaps
#[derive(Debug, Clone)]
pub struct GapEstimator {
    /// Seconds per timestamp tick
    tick_secs: f64,
    /// Nominal seconds per frame, when the stream advertises a rate
    frame_secs: Option<f64>,
    last_ts: Option<i64>,
}

impl GapEstimator {
    /// `time_base` is the stream's time base, `frame_rate` its nominal rate
    /// (average or real base rate; zero or invalid disables estimation).
    pub fn new(time_base: Rational, frame_rate: Rational) -> Self {
        let tick_secs = if time_base.denominator() != 0 {
            f64::from(time_base)
        } else {
            0.0
        };
        let frame_secs = (frame_rate.numerator() > 0 && frame_rate.denominator() > 0)
            .then(|| frame_rate.denominator() as f64 / frame_rate.numerator() as f64);

        Self {
            tick_secs,
            frame_secs,
            last_ts: None,
        }
    }

    /// Whether the stream advertised a usable frame rate
    pub fn is_active(&self) -> bool {
        self.frame_secs.is_some() && self.tick_secs > 0.0
    }

    /// Observe one video packet; returns the number of frames estimated
    /// missing between it and the previous one.
    pub fn observe(&mut self, pts: Option<i64>, dts: Option<i64>) -> u64 {
        let Some(ts) = pts.or(dts) else {
            return 0;
        };
        let Some(prev) = self.last_ts.replace(ts) else {
            return 0;
        };

        let delta = ts.saturating_sub(prev);
        if delta <= 0 {
            return 0;
        }
        let elapsed = delta as f64 * self.tick_secs;
        if elapsed <= 0.0 || elapsed > MAX_GAP_SECS {
            return 0;
        }
        let Some(frame_secs) = self.frame_secs else {
            return 0;
        };

        let expected = (elapsed / frame_secs).round();
        if expected <= 1.0 {
            return 0;
        }
        ((expected as u64) - 1).min(MAX_MISSING_PER_GAP)
    }

    /// Forget the previous timestamp (e.g. after a discontinuity)
    pub fn reset(&mut self) {
        self.last_ts = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator_25fps() -> GapEstimator {
        GapEstimator::new(Rational::new(1, 90000), Rational::new(25, 1))
    }

    #[test]
    fn test_regular_cadence_has_no_drops() {
        let mut est = estimator_25fps();
        let mut total = 0;
        for i in 0..50 {
            total += est.observe(Some(i * 3600), None);
        }
        assert_eq!(total, 0);
    }

    #[test]
    fn test_gap_of_three_frames_adds_two() {
        let mut est = estimator_25fps();
        assert_eq!(est.observe(Some(0), None), 0);
        assert_eq!(est.observe(Some(3600), None), 0);
        assert_eq!(est.observe(Some(3600 + 3 * 3600), None), 2);
    }

    #[test]
    fn test_gap_beyond_three_seconds_is_discontinuity() {
        let mut est = estimator_25fps();
        est.observe(Some(0), None);
        assert_eq!(est.observe(Some(90000 * 3 + 1), None), 0);
        // exactly three seconds still counts
        let mut est = estimator_25fps();
        est.observe(Some(0), None);
        assert_eq!(est.observe(Some(90000 * 3), None), 74);
    }

    #[test]
    fn test_clamped_per_gap() {
        let mut est = GapEstimator::new(Rational::new(1, 1000), Rational::new(120, 1));
        est.observe(Some(0), None);
        // 2.5 s at 120 fps = 300 frames expected
        assert_eq!(est.observe(Some(2500), None), MAX_MISSING_PER_GAP);
    }

    #[test]
    fn test_falls_back_to_dts_and_ignores_backwards() {
        let mut est = estimator_25fps();
        est.observe(None, Some(0));
        assert_eq!(est.observe(None, Some(3 * 3600)), 2);
        assert_eq!(est.observe(Some(0), None), 0);
        assert_eq!(est.observe(None, None), 0);
    }

    #[test]
    fn test_unknown_frame_rate_disables() {
        let mut est = GapEstimator::new(Rational::new(1, 90000), Rational::new(0, 1));
        assert!(!est.is_active());
        est.observe(Some(0), None);
        assert_eq!(est.observe(Some(90000), None), 0);
    }

    #[test]
    fn test_reset_forgets_previous() {
        let mut est = estimator_25fps();
        est.observe(Some(0), None);
        est.reset();
        assert_eq!(est.observe(Some(5 * 3600), None), 0);
    }
}
