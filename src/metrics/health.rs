//! Derived per-interval health snapshot

use std::time::Duration;

use serde::Serialize;

use super::Counters;

/// Drop share above which the health score loses one step
pub const DROP_PENALTY_PCT: f64 = 10.0;
/// Upper clamp for CPU percent (multi-threaded decode may exceed 100)
pub const MAX_CPU_PCT: f64 = 400.0;

/// Values shown by the presentation layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub drops_pct: f64,
    pub cpu_pct: f64,
    /// 0 (stalled) to 5 (healthy)
    pub health: u8,
}

/// Map an interval's FPS and drop share to a 0-5 score
pub fn health_score(fps: f64, drops_pct: f64) -> u8 {
    let score: u8 = if fps >= 24.0 {
        5
    } else if fps >= 15.0 {
        4
    } else if fps >= 5.0 {
        3
    } else if fps > 0.0 {
        2
    } else {
        0
    };

    if drops_pct > DROP_PENALTY_PCT {
        score.saturating_sub(1)
    } else {
        score
    }
}

/// Compute a snapshot from counter deltas over `elapsed`
pub fn compute_snapshot(delta: &Counters, elapsed: Duration) -> MetricsSnapshot {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return MetricsSnapshot::default();
    }

    let fps = delta.frames as f64 / secs;
    let bitrate_kbps = delta.bytes as f64 * 8.0 / secs / 1000.0;

    let dropped = delta.missing + delta.decode_errors;
    let drops_pct = if delta.frames + dropped > 0 {
        (dropped as f64 * 100.0 / (delta.frames + dropped) as f64).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let wall_ns = elapsed.as_nanos() as f64;
    let cpu_pct = (delta.busy_ns as f64 / wall_ns * 100.0).clamp(0.0, MAX_CPU_PCT);

    MetricsSnapshot {
        fps,
        bitrate_kbps,
        drops_pct,
        cpu_pct,
        health: health_score(fps, drops_pct),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_mapping() {
        let fps = [30.0, 20.0, 10.0, 1.0, 0.0];
        let clean = [5, 4, 3, 2, 0];
        let penalised = [4, 3, 2, 1, 0];
        for i in 0..fps.len() {
            assert_eq!(health_score(fps[i], 0.0), clean[i], "fps {}", fps[i]);
            assert_eq!(health_score(fps[i], 12.5), penalised[i], "fps {}", fps[i]);
        }
    }

    #[test]
    fn test_health_boundaries() {
        assert_eq!(health_score(24.0, 0.0), 5);
        assert_eq!(health_score(23.9, 0.0), 4);
        assert_eq!(health_score(15.0, 0.0), 4);
        assert_eq!(health_score(5.0, 0.0), 3);
        assert_eq!(health_score(0.1, 0.0), 2);
        assert_eq!(health_score(30.0, 10.0), 5);
    }

    #[test]
    fn test_compute_snapshot() {
        let delta = Counters {
            frames: 25,
            bytes: 250_000,
            missing: 0,
            decode_errors: 0,
            busy_ns: 150_000_000,
        };
        let snap = compute_snapshot(&delta, Duration::from_secs(1));
        assert_eq!(snap.fps, 25.0);
        assert_eq!(snap.bitrate_kbps, 2000.0);
        assert_eq!(snap.drops_pct, 0.0);
        assert!((snap.cpu_pct - 15.0).abs() < 1e-9);
        assert_eq!(snap.health, 5);
    }

    #[test]
    fn test_drops_and_cpu_clamp() {
        let delta = Counters {
            frames: 18,
            bytes: 0,
            missing: 1,
            decode_errors: 1,
            busy_ns: 9_000_000_000,
        };
        let snap = compute_snapshot(&delta, Duration::from_secs(2));
        assert_eq!(snap.fps, 9.0);
        assert!((snap.drops_pct - 10.0).abs() < 1e-9);
        assert_eq!(snap.cpu_pct, MAX_CPU_PCT);
        assert_eq!(snap.health, 3);
    }

    #[test]
    fn test_zero_interval() {
        let snap = compute_snapshot(&Counters::default(), Duration::ZERO);
        assert_eq!(snap, MetricsSnapshot::default());
    }
}
