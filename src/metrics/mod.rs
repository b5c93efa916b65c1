//! Stream health metrics
//!
//! The decode thread bumps atomic counters; a ~1 Hz sampler on the
//! presentation side turns counter deltas into a [`MetricsSnapshot`].
//! Only the snapshot is meant for display.

pub mod gap;
pub mod health;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub use gap::GapEstimator;
pub use health::{compute_snapshot, health_score, MetricsSnapshot};

/// Share of packet-processing wall time counted as busy decoder plumbing
pub const PACKET_BUSY_SHARE: f64 = 0.10;

/// Plain copy of the cumulative counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub frames: u64,
    pub bytes: u64,
    pub missing: u64,
    pub decode_errors: u64,
    pub busy_ns: u64,
}

impl Counters {
    /// Per-field difference, clamping counter resets to zero
    pub fn delta_since(&self, earlier: &Counters) -> Counters {
        Counters {
            frames: self.frames.saturating_sub(earlier.frames),
            bytes: self.bytes.saturating_sub(earlier.bytes),
            missing: self.missing.saturating_sub(earlier.missing),
            decode_errors: self.decode_errors.saturating_sub(earlier.decode_errors),
            busy_ns: self.busy_ns.saturating_sub(earlier.busy_ns),
        }
    }
}

/// Cumulative per-camera counters shared with the decode thread
#[derive(Debug, Default)]
pub struct StreamMetrics {
    frames: AtomicU64,
    bytes: AtomicU64,
    missing: AtomicU64,
    decode_errors: AtomicU64,
    busy_ns: AtomicU64,
    last_progress: Mutex<Option<Instant>>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one decoded and published frame, marking progress
    pub fn record_frame(&self, now: Instant) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        *self.last_progress.lock() = Some(now);
    }

    pub fn record_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_missing(&self, frames: u64) {
        if frames > 0 {
            self.missing.fetch_add(frames, Ordering::Relaxed);
        }
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy(&self, busy: Duration) {
        self.busy_ns
            .fetch_add(busy.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    /// Busy accounting for one processed packet: measured conversion/copy
    /// time plus a fixed share of the packet's total wall time.
    pub fn record_packet_busy(&self, measured: Duration, packet_wall: Duration) {
        self.record_busy(measured + packet_wall.mul_f64(PACKET_BUSY_SHARE));
    }

    /// When a frame was last published
    pub fn last_progress(&self) -> Option<Instant> {
        *self.last_progress.lock()
    }

    pub fn counters(&self) -> Counters {
        Counters {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            busy_ns: self.busy_ns.load(Ordering::Relaxed),
        }
    }
}

/// Turns counter deltas into snapshots; owned by the sampling side
#[derive(Debug, Clone)]
pub struct MetricsSampler {
    last: Counters,
    last_at: Instant,
}

impl MetricsSampler {
    pub fn new(metrics: &StreamMetrics) -> Self {
        Self::starting_at(metrics.counters(), Instant::now())
    }

    pub fn starting_at(counters: Counters, at: Instant) -> Self {
        Self {
            last: counters,
            last_at: at,
        }
    }

    /// Sample now
    pub fn sample(&mut self, metrics: &StreamMetrics) -> MetricsSnapshot {
        self.sample_at(metrics.counters(), Instant::now())
    }

    pub fn sample_at(&mut self, counters: Counters, now: Instant) -> MetricsSnapshot {
        let elapsed = now.saturating_duration_since(self.last_at);
        if elapsed.is_zero() {
            return MetricsSnapshot::default();
        }
        let delta = counters.delta_since(&self.last);
        self.last = counters;
        self.last_at = now;
        compute_snapshot(&delta, elapsed)
    }
}
