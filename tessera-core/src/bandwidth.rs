//! Measured link throughput.
//!
//! A connection records every packet it writes. Peers that were not
//! configured with a bandwidth are judged by this measurement when the
//! transmitter decides between raw and compressed pixel payloads.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default span of writes the estimate is averaged over.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Write {
    at: Instant,
    bytes: u64,
}

/// Throughput over a sliding time window.
#[derive(Debug)]
pub struct BandwidthEstimator {
    writes: VecDeque<Write>,
    window: Duration,
    /// Sum of `writes[..].bytes`.
    in_window: u64,
}

impl BandwidthEstimator {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            writes: VecDeque::new(),
            window,
            in_window: 0,
        }
    }

    /// `bytes` were just written.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, at: Instant, bytes: u64) {
        self.writes.push_back(Write { at, bytes });
        self.in_window += bytes;
        while let Some(oldest) = self.writes.front().copied() {
            if at.saturating_duration_since(oldest.at) <= self.window {
                break;
            }
            self.writes.pop_front();
            self.in_window -= oldest.bytes;
        }
    }

    /// Bytes per second between the oldest and newest write in the
    /// window. `0` until something was written.
    pub fn estimate_bps(&self) -> u64 {
        let (Some(first), Some(last)) = (self.writes.front(), self.writes.back()) else {
            return 0;
        };
        let span = last
            .at
            .saturating_duration_since(first.at)
            .max(Duration::from_millis(1));
        (self.in_window as f64 / span.as_secs_f64()) as u64
    }

    /// Estimate in KiB/s, the unit link bandwidths are configured in.
    pub fn estimate_kibps(&self) -> u64 {
        self.estimate_bps() / 1024
    }

    /// Writes currently inside the window.
    pub fn sample_count(&self) -> usize {
        self.writes.len()
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_written_is_unknown() {
        let est = BandwidthEstimator::new();
        assert_eq!(est.estimate_bps(), 0);
        assert_eq!(est.estimate_kibps(), 0);
    }

    #[test]
    fn rate_over_one_second() {
        let mut est = BandwidthEstimator::with_window(Duration::from_secs(5));
        let t0 = Instant::now();
        est.record_at(t0, 1024 * 1024);
        est.record_at(t0 + Duration::from_secs(1), 1024 * 1024);
        assert_eq!(est.estimate_kibps(), 2048);
    }

    #[test]
    fn old_writes_leave_the_window() {
        let mut est = BandwidthEstimator::with_window(Duration::from_millis(500));
        let t0 = Instant::now();
        est.record_at(t0, 1000);
        est.record_at(t0 + Duration::from_secs(1), 500);
        assert_eq!(est.sample_count(), 1);
        // A single write spans the 1 ms floor.
        assert_eq!(est.estimate_bps(), 500_000);
    }
}
