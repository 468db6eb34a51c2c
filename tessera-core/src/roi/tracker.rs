//! Per-region backoff for the ROI analysis.
//!
//! When splitting a viewport barely reduces the transmitted area the
//! analysis is pure overhead. The tracker then skips it for a number of
//! frames, doubling the skip after each unprofitable run up to a bound,
//! and resets once a run pays off again.

use std::collections::HashMap;

use tracing::debug;

use crate::types::Viewport;

/// Default upper bound on skipped frames.
pub const DEFAULT_MAX_DELAY: u32 = 16;

/// Regions covering more than this share of the viewport did not pay off.
const PAYOFF_RATIO: f32 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Key {
    pvp: Viewport,
    stage: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    /// Frame the last decision was taken for.
    frame_id: Option<u64>,
    /// Whether that frame runs the analysis.
    analyse: bool,
    /// Skip length applied after the next unprofitable run.
    delay: u32,
    /// Frames left to skip.
    skip: u32,
}

/// Permission to run the analysis once; hand it back to
/// [`RoiTracker::update_delay`] with the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiTicket {
    key: Key,
}

#[derive(Debug)]
pub struct RoiTracker {
    max_delay: u32,
    entries: HashMap<Key, Entry>,
}

impl Default for RoiTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELAY)
    }
}

impl RoiTracker {
    pub fn new(max_delay: u32) -> Self {
        Self {
            max_delay,
            entries: HashMap::new(),
        }
    }

    /// Decide whether frame `frame_id` analyses `pvp` at `stage`. Asking
    /// again for the same frame repeats the earlier decision.
    pub fn use_roi(&mut self, pvp: Viewport, stage: u32, frame_id: u64) -> Option<RoiTicket> {
        let key = Key { pvp, stage };
        let entry = self.entries.entry(key).or_default();

        if entry.frame_id != Some(frame_id) {
            entry.frame_id = Some(frame_id);
            entry.analyse = if entry.skip > 0 {
                entry.skip -= 1;
                false
            } else {
                true
            };
        }
        entry.analyse.then_some(RoiTicket { key })
    }

    /// Record the result of an analysis run.
    pub fn update_delay(&mut self, ticket: RoiTicket, regions: &[Viewport]) {
        let total = ticket.key.pvp.area();
        let covered: usize = regions.iter().map(Viewport::area).sum();
        let Some(entry) = self.entries.get_mut(&ticket.key) else {
            return;
        };

        if total > 0 && covered as f32 > PAYOFF_RATIO * total as f32 {
            entry.delay = (entry.delay * 2).clamp(1, self.max_delay.max(1));
            entry.skip = entry.delay.min(self.max_delay);
            debug!(
                pvp = %ticket.key.pvp,
                stage = ticket.key.stage,
                skip = entry.skip,
                "roi did not pay off, backing off"
            );
        } else {
            entry.delay = 0;
            entry.skip = 0;
        }
    }

    /// Frames still to skip for `pvp` at `stage`.
    pub fn pending_skip(&self, pvp: Viewport, stage: u32) -> u32 {
        self.entries
            .get(&Key { pvp, stage })
            .map_or(0, |e| e.skip)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const PVP: Viewport = Viewport::new(0, 0, 100, 100);

    fn run(tracker: &mut RoiTracker, frame: u64, covered: Viewport) -> bool {
        match tracker.use_roi(PVP, 0, frame) {
            Some(ticket) => {
                tracker.update_delay(ticket, &[covered]);
                true
            }
            None => false,
        }
    }

    #[test]
    fn unprofitable_runs_double_the_skip() {
        let mut tracker = RoiTracker::new(4);
        let mut analysed = Vec::new();
        for frame in 0..12 {
            analysed.push(run(&mut tracker, frame, PVP));
        }
        // skip 1, then 2, then 4 (bounded).
        let expected = [
            true, false, true, false, false, true, false, false, false, false, true, false,
        ];
        assert_eq!(analysed, expected);
    }

    #[test]
    fn useful_run_resets_delay() {
        let mut tracker = RoiTracker::default();
        assert!(run(&mut tracker, 0, PVP));
        assert_eq!(tracker.pending_skip(PVP, 0), 1);
        assert!(!run(&mut tracker, 1, PVP));
        assert!(run(&mut tracker, 2, Viewport::new(0, 0, 10, 10)));
        assert_eq!(tracker.pending_skip(PVP, 0), 0);
        assert!(run(&mut tracker, 3, PVP));
        assert_eq!(tracker.pending_skip(PVP, 0), 1);
    }

    #[test]
    fn same_frame_repeats_decision() {
        let mut tracker = RoiTracker::default();
        let first = tracker.use_roi(PVP, 1, 7);
        let second = tracker.use_roi(PVP, 1, 7);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn stages_are_tracked_separately() {
        let mut tracker = RoiTracker::default();
        assert!(run(&mut tracker, 0, PVP));
        assert!(tracker.use_roi(PVP, 0, 1).is_none());
        assert!(tracker.use_roi(PVP, 1, 1).is_some());
    }
}
