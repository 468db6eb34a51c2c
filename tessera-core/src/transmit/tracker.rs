//! Outstanding-work counters per output frame.
//!
//! The scheduling layer needs to know when every readback, transmission
//! and ready signal queued for a frame has completed. Work calls
//! [`FrameTracker::begin`] when queued and [`FrameTracker::end`] when
//! done; callbacks registered with [`FrameTracker::on_frame_finished`]
//! run when a frame's counter returns to zero.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use tracing::{trace, warn};

type FrameFinishedCallback = Box<dyn Fn(u32) + Send + Sync + 'static>;

#[derive(Default)]
pub struct FrameTracker {
    outstanding: Mutex<HashMap<u32, usize>>,
    finished_callbacks: RwLock<Vec<FrameFinishedCallback>>,
}

impl FrameTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// One more unit of work for `frame`.
    pub fn begin(&self, frame: u32) {
        let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        *outstanding.entry(frame).or_insert(0) += 1;
    }

    /// One unit of work for `frame` completed.
    pub fn end(&self, frame: u32) {
        let finished = {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
            match outstanding.get_mut(&frame) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    outstanding.remove(&frame);
                    true
                }
                None => {
                    warn!(frame, "work finished for a frame without outstanding work");
                    false
                }
            }
        };
        if finished {
            trace!(frame, "frame work finished");
            let callbacks = self.finished_callbacks.read().unwrap_or_else(PoisonError::into_inner);
            for callback in callbacks.iter() {
                callback(frame);
            }
        }
    }

    /// Work still outstanding for `frame`.
    pub fn outstanding(&self, frame: u32) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&frame)
            .copied()
            .unwrap_or(0)
    }

    pub fn on_frame_finished<F>(&self, f: F)
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.finished_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(f));
    }
}

impl std::fmt::Debug for FrameTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outstanding = self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("FrameTracker")
            .field("outstanding", &*outstanding)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn callback_fires_once_when_counter_drains() {
        let tracker = FrameTracker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tracker.on_frame_finished(move |frame| sink.lock().unwrap().push(frame));

        tracker.begin(1);
        tracker.begin(1);
        tracker.begin(2);
        tracker.end(1);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(tracker.outstanding(1), 1);

        tracker.end(2);
        tracker.end(1);
        assert_eq!(*seen.lock().unwrap(), vec![2, 1]);
        assert_eq!(tracker.outstanding(1), 0);
    }

    #[test]
    fn unmatched_end_is_ignored() {
        let tracker = FrameTracker::new();
        let fired = Arc::new(Mutex::new(0));
        let count = Arc::clone(&fired);
        tracker.on_frame_finished(move |_| *count.lock().unwrap() += 1);
        tracker.end(9);
        assert_eq!(*fired.lock().unwrap(), 0);
    }
}
