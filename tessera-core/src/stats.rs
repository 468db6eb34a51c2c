//! Per-phase timing samples for an external telemetry collector.
//!
//! Wrap a phase in a [`StatEvent`]; the sample is handed to the
//! [`StatisticsHook`] when the event is dropped.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Statistic {
    Readback,
    Compress,
    Transmit,
    WaitSendToken,
    Decompress,
    WaitReady,
    Assemble,
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Statistic::Readback => "readback",
            Statistic::Compress => "compress",
            Statistic::Transmit => "transmit",
            Statistic::WaitSendToken => "wait-send-token",
            Statistic::Decompress => "decompress",
            Statistic::WaitReady => "wait-ready",
            Statistic::Assemble => "assemble",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatSample {
    pub kind: Statistic,
    pub frame_number: u32,
    pub duration: Duration,
    /// Uncompressed bytes handled, zero when not applicable.
    pub raw_bytes: u64,
    /// Bytes after compression, zero when not applicable.
    pub sent_bytes: u64,
}

impl StatSample {
    /// Compression ratio, `1.0` when nothing was measured.
    pub fn ratio(&self) -> f32 {
        if self.raw_bytes == 0 || self.sent_bytes == 0 {
            1.0
        } else {
            self.sent_bytes as f32 / self.raw_bytes as f32
        }
    }
}

pub trait StatisticsHook: Send + Sync {
    fn record(&self, sample: &StatSample);
}

/// Discards every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatistics;

impl StatisticsHook for NullStatistics {
    fn record(&self, _sample: &StatSample) {}
}

/// Emits every sample as a `trace` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatistics;

impl StatisticsHook for TracingStatistics {
    fn record(&self, sample: &StatSample) {
        trace!(
            kind = %sample.kind,
            frame = sample.frame_number,
            micros = sample.duration.as_micros() as u64,
            raw = sample.raw_bytes,
            sent = sample.sent_bytes,
            "stat"
        );
    }
}

// ── StatEvent ────────────────────────────────────────────────────

/// Scoped measurement of one phase.
pub struct StatEvent<'a> {
    hook: &'a dyn StatisticsHook,
    kind: Statistic,
    frame_number: u32,
    start: Instant,
    raw_bytes: u64,
    sent_bytes: u64,
}

impl<'a> StatEvent<'a> {
    pub fn start(hook: &'a dyn StatisticsHook, kind: Statistic, frame_number: u32) -> Self {
        Self {
            hook,
            kind,
            frame_number,
            start: Instant::now(),
            raw_bytes: 0,
            sent_bytes: 0,
        }
    }

    pub fn add_bytes(&mut self, raw: u64, sent: u64) {
        self.raw_bytes += raw;
        self.sent_bytes += sent;
    }
}

impl Drop for StatEvent<'_> {
    fn drop(&mut self) {
        self.hook.record(&StatSample {
            kind: self.kind,
            frame_number: self.frame_number,
            duration: self.start.elapsed(),
            raw_bytes: self.raw_bytes,
            sent_bytes: self.sent_bytes,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<StatSample>>);

    impl StatisticsHook for Collect {
        fn record(&self, sample: &StatSample) {
            self.0.lock().unwrap().push(*sample);
        }
    }

    #[test]
    fn event_records_on_drop() {
        let hook = Collect::default();
        {
            let mut event = StatEvent::start(&hook, Statistic::Compress, 42);
            event.add_bytes(1000, 250);
        }
        let samples = hook.0.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].kind, Statistic::Compress);
        assert_eq!(samples[0].frame_number, 42);
        assert_eq!(samples[0].ratio(), 0.25);
    }
}
