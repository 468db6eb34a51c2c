//! Link properties steering the compression decision.

/// Links at or below this bandwidth (KiB/s) get compressed payloads.
pub const COMPRESSION_THRESHOLD: u64 = 262_144;

/// What a sender knows about the link to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkInfo {
    /// Bandwidth estimate in KiB/s. `0` means unknown.
    pub bandwidth: u64,
}

impl LinkInfo {
    pub const fn new(bandwidth: u64) -> Self {
        Self { bandwidth }
    }

    /// Whether payloads sent over this link should be compressed.
    /// Unknown links are treated as slow.
    pub fn should_compress(&self) -> bool {
        self.bandwidth <= COMPRESSION_THRESHOLD
    }
}
