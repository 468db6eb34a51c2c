//! Configuration for the compositing node.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use tessera_core::compressor::{
    COMPRESSOR_AUTO, COMPRESSOR_NONE, COMPRESSOR_ZSTD, COMPRESSOR_ZSTD_NO_ALPHA,
};
use tessera_core::roi::{EmptySpaceFinder, RoiFinder, RoiTracker};
use tessera_core::{Buffer, Buffers, ConnectionInfo, FrameData, TesseraError, Viewport};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity and role.
    pub node: NodeSection,
    /// Listener and peers.
    pub network: NetworkConfig,
    /// Output frame produced by a source.
    pub frame: FrameConfig,
    /// How a sink merges its inputs.
    pub compositing: CompositingConfig,
    /// Region-of-interest restriction on a source.
    pub roi: RoiConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// What a node does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Renders tiles and ships them to the peers.
    Source,
    /// Receives tiles and composites them.
    #[default]
    Sink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Also the id of the frame data this node produces.
    pub id: u64,
    pub role: NodeRole,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP port a sink listens on.
    pub listen_port: u16,
    /// Destinations of a source.
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// `host:port` of the sink.
    pub address: String,
    /// Advertised link bandwidth in KiB/s, 0 to measure.
    pub bandwidth: u64,
    /// Serialize images from concurrent transmitters on this link.
    pub ordered: bool,
}

/// Output frame settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    /// Any of `"color"`, `"depth"`.
    pub buffers: Vec<String>,
    /// Whether alpha carries information.
    pub alpha: bool,
    pub color_quality: f32,
    pub depth_quality: f32,
    /// `"auto"`, `"none"`, `"zstd"` or `"zstd-no-alpha"`.
    pub color_compressor: String,
    pub depth_compressor: String,
    /// Time between frames on a source.
    pub interval_ms: u64,
    /// Frames a source produces, 0 runs until stopped.
    pub count: u32,
}

/// Compositing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositingConfig {
    /// Wait bound for inputs in milliseconds, 0 waits forever.
    pub input_timeout_ms: u64,
    /// Back-to-front alpha blending instead of depth compositing.
    pub blend: bool,
    /// Inputs per output frame.
    pub inputs: usize,
    /// Jitter samples averaged per output frame.
    pub sub_pixels: u32,
}

/// Region-of-interest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiConfig {
    pub enabled: bool,
    /// Smallest hole, in 16x16 cells, worth cutting out.
    pub min_cells: u32,
    /// Smallest hole relative to the whole image.
    pub min_ratio: f32,
    /// Upper bound of frames skipped after ROI did not pay off.
    pub max_skip: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: 1,
            role: NodeRole::Sink,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 7440,
            peers: vec![PeerConfig::default()],
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7440".into(),
            bandwidth: 0,
            ordered: true,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 640,
            height: 480,
            buffers: vec!["color".into(), "depth".into()],
            alpha: true,
            color_quality: 1.0,
            depth_quality: 1.0,
            color_compressor: "auto".into(),
            depth_compressor: "auto".into(),
            interval_ms: 33,
            count: 0,
        }
    }
}

impl Default for CompositingConfig {
    fn default() -> Self {
        Self {
            input_timeout_ms: 1000,
            blend: false,
            inputs: 1,
            sub_pixels: 1,
        }
    }
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_cells: tessera_core::roi::empty::DEFAULT_MIN_CELLS,
            min_ratio: tessera_core::roi::empty::DEFAULT_MIN_RATIO,
            max_skip: tessera_core::roi::tracker::DEFAULT_MAX_DELAY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    // ── Conversions ──────────────────────────────────────────────

    /// Output viewport; receivers only accept non-negative origins.
    pub fn to_viewport(&self) -> Viewport {
        let f = &self.frame;
        Viewport::new(f.x.max(0), f.y.max(0), f.width.max(0), f.height.max(0))
    }

    /// Enabled buffers; unknown names are skipped with a warning.
    pub fn to_buffers(&self) -> Buffers {
        self.frame
            .buffers
            .iter()
            .fold(Buffers::empty(), |acc, name| match name.as_str() {
                "color" => acc | Buffers::COLOR,
                "depth" => acc | Buffers::DEPTH,
                other => {
                    tracing::warn!("unknown buffer {other:?} in [frame] buffers");
                    acc
                }
            })
    }

    /// Apply the `[frame]` settings to a source frame data.
    pub fn apply_frame(&self, frame_data: &FrameData) -> Result<(), TesseraError> {
        frame_data.set_viewport(self.to_viewport());
        frame_data.set_buffers(self.to_buffers());
        frame_data.set_alpha_usage(self.frame.alpha);
        frame_data.set_quality(Buffer::Color, self.frame.color_quality);
        frame_data.set_quality(Buffer::Depth, self.frame.depth_quality);
        frame_data.use_compressor(Buffer::Color, compressor_name(&self.frame.color_compressor)?);
        frame_data.use_compressor(Buffer::Depth, compressor_name(&self.frame.depth_compressor)?);
        Ok(())
    }

    /// Never zero.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame.interval_ms.max(1))
    }

    /// `None` waits for inputs forever.
    pub fn input_timeout(&self) -> Option<Duration> {
        match self.compositing.input_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// The ROI finder for a source, if enabled.
    pub fn to_roi_finder(&self) -> Option<RoiFinder> {
        if !self.roi.enabled {
            return None;
        }
        let empty = EmptySpaceFinder::new(self.roi.min_cells, self.roi.min_ratio);
        Some(RoiFinder::new(empty, RoiTracker::new(self.roi.max_skip)))
    }
}

impl PeerConfig {
    pub fn to_connection_info(&self) -> Result<ConnectionInfo, TesseraError> {
        let (host, port) = self
            .address
            .rsplit_once(':')
            .ok_or_else(|| TesseraError::Other(format!("peer address {:?} lacks a port", self.address)))?;
        let port = port
            .parse()
            .map_err(|e| TesseraError::Other(format!("peer address {:?}: {e}", self.address)))?;
        Ok(ConnectionInfo::new(host, port))
    }
}

/// Resolve a configured compressor name.
pub fn compressor_name(name: &str) -> Result<u32, TesseraError> {
    match name {
        "auto" => Ok(COMPRESSOR_AUTO),
        "none" => Ok(COMPRESSOR_NONE),
        "zstd" => Ok(COMPRESSOR_ZSTD),
        "zstd-no-alpha" => Ok(COMPRESSOR_ZSTD_NO_ALPHA),
        other => Err(TesseraError::Other(format!("unknown compressor {other:?}"))),
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = NodeConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("listen_port"));
        assert!(text.contains("[compositing]"));
        assert!(text.contains("role = \"sink\""));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = NodeConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.listen_port, 7440);
        assert_eq!(parsed.network.peers, cfg.network.peers);
        assert_eq!(parsed.frame.width, 640);
    }

    #[test]
    fn written_default_loads_back() {
        let path = std::env::temp_dir().join(format!("tessera-node-{}.toml", std::process::id()));
        NodeConfig::write_default(&path).unwrap();
        let loaded = NodeConfig::load(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.node.role, NodeRole::Sink);
        assert_eq!(loaded.frame.buffers, NodeConfig::default().frame.buffers);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: NodeConfig = toml::from_str("[node]\nrole = \"source\"\n").unwrap();
        assert_eq!(parsed.node.role, NodeRole::Source);
        assert_eq!(parsed.compositing.inputs, 1);
    }

    #[test]
    fn conversions() {
        let mut cfg = NodeConfig::default();
        assert_eq!(cfg.to_buffers(), Buffers::COLOR | Buffers::DEPTH);
        assert_eq!(cfg.to_viewport(), Viewport::new(0, 0, 640, 480));
        assert_eq!(cfg.input_timeout(), Some(Duration::from_millis(1000)));
        assert!(cfg.to_roi_finder().is_none());

        cfg.frame.x = -5;
        assert_eq!(cfg.to_viewport(), Viewport::new(0, 0, 640, 480));
        cfg.frame.buffers = vec!["color".into(), "stencil".into()];
        cfg.compositing.input_timeout_ms = 0;
        cfg.roi.enabled = true;
        assert_eq!(cfg.to_buffers(), Buffers::COLOR);
        assert_eq!(cfg.input_timeout(), None);
        assert!(cfg.to_roi_finder().is_some());
    }

    #[test]
    fn peer_address_parsing() {
        let peer = PeerConfig {
            address: "10.1.2.3:9000".into(),
            ..PeerConfig::default()
        };
        let info = assert_ok!(peer.to_connection_info());
        assert_eq!(info.ip(), "10.1.2.3");
        assert_eq!(info.port(), 9000);

        let bad = PeerConfig {
            address: "nowhere".into(),
            ..PeerConfig::default()
        };
        assert_err!(bad.to_connection_info());
    }

    #[test]
    fn compressor_names() {
        assert_eq!(assert_ok!(compressor_name("auto")), COMPRESSOR_AUTO);
        assert_eq!(assert_ok!(compressor_name("none")), COMPRESSOR_NONE);
        assert_err!(compressor_name("lz4"));
    }
}
