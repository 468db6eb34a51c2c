//! # tessera-core
//!
//! Core library of the tessera distributed compositing engine.
//!
//! This crate contains:
//! - **Pixel model**: `PixelData`, `Image`, `ImagePool`, format tokens and geometry types
//! - **FrameData / Frame**: versioned readiness protocol with listener monitors
//! - **Compression**: `CompressorRegistry` and the zstd-backed `BuiltinCompressors`
//! - **Compositor**: sorted, unsorted, blended and CPU-merged assembly into a `CompositeTarget`
//! - **ROI**: `RoiFinder` splitting images into regions that carry content
//! - **Transmission**: `Transmitter` pipeline (readback → compress → send → ready)
//! - **Wire protocol**: `PacketHeader`, `Packet`, `Command`, `NodeCodec`, image blocks
//! - **Network**: `Connection` for framed TCP links with heartbeat and link bandwidth
//! - **Store**: `FrameDataStore` applying received packets on the sink side
//! - **Error**: `TesseraError`, a typed `thiserror`-based error hierarchy

pub mod bandwidth;
pub mod codec;
pub mod compositor;
pub mod compressor;
pub mod error;
pub mod frame;
pub mod frame_data;
pub mod header;
pub mod image;
pub mod message;
pub mod network;
pub mod packet;
pub mod pixel;
pub mod pool;
pub mod renderer;
pub mod roi;
pub mod stats;
pub mod store;
pub mod sync;
pub mod transmit;
pub mod types;
pub mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bandwidth::BandwidthEstimator;
pub use codec::NodeCodec;
pub use compositor::{Accumulator, Canvas, CompositeTarget, Compositor, ImageOp, WaitHandle};
pub use compressor::{BuiltinCompressors, CompressorFlags, CompressorInfo, CompressorRegistry};
pub use error::TesseraError;
pub use frame::Frame;
pub use frame_data::{FrameData, FrameDataParams, FrameDataPtr};
pub use header::{HEADER_SIZE, PacketHeader};
pub use image::Image;
pub use message::Command;
pub use network::{Connection, ConnectionInfo, ConnectionSender};
pub use packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet};
pub use pixel::{CompressedData, PixelData};
pub use pool::{ImagePool, ImageRef};
pub use renderer::{Readback, ReadbackHandle, Renderer};
pub use roi::{EmptySpaceFinder, RoiFinder, RoiTracker};
pub use stats::{NullStatistics, StatEvent, Statistic, StatisticsHook, TracingStatistics};
pub use store::{Dispatched, FrameDataStore};
pub use sync::Monitor;
pub use transmit::{CompletionToken, FrameTracker, ImageSink, LinkInfo, SendToken, Transmitter};
pub use types::{
    Buffer, Buffers, DrawableConfig, ObjectVersion, Offset, Pixel, StorageType, SubPixel, Viewport,
    Zoom, ZoomFilter,
};
