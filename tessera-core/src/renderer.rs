//! The pixel-producing collaborator.
//!
//! A [`Renderer`] reads pixels back from whatever surface it draws to.
//! Readbacks either complete immediately or hand out a
//! [`ReadbackHandle`] that is finished later on the transfer worker.

use crate::error::TesseraError;
use crate::pixel::PixelData;
use crate::types::{Buffer, Buffers, Viewport, Zoom};

/// Opaque id of an outstanding asynchronous readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadbackHandle(pub u64);

/// Opaque GPU texture id for images kept in texture storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Result of starting a readback.
#[derive(Debug)]
pub enum Readback {
    /// Pixels for every requested buffer are available now.
    Complete(Vec<(Buffer, PixelData)>),
    /// The transfer is still running.
    Pending(ReadbackHandle),
}

pub trait Renderer: Send + Sync {
    /// Start copying `buffers` of `viewport` into host memory.
    fn begin_async_readback(
        &self,
        buffers: Buffers,
        viewport: Viewport,
        zoom: Zoom,
    ) -> Result<Readback, TesseraError>;

    /// Block until the readback behind `handle` is done.
    fn finish_async_readback(
        &self,
        handle: ReadbackHandle,
    ) -> Result<Vec<(Buffer, PixelData)>, TesseraError>;
}
