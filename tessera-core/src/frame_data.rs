//! Versioned, network-replicated image containers.
//!
//! A [`FrameData`] holds the images one output produced for its current
//! version plus the shared parameters describing them. Consumers learn
//! about new versions through the readiness protocol:
//!
//! ```text
//!   producer                      FrameData                 consumer
//!   ────────                      ─────────                 ────────
//!   set_version(v) ───────────▶ version = v
//!                               ready_version < v ◀───── wait_ready / add_listener
//!   new_image / add_image ───▶ images (or pending)
//!   set_ready ────────────────▶ ready_version = v ──────▶ listeners += 1
//! ```
//!
//! Invariants:
//! - `ready_version <= version`, and both only move forward.
//! - A listener registered when the data is already ready is bumped
//!   immediately, so registration can never miss a wakeup.
//! - Images received for a version that is not ready yet wait in a
//!   pending list until that version's ready signal arrives.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::compressor::{COMPRESSOR_AUTO, CompressorRegistry};
use crate::error::TesseraError;
use crate::pool::{ImagePool, ImageRef};
use crate::renderer::Renderer;
use crate::sync::Monitor;
use crate::types::{
    Buffer, Buffers, DrawableConfig, Offset, StorageType, Viewport, Zoom, format,
};
use crate::wire;

pub type FrameDataPtr = Arc<FrameData>;

// ── FrameDataParams ──────────────────────────────────────────────

/// Parameters shared by every image of a version, replicated with the
/// ready signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameDataParams {
    pub buffers: Buffers,
    pub viewport: Viewport,
    pub zoom: Zoom,
    pub storage: StorageType,
}

impl Default for FrameDataParams {
    fn default() -> Self {
        Self {
            buffers: Buffers::COLOR,
            viewport: Viewport::default(),
            zoom: Zoom::NONE,
            storage: StorageType::Memory,
        }
    }
}

/// Local image settings applied to newly allocated images.
#[derive(Debug, Clone, Copy)]
struct ImageSettings {
    use_alpha: bool,
    quality: [f32; 2],
    compressor: [u32; 2],
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            use_alpha: true,
            quality: [1.0; 2],
            compressor: [COMPRESSOR_AUTO; 2],
        }
    }
}

#[derive(Debug, Default)]
struct State {
    params: FrameDataParams,
    settings: ImageSettings,
    version: u64,
    images: Vec<ImageRef>,
    /// Images that arrived ahead of their version's ready signal.
    pending: Vec<(u64, ImageRef)>,
    /// Highest version whose pending images were adopted.
    adopted: u64,
}

// ── FrameData ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FrameData {
    id: u64,
    state: Mutex<State>,
    ready_version: Monitor,
    listeners: Mutex<Vec<Arc<Monitor>>>,
    pool: ImagePool,
}

impl FrameData {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: Mutex::new(State::default()),
            ready_version: Monitor::new(),
            listeners: Mutex::new(Vec::new()),
            pool: ImagePool::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // ── Parameters ───────────────────────────────────────────────

    pub fn params(&self) -> FrameDataParams {
        self.lock().params.clone()
    }

    pub fn buffers(&self) -> Buffers {
        self.lock().params.buffers
    }

    pub fn set_buffers(&self, buffers: Buffers) {
        self.lock().params.buffers = buffers;
    }

    pub fn viewport(&self) -> Viewport {
        self.lock().params.viewport
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        self.lock().params.viewport = viewport;
    }

    pub fn zoom(&self) -> Zoom {
        self.lock().params.zoom
    }

    pub fn set_zoom(&self, zoom: Zoom) {
        self.lock().params.zoom = zoom;
    }

    pub fn storage_type(&self) -> StorageType {
        self.lock().params.storage
    }

    pub fn set_storage_type(&self, storage: StorageType) {
        self.lock().params.storage = storage;
    }

    pub fn set_alpha_usage(&self, use_alpha: bool) {
        self.lock().settings.use_alpha = use_alpha;
    }

    pub fn alpha_usage(&self) -> bool {
        self.lock().settings.use_alpha
    }

    pub fn set_quality(&self, buffer: Buffer, quality: f32) {
        self.lock().settings.quality[buffer.index()] = quality;
    }

    pub fn use_compressor(&self, buffer: Buffer, name: u32) {
        self.lock().settings.compressor[buffer.index()] = name;
    }

    // ── Images ───────────────────────────────────────────────────

    /// Images of the current version.
    pub fn images(&self) -> Vec<ImageRef> {
        self.lock().images.clone()
    }

    /// Allocate an image configured with the current settings and
    /// append it to the current image list.
    pub fn new_image(&self, storage: StorageType, drawable: &DrawableConfig) -> ImageRef {
        let image = self.pool.acquire();
        let settings = self.lock().settings;
        {
            let mut img = image.write();
            img.set_storage_type(storage);
            img.set_alpha_usage(settings.use_alpha);
            for buffer in Buffer::ALL {
                img.set_quality(buffer, settings.quality[buffer.index()]);
                img.use_compressor(buffer, settings.compressor[buffer.index()]);
            }
            img.set_formats(
                Buffer::Color,
                drawable.color_internal_format(),
                drawable.color_external_format(),
            );
            img.set_formats(Buffer::Depth, format::DEPTH, format::DEPTH_UNSIGNED_INT);
        }
        self.lock().images.push(image.clone());
        image
    }

    /// Move all current images into the recycle pool.
    pub fn clear(&self) {
        let images = std::mem::take(&mut self.lock().images);
        self.pool.release(images);
    }

    /// Clear, then free the recycled images' memory.
    pub fn flush(&self) {
        let pending = std::mem::take(&mut self.lock().pending);
        self.clear();
        self.pool.release(pending.into_iter().map(|(_, image)| image));
        self.pool.drain();
    }

    /// Read back every region intersecting this frame data's viewport
    /// (moved by `offset`) into new images. Returns the started images.
    pub fn start_readback(
        &self,
        offset: Offset,
        renderer: &dyn Renderer,
        drawable: &DrawableConfig,
        regions: &[Viewport],
    ) -> Result<Vec<ImageRef>, TesseraError> {
        let params = self.params();
        if params.buffers.is_empty() || !params.zoom.is_valid() {
            return Ok(Vec::new());
        }
        let absolute = params.viewport.translate(offset);
        if !absolute.has_area() {
            return Ok(Vec::new());
        }

        let mut started = Vec::new();
        for region in regions {
            let pvp = region.intersect(&absolute);
            if !pvp.has_area() {
                continue;
            }
            let image = self.new_image(params.storage, drawable);
            image
                .write()
                .start_readback(params.buffers, pvp, params.zoom, renderer)?;
            started.push(image);
        }
        debug!(id = self.id, count = started.len(), "started readback");
        Ok(started)
    }

    // ── Versioning & readiness ───────────────────────────────────

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn ready_version(&self) -> u64 {
        self.ready_version.get()
    }

    /// Advance to `version`. Moving backwards is rejected.
    pub fn set_version(&self, version: u64) -> Result<(), TesseraError> {
        let mut state = self.lock();
        if version < state.version {
            error!(id = self.id, current = state.version, version, "frame data version regression");
            return Err(TesseraError::VersionRegression {
                current: state.version,
                requested: version,
            });
        }
        state.version = version;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready_version() >= self.version()
    }

    /// Block until the current version is ready. `None` waits forever.
    /// A timeout leaves the frame data untouched.
    pub fn wait_ready(&self, timeout: Option<Duration>) -> Result<(), TesseraError> {
        let target = self.version();
        match timeout {
            None => {
                self.ready_version.wait_ge(target);
                Ok(())
            }
            Some(timeout) => {
                if self.ready_version.timed_wait_ge(target, timeout) {
                    Ok(())
                } else {
                    Err(TesseraError::TimeoutWaitingForInput { timeout })
                }
            }
        }
    }

    /// Mark the current version ready.
    pub fn set_ready(&self) {
        let version = self.version();
        self.mark_ready(version);
    }

    /// Apply a ready signal from the producing node: adopt the images
    /// received for `version`, copy `params`, then mark it ready.
    pub fn set_ready_remote(&self, version: u64, params: FrameDataParams) {
        if self.ready_version() >= version {
            debug!(id = self.id, version, "ignoring ready signal for a ready version");
            return;
        }
        let (adopted, stale) = {
            let mut state = self.lock();
            let pending = std::mem::take(&mut state.pending);
            let mut adopted = Vec::new();
            let mut stale = Vec::new();
            for (v, image) in pending {
                match v.cmp(&version) {
                    std::cmp::Ordering::Equal => adopted.push(image),
                    std::cmp::Ordering::Less => stale.push(image),
                    std::cmp::Ordering::Greater => state.pending.push((v, image)),
                }
            }
            let previous = std::mem::replace(&mut state.images, adopted);
            stale.extend(previous);
            state.params = params;
            state.adopted = state.adopted.max(version);
            if state.version < version {
                state.version = version;
            }
            (state.images.len(), stale)
        };
        if !stale.is_empty() {
            debug!(id = self.id, count = stale.len(), "recycling superseded images");
        }
        self.pool.release(stale);
        debug!(id = self.id, version, images = adopted, "remote frame data ready");
        self.mark_ready(version);
    }

    /// Register `listener`, bumping it right away if already ready.
    pub fn add_listener(&self, listener: Arc<Monitor>) {
        let mut listeners = self.lock_listeners();
        if self.ready_version() >= self.version() {
            listener.increment();
        }
        listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<Monitor>) {
        let mut listeners = self.lock_listeners();
        match listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(index) => {
                listeners.swap_remove(index);
            }
            None => warn!(id = self.id, "removing unknown frame data listener"),
        }
    }

    /// Insert an image received for `version` ahead of its ready signal.
    /// Returns `Ok(false)` when `version` is already ready.
    #[allow(clippy::too_many_arguments)]
    pub fn add_image(
        &self,
        version: u64,
        viewport: Viewport,
        zoom: Zoom,
        buffers: Buffers,
        use_alpha: bool,
        data: &Bytes,
        registry: &dyn CompressorRegistry,
    ) -> Result<bool, TesseraError> {
        if self.ready_version() >= version {
            return Ok(false);
        }
        let decoded = wire::decode_buffers(buffers, data)?;
        if decoded.iter().any(|block| block.data.viewport != viewport) {
            return Err(TesseraError::InvalidHeader(
                "image block viewport differs from the transmitted viewport",
            ));
        }

        let image = self.pool.acquire();
        {
            let mut img = image.write();
            img.set_viewport(viewport);
            img.set_alpha_usage(use_alpha);
            img.set_zoom(zoom);
            for block in decoded {
                img.set_quality(block.buffer, block.quality);
                match img.set_pixel_data(block.buffer, block.data, registry) {
                    Ok(()) => {}
                    Err(e @ TesseraError::MissingCompressor { .. }) => {
                        error!(id = self.id, "dropping {:?} buffer: {e}", block.buffer);
                    }
                    Err(e) => {
                        drop(img);
                        self.pool.release([image]);
                        return Err(e);
                    }
                }
            }
        }
        let mut state = self.lock();
        // A ready signal may have adopted this version while decoding.
        if state.adopted >= version || self.ready_version() >= version {
            drop(state);
            self.pool.release([image]);
            return Ok(false);
        }
        state.pending.push((version, image));
        Ok(true)
    }

    // ── Internal ─────────────────────────────────────────────────

    fn mark_ready(&self, version: u64) {
        let listeners = self.lock_listeners();
        if !self.ready_version.advance_to(version) {
            return;
        }
        for listener in listeners.iter() {
            listener.increment();
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<Arc<Monitor>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ────────────────────────────────────────────────────────
