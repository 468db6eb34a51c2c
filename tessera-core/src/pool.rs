//! Per-frame-data image recycling.
//!
//! `clear()` on a frame data hands its images back here instead of
//! freeing them, so steady-state readback does not allocate.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::image::Image;

// ── ImageRef ─────────────────────────────────────────────────────

/// Shared handle to an image owned by a frame data.
#[derive(Debug, Clone, Default)]
pub struct ImageRef(Arc<RwLock<Image>>);

impl ImageRef {
    pub fn new(image: Image) -> Self {
        Self(Arc::new(RwLock::new(image)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Image> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Image> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &ImageRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// ── ImagePool ────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ImagePool {
    free: Mutex<Vec<ImageRef>>,
}

impl ImagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reset image, recycled when one is available.
    pub fn acquire(&self) -> ImageRef {
        let recycled = self.lock().pop();
        match recycled {
            Some(image) => {
                image.write().reset();
                image
            }
            None => ImageRef::default(),
        }
    }

    /// Return images for later reuse.
    pub fn release(&self, images: impl IntoIterator<Item = ImageRef>) {
        self.lock().extend(images);
    }

    /// Free every pooled image's pixel memory and empty the pool.
    pub fn drain(&self) {
        let images = std::mem::take(&mut *self.lock());
        for image in images {
            image.write().flush();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ImageRef>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ────────────────────────────────────────────────────────
