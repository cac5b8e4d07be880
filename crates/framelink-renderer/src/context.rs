use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use framelink_core::{DisplayTarget, GraphicsError, Resolution};
use tracing::{debug, info};

use crate::{GpuBackend, PresentParams, TextureId, WindowSurfaceId};

// MARK: - SurfaceHandle

/// Off-screen texture + surface the decoder renders into.
///
/// Cheap to clone: the decoder session holds one clone, the render target
/// another. Releasing through [`GraphicsContext::release_surface`] marks every
/// clone as released.
#[derive(Clone)]
pub struct SurfaceHandle {
    inner: Arc<SurfaceInner>,
}

struct SurfaceInner {
    id: u64,
    texture: TextureId,
    resolution: Resolution,
    frames_written: AtomicU64,
    released: AtomicBool,
}

impl SurfaceHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn texture(&self) -> TextureId {
        self.inner.texture
    }

    pub fn resolution(&self) -> Resolution {
        self.inner.resolution
    }

    /// Called by decoders when a decoded image has been rendered into the
    /// surface. Returns `false` once the surface is released.
    pub fn write_frame(&self) -> bool {
        if self.is_released() {
            return false;
        }
        self.inner.frames_written.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn frames_written(&self) -> u64 {
        self.inner.frames_written.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("id", &self.inner.id)
            .field("texture", &self.inner.texture)
            .field("resolution", &self.inner.resolution)
            .field("released", &self.is_released())
            .finish()
    }
}

// MARK: - DisplayBinding

/// Presentable surface wrapping a [`DisplayTarget`].
#[derive(Debug)]
pub struct DisplayBinding {
    surface: WindowSurfaceId,
    target: DisplayTarget,
    viewport: Resolution,
    released: AtomicBool,
}

impl DisplayBinding {
    pub fn window_surface(&self) -> WindowSurfaceId {
        self.surface
    }

    pub fn target(&self) -> &DisplayTarget {
        &self.target
    }

    pub fn viewport(&self) -> Resolution {
        self.viewport
    }

    /// Follow a resized target that still wraps the same platform surface.
    pub fn set_viewport(&mut self, viewport: Resolution) {
        self.viewport = viewport;
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

// MARK: - GraphicsContext

/// Long-lived GPU context shared across decode generations.
///
/// Every GPU call goes through [`GraphicsContext::with_current`], which makes
/// the context current, runs one operation and releases it again, so the
/// context is never left bound to a thread. The backend lock serialises
/// callers; concurrent GPU calls on one context are impossible.
pub struct GraphicsContext {
    backend: Mutex<Box<dyn GpuBackend>>,
    next_surface_id: AtomicU64,
}

impl GraphicsContext {
    pub fn new(backend: impl GpuBackend + 'static) -> Self {
        info!("GraphicsContext ready (backend: {})", backend.name());
        Self {
            backend: Mutex::new(Box::new(backend)),
            next_surface_id: AtomicU64::new(1),
        }
    }

    /// Run `op` with the context current on the calling thread.
    pub fn with_current<T>(
        &self,
        surface: Option<WindowSurfaceId>,
        op: impl FnOnce(&mut dyn GpuBackend) -> Result<T, GraphicsError>,
    ) -> Result<T, GraphicsError> {
        let mut backend = self.backend.lock().unwrap_or_else(PoisonError::into_inner);
        let mut current = CurrentGuard::make_current(&mut **backend, surface)?;
        op(&mut *current)
    }

    pub fn create_offscreen_surface(&self, width: u32, height: u32) -> Result<SurfaceHandle, GraphicsError> {
        let resolution = Resolution::new(width, height);
        let texture = self.with_current(None, |gpu| gpu.create_texture(resolution))?;
        let id = self.next_surface_id.fetch_add(1, Ordering::Relaxed);
        debug!("Off-screen surface #{} created ({}, {:?})", id, resolution, texture);
        Ok(SurfaceHandle {
            inner: Arc::new(SurfaceInner {
                id,
                texture,
                resolution,
                frames_written: AtomicU64::new(0),
                released: AtomicBool::new(false),
            }),
        })
    }

    pub fn bind_display_target(&self, target: &DisplayTarget) -> Result<DisplayBinding, GraphicsError> {
        let surface = self.with_current(None, |gpu| gpu.create_window_surface(target))?;
        debug!("Display target {:?} bound as {:?}", target.surface(), surface);
        Ok(DisplayBinding {
            surface,
            target: target.clone(),
            viewport: target.resolution(),
            released: AtomicBool::new(false),
        })
    }

    /// Draw `source` into `binding` and swap buffers.
    pub fn present(
        &self,
        binding: &DisplayBinding,
        source: &SurfaceHandle,
        params: &PresentParams,
    ) -> Result<(), GraphicsError> {
        if binding.is_released() || source.is_released() {
            return Err(GraphicsError::Released);
        }
        self.with_current(Some(binding.surface), |gpu| {
            gpu.draw(source.texture(), binding.viewport, params)?;
            gpu.swap_buffers(binding.surface)
        })
    }

    /// Release an off-screen surface. No-op if already released.
    pub fn release_surface(&self, handle: &SurfaceHandle) -> Result<(), GraphicsError> {
        if handle.inner.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Releasing off-screen surface #{}", handle.id());
        self.with_current(None, |gpu| gpu.delete_texture(handle.texture()))
    }

    /// Release a display binding. No-op if already released.
    pub fn release_binding(&self, binding: &DisplayBinding) -> Result<(), GraphicsError> {
        if binding.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("Releasing display binding {:?}", binding.surface);
        self.with_current(None, |gpu| gpu.destroy_window_surface(binding.surface))
    }
}

// MARK: - CurrentGuard

/// Keeps the context current for its lifetime; releases it on drop, including
/// when the guarded operation fails or panics.
struct CurrentGuard<'a> {
    backend: &'a mut (dyn GpuBackend + 'static),
}

impl<'a> CurrentGuard<'a> {
    fn make_current(
        backend: &'a mut (dyn GpuBackend + 'static),
        surface: Option<WindowSurfaceId>,
    ) -> Result<Self, GraphicsError> {
        backend.make_current(surface)?;
        Ok(Self { backend })
    }
}

impl Deref for CurrentGuard<'_> {
    type Target = dyn GpuBackend;

    fn deref(&self) -> &Self::Target {
        &*self.backend
    }
}

impl DerefMut for CurrentGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.backend
    }
}

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        self.backend.release_current();
    }
}
