//! framelink-renderer: shared GPU context and render surfaces.
//!
//! ```text
//! decoder ──writes──▶ off-screen SurfaceHandle ──present──▶ DisplayBinding (window)
//! ```
//!
//! One [`GraphicsContext`] lives for the whole pipeline and is shared by every
//! decode generation. Each generation owns one [`RenderTarget`]: the
//! off-screen surface the decoder renders into plus the presentable binding
//! for the current display target.

pub mod context;
pub mod headless;
pub mod target;

use framelink_core::{DisplayTarget, FoveationParams, GraphicsError, Resolution};

pub use context::{DisplayBinding, GraphicsContext, SurfaceHandle};
pub use headless::{HeadlessBackend, HeadlessProbe, HeadlessWindow};
pub use target::RenderTarget;

// MARK: - Backend handles

/// Texture name allocated by a [`GpuBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// Presentable window surface allocated by a [`GpuBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSurfaceId(pub u64);

/// Per-present drawing parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PresentParams {
    pub foveation: Option<FoveationParams>,
}

// MARK: - GpuBackend trait

/// Platform GPU primitives (EGL/GLES, Vulkan, a headless recorder...).
///
/// Only [`GraphicsContext`] calls these, always between `make_current` and
/// `release_current` and never from two threads at once.
pub trait GpuBackend: Send {
    fn name(&self) -> &str;

    /// Bind the context to the calling thread, optionally with a draw surface.
    fn make_current(&mut self, surface: Option<WindowSurfaceId>) -> Result<(), GraphicsError>;

    /// Unbind the context from the calling thread. Must not fail.
    fn release_current(&mut self);

    fn create_texture(&mut self, size: Resolution) -> Result<TextureId, GraphicsError>;

    fn delete_texture(&mut self, texture: TextureId) -> Result<(), GraphicsError>;

    /// Wrap the target's platform surface; fails if the platform rejects it.
    fn create_window_surface(&mut self, target: &DisplayTarget) -> Result<WindowSurfaceId, GraphicsError>;

    fn destroy_window_surface(&mut self, surface: WindowSurfaceId) -> Result<(), GraphicsError>;

    /// Latch the newest decoded image into `texture` and draw it over the
    /// current surface's `viewport`.
    fn draw(
        &mut self,
        texture: TextureId,
        viewport: Resolution,
        params: &PresentParams,
    ) -> Result<(), GraphicsError>;

    fn swap_buffers(&mut self, surface: WindowSurfaceId) -> Result<(), GraphicsError>;
}
