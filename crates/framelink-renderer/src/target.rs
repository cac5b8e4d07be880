use std::sync::Arc;

use framelink_core::{DisplayTarget, FoveationParams, GraphicsError};
use tracing::{debug, warn};

use crate::context::{DisplayBinding, GraphicsContext, SurfaceHandle};
use crate::PresentParams;

/// The render resources of one decode generation: the off-screen surface the
/// decoder writes into and the binding that presents it.
///
/// Both are released on [`RenderTarget::release`] or on drop, whichever comes
/// first.
pub struct RenderTarget {
    context: Arc<GraphicsContext>,
    offscreen: SurfaceHandle,
    binding: DisplayBinding,
    params: PresentParams,
    presented: u64,
}

impl RenderTarget {
    /// Allocate an off-screen surface sized like `target` and bind `target`.
    /// If binding fails the off-screen surface is released before returning.
    pub fn create(context: Arc<GraphicsContext>, target: &DisplayTarget) -> Result<Self, GraphicsError> {
        let offscreen = context.create_offscreen_surface(target.width(), target.height())?;
        let binding = match context.bind_display_target(target) {
            Ok(binding) => binding,
            Err(e) => {
                if let Err(release_err) = context.release_surface(&offscreen) {
                    warn!("Releasing off-screen surface after failed bind: {}", release_err);
                }
                return Err(e);
            }
        };
        debug!("RenderTarget ready: {:?} → {:?}", offscreen, target);
        Ok(Self {
            context,
            offscreen,
            binding,
            params: PresentParams::default(),
            presented: 0,
        })
    }

    /// Surface the decoder must render into.
    pub fn surface(&self) -> &SurfaceHandle {
        &self.offscreen
    }

    pub fn target(&self) -> &DisplayTarget {
        self.binding.target()
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn set_foveation(&mut self, foveation: Option<FoveationParams>) {
        self.params.foveation = foveation;
    }

    /// Adopt a new size for the same platform surface.
    pub fn follow_resize(&mut self, target: &DisplayTarget) {
        if self.binding.viewport() != target.resolution() {
            debug!("Viewport {} → {}", self.binding.viewport(), target.resolution());
            self.binding.set_viewport(target.resolution());
        }
    }

    pub fn present(&mut self) -> Result<(), GraphicsError> {
        self.context.present(&self.binding, &self.offscreen, &self.params)?;
        self.presented += 1;
        Ok(())
    }

    /// Swap in a fresh off-screen surface (a new decoder needs a clean output
    /// surface); the display binding is kept.
    pub fn replace_offscreen(&mut self) -> Result<SurfaceHandle, GraphicsError> {
        let viewport = self.binding.viewport();
        let fresh = self.context.create_offscreen_surface(viewport.width, viewport.height)?;
        let old = std::mem::replace(&mut self.offscreen, fresh);
        if let Err(e) = self.context.release_surface(&old) {
            warn!("Releasing replaced off-screen surface: {}", e);
        }
        Ok(self.offscreen.clone())
    }

    /// Release both surfaces. Errors are logged; calling twice is harmless.
    pub fn release(&mut self) {
        if let Err(e) = self.context.release_surface(&self.offscreen) {
            warn!("Releasing off-screen surface: {}", e);
        }
        if let Err(e) = self.context.release_binding(&self.binding) {
            warn!("Releasing display binding: {}", e);
        }
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        self.release();
    }
}
