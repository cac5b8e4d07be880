//! Display targets handed to the pipeline by the host.
//!
//! A [`DisplayTarget`] is identified by its underlying platform surface, never
//! by its dimensions: two targets wrapping the same surface compare equal even
//! if the host reported a different size the second time.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::types::Resolution;

// MARK: - NativeSurface

/// Opaque, reference-counted platform surface (window, layer, EGL native
/// window...). Graphics backends recover their concrete type with
/// [`NativeSurface::downcast_ref`].
#[derive(Clone)]
pub struct NativeSurface(Arc<dyn Any + Send + Sync>);

impl NativeSurface {
    pub fn new<T: Any + Send + Sync>(surface: T) -> Self {
        Self(Arc::new(surface))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Address of the shared allocation; stable for the surface's lifetime.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn same_surface(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl std::fmt::Debug for NativeSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeSurface({:#x})", self.id())
    }
}

// MARK: - DisplayTarget

type DetachCallback = Box<dyn FnOnce() + Send>;

/// A platform surface plus its pixel size and a detach callback that fires
/// exactly once, when the pipeline stops using the surface.
#[derive(Clone)]
pub struct DisplayTarget {
    surface: NativeSurface,
    resolution: Resolution,
    on_detached: Arc<Mutex<Option<DetachCallback>>>,
}

impl DisplayTarget {
    pub fn new(
        surface: NativeSurface,
        width: u32,
        height: u32,
        on_detached: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            surface,
            resolution: Resolution::new(width, height),
            on_detached: Arc::new(Mutex::new(Some(Box::new(on_detached)))),
        }
    }

    pub fn surface(&self) -> &NativeSurface {
        &self.surface
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Same underlying surface; dimensions are ignored.
    pub fn is_same_target(&self, other: &DisplayTarget) -> bool {
        self.surface.same_surface(&other.surface)
    }

    /// `true` if both values fire the same detach callback (one is a clone of
    /// the other).
    pub fn shares_detach_hook(&self, other: &DisplayTarget) -> bool {
        Arc::ptr_eq(&self.on_detached, &other.on_detached)
    }

    /// Fire the detach callback. Returns `false` if it already fired (through
    /// this value or any clone of it).
    pub fn notify_detached(&self) -> bool {
        let callback = self
            .on_detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match callback {
            Some(callback) => {
                debug!("Display target {:?} detached", self.surface);
                callback();
                true
            }
            None => false,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.on_detached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl PartialEq for DisplayTarget {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_target(other)
    }
}

impl Eq for DisplayTarget {}

impl std::fmt::Debug for DisplayTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayTarget")
            .field("surface", &self.surface)
            .field("resolution", &self.resolution)
            .field("detached", &self.is_detached())
            .finish()
    }
}
