//! In-memory GPU backend.
//!
//! Records every operation instead of touching a GPU. Used by the test suites
//! and by the receiver binary when no platform backend is compiled in. It
//! enforces the same rules a real EGL context would: operations outside
//! make-current fail, presenting requires the target surface to be current,
//! and destroyed windows are rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use framelink_core::{DisplayTarget, FoveationParams, GraphicsError, NativeSurface, Resolution};
use tracing::trace;

use crate::{GpuBackend, PresentParams, TextureId, WindowSurfaceId};

// MARK: - HeadlessWindow

/// Platform surface understood by [`HeadlessBackend`].
#[derive(Debug)]
pub struct HeadlessWindow {
    name: String,
    destroyed: AtomicBool,
}

impl HeadlessWindow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulate the host tearing the window down.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

// MARK: - Stats

/// Snapshot of everything the backend has done so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadlessStats {
    pub current: bool,
    pub make_current_calls: u64,
    pub release_current_calls: u64,
    pub discipline_violations: u64,
    pub textures_created: u64,
    pub textures_deleted: u64,
    pub window_surfaces_created: u64,
    pub window_surfaces_destroyed: u64,
    pub draws: u64,
    pub last_foveation: Option<FoveationParams>,
}

impl HeadlessStats {
    pub fn live_textures(&self) -> u64 {
        self.textures_created - self.textures_deleted
    }

    pub fn live_window_surfaces(&self) -> u64 {
        self.window_surfaces_created - self.window_surfaces_destroyed
    }
}

#[derive(Default)]
struct HeadlessState {
    stats: HeadlessStats,
    current_surface: Option<Option<WindowSurfaceId>>,
    next_texture: u32,
    next_window: u64,
    textures: HashMap<TextureId, Resolution>,
    windows: HashMap<WindowSurfaceId, usize>,
    /// Presents keyed by `NativeSurface::id`.
    presents: HashMap<usize, u64>,
}

impl HeadlessState {
    fn require_current(&mut self, operation: &'static str) -> Result<Option<WindowSurfaceId>, GraphicsError> {
        match self.current_surface {
            Some(surface) => Ok(surface),
            None => {
                self.stats.discipline_violations += 1;
                Err(GraphicsError::OperationFailed {
                    operation,
                    reason: "context is not current".into(),
                })
            }
        }
    }
}

// MARK: - HeadlessProbe

/// Read-only view of a [`HeadlessBackend`] that stays valid after the backend
/// has been moved into a `GraphicsContext`.
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessProbe {
    pub fn snapshot(&self) -> HeadlessStats {
        lock(&self.state).stats.clone()
    }

    /// Buffer swaps performed on window surfaces wrapping `surface`.
    pub fn presents_to(&self, surface: &NativeSurface) -> u64 {
        lock(&self.state).presents.get(&surface.id()).copied().unwrap_or(0)
    }
}

// MARK: - HeadlessBackend

pub struct HeadlessBackend {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessBackend {
    pub fn new() -> (Self, HeadlessProbe) {
        let state = Arc::new(Mutex::new(HeadlessState {
            next_texture: 1,
            next_window: 1,
            ..HeadlessState::default()
        }));
        (Self { state: Arc::clone(&state) }, HeadlessProbe { state })
    }
}

fn lock(state: &Mutex<HeadlessState>) -> MutexGuard<'_, HeadlessState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GpuBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn make_current(&mut self, surface: Option<WindowSurfaceId>) -> Result<(), GraphicsError> {
        let mut state = lock(&self.state);
        state.stats.make_current_calls += 1;
        if let Some(surface) = surface {
            if !state.windows.contains_key(&surface) {
                return Err(GraphicsError::MakeCurrentFailed(format!("unknown surface {surface:?}")));
            }
        }
        if state.current_surface.is_some() {
            state.stats.discipline_violations += 1;
        }
        state.current_surface = Some(surface);
        state.stats.current = true;
        Ok(())
    }

    fn release_current(&mut self) {
        let mut state = lock(&self.state);
        state.stats.release_current_calls += 1;
        state.current_surface = None;
        state.stats.current = false;
    }

    fn create_texture(&mut self, size: Resolution) -> Result<TextureId, GraphicsError> {
        let mut state = lock(&self.state);
        state.require_current("create_texture")?;
        let texture = TextureId(state.next_texture);
        state.next_texture += 1;
        state.textures.insert(texture, size);
        state.stats.textures_created += 1;
        trace!("headless: texture {:?} ({})", texture, size);
        Ok(texture)
    }

    fn delete_texture(&mut self, texture: TextureId) -> Result<(), GraphicsError> {
        let mut state = lock(&self.state);
        state.require_current("delete_texture")?;
        if state.textures.remove(&texture).is_none() {
            return Err(GraphicsError::OperationFailed {
                operation: "delete_texture",
                reason: format!("unknown texture {texture:?}"),
            });
        }
        state.stats.textures_deleted += 1;
        Ok(())
    }

    fn create_window_surface(&mut self, target: &DisplayTarget) -> Result<WindowSurfaceId, GraphicsError> {
        let mut state = lock(&self.state);
        state.require_current("create_window_surface")?;
        let window = target
            .surface()
            .downcast_ref::<HeadlessWindow>()
            .ok_or_else(|| GraphicsError::SurfaceRejected {
                reason: "not a headless window".into(),
            })?;
        if window.is_destroyed() {
            return Err(GraphicsError::SurfaceRejected {
                reason: format!("window '{}' already destroyed", window.name()),
            });
        }
        let surface = WindowSurfaceId(state.next_window);
        state.next_window += 1;
        state.windows.insert(surface, target.surface().id());
        state.stats.window_surfaces_created += 1;
        Ok(surface)
    }

    fn destroy_window_surface(&mut self, surface: WindowSurfaceId) -> Result<(), GraphicsError> {
        let mut state = lock(&self.state);
        state.require_current("destroy_window_surface")?;
        if state.windows.remove(&surface).is_none() {
            return Err(GraphicsError::OperationFailed {
                operation: "destroy_window_surface",
                reason: format!("unknown surface {surface:?}"),
            });
        }
        state.stats.window_surfaces_destroyed += 1;
        Ok(())
    }

    fn draw(
        &mut self,
        texture: TextureId,
        _viewport: Resolution,
        params: &PresentParams,
    ) -> Result<(), GraphicsError> {
        let mut state = lock(&self.state);
        if state.require_current("draw")?.is_none() {
            return Err(GraphicsError::OperationFailed {
                operation: "draw",
                reason: "no draw surface is current".into(),
            });
        }
        if !state.textures.contains_key(&texture) {
            return Err(GraphicsError::OperationFailed {
                operation: "draw",
                reason: format!("unknown texture {texture:?}"),
            });
        }
        state.stats.draws += 1;
        state.stats.last_foveation = params.foveation;
        Ok(())
    }

    fn swap_buffers(&mut self, surface: WindowSurfaceId) -> Result<(), GraphicsError> {
        let mut state = lock(&self.state);
        if state.require_current("swap_buffers")? != Some(surface) {
            return Err(GraphicsError::OperationFailed {
                operation: "swap_buffers",
                reason: format!("{surface:?} is not the current surface"),
            });
        }
        let native = state.windows.get(&surface).copied().ok_or_else(|| GraphicsError::OperationFailed {
            operation: "swap_buffers",
            reason: format!("unknown surface {surface:?}"),
        })?;
        *state.presents.entry(native).or_insert(0) += 1;
        Ok(())
    }
}
