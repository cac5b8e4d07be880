use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use framelink_core::{DecoderError, GraphicsError, StreamSettings, VideoCodec};
use framelink_renderer::SurfaceHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{CodecCallbacks, DecoderBackend, DecoderFormat, DecoderParams, DecoderRegistry, InputKind};
use crate::frame_map::{FrameCorrelationTable, NO_FRAME};
use crate::input::InputBuffer;
use crate::signal::{FrameRejected, RenderQueue};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Where a session delivers its work.
#[derive(Clone)]
pub struct SessionSinks {
    /// Free input buffers, in the order the decoder released them.
    pub input: mpsc::UnboundedSender<InputBuffer>,
    /// Decoded-frame notifications for the render worker.
    pub render: RenderQueue,
    /// Incremented for every decoded frame that will never be presented.
    pub dropped: Arc<AtomicU64>,
}

// MARK: - Shared state

pub(crate) struct SessionShared {
    pub(crate) id: u64,
    backend: Mutex<Option<Box<dyn DecoderBackend>>>,
    active: AtomicBool,
    pub(crate) frames: Arc<FrameCorrelationTable>,
    sinks: SessionSinks,
    outputs: AtomicU64,
}

impl SessionShared {
    fn lock_backend(&self) -> MutexGuard<'_, Option<Box<dyn DecoderBackend>>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn queue_input(
        &self,
        index: usize,
        data: &[u8],
        presentation_time_us: u64,
        kind: InputKind,
    ) -> Result<(), DecoderError> {
        if !self.is_active() {
            return Err(DecoderError::SessionClosed);
        }
        let mut backend = self.lock_backend();
        let backend = backend.as_mut().ok_or(DecoderError::SessionClosed)?;
        backend.queue_input(index, data, presentation_time_us, kind)
    }

    fn release_output(&self, index: usize, render: bool) {
        match self.lock_backend().as_mut() {
            Some(backend) => {
                if let Err(e) = backend.release_output(index, render) {
                    warn!("Session #{}: releasing output {} failed: {}", self.id, index, e);
                }
            }
            None => trace!("Session #{}: output {} after close", self.id, index),
        }
    }

    fn count_drop(&self) {
        self.sinks.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

// MARK: - Callbacks

/// Bridges raw decoder callbacks to the session's sinks. Holds the session
/// weakly so a backend can never keep its own session alive.
struct SessionCallbacks {
    shared: Weak<SessionShared>,
}

impl CodecCallbacks for SessionCallbacks {
    fn on_input_buffer_available(&self, index: usize, capacity: usize) {
        let Some(shared) = self.shared.upgrade() else { return };
        if !shared.is_active() {
            trace!("Session #{}: input {} after close, ignored", shared.id, index);
            return;
        }
        let buffer = InputBuffer::new(&shared, index, capacity);
        if shared.sinks.input.send(buffer).is_err() {
            debug!("Session #{}: input consumer gone", shared.id);
        }
    }

    fn on_output_buffer_available(&self, index: usize, presentation_time_us: u64) {
        let Some(shared) = self.shared.upgrade() else { return };
        let active = shared.is_active();

        // The image goes to the off-screen surface before anyone is told.
        shared.release_output(index, active);
        shared.outputs.fetch_add(1, Ordering::Relaxed);

        let frame_id = shared.frames.take(presentation_time_us);
        if frame_id == NO_FRAME {
            warn!(
                "Session #{}: no frame id for pts {}us, dropping frame",
                shared.id, presentation_time_us
            );
            shared.count_drop();
            return;
        }
        if !active {
            debug!("Session #{}: frame {} decoded after close, dropped", shared.id, frame_id);
            shared.count_drop();
            return;
        }
        match shared.sinks.render.frame_ready(shared.id, frame_id) {
            Ok(()) => {}
            Err(FrameRejected::Full) => {
                warn!("Session #{}: render queue full, dropping frame {}", shared.id, frame_id);
                shared.count_drop();
            }
            Err(FrameRejected::Closed) => {
                debug!("Session #{}: render worker gone, dropping frame {}", shared.id, frame_id);
                shared.count_drop();
            }
        }
    }

    fn on_output_format_changed(&self, width: u32, height: u32) {
        if let Some(shared) = self.shared.upgrade() {
            info!("Session #{}: output format changed to {}x{}", shared.id, width, height);
        }
    }

    fn on_error(&self, error: DecoderError) {
        let Some(shared) = self.shared.upgrade() else { return };
        error!("Session #{}: decoder error: {}", shared.id, error);
        if shared.active.swap(false, Ordering::AcqRel) {
            shared.sinks.render.fatal(shared.id, error);
        }
    }
}

// MARK: - HardwareDecoderSession

/// One configured and running platform decoder, rendering into a single
/// off-screen surface.
///
/// Dropping the session closes it.
pub struct HardwareDecoderSession {
    shared: Arc<SessionShared>,
    codec: VideoCodec,
    backend_name: String,
    surface: SurfaceHandle,
}

impl HardwareDecoderSession {
    /// Pick a decoder for `settings.codec`, configure it to render into
    /// `surface` and start it.
    pub fn open(
        registry: &DecoderRegistry,
        settings: &StreamSettings,
        surface: SurfaceHandle,
        frames: Arc<FrameCorrelationTable>,
        sinks: SessionSinks,
    ) -> Result<Self, DecoderError> {
        if surface.is_released() {
            return Err(DecoderError::Surface(GraphicsError::Released));
        }
        let provider = registry.select(settings.codec)?;
        let mime = settings
            .codec
            .mime()
            .ok_or(DecoderError::NoCompatibleDecoder { codec: settings.codec })?;
        let resolution = surface.resolution();
        let format = DecoderFormat {
            codec: settings.codec,
            mime,
            width: resolution.width,
            height: resolution.height,
            params: DecoderParams::from_settings(settings),
        };

        let mut backend = provider.create()?;
        let backend_name = backend.name().to_owned();
        let shared = Arc::new(SessionShared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            backend: Mutex::new(None),
            active: AtomicBool::new(true),
            frames,
            sinks,
            outputs: AtomicU64::new(0),
        });
        let callbacks = Arc::new(SessionCallbacks {
            shared: Arc::downgrade(&shared),
        });

        backend.configure(&format, surface.clone(), callbacks)?;
        *shared.lock_backend() = Some(backend);

        let started = match shared.lock_backend().as_mut() {
            Some(backend) => backend.start(),
            None => Err(DecoderError::NotInitialized),
        };
        if let Err(e) = started {
            shared.active.store(false, Ordering::Release);
            let backend = shared.lock_backend().take();
            if let Some(mut backend) = backend {
                backend.stop();
            }
            return Err(e);
        }

        info!(
            "Decoder session #{} started: {} ({}, {}x{}, {} fps)",
            shared.id, backend_name, mime, format.width, format.height, settings.fps
        );
        Ok(Self {
            shared,
            codec: settings.codec,
            backend_name,
            surface,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    pub fn surface(&self) -> &SurfaceHandle {
        &self.surface
    }

    pub fn frames(&self) -> &Arc<FrameCorrelationTable> {
        &self.shared.frames
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Output callbacks received so far, correlated or not.
    pub fn outputs(&self) -> u64 {
        self.shared.outputs.load(Ordering::Relaxed)
    }

    /// Apply new tuning without restarting the decoder.
    pub fn update_parameters(&self, settings: &StreamSettings) -> Result<(), DecoderError> {
        let params = DecoderParams::from_settings(settings);
        let mut backend = self.shared.lock_backend();
        let backend = backend.as_mut().ok_or(DecoderError::SessionClosed)?;
        backend.set_parameters(&params)?;
        debug!("Session #{}: parameters updated {:?}", self.shared.id, params);
        Ok(())
    }

    /// Stop forwarding callbacks without releasing the decoder. Outputs that
    /// arrive afterwards are released unrendered and counted as drops.
    pub fn deactivate(&self) {
        self.shared.active.store(false, Ordering::Release);
    }

    /// Stop and release the decoder. Idempotent.
    pub fn close(&self) {
        self.deactivate();
        // Taken out first: a callback thread may be waiting for this lock and
        // stop() may join it.
        let backend = self.shared.lock_backend().take();
        if let Some(mut backend) = backend {
            backend.stop();
            drop(backend);
            info!("Decoder session #{} closed ({})", self.shared.id, self.backend_name);
        }
    }
}

impl Drop for HardwareDecoderSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for HardwareDecoderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareDecoderSession")
            .field("id", &self.shared.id)
            .field("codec", &self.codec)
            .field("backend", &self.backend_name)
            .field("active", &self.is_active())
            .finish()
    }
}
