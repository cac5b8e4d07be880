//! One decode generation: decoder session, render target and correlation
//! table, created together and destroyed together.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use framelink_core::{DisplayTarget, GraphicsError, PipelineError, StreamSettings};
use framelink_decoder::{DecoderRegistry, FrameCorrelationTable, HardwareDecoderSession, SessionSinks};
use framelink_renderer::{GraphicsContext, RenderTarget};
use tracing::{debug, info, warn};

// MARK: - BoundTarget

/// The display target the pipeline currently holds, across pauses.
///
/// Re-attaching the same surface with a fresh callback keeps the earlier
/// callbacks too; all of them fire when the surface is finally given up.
pub(crate) struct BoundTarget {
    latest: DisplayTarget,
    hooks: Vec<DisplayTarget>,
}

impl BoundTarget {
    pub(crate) fn new(target: DisplayTarget) -> Self {
        Self {
            hooks: vec![target.clone()],
            latest: target,
        }
    }

    pub(crate) fn latest(&self) -> &DisplayTarget {
        &self.latest
    }

    pub(crate) fn is_same(&self, target: &DisplayTarget) -> bool {
        self.latest.is_same_target(target)
    }

    /// Take over a new value for the same surface.
    pub(crate) fn adopt(&mut self, target: DisplayTarget) {
        if !self.hooks.iter().any(|hook| hook.shares_detach_hook(&target)) {
            self.hooks.push(target.clone());
        }
        self.latest = target;
    }

    /// Fire every pending detach callback. Returns how many fired.
    pub(crate) fn detach(self) -> usize {
        let fired = self.hooks.iter().filter(|hook| hook.notify_detached()).count();
        info!("Display target {:?} detached ({} callback(s))", self.latest.surface(), fired);
        fired
    }
}

// MARK: - DecodeGeneration

pub(crate) struct DecodeGeneration {
    id: u64,
    settings: StreamSettings,
    render: RenderTarget,
    session: HardwareDecoderSession,
}

/// What every generation is built from; owned by the pipeline worker.
pub(crate) struct GenerationEnv {
    pub context: Arc<GraphicsContext>,
    pub registry: DecoderRegistry,
    pub correlation_slots: usize,
    pub sinks: SessionSinks,
}

impl DecodeGeneration {
    /// Bind `target`, then open a decoder rendering into the new off-screen
    /// surface. Nothing survives a failure.
    pub(crate) fn create(
        id: u64,
        env: &GenerationEnv,
        settings: StreamSettings,
        target: &DisplayTarget,
    ) -> Result<Self, PipelineError> {
        let mut render = RenderTarget::create(Arc::clone(&env.context), target)?;
        render.set_foveation(settings.foveation);
        let frames = Arc::new(FrameCorrelationTable::with_capacity(env.correlation_slots));
        let session = open_session(env, &settings, &render, frames)?;
        info!(
            "Generation #{} active: {} via {} on {:?} ({})",
            id,
            settings.codec,
            session.backend_name(),
            target.surface(),
            target.resolution()
        );
        Ok(Self {
            id,
            settings,
            render,
            session,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub(crate) fn backend_name(&self) -> &str {
        self.session.backend_name()
    }

    pub(crate) fn pending_correlations(&self) -> usize {
        self.session.frames().occupied()
    }

    pub(crate) fn follow_resize(&mut self, target: &DisplayTarget) {
        self.render.follow_resize(target);
    }

    /// Apply new settings to the running generation. A codec change replaces
    /// the decoder and its output surface but keeps the display binding and
    /// correlation table; anything else is a parameter update. Signals from
    /// the old session must already be drained.
    pub(crate) fn reconfigure(
        &mut self,
        env: &GenerationEnv,
        settings: StreamSettings,
    ) -> Result<(), PipelineError> {
        if settings.codec != self.settings.codec {
            info!(
                "Generation #{}: codec {} → {}, replacing decoder",
                self.id, self.settings.codec, settings.codec
            );
            // The table outlives the decoder. Whatever the old decoder still
            // held will never come out, so it is emptied once it has stopped.
            let frames = Arc::clone(self.session.frames());
            self.session.close();
            let abandoned = frames.clear();
            if abandoned > 0 {
                debug!(
                    "Generation #{}: {} frame(s) still inside the old decoder dropped",
                    self.id, abandoned
                );
                env.sinks.dropped.fetch_add(abandoned as u64, Ordering::Relaxed);
            }
            self.render.replace_offscreen()?;
            self.session = open_session(env, &settings, &self.render, frames)?;
        } else {
            self.session.update_parameters(&settings)?;
        }
        self.render.set_foveation(settings.foveation);
        self.settings = settings;
        Ok(())
    }

    /// Whether a codec change is pending for `settings`.
    pub(crate) fn needs_new_decoder(&self, settings: &StreamSettings) -> bool {
        settings.codec != self.settings.codec
    }

    /// Stop forwarding decoder callbacks. First step of every teardown.
    pub(crate) fn deactivate(&self) {
        self.session.deactivate();
    }

    pub(crate) fn present(&mut self) -> Result<(), GraphicsError> {
        self.render.present()
    }

    /// Release decoder and render resources. Failures are logged. Returns
    /// how many queued frames the decoder never produced.
    pub(crate) fn close(mut self) -> u64 {
        self.session.close();
        let abandoned = self.session.frames().clear() as u64;
        self.render.release();
        debug!(
            "Generation #{} closed after {} presented frame(s), {} abandoned in the decoder",
            self.id,
            self.render.presented(),
            abandoned
        );
        abandoned
    }
}

fn open_session(
    env: &GenerationEnv,
    settings: &StreamSettings,
    render: &RenderTarget,
    frames: Arc<FrameCorrelationTable>,
) -> Result<HardwareDecoderSession, PipelineError> {
    HardwareDecoderSession::open(
        &env.registry,
        settings,
        render.surface().clone(),
        frames,
        env.sinks.clone(),
    )
    .map_err(|e| {
        warn!("Decoder session failed to open: {}", e);
        PipelineError::from(e)
    })
}
