use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use framelink_core::{
    ConnectionEvent, DisplayTarget, NativeSurface, PipelineConfig, PipelineError, StreamSettings,
};
use framelink_decoder::{render_channel, DecoderRegistry, InputBuffer, RenderSignal, RenderSignals, SessionSinks};
use framelink_renderer::GraphicsContext;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::fps::FrameRateMeter;
use crate::generation::{BoundTarget, DecodeGeneration, GenerationEnv};
use crate::mailbox::Mailbox;
use crate::observer::FrameObserver;

// MARK: - State

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    /// No generation alive; a display target may still be held for resume.
    Idle,
    /// Decoding and presenting.
    Active,
    /// A generation is being torn down.
    Draining,
    /// Fully torn down, display target released.
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub state: PipelineState,
    /// Id of the live generation, if any.
    pub generation: Option<u64>,
    /// Decoder provider of the live generation.
    pub decoder: Option<String>,
    pub frames_rendered: u64,
    /// Decoded frames that were never presented, for any reason.
    pub frames_dropped: u64,
    /// Frames queued to the live decoder and not yet output.
    pub pending_correlations: usize,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Start {
        settings: StreamSettings,
        target: DisplayTarget,
        reply: Reply<Result<(), PipelineError>>,
    },
    Restart {
        settings: StreamSettings,
        reply: Reply<Result<(), PipelineError>>,
    },
    Pause {
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<()>,
    },
    Stats {
        reply: Reply<PipelineStats>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// MARK: - DecodePipeline

/// Handle to the decode-and-present state machine.
///
/// All transitions run on one worker task started by [`launch`]; every method
/// here only hands a request to that task. Settings and display targets can
/// also be pushed through single-slot mailboxes, in which case the worker
/// starts decoding as soon as it knows both.
///
/// [`launch`]: DecodePipeline::launch
pub struct DecodePipeline {
    commands: mpsc::UnboundedSender<Command>,
    settings: Arc<Mailbox<StreamSettings>>,
    targets: Arc<Mailbox<DisplayTarget>>,
    state: watch::Receiver<PipelineState>,
    observer: Arc<dyn FrameObserver>,
    worker: Mutex<Option<Worker>>,
    task: Mutex<Option<JoinHandle<()>>>,
    launched: AtomicBool,
    shut_down: AtomicBool,
}

impl DecodePipeline {
    /// Build a pipeline around a long-lived graphics context. The returned
    /// receiver yields a free decoder input buffer each time the running
    /// decoder can accept data.
    pub fn new(
        config: PipelineConfig,
        context: Arc<GraphicsContext>,
        mut registry: DecoderRegistry,
        observer: Arc<dyn FrameObserver>,
    ) -> (Self, mpsc::UnboundedReceiver<InputBuffer>) {
        if let Some(name) = config.decoder.as_deref() {
            registry.prefer(name);
        }
        if registry.is_empty() {
            warn!("Decode pipeline created without decoder providers");
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (render, signals) = render_channel(config.render_queue_depth);
        let (state_tx, state_rx) = watch::channel(PipelineState::Idle);
        let settings = Arc::new(Mailbox::new("settings"));
        let targets = Arc::new(Mailbox::new("display target"));
        let dropped = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            env: GenerationEnv {
                context,
                registry,
                correlation_slots: config.correlation_slots,
                sinks: SessionSinks {
                    input: input_tx,
                    render,
                    dropped: Arc::clone(&dropped),
                },
            },
            observer: Arc::clone(&observer),
            commands: commands_rx,
            signals,
            settings_box: Arc::clone(&settings),
            target_box: Arc::clone(&targets),
            state_tx,
            desired_settings: None,
            bound: None,
            generation: None,
            next_generation: 0,
            frames_rendered: 0,
            dropped,
            fps: config.log_fps.then(FrameRateMeter::new),
            stopped: false,
        };

        let pipeline = Self {
            commands: commands_tx,
            settings,
            targets,
            state: state_rx,
            observer,
            worker: Mutex::new(Some(worker)),
            task: Mutex::new(None),
            launched: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        };
        (pipeline, input_rx)
    }

    /// Spawn the worker task. Must be called from within a Tokio runtime.
    pub fn launch(&self) -> Result<(), PipelineError> {
        let worker = lock(&self.worker)
            .take()
            .ok_or_else(|| PipelineError::misuse("pipeline already launched"))?;
        let task = tokio::spawn(worker.run());
        *lock(&self.task) = Some(task);
        self.launched.store(true, Ordering::Release);
        info!("Decode pipeline launched");
        Ok(())
    }

    /// Start decoding `settings` onto `target`. A different surface than the
    /// one currently bound causes a full restart; the same surface only
    /// reconfigures.
    pub async fn start(&self, settings: StreamSettings, target: DisplayTarget) -> Result<(), PipelineError> {
        self.request(|reply| Command::Start { settings, target, reply }).await?
    }

    /// `start` with the currently bound display target.
    pub async fn restart(&self, settings: StreamSettings) -> Result<(), PipelineError> {
        self.request(|reply| Command::Restart { settings, reply }).await?
    }

    /// Tear down the running generation and discard undelivered frames. The
    /// display target stays bound, so a later `start` or `restart` resumes.
    pub async fn pause(&self) -> Result<(), PipelineError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    /// Full teardown; the bound display target is detached. Idempotent.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn stats(&self) -> Result<PipelineStats, PipelineError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop and end the worker task. The pipeline is unusable afterwards.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.request(|reply| Command::Shutdown { reply }).await?;
        self.shut_down.store(true, Ordering::Release);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Pipeline worker ended abnormally: {}", e);
            }
        }
        info!("Decode pipeline shut down");
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.clone()
    }

    // MARK: - Mailboxes

    /// Offer new stream settings. Only the newest unread value is kept.
    pub fn submit_settings(&self, settings: StreamSettings) -> Result<(), PipelineError> {
        self.ensure_running()?;
        self.settings.send(settings);
        Ok(())
    }

    /// Offer a display target. Only the newest unread value is kept.
    pub fn submit_display_target(&self, target: DisplayTarget) -> Result<(), PipelineError> {
        self.ensure_running()?;
        self.targets.send(target);
        Ok(())
    }

    /// Offer a platform surface; `on_detached` fires once when the pipeline
    /// stops using it.
    pub fn attach_display_target(
        &self,
        surface: NativeSurface,
        width: u32,
        height: u32,
        on_detached: impl FnOnce() + Send + 'static,
    ) -> Result<(), PipelineError> {
        self.submit_display_target(DisplayTarget::new(surface, width, height, on_detached))
    }

    /// The host is taking the surface away: stop.
    pub async fn detach_display_target(&self) -> Result<(), PipelineError> {
        self.stop().await
    }

    /// Forward a connection event to the observer and react to it:
    /// `Connected` offers its settings, `ServerRestart` and `Error` pause.
    pub async fn on_connection_event(&self, event: ConnectionEvent) -> Result<(), PipelineError> {
        self.ensure_running()?;
        self.observer.on_connection_event(&event);
        match event {
            ConnectionEvent::Connected { settings } => {
                self.settings.send(settings);
                Ok(())
            }
            event if event.suspends_stream() => {
                info!("Pausing on connection event {:?}", event);
                self.pause().await
            }
            _ => Ok(()),
        }
    }

    fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PipelineError::misuse("pipeline has been shut down"));
        }
        if !self.launched.load(Ordering::Acquire) {
            return Err(PipelineError::misuse("pipeline has not been launched"));
        }
        Ok(())
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, PipelineError> {
        self.ensure_running()?;
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| PipelineError::WorkerGone)?;
        response.await.map_err(|_| PipelineError::WorkerGone)
    }
}

// MARK: - Worker

struct Worker {
    env: GenerationEnv,
    observer: Arc<dyn FrameObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: RenderSignals,
    settings_box: Arc<Mailbox<StreamSettings>>,
    target_box: Arc<Mailbox<DisplayTarget>>,
    state_tx: watch::Sender<PipelineState>,
    desired_settings: Option<StreamSettings>,
    bound: Option<BoundTarget>,
    generation: Option<DecodeGeneration>,
    next_generation: u64,
    frames_rendered: u64,
    dropped: Arc<AtomicU64>,
    fps: Option<FrameRateMeter>,
    stopped: bool,
}

impl Worker {
    async fn run(mut self) {
        debug!("Pipeline worker running");
        loop {
            let rendering = self.generation.is_some();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    None => {
                        debug!("Pipeline handle dropped");
                        break;
                    }
                },
                Some(signal) = self.signals.recv(), if rendering => self.on_signal(signal),
                settings = self.settings_box.receive() => self.on_settings(settings),
                target = self.target_box.receive() => self.on_target(target),
            }
        }
        self.stop();
        debug!("Pipeline worker exited");
    }

    /// Returns `false` when the worker should exit.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start { settings, target, reply } => {
                let _ = reply.send(self.start(settings, target));
            }
            Command::Restart { settings, reply } => {
                let result = match self.bound.as_ref().map(|b| b.latest().clone()) {
                    Some(target) => self.start(settings, target),
                    None => Err(PipelineError::misuse("restart without a display target")),
                };
                let _ = reply.send(result);
            }
            Command::Pause { reply } => {
                self.pause();
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { reply } => {
                self.stop();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    fn start(&mut self, settings: StreamSettings, target: DisplayTarget) -> Result<(), PipelineError> {
        self.desired_settings = Some(settings.clone());
        if self.hold_target(target.clone()) {
            if let Some(generation) = self.generation.as_mut() {
                generation.follow_resize(&target);
                return self.reconfigure(settings);
            }
        }
        self.open_generation(settings)
    }

    /// Make `target` the bound target. Returns `true` if it wraps the surface
    /// already bound; otherwise the running generation is torn down and the
    /// previous target detached.
    fn hold_target(&mut self, target: DisplayTarget) -> bool {
        if let Some(bound) = self.bound.as_mut() {
            if bound.is_same(&target) {
                bound.adopt(target);
                return true;
            }
        }
        self.cancel_generation("display target changed");
        if let Some(previous) = self.bound.take() {
            previous.detach();
        }
        self.bound = Some(BoundTarget::new(target));
        false
    }

    fn reconfigure(&mut self, settings: StreamSettings) -> Result<(), PipelineError> {
        let Some(generation) = self.generation.as_ref() else {
            return self.open_generation(settings);
        };
        if generation.needs_new_decoder(&settings) {
            generation.deactivate();
            self.drain_signals("decoder replaced");
        }
        let result = match self.generation.as_mut() {
            Some(generation) => generation.reconfigure(&self.env, settings),
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!("Reconfiguration failed, tearing down: {}", e);
            self.cancel_generation("reconfiguration failed");
            self.publish(self.rest_state());
        }
        result
    }

    fn open_generation(&mut self, settings: StreamSettings) -> Result<(), PipelineError> {
        let target = self
            .bound
            .as_ref()
            .map(|b| b.latest().clone())
            .ok_or_else(|| PipelineError::misuse("no display target to decode onto"))?;
        self.drain_signals("stale");

        self.next_generation += 1;
        let id = self.next_generation;
        match DecodeGeneration::create(id, &self.env, settings, &target) {
            Ok(generation) => {
                self.generation = Some(generation);
                self.stopped = false;
                if let Some(fps) = self.fps.as_mut() {
                    fps.reset();
                }
                self.publish(PipelineState::Active);
                Ok(())
            }
            Err(e) => {
                error!("Generation #{} failed to start: {}", id, e);
                self.publish(self.rest_state());
                Err(e)
            }
        }
    }

    fn pause(&mut self) {
        if self.cancel_generation("pause") {
            info!("Pipeline paused");
        }
        self.publish(self.rest_state());
    }

    fn stop(&mut self) {
        self.cancel_generation("stop");
        if let Some(bound) = self.bound.take() {
            bound.detach();
        }
        if let Some(pending) = self.target_box.clear() {
            pending.notify_detached();
        }
        if !self.stopped {
            info!("Pipeline stopped");
        }
        self.stopped = true;
        self.publish(PipelineState::Stopped);
    }

    /// Tear down the running generation: stop callbacks, wake any render
    /// wait, discard undelivered frames, release decoder and surfaces.
    /// Returns `false` if nothing was running.
    fn cancel_generation(&mut self, reason: &str) -> bool {
        let Some(generation) = self.generation.take() else {
            return false;
        };
        self.publish(PipelineState::Draining);
        generation.deactivate();
        self.env.sinks.render.cancel();
        let discarded = self.drain_signals(reason);
        let id = generation.id();
        let abandoned = generation.close();
        self.dropped.fetch_add(abandoned, Ordering::Relaxed);
        info!(
            "Generation #{} torn down ({}), {} undelivered and {} in-flight frame(s) discarded",
            id, reason, discarded, abandoned
        );
        true
    }

    fn drain_signals(&mut self, reason: &str) -> u64 {
        let mut discarded = 0;
        while let Some(signal) = self.signals.try_recv() {
            match signal {
                RenderSignal::FrameReady { frame_id, .. } => {
                    trace!("Discarding frame {} ({})", frame_id, reason);
                    discarded += 1;
                }
                RenderSignal::Cancelled => {}
                RenderSignal::Fatal { session, error } => {
                    debug!("Ignoring error from session #{} ({}): {}", session, reason, error);
                }
            }
        }
        self.dropped.fetch_add(discarded, Ordering::Relaxed);
        discarded
    }

    fn rest_state(&self) -> PipelineState {
        if self.stopped {
            PipelineState::Stopped
        } else {
            PipelineState::Idle
        }
    }

    fn publish(&self, state: PipelineState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Pipeline {} → {}", previous, state);
        }
    }

    // ── Events ───────────────────────────────────────────────────────────────

    fn on_settings(&mut self, settings: StreamSettings) {
        self.desired_settings = Some(settings.clone());
        match self.bound.as_ref().map(|b| b.latest().clone()) {
            Some(target) => {
                if let Err(e) = self.start(settings, target) {
                    warn!("Start with new settings failed: {}", e);
                }
            }
            None => debug!("Settings received, waiting for a display target"),
        }
    }

    fn on_target(&mut self, target: DisplayTarget) {
        match self.desired_settings.clone() {
            Some(settings) => {
                if let Err(e) = self.start(settings, target) {
                    warn!("Start on new display target failed: {}", e);
                }
            }
            None => {
                self.hold_target(target);
                if self.stopped {
                    self.stopped = false;
                    self.publish(PipelineState::Idle);
                }
                debug!("Display target held, waiting for settings");
            }
        }
    }

    fn on_signal(&mut self, signal: RenderSignal) {
        match signal {
            RenderSignal::FrameReady { session, frame_id } => self.present(session, frame_id),
            RenderSignal::Cancelled => trace!("Render wait cancelled"),
            RenderSignal::Fatal { session, error } => {
                if self.generation.as_ref().map(DecodeGeneration::session_id) != Some(session) {
                    debug!("Ignoring error from retired session #{}: {}", session, error);
                    return;
                }
                error!("Decoder session #{} failed, pausing: {}", session, error);
                self.pause();
                self.observer.on_decoder_error(&error);
            }
        }
    }

    fn present(&mut self, session: u64, frame_id: u64) {
        let Some(generation) = self.generation.as_mut() else {
            self.count_drop();
            return;
        };
        if generation.session_id() != session {
            debug!("Frame {} from retired session #{} dropped", frame_id, session);
            self.count_drop();
            return;
        }
        match generation.present() {
            Ok(()) => {
                self.frames_rendered += 1;
                if let Some(fps) = self.fps.as_mut() {
                    fps.tick();
                }
                self.observer.on_frame_rendered(frame_id);
            }
            Err(e) => {
                error!("Presenting frame {} failed, pausing: {}", frame_id, e);
                self.count_drop();
                self.pause();
            }
        }
    }

    fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> PipelineStats {
        let generation = self.generation.as_ref();
        PipelineStats {
            state: *self.state_tx.borrow(),
            generation: generation.map(DecodeGeneration::id),
            decoder: generation.map(|g| g.backend_name().to_owned()),
            frames_rendered: self.frames_rendered,
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            pending_correlations: generation.map_or(0, DecodeGeneration::pending_correlations),
        }
    }
}
