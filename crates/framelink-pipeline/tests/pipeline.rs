use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use framelink_core::{
    ConnectionError, ConnectionEvent, DecoderError, DisplayTarget, GraphicsError, NativeSurface, PipelineConfig,
    PipelineError, StreamSettings, VideoCodec,
};
use framelink_decoder::{
    CodecCallbacks, DecoderBackend, DecoderFormat, DecoderParams, DecoderProvider, DecoderRegistry, InputBuffer,
    InputKind, LoopbackControl, LoopbackProvider,
};
use framelink_pipeline::{DecodePipeline, FrameObserver, PipelineState};
use framelink_renderer::{GraphicsContext, HeadlessBackend, HeadlessProbe, HeadlessWindow, SurfaceHandle};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// ── Fixture ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    rendered: Mutex<Vec<u64>>,
    events: Mutex<Vec<ConnectionEvent>>,
    errors: Mutex<Vec<String>>,
}

impl Recorder {
    fn rendered(&self) -> Vec<u64> {
        self.rendered.lock().unwrap().clone()
    }
}

impl FrameObserver for Recorder {
    fn on_frame_rendered(&self, frame_id: u64) {
        self.rendered.lock().unwrap().push(frame_id);
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn on_decoder_error(&self, error: &DecoderError) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

struct Fixture {
    pipeline: DecodePipeline,
    inputs: mpsc::UnboundedReceiver<InputBuffer>,
    control: LoopbackControl,
    probe: HeadlessProbe,
    recorder: Arc<Recorder>,
}

fn unlaunched() -> Fixture {
    let (backend, probe) = HeadlessBackend::new();
    let context = Arc::new(GraphicsContext::new(backend));
    let provider = LoopbackProvider::new();
    let control = provider.control();
    let recorder = Arc::new(Recorder::default());
    let config = PipelineConfig {
        log_fps: false,
        ..PipelineConfig::default()
    };
    let (pipeline, inputs) = DecodePipeline::new(
        config,
        context,
        DecoderRegistry::new().with(provider),
        Arc::clone(&recorder) as Arc<dyn FrameObserver>,
    );
    Fixture {
        pipeline,
        inputs,
        control,
        probe,
        recorder,
    }
}

fn fixture() -> Fixture {
    let fx = unlaunched();
    fx.pipeline.launch().unwrap();
    fx
}

impl Fixture {
    /// Queue one coded frame on the first input buffer of a live session.
    async fn feed(&mut self, frame_id: u64) -> u64 {
        loop {
            let mut input = timeout(WAIT, self.inputs.recv())
                .await
                .expect("input buffer in time")
                .expect("input channel open");
            if !input.is_session_alive() {
                continue;
            }
            input.write(&[0, 0, 0, 1, 0x65, 0x88, 0x84]).unwrap();
            return input.queue(frame_id).unwrap();
        }
    }

    async fn wait_rendered(&self, count: usize) -> Vec<u64> {
        timeout(WAIT, async {
            loop {
                let rendered = self.recorder.rendered();
                if rendered.len() >= count {
                    return rendered;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("frames rendered in time")
    }

    async fn wait_state(&self, state: PipelineState) {
        let mut rx = self.pipeline.subscribe_state();
        timeout(WAIT, rx.wait_for(|s| *s == state))
            .await
            .expect("state reached in time")
            .expect("worker alive");
    }
}

fn h264() -> StreamSettings {
    StreamSettings::new(VideoCodec::H264, true)
}

fn window(name: &str, width: u32, height: u32) -> (DisplayTarget, Arc<AtomicUsize>) {
    let detached = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&detached);
    let target = DisplayTarget::new(NativeSurface::new(HeadlessWindow::new(name)), width, height, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (target, detached)
}

// ── End to end ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn frame_42_is_rendered_once_and_correlation_clears() {
    let mut fx = fixture();
    let (t1, detached) = window("T1", 256, 256);

    fx.pipeline.start(h264(), t1.clone()).await.unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Active);

    fx.feed(42).await;
    assert_eq!(fx.wait_rendered(1).await, vec![42]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fx.recorder.rendered(), vec![42], "rendered exactly once");

    let stats = fx.pipeline.stats().await.unwrap();
    assert_eq!(stats.frames_rendered, 1);
    assert_eq!(stats.frames_dropped, 0);
    assert_eq!(stats.pending_correlations, 0);
    assert_eq!(stats.decoder.as_deref(), Some("loopback"));
    assert_eq!(fx.probe.presents_to(t1.surface()), 1);
    assert_eq!(detached.load(Ordering::SeqCst), 0);

    fx.pipeline.shutdown().await.unwrap();
    assert_eq!(detached.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pause_discards_undelivered_frames() {
    let mut fx = fixture();
    let (t1, detached) = window("T1", 256, 256);
    fx.pipeline.start(h264(), t1).await.unwrap();

    fx.control.hold_outputs(true);
    for id in 1..=3 {
        fx.feed(id).await;
    }
    // Delivered on this thread: three FrameReady signals are now queued
    // for a worker that has not run yet.
    assert_eq!(fx.control.flush_outputs(), 3);

    fx.pipeline.pause().await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(fx.recorder.rendered().is_empty());
    let stats = fx.pipeline.stats().await.unwrap();
    assert_eq!(stats.state, PipelineState::Idle);
    assert_eq!(stats.frames_dropped, 3);
    assert_eq!(stats.generation, None);
    assert_eq!(detached.load(Ordering::SeqCst), 0, "pause keeps the target");

    let gpu = fx.probe.snapshot();
    assert_eq!(gpu.live_textures(), 0);
    assert_eq!(gpu.live_window_surfaces(), 0);
    assert_eq!(fx.control.stats().stopped, 1);
}

#[tokio::test]
async fn pause_counts_frames_still_inside_the_decoder() {
    let mut fx = fixture();
    let (t1, _) = window("T1", 256, 256);
    fx.pipeline.start(h264(), t1).await.unwrap();

    fx.control.hold_outputs(true);
    for id in 1..=3 {
        fx.feed(id).await;
    }
    let before = fx.pipeline.stats().await.unwrap();
    assert_eq!(before.pending_correlations, 3);
    assert_eq!(before.frames_dropped, 0);

    fx.pipeline.pause().await.unwrap();

    let after = fx.pipeline.stats().await.unwrap();
    assert_eq!(after.frames_dropped, 3);
    assert_eq!(after.pending_correlations, 0);
    assert!(fx.recorder.rendered().is_empty());
}

#[tokio::test]
async fn codec_change_counts_frames_left_in_the_old_decoder() {
    let mut fx = fixture();
    let (t1, detached) = window("T1", 256, 256);
    fx.pipeline.start(h264(), t1.clone()).await.unwrap();

    fx.control.hold_outputs(true);
    for id in 1..=3 {
        fx.feed(id).await;
    }
    fx.pipeline
        .start(StreamSettings::new(VideoCodec::H265, true), t1)
        .await
        .unwrap();

    let stats = fx.pipeline.stats().await.unwrap();
    assert_eq!(stats.frames_dropped, 3);
    assert_eq!(stats.pending_correlations, 0);
    assert_eq!(detached.load(Ordering::SeqCst), 0);

    fx.control.hold_outputs(false);
    fx.feed(4).await;
    assert_eq!(fx.wait_rendered(1).await, vec![4]);
    assert_eq!(fx.pipeline.stats().await.unwrap().pending_correlations, 0);
}

// ── Target identity ──────────────────────────────────────────────────────────

#[tokio::test]
async fn same_target_is_reconfigured_in_place() {
    let mut fx = fixture();
    let (a, detached) = window("A", 256, 256);

    fx.pipeline.start(h264(), a.clone()).await.unwrap();
    let first = fx.pipeline.stats().await.unwrap().generation;

    fx.pipeline.start(h264().with_fps(90.0), a.clone()).await.unwrap();

    assert_eq!(detached.load(Ordering::SeqCst), 0);
    assert_eq!(fx.pipeline.stats().await.unwrap().generation, first);
    assert_eq!(fx.probe.snapshot().window_surfaces_created, 1);
    let decoder = fx.control.stats();
    assert_eq!(decoder.created, 1);
    assert_eq!(decoder.parameter_updates, 1);
    assert_eq!(decoder.last_params.unwrap().operating_rate, 90.0);

    fx.feed(5).await;
    assert_eq!(fx.wait_rendered(1).await, vec![5]);
}

#[tokio::test]
async fn codec_change_replaces_only_the_decoder() {
    let mut fx = fixture();
    let (a, detached) = window("A", 256, 256);

    fx.pipeline.start(h264(), a.clone()).await.unwrap();
    fx.pipeline
        .start(StreamSettings::new(VideoCodec::H265, true), a.clone())
        .await
        .unwrap();

    assert_eq!(detached.load(Ordering::SeqCst), 0);
    let gpu = fx.probe.snapshot();
    assert_eq!(gpu.window_surfaces_created, 1, "display binding kept");
    assert_eq!(gpu.textures_created, 2);
    assert_eq!(gpu.live_textures(), 1);
    let decoder = fx.control.stats();
    assert_eq!(decoder.created, 2);
    assert_eq!(decoder.stopped, 1);
    assert_eq!(decoder.last_format.unwrap().codec, VideoCodec::H265);

    fx.feed(9).await;
    assert_eq!(fx.wait_rendered(1).await, vec![9]);
}

#[tokio::test]
async fn resized_same_surface_is_not_a_new_target() {
    let fx = fixture();
    let surface = NativeSurface::new(HeadlessWindow::new("A"));
    let fired = Arc::new(AtomicUsize::new(0));
    let (f1, f2) = (Arc::clone(&fired), Arc::clone(&fired));
    let small = DisplayTarget::new(surface.clone(), 640, 360, move || {
        f1.fetch_add(1, Ordering::SeqCst);
    });
    let large = DisplayTarget::new(surface, 1920, 1080, move || {
        f2.fetch_add(1, Ordering::SeqCst);
    });

    fx.pipeline.start(h264(), small).await.unwrap();
    fx.pipeline.start(h264(), large).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(fx.probe.snapshot().window_surfaces_created, 1);

    fx.pipeline.stop().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2, "both callbacks fire on stop");
}

#[tokio::test]
async fn switching_targets_detaches_the_old_one_before_presenting_on_the_new() {
    let mut fx = fixture();
    let surface_b = NativeSurface::new(HeadlessWindow::new("B"));
    let presents_on_b_at_detach = Arc::new(Mutex::new(None));
    let a = {
        let probe = fx.probe.clone();
        let surface_b = surface_b.clone();
        let seen = Arc::clone(&presents_on_b_at_detach);
        DisplayTarget::new(NativeSurface::new(HeadlessWindow::new("A")), 256, 256, move || {
            *seen.lock().unwrap() = Some(probe.presents_to(&surface_b));
        })
    };
    let b = DisplayTarget::new(surface_b.clone(), 256, 256, || {});

    fx.pipeline.start(h264(), a.clone()).await.unwrap();
    fx.feed(1).await;
    fx.wait_rendered(1).await;

    fx.pipeline.start(h264(), b).await.unwrap();
    assert_eq!(*presents_on_b_at_detach.lock().unwrap(), Some(0));

    fx.feed(2).await;
    assert_eq!(fx.wait_rendered(2).await, vec![1, 2]);
    assert_eq!(fx.probe.presents_to(a.surface()), 1);
    assert_eq!(fx.probe.presents_to(&surface_b), 1);
    assert_eq!(fx.probe.snapshot().live_window_surfaces(), 1);
}

// ── Pause / stop ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn pause_then_start_resumes_without_reattach() {
    let mut fx = fixture();
    let (a, detached) = window("A", 256, 256);

    fx.pipeline.start(h264(), a.clone()).await.unwrap();
    fx.feed(1).await;
    fx.wait_rendered(1).await;

    fx.pipeline.pause().await.unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Idle);

    fx.pipeline.start(h264(), a.clone()).await.unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Active);
    fx.feed(2).await;
    assert_eq!(fx.wait_rendered(2).await, vec![1, 2]);

    fx.pipeline.pause().await.unwrap();
    fx.pipeline.restart(h264()).await.unwrap();
    fx.feed(3).await;
    assert_eq!(fx.wait_rendered(3).await, vec![1, 2, 3]);

    assert_eq!(detached.load(Ordering::SeqCst), 0);
    assert_eq!(fx.probe.presents_to(a.surface()), 3);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let fx = fixture();
    let (a, detached) = window("A", 256, 256);

    fx.pipeline.start(h264(), a).await.unwrap();
    fx.pipeline.stop().await.unwrap();
    fx.pipeline.stop().await.unwrap();

    assert_eq!(fx.pipeline.state(), PipelineState::Stopped);
    assert_eq!(detached.load(Ordering::SeqCst), 1);
    let gpu = fx.probe.snapshot();
    assert_eq!(gpu.textures_created, gpu.textures_deleted);
    assert_eq!(gpu.window_surfaces_created, gpu.window_surfaces_destroyed);
    assert_eq!(gpu.discipline_violations, 0);
    let decoder = fx.control.stats();
    assert_eq!(decoder.started, 1);
    assert_eq!(decoder.stopped, 1);
}

#[tokio::test]
async fn stop_on_a_fresh_pipeline_is_harmless() {
    let fx = fixture();
    fx.pipeline.stop().await.unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Stopped);
    fx.pipeline.pause().await.unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Stopped);
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn decoder_error_pauses_and_reaches_the_observer() {
    let mut fx = fixture();
    let (a, detached) = window("A", 256, 256);
    fx.pipeline.start(h264(), a).await.unwrap();

    assert!(fx.control.fail("device lost"));
    fx.wait_state(PipelineState::Idle).await;

    assert_eq!(fx.recorder.errors.lock().unwrap().len(), 1);
    assert_eq!(detached.load(Ordering::SeqCst), 0);
    assert_eq!(fx.pipeline.stats().await.unwrap().generation, None);

    fx.pipeline.restart(h264()).await.unwrap();
    fx.feed(11).await;
    assert_eq!(fx.wait_rendered(1).await, vec![11]);
}

#[tokio::test]
async fn failed_start_leaves_nothing_behind() {
    let fx = fixture();
    let (a, detached) = window("A", 256, 256);
    fx.control.reject_configuration(true);

    let err = fx.pipeline.start(h264(), a).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Decoder(DecoderError::ConfigurationRejected { .. })
    ));
    assert_eq!(fx.pipeline.state(), PipelineState::Idle);
    let gpu = fx.probe.snapshot();
    assert_eq!(gpu.live_textures(), 0);
    assert_eq!(gpu.live_window_surfaces(), 0);
    assert_eq!(detached.load(Ordering::SeqCst), 0);

    fx.control.reject_configuration(false);
    fx.pipeline.restart(h264()).await.unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Active);
}

#[tokio::test]
async fn rejected_surface_is_a_graphics_error() {
    let fx = fixture();
    let window = HeadlessWindow::new("gone");
    window.destroy();
    let target = DisplayTarget::new(NativeSurface::new(window), 64, 64, || {});

    let err = fx.pipeline.start(h264(), target).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Graphics(GraphicsError::SurfaceRejected { .. })
    ));
    assert_eq!(fx.pipeline.state(), PipelineState::Idle);
}

#[tokio::test]
async fn unknown_codec_fails_start() {
    let fx = fixture();
    let (a, _) = window("A", 64, 64);
    let err = fx
        .pipeline
        .start(StreamSettings::new(VideoCodec::Unknown, false), a)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Decoder(DecoderError::NoCompatibleDecoder { .. })
    ));
}

#[tokio::test]
async fn use_before_launch_and_after_shutdown_is_protocol_misuse() {
    let fx = unlaunched();
    let (a, _) = window("A", 64, 64);

    let misuse = |r: Result<(), PipelineError>| matches!(r, Err(PipelineError::ProtocolMisuse { .. }));
    assert!(misuse(fx.pipeline.start(h264(), a.clone()).await));
    assert!(misuse(fx.pipeline.submit_display_target(a.clone())));
    assert!(misuse(fx.pipeline.on_connection_event(ConnectionEvent::StreamStart).await));

    fx.pipeline.launch().unwrap();
    assert!(misuse(fx.pipeline.launch()));

    fx.pipeline.shutdown().await.unwrap();
    assert!(misuse(fx.pipeline.stop().await));
    assert!(misuse(fx.pipeline.shutdown().await));
}

#[tokio::test]
async fn restart_without_a_target_is_protocol_misuse() {
    let fx = fixture();
    let err = fx.pipeline.restart(h264()).await.unwrap_err();
    assert!(matches!(err, PipelineError::ProtocolMisuse { .. }));
}

// ── Mailboxes and connection events ──────────────────────────────────────────

#[tokio::test]
async fn connection_events_drive_the_pipeline() {
    let mut fx = fixture();
    let detached = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&detached);
    let surface = NativeSurface::new(HeadlessWindow::new("main"));

    fx.pipeline
        .attach_display_target(surface.clone(), 256, 256, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fx.pipeline.state(), PipelineState::Idle, "no settings yet");

    fx.pipeline
        .on_connection_event(ConnectionEvent::Connected { settings: h264() })
        .await
        .unwrap();
    fx.wait_state(PipelineState::Active).await;
    fx.feed(1).await;
    fx.wait_rendered(1).await;

    fx.pipeline.on_connection_event(ConnectionEvent::ServerRestart).await.unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Idle);

    fx.pipeline
        .on_connection_event(ConnectionEvent::Connected { settings: h264() })
        .await
        .unwrap();
    fx.wait_state(PipelineState::Active).await;
    fx.feed(2).await;
    assert_eq!(fx.wait_rendered(2).await, vec![1, 2]);

    fx.pipeline
        .on_connection_event(ConnectionEvent::Error {
            error: ConnectionError::ServerDisconnected { cause: "bye".into() },
        })
        .await
        .unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Idle);
    assert_eq!(detached.load(Ordering::SeqCst), 0);

    fx.pipeline.detach_display_target().await.unwrap();
    assert_eq!(fx.pipeline.state(), PipelineState::Stopped);
    assert_eq!(detached.load(Ordering::SeqCst), 1);
    assert_eq!(fx.recorder.events.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn only_the_newest_mailbox_settings_are_applied() {
    let fx = fixture();
    let (a, _) = window("A", 256, 256);

    fx.pipeline.start(h264(), a).await.unwrap();
    fx.pipeline.submit_settings(h264().with_fps(30.0)).unwrap();
    fx.pipeline.submit_settings(h264().with_fps(72.0)).unwrap();

    timeout(WAIT, async {
        while fx.control.stats().parameter_updates == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("settings applied");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let decoder = fx.control.stats();
    assert_eq!(decoder.parameter_updates, 1);
    assert_eq!(decoder.last_params.unwrap().operating_rate, 72.0);
}

// ── Retired decoder sessions ─────────────────────────────────────────────────

/// Parks the first decoded output inside `release_output` until opened.
#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    armed: bool,
    waiting: bool,
    open: bool,
}

impl Gate {
    fn armed() -> Arc<Self> {
        let gate = Self::default();
        gate.state.lock().unwrap().armed = true;
        Arc::new(gate)
    }

    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.armed {
            return;
        }
        state.armed = false;
        state.waiting = true;
        self.changed.notify_all();
        while !state.open {
            state = self.changed.wait(state).unwrap();
        }
    }

    fn wait_until_parked(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.waiting {
            let (next, timeout) = self.changed.wait_timeout(state, WAIT).unwrap();
            assert!(!timeout.timed_out(), "output never reached the decoder");
            state = next;
        }
    }

    fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }
}

struct GatedProvider {
    gate: Arc<Gate>,
}

impl DecoderProvider for GatedProvider {
    fn name(&self) -> &str {
        "gated"
    }

    fn supports(&self, _codec: VideoCodec) -> bool {
        true
    }

    fn create(&self) -> Result<Box<dyn DecoderBackend>, DecoderError> {
        Ok(Box::new(GatedDecoder {
            gate: Arc::clone(&self.gate),
            callbacks: None,
            outputs: Vec::new(),
        }))
    }
}

/// Emits each frame from its own thread, like a platform codec would.
struct GatedDecoder {
    gate: Arc<Gate>,
    callbacks: Option<Arc<dyn CodecCallbacks>>,
    outputs: Vec<thread::JoinHandle<()>>,
}

impl DecoderBackend for GatedDecoder {
    fn name(&self) -> &str {
        "gated"
    }

    fn configure(
        &mut self,
        _format: &DecoderFormat,
        _surface: SurfaceHandle,
        callbacks: Arc<dyn CodecCallbacks>,
    ) -> Result<(), DecoderError> {
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DecoderError> {
        let callbacks = self.callbacks.as_ref().ok_or(DecoderError::NotInitialized)?;
        callbacks.on_input_buffer_available(0, 4096);
        Ok(())
    }

    fn queue_input(
        &mut self,
        index: usize,
        _data: &[u8],
        presentation_time_us: u64,
        kind: InputKind,
    ) -> Result<(), DecoderError> {
        let callbacks = self.callbacks.clone().ok_or(DecoderError::NotInitialized)?;
        if kind == InputKind::Frame {
            let output = Arc::clone(&callbacks);
            self.outputs.push(thread::spawn(move || {
                output.on_output_buffer_available(index, presentation_time_us)
            }));
        }
        callbacks.on_input_buffer_available(index, 4096);
        Ok(())
    }

    fn release_output(&mut self, _index: usize, _render: bool) -> Result<(), DecoderError> {
        self.gate.pass();
        Ok(())
    }

    fn set_parameters(&mut self, _params: &DecoderParams) -> Result<(), DecoderError> {
        Ok(())
    }

    fn stop(&mut self) {
        self.callbacks = None;
        for output in self.outputs.drain(..) {
            let _ = output.join();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_frame_from_a_replaced_decoder_is_never_presented() {
    let gate = Gate::armed();
    let (backend, _probe) = HeadlessBackend::new();
    let recorder = Arc::new(Recorder::default());
    let config = PipelineConfig {
        log_fps: false,
        ..PipelineConfig::default()
    };
    let (pipeline, mut inputs) = DecodePipeline::new(
        config,
        Arc::new(GraphicsContext::new(backend)),
        DecoderRegistry::new().with(GatedProvider { gate: Arc::clone(&gate) }),
        Arc::clone(&recorder) as Arc<dyn FrameObserver>,
    );
    let pipeline = Arc::new(pipeline);
    pipeline.launch().unwrap();

    let (a, _) = window("A", 256, 256);
    pipeline.start(h264(), a.clone()).await.unwrap();

    let mut input = timeout(WAIT, inputs.recv()).await.unwrap().unwrap();
    input.write(&[0, 0, 0, 1, 0x65]).unwrap();
    input.queue(77).unwrap();
    let parked = Arc::clone(&gate);
    tokio::task::spawn_blocking(move || parked.wait_until_parked())
        .await
        .unwrap();

    // The old session's output is mid-flight while its decoder is replaced;
    // it reports frame 77 only after the teardown has drained the queue.
    let replace = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            pipeline
                .start(StreamSettings::new(VideoCodec::H265, true), a)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.open();
    replace.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = pipeline.stats().await.unwrap();
    assert!(recorder.rendered().is_empty(), "frame 77 must not be presented");
    assert_eq!(stats.state, PipelineState::Active);
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.frames_rendered, 0);
    assert_eq!(stats.pending_correlations, 0);

    pipeline.shutdown().await.unwrap();
}
