use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framelink_core::{DecoderError, StreamSettings, VideoCodec};
use framelink_decoder::{
    render_channel, DecoderRegistry, FrameCorrelationTable, HardwareDecoderSession, InputBuffer, InputKind,
    LoopbackControl, LoopbackProvider, RenderSignal, RenderSignals, SessionSinks,
};
use framelink_renderer::{GraphicsContext, HeadlessBackend, SurfaceHandle};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Harness {
    _ctx: Arc<GraphicsContext>,
    surface: SurfaceHandle,
    control: LoopbackControl,
    registry: DecoderRegistry,
    frames: Arc<FrameCorrelationTable>,
    sinks: SessionSinks,
    inputs: mpsc::UnboundedReceiver<InputBuffer>,
    signals: RenderSignals,
    dropped: Arc<AtomicU64>,
}

fn harness() -> Harness {
    let (backend, _probe) = HeadlessBackend::new();
    let ctx = Arc::new(GraphicsContext::new(backend));
    let surface = ctx.create_offscreen_surface(640, 360).unwrap();
    let provider = LoopbackProvider::new();
    let control = provider.control();
    let (input_tx, inputs) = mpsc::unbounded_channel();
    let (render, signals) = render_channel(8);
    let dropped = Arc::new(AtomicU64::new(0));
    Harness {
        _ctx: ctx,
        surface,
        control,
        registry: DecoderRegistry::new().with(provider),
        frames: Arc::new(FrameCorrelationTable::new()),
        sinks: SessionSinks {
            input: input_tx,
            render,
            dropped: Arc::clone(&dropped),
        },
        inputs,
        signals,
        dropped,
    }
}

impl Harness {
    fn open(&self) -> Result<HardwareDecoderSession, DecoderError> {
        HardwareDecoderSession::open(
            &self.registry,
            &StreamSettings::new(VideoCodec::H264, true),
            self.surface.clone(),
            Arc::clone(&self.frames),
            self.sinks.clone(),
        )
    }

    async fn next_input(&mut self) -> InputBuffer {
        timeout(Duration::from_secs(5), self.inputs.recv())
            .await
            .expect("input buffer in time")
            .expect("input channel open")
    }

    async fn next_signal(&mut self) -> RenderSignal {
        timeout(Duration::from_secs(5), self.signals.recv())
            .await
            .expect("render signal in time")
            .expect("render channel open")
    }
}

#[tokio::test]
async fn queued_frame_comes_back_with_its_id() {
    let mut h = harness();
    let session = h.open().unwrap();

    let mut input = h.next_input().await;
    input.write(&[0, 0, 0, 1, 0x65, 0x88]).unwrap();
    let pts = input.queue(42).unwrap();
    assert!(pts > 0);

    match h.next_signal().await {
        RenderSignal::FrameReady { session: id, frame_id } => {
            assert_eq!(id, session.id());
            assert_eq!(frame_id, 42);
        }
        other => panic!("expected FrameReady, got {other:?}"),
    }
    assert!(h.frames.is_empty());
    assert_eq!(h.surface.frames_written(), 1);
    assert_eq!(h.dropped.load(Ordering::Relaxed), 0);
    assert_eq!(h.control.last_presentation_time(), Some(pts));

    session.close();
}

#[tokio::test]
async fn codec_config_is_queued_at_timestamp_zero() {
    let mut h = harness();
    let _session = h.open().unwrap();

    let mut input = h.next_input().await;
    input.write(&[0, 0, 0, 1, 0x67]).unwrap();
    input.queue_config().unwrap();

    let queued = h.control.queued();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, InputKind::CodecConfig);
    assert_eq!(queued[0].presentation_time_us, 0);
    assert_eq!(queued[0].len, 5);
    assert!(h.signals.try_recv().is_none(), "config produces no frame");
}

#[tokio::test]
async fn uncorrelated_output_is_dropped() {
    let h = harness();
    let _session = h.open().unwrap();

    assert!(h.control.emit_output(999_999));

    assert_eq!(h.dropped.load(Ordering::Relaxed), 1);
    let mut signals = h.signals;
    assert!(signals.try_recv().is_none());
}

#[tokio::test]
async fn outputs_after_deactivate_are_discarded_unrendered() {
    let mut h = harness();
    let session = h.open().unwrap();
    h.control.hold_outputs(true);

    let input = h.next_input().await;
    input.queue(7).unwrap();
    assert_eq!(h.control.held_outputs(), 1);

    session.deactivate();
    assert_eq!(h.control.flush_outputs(), 1);

    assert_eq!(h.dropped.load(Ordering::Relaxed), 1);
    assert_eq!(h.surface.frames_written(), 0);
    assert_eq!(h.control.stats().discarded_outputs, 1);
    assert!(h.signals.try_recv().is_none());
    assert!(h.frames.is_empty(), "the correlation entry is consumed either way");
}

#[tokio::test]
async fn closed_session_rejects_input_and_stops_decoder() {
    let mut h = harness();
    let session = h.open().unwrap();
    let input = h.next_input().await;

    session.close();
    session.close();

    assert!(matches!(input.queue(1), Err(DecoderError::SessionClosed)));
    let stats = h.control.stats();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.stopped, 1);
    assert!(!h.control.has_running_decoder());
    assert!(h.frames.is_empty(), "failed queue leaves no correlation entry");
}

#[tokio::test]
async fn decoder_error_is_reported_once() {
    let mut h = harness();
    let session = h.open().unwrap();

    assert!(h.control.fail("device lost"));
    assert!(h.control.fail("device lost again"));

    match h.next_signal().await {
        RenderSignal::Fatal {
            session: id,
            error: DecoderError::Fatal { reason },
        } => {
            assert_eq!(id, session.id());
            assert_eq!(reason, "device lost");
        }
        other => panic!("expected Fatal, got {other:?}"),
    }
    assert!(!session.is_active());
    assert!(h.signals.try_recv().is_none());
}

#[tokio::test]
async fn rejected_configuration_fails_open() {
    let h = harness();
    h.control.reject_configuration(true);

    let err = h.open().unwrap_err();
    assert!(matches!(err, DecoderError::ConfigurationRejected { .. }));
    assert_eq!(h.control.stats().started, 0);
}

#[tokio::test]
async fn released_surface_fails_open() {
    let (backend, _probe) = HeadlessBackend::new();
    let ctx = GraphicsContext::new(backend);
    let h = harness();
    let surface = ctx.create_offscreen_surface(16, 16).unwrap();
    ctx.release_surface(&surface).unwrap();

    let err = HardwareDecoderSession::open(
        &h.registry,
        &StreamSettings::new(VideoCodec::H264, false),
        surface,
        Arc::clone(&h.frames),
        h.sinks.clone(),
    )
    .unwrap_err();
    assert!(matches!(err, DecoderError::Surface(_)));
}

#[tokio::test]
async fn unsupported_codec_fails_open() {
    let h = harness();
    let err = HardwareDecoderSession::open(
        &h.registry,
        &StreamSettings::new(VideoCodec::Unknown, false),
        h.surface.clone(),
        Arc::clone(&h.frames),
        h.sinks.clone(),
    )
    .unwrap_err();
    assert!(matches!(err, DecoderError::NoCompatibleDecoder { .. }));
}

#[tokio::test]
async fn parameters_update_in_place() {
    let h = harness();
    let session = h.open().unwrap();

    session
        .update_parameters(&StreamSettings::new(VideoCodec::H264, false).with_fps(90.0))
        .unwrap();

    let stats = h.control.stats();
    assert_eq!(stats.parameter_updates, 1);
    let params = stats.last_params.unwrap();
    assert_eq!(params.operating_rate, 90.0);
    assert!(!params.realtime);
    assert_eq!(stats.created, 1, "no new decoder");
}
