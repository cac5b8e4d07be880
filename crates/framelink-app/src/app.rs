use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use framelink_core::{ConnectionEvent, DecoderError, NativeSurface, PipelineConfig, StreamSettings, VideoCodec};
use framelink_decoder::{DecoderRegistry, InputBuffer, LoopbackProvider};
use framelink_pipeline::{DecodePipeline, FrameObserver, PipelineState};
use framelink_renderer::{GraphicsContext, HeadlessBackend, HeadlessWindow};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const DEFAULT_FRAME_COUNT: u64 = 300;
const INPUT_TIMEOUT: Duration = Duration::from_secs(2);
const RENDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Synthetic receiver session: drives one pipeline end to end without a
/// network peer.
///
/// # Environment
/// - `FRAMELINK_FRAME_COUNT`: frames to stream (default 300, split across a
///   simulated server restart)
/// - `FRAMELINK_CODEC`: `h264` (default) or `h265`
/// - `FRAMELINK_*` pipeline tuning, see `PipelineConfig::from_env`
///
/// # Flow
/// 1. Attach a headless display surface
/// 2. `Connected` → the pipeline starts once settings and surface are known
/// 3. Stream the first half of the frames
/// 4. `ServerRestart` → pause, surface kept
/// 5. `Connected` again → resume and stream the rest
/// 6. Detach the surface and shut down
pub async fn run() -> Result<()> {
    let config = PipelineConfig::from_env();
    let frame_count: u64 = std::env::var("FRAMELINK_FRAME_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_FRAME_COUNT)
        .max(2);
    let codec = match std::env::var("FRAMELINK_CODEC").as_deref() {
        Ok("h265") | Ok("hevc") => VideoCodec::H265,
        _ => VideoCodec::H264,
    };
    info!("Pipeline config: {:?}", config);

    let registry = build_registry();
    info!("Decoder candidates: {:?}", registry.names());

    let (backend, probe) = HeadlessBackend::new();
    let context = Arc::new(GraphicsContext::new(backend));
    let (observer, mut rendered) = CountingObserver::new();
    let (pipeline, mut inputs) = DecodePipeline::new(config, context, registry, observer);
    pipeline.launch()?;

    // ── Surface + connection ─────────────────────────────────────────────────
    let window = NativeSurface::new(HeadlessWindow::new("framelink-main"));
    pipeline.attach_display_target(window.clone(), 1920, 1080, || {
        info!("Display surface released by the pipeline");
    })?;

    let settings = StreamSettings::new(codec, true).with_fps(72.0);
    pipeline.on_connection_event(ConnectionEvent::Initial).await?;
    pipeline
        .on_connection_event(ConnectionEvent::ServerFound {
            ipaddr: "127.0.0.1".into(),
        })
        .await?;
    pipeline
        .on_connection_event(ConnectionEvent::Connected {
            settings: settings.clone(),
        })
        .await?;
    wait_for_state(&pipeline, PipelineState::Active).await?;
    pipeline.on_connection_event(ConnectionEvent::StreamStart).await?;

    // ── First half ───────────────────────────────────────────────────────────
    let half = frame_count / 2;
    stream_frames(&mut inputs, 1..=half).await?;
    wait_rendered(&mut rendered, half).await?;
    info!("Stats after first half: {:?}", pipeline.stats().await?);

    // ── Server restart ───────────────────────────────────────────────────────
    pipeline.on_connection_event(ConnectionEvent::ServerRestart).await?;
    info!("Pipeline {} after server restart", pipeline.state());

    pipeline
        .on_connection_event(ConnectionEvent::Connected { settings })
        .await?;
    wait_for_state(&pipeline, PipelineState::Active).await?;

    // ── Second half ──────────────────────────────────────────────────────────
    stream_frames(&mut inputs, half + 1..=frame_count).await?;
    wait_rendered(&mut rendered, frame_count).await?;

    let stats = pipeline.stats().await?;
    info!(
        "Streamed {} frames: rendered={} dropped={} decoder={:?}",
        frame_count, stats.frames_rendered, stats.frames_dropped, stats.decoder
    );

    // ── Teardown ─────────────────────────────────────────────────────────────
    pipeline.detach_display_target().await?;
    pipeline.shutdown().await?;

    let gpu = probe.snapshot();
    info!(
        "GPU: presents={} textures live={} window surfaces live={} violations={}",
        probe.presents_to(&window),
        gpu.live_textures(),
        gpu.live_window_surfaces(),
        gpu.discipline_violations
    );
    if gpu.live_textures() != 0 || gpu.live_window_surfaces() != 0 {
        warn!("GPU resources leaked after shutdown");
    }
    Ok(())
}

/// GStreamer decoders first when built with the `gstreamer` feature; the
/// loopback decoder is always the last resort.
fn build_registry() -> DecoderRegistry {
    #[allow(unused_mut)]
    let mut registry = DecoderRegistry::new();
    #[cfg(feature = "gstreamer")]
    match framelink_decoder::gst::register_available(&mut registry) {
        Ok(found) => info!("{} GStreamer decoder(s) registered", found),
        Err(e) => warn!("GStreamer unavailable: {}; using loopback decoder", e),
    }
    registry.with(LoopbackProvider::new())
}

// ── Feeding ──────────────────────────────────────────────────────────────────

/// Queue one synthetic access unit per frame id, preceded by codec config
/// whenever a new decoder session shows up.
async fn stream_frames(
    inputs: &mut mpsc::UnboundedReceiver<InputBuffer>,
    frame_ids: std::ops::RangeInclusive<u64>,
) -> Result<()> {
    let mut configured_session = None;
    for frame_id in frame_ids {
        let mut input = next_live_input(inputs).await?;
        if configured_session != Some(input.session_id()) {
            let session = input.session_id();
            input.write(&codec_config())?;
            input.queue_config()?;
            configured_session = Some(session);
            // The config consumed the slot; fetch a fresh one for the frame.
            input = next_live_input(inputs).await?;
        }
        input.write(&access_unit(frame_id))?;
        match input.queue(frame_id) {
            Ok(pts) => debug!("Frame {} queued at {} µs", frame_id, pts),
            Err(DecoderError::SessionClosed) => warn!("Frame {} lost: session closed", frame_id),
            Err(e) => return Err(e).context("queueing frame"),
        }
    }
    Ok(())
}

async fn next_live_input(inputs: &mut mpsc::UnboundedReceiver<InputBuffer>) -> Result<InputBuffer> {
    loop {
        let input = tokio::time::timeout(INPUT_TIMEOUT, inputs.recv())
            .await
            .context("decoder stopped offering input buffers")?
            .context("input channel closed")?;
        if input.is_session_alive() {
            return Ok(input);
        }
        debug!("Skipping input slot {} of closed session #{}", input.index(), input.session_id());
    }
}

fn codec_config() -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_slice(&[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f]); // SPS
    buf.put_slice(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]); // PPS
    buf.freeze()
}

fn access_unit(frame_id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    let nal_type = if frame_id % 60 == 1 { 0x65 } else { 0x41 };
    buf.put_slice(&[0, 0, 0, 1, nal_type]);
    buf.put_u64(frame_id);
    buf.freeze()
}

// ── Observer ─────────────────────────────────────────────────────────────────

struct CountingObserver {
    rendered: watch::Sender<u64>,
    last_id: AtomicU64,
}

impl CountingObserver {
    fn new() -> (Arc<Self>, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (Arc::new(Self { rendered: tx, last_id: AtomicU64::new(0) }), rx)
    }
}

impl FrameObserver for CountingObserver {
    fn on_frame_rendered(&self, frame_id: u64) {
        self.last_id.store(frame_id, Ordering::Relaxed);
        self.rendered.send_modify(|n| *n += 1);
        let n = *self.rendered.borrow();
        if n == 1 {
            info!("First frame presented (id={})", frame_id);
        }
        if n % 100 == 0 {
            info!("Presented {} frames (last id={})", n, frame_id);
        }
    }

    fn on_connection_event(&self, event: &ConnectionEvent) {
        info!("Connection event: {:?}", event);
    }

    fn on_decoder_error(&self, error: &DecoderError) {
        warn!(
            "Decoder failed after frame {}: {}",
            self.last_id.load(Ordering::Relaxed),
            error
        );
    }
}

async fn wait_rendered(rendered: &mut watch::Receiver<u64>, count: u64) -> Result<()> {
    let waited = tokio::time::timeout(RENDER_TIMEOUT, rendered.wait_for(|n| *n >= count))
        .await
        .map(|r| r.map(|_| ()));
    match waited {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => bail!("observer dropped"),
        Err(_) => bail!("timed out: {} of {} frames presented", *rendered.borrow(), count),
    }
}

async fn wait_for_state(pipeline: &DecodePipeline, state: PipelineState) -> Result<()> {
    let mut rx = pipeline.subscribe_state();
    tokio::time::timeout(RENDER_TIMEOUT, rx.wait_for(|s| *s == state))
        .await
        .with_context(|| format!("pipeline never became {}", state))?
        .context("pipeline worker gone")?;
    Ok(())
}
